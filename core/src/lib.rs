// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! # Hive
//!
//! A service container framework for message-driven microservices.
//!
//! A [`ServiceContainer`](container::ServiceContainer) hosts one or more application
//! [`Interface`](interface::Interface)s, speaks a length-prefixed multipart RPC protocol over TCP,
//! keeps per-peer [`Connection`](connection::Connection) health with a phi-accrual estimator,
//! tracks remote instances through a coordination backend ([`discovery`]) and dispatches
//! topic-wildcarded [`Event`](events::Event)s through pluggable back-ends ([`events`]).

pub mod config;
pub mod connection;
pub mod container;
pub mod discovery;
pub mod events;
pub mod hooks;
pub mod interface;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod rpc;
pub mod serializer;
pub mod services;
pub mod stats;
pub mod trace;
pub mod transport;

pub use config::{ConfigurationError, ContainerConfig};
pub use container::{ContainerError, ContainerHandle, ServiceContainer};
pub use events::Event;
pub use interface::{HandlerError, Interface, InterfaceBuilder, Request};
pub use message::{Message, MessageId, MessageType};
pub use rpc::{ReplyChannel, RequestChannel, RpcError};
pub use services::{Service, ServiceEvent, ServiceInstance};
