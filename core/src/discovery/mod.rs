// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Service discovery.
//!
//! A [`ServiceRegistry`] advertises local interfaces and resolves remote ones into live
//! [`Service`](crate::services::Service) views. The production implementation,
//! [`CoordinatorRegistry`], speaks to any hierarchical coordination store providing ephemeral
//! nodes and one-shot watches through the [`Coordinator`] trait; [`MemoryCoordinatorHub`] is an
//! in-process implementation of that trait. [`StaticRegistryHub`] wires containers of a single
//! process together without any coordinator.

mod coordinator;
mod error;
mod memory;
mod static_registry;

use async_trait::async_trait;

pub use coordinator::{Coordinator, CoordinatorRegistry, SessionEvent, Watch, WatchEvent};
pub use error::{CoordinatorError, DiscoveryError};
pub use memory::{MemoryCoordinator, MemoryCoordinatorHub};
pub use static_registry::{StaticRegistryHub, StaticServiceRegistry};

use crate::services::{Service, ServiceInstance};

/// Client-side view of the discovery service.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// The cached live view for `name`, looked up and watched on first use.
    async fn get(&self, name: &str) -> Result<Service, DiscoveryError>;

    /// All known service names.
    async fn discover(&self) -> Result<Vec<String>, DiscoveryError>;

    /// Advertise a local interface instance.
    async fn register(&self, name: &str, instance: ServiceInstance) -> Result<(), DiscoveryError>;

    async fn unregister(&self, name: &str, instance: &ServiceInstance) -> Result<(), DiscoveryError>;
}
