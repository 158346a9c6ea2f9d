// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The RPC server: request/reply channel multiplexing over the transport.

mod channels;
mod error;
mod server;

pub use channels::{ReplyChannel, RequestChannel};
pub(crate) use channels::ReplySlot;
pub use error::{ErrorReplyBody, RpcError};
pub use server::{RequestTarget, RpcServer};
