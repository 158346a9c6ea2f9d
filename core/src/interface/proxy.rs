// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Typed call proxies.
//!
//! A [`Proxy`] binds an address (service name, `name@version`, or concrete endpoint) with a call
//! timeout and subject namespace. Calls decode the REP body into the requested type; timeouts
//! and remote failures are counted per address.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::{container::ContainerHandle, metrics, rpc::RpcError};

const LOG_TARGET: &str = "hive::interface::proxy";

/// A reply that is being awaited on a spawned task.
pub struct DeferredReply<T> {
    handle: tokio::task::JoinHandle<Result<T, RpcError>>,
}

impl<T> DeferredReply<T> {
    pub async fn get(self) -> Result<T, RpcError> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_err) => {
                log::warn!(target: LOG_TARGET, "deferred call task failed: {}", join_err);
                Err(RpcError::ChannelClosed)
            },
        }
    }
}

pub struct Proxy {
    handle: ContainerHandle,
    address: String,
    namespace: String,
    timeout: Duration,
}

impl Proxy {
    pub(crate) fn new(handle: ContainerHandle, address: impl Into<String>) -> Self {
        let address = address.into();
        let timeout = handle.request_timeout();
        // The subject namespace defaults to the service name part of the address
        let namespace = address.split('@').next().unwrap_or(&address).to_string();
        Self {
            handle,
            address,
            namespace,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the subject prefix, e.g. when addressing a concrete endpoint.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Call `method` and decode the reply body.
    pub async fn call<B, T>(&self, method: &str, body: &B) -> Result<T, RpcError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let subject = format!("{}.{}", self.namespace, method);
        let channel = self.handle.send_request(&self.address, &subject, body).await?;
        match channel.get(self.timeout).await {
            Ok(reply) => Ok(reply.decode_body()?),
            Err(err) => {
                match &err {
                    RpcError::Timeout(_) => metrics::proxy_timeouts_total(&self.address).inc(),
                    other => metrics::proxy_errors_total(&self.address, other.tag()).inc(),
                }
                Err(err)
            },
        }
    }

    /// Start a call on a spawned task and return a handle to its eventual reply.
    pub fn defer<B, T>(&self, method: &str, body: B) -> DeferredReply<T>
    where
        B: Serialize + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        let proxy = Proxy {
            handle: self.handle.clone(),
            address: self.address.clone(),
            namespace: self.namespace.clone(),
            timeout: self.timeout,
        };
        let method = method.to_string();
        let handle = tokio::spawn(async move { proxy.call(&method, &body).await });
        DeferredReply { handle }
    }
}
