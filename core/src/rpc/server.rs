// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The RPC server.
//!
//! The send path composes a REQ, enters a [`RequestChannel`] into the channel table keyed by
//! message id, resolves the target endpoint (uniformly at random among live instances of a
//! service view) and transmits. The receive path dispatches REQs to the interface registry on a
//! fresh task and matches replies back to their channel by subject.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
};

use bytes::Bytes;
use hive_shutdown::ShutdownSignal;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    config::{ConnectionConfig, RpcConfig},
    connection::{Connection, ConnectionStats, ConnectionStatus},
    container::tasks::TaskGroup,
    hooks::ErrorHook,
    interface::InterfaceRegistry,
    message::{Message, MessageId, MessageType},
    metrics,
    rpc::{channels::ReplySlot, ReplyChannel, RequestChannel, RpcError},
    services::{endpoint_identity, Service, ServiceEvent},
    transport::{self, Endpoint, TransportError},
};

const LOG_TARGET: &str = "hive::rpc::server";

/// Target of an outbound request: a concrete endpoint or a live service view.
#[derive(Clone)]
pub enum RequestTarget {
    Endpoint(Endpoint),
    Service(Service),
}

impl From<Endpoint> for RequestTarget {
    fn from(endpoint: Endpoint) -> Self {
        RequestTarget::Endpoint(endpoint)
    }
}

impl From<Service> for RequestTarget {
    fn from(service: Service) -> Self {
        RequestTarget::Service(service)
    }
}

pub struct RpcServer {
    rpc_config: RpcConfig,
    connection_config: ConnectionConfig,
    endpoint: Endpoint,
    identity: String,
    channels: Mutex<HashMap<MessageId, ReplySlot>>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    watched_services: Mutex<HashSet<String>>,
    running: AtomicBool,
    shutdown_signal: ShutdownSignal,
}

impl RpcServer {
    /// Bind the listening socket and create the server. The returned receiver carries every
    /// inbound message and must be handed to [`spawn_inbound_loop`](Self::spawn_inbound_loop).
    pub(crate) async fn bind(
        rpc_config: RpcConfig,
        connection_config: ConnectionConfig,
        shutdown_signal: ShutdownSignal,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Message>), TransportError> {
        let bound = transport::bind(&rpc_config, shutdown_signal.clone()).await?;
        let identity = endpoint_identity(bound.endpoint.as_str());
        log::info!(
            target: LOG_TARGET,
            "rpc server listening on {} (identity={})",
            bound.endpoint,
            identity
        );
        let server = Arc::new(Self {
            rpc_config,
            connection_config,
            endpoint: bound.endpoint,
            identity,
            channels: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            watched_services: Mutex::new(HashSet::new()),
            running: AtomicBool::new(true),
            shutdown_signal,
        });
        Ok((server, bound.incoming))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stable 32-hex hash of the endpoint.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Compose and transmit a REQ, returning its reply channel. When the target has no live
    /// instance the request fails with `NotConnected`, but the channel is still returned so
    /// callers get a consistent error path via `channel.get()`.
    pub async fn send_request<T>(
        self: &Arc<Self>,
        target: RequestTarget,
        subject: &str,
        body: &T,
        headers: Option<HashMap<String, String>>,
    ) -> Result<RequestChannel, RpcError>
    where
        T: Serialize + ?Sized,
    {
        let msg = Message::request(subject, self.endpoint.as_str(), headers.unwrap_or_default(), body)?;
        let (tx, rx) = oneshot::channel();
        self.channels
            .lock()
            .expect("channel table lock poisoned")
            .insert(msg.id().clone(), tx);
        let channel = RequestChannel::new(msg.clone(), rx, Arc::downgrade(self));

        match self.resolve_target(&target) {
            Ok(endpoint) => {
                if let Err(err) = self.send_message(&endpoint, msg).await {
                    self.fail_channel(channel.request().id(), err);
                }
            },
            Err(err) => {
                log::warn!(
                    target: LOG_TARGET,
                    "cannot send request (no live instance): {}",
                    channel.request()
                );
                self.fail_channel(channel.request().id(), err);
            },
        }
        Ok(channel)
    }

    /// Send a heartbeat ping to a concrete endpoint.
    pub async fn ping(self: &Arc<Self>, endpoint: Endpoint) -> Result<RequestChannel, RpcError> {
        #[derive(Serialize)]
        struct PingBody<'a> {
            payload: &'a str,
        }
        self.send_request(
            RequestTarget::Endpoint(endpoint),
            crate::message::PING_SUBJECT,
            &PingBody { payload: "" },
            None,
        )
        .await
    }

    fn resolve_target(self: &Arc<Self>, target: &RequestTarget) -> Result<Endpoint, RpcError> {
        match target {
            RequestTarget::Endpoint(endpoint) => Ok(endpoint.clone()),
            RequestTarget::Service(service) => {
                self.observe_removals(service);
                let candidates: Vec<Endpoint> = {
                    let connections = self.connections.lock().expect("connection table lock poisoned");
                    service
                        .instances()
                        .iter()
                        .filter_map(|instance| Endpoint::parse(&instance.endpoint).ok())
                        .filter(|endpoint| match connections.get(endpoint.as_str()) {
                            Some(conn) => conn.is_alive(),
                            None => true,
                        })
                        .collect()
                };
                if candidates.is_empty() {
                    return Err(RpcError::NotConnected(service.name().to_string()));
                }
                let choice = rand::thread_rng().gen_range(0..candidates.len());
                Ok(candidates[choice].clone())
            },
        }
    }

    /// Watch a service view so instances that leave have their connections evicted promptly.
    fn observe_removals(self: &Arc<Self>, service: &Service) {
        let is_new = self
            .watched_services
            .lock()
            .expect("watched services lock poisoned")
            .insert(service.name().to_string());
        if !is_new {
            return;
        }
        let mut events = service.subscribe();
        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown_signal.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    event = events.recv() => match event {
                        Ok(ServiceEvent::Removed(instance)) => {
                            let Some(server) = weak.upgrade() else { break };
                            server.disconnect(&instance.endpoint);
                        },
                        Ok(_) => {},
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!(target: LOG_TARGET, "service event stream lagged by {}", skipped);
                        },
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// The connection for `endpoint`, created on demand. A CLOSED record is never resurrected;
    /// a new one replaces it.
    pub(crate) fn connect(self: &Arc<Self>, endpoint: &Endpoint) -> Arc<Connection> {
        let mut connections = self.connections.lock().expect("connection table lock poisoned");
        match connections.get(endpoint.as_str()) {
            Some(conn) if conn.status() != ConnectionStatus::Closed => Arc::clone(conn),
            _ => {
                log::debug!(target: LOG_TARGET, "connecting to {}", endpoint);
                let conn = Connection::spawn(
                    self,
                    endpoint.clone(),
                    self.connection_config.clone(),
                    &self.rpc_config,
                    self.shutdown_signal.clone(),
                );
                connections.insert(endpoint.as_str().to_string(), Arc::clone(&conn));
                metrics::connection_count().set(connections.len() as i64);
                conn
            },
        }
    }

    /// Close and remove the connection for `endpoint`, if any.
    pub fn disconnect(&self, endpoint: &str) {
        let removed = self
            .connections
            .lock()
            .expect("connection table lock poisoned")
            .remove(endpoint);
        if let Some(conn) = removed {
            log::debug!(target: LOG_TARGET, "disconnecting from {}", endpoint);
            conn.close();
            metrics::connection_count().set(self.connection_count() as i64);
        }
    }

    /// Remove a closed connection's table entry. Called from [`Connection::close`]; must not
    /// call back into the connection.
    pub(crate) fn forget_connection(&self, endpoint: &Endpoint) {
        let mut connections = self.connections.lock().expect("connection table lock poisoned");
        if let Some(conn) = connections.get(endpoint.as_str()) {
            if conn.status() == ConnectionStatus::Closed {
                connections.remove(endpoint.as_str());
            }
        }
        metrics::connection_count().set(connections.len() as i64);
    }

    async fn send_message(self: &Arc<Self>, endpoint: &Endpoint, msg: Message) -> Result<(), RpcError> {
        if !self.running.load(Ordering::SeqCst) {
            log::error!(target: LOG_TARGET, "cannot send message (not started): {}", msg);
            return Err(RpcError::NotRunning);
        }
        let conn = self.connect(endpoint);
        log::debug!(target: LOG_TARGET, "-> {} to {}", msg, endpoint);
        conn.send(msg)
            .await
            .map_err(|_| RpcError::NotConnected(endpoint.to_string()))
    }

    /// Compose and transmit a reply to `request`.
    pub(crate) async fn send_reply(
        self: &Arc<Self>,
        request: &Message,
        msg_type: MessageType,
        body: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<(), RpcError> {
        let reply = Message::reply(request, msg_type, self.endpoint.as_str(), headers, body);
        let source = Endpoint::parse(request.source())
            .map_err(|_| RpcError::NotConnected(request.source().to_string()))?;
        self.send_message(&source, reply).await
    }

    pub(crate) fn remove_channel(&self, id: &MessageId) {
        self.channels.lock().expect("channel table lock poisoned").remove(id);
    }

    fn fail_channel(&self, id: &MessageId, err: RpcError) {
        let slot = self.channels.lock().expect("channel table lock poisoned").remove(id);
        if let Some(tx) = slot {
            let _ = tx.send(Err(err));
        }
    }

    /// Number of requests currently awaiting a reply.
    pub fn num_pending_requests(&self) -> usize {
        self.channels.lock().expect("channel table lock poisoned").len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connection table lock poisoned").len()
    }

    pub fn connection(&self, endpoint: &str) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connection table lock poisoned")
            .get(endpoint)
            .cloned()
    }

    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        let connections: Vec<_> = {
            let map = self.connections.lock().expect("connection table lock poisoned");
            map.values().cloned().collect()
        };
        connections.iter().map(|conn| conn.stats()).collect()
    }

    /// Run the receive path until shutdown: one inbound message per iteration.
    pub(crate) fn spawn_inbound_loop(
        self: &Arc<Self>,
        mut incoming: mpsc::Receiver<Message>,
        interfaces: Arc<InterfaceRegistry>,
        tasks: TaskGroup,
        error_hook: ErrorHook,
    ) {
        let server = Arc::clone(self);
        let mut shutdown = self.shutdown_signal.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    maybe = incoming.recv() => match maybe {
                        Some(msg) => server.recv_message(msg, &interfaces, &tasks, &error_hook),
                        None => break,
                    },
                }
            }
            log::debug!(target: LOG_TARGET, "inbound loop ended");
        });
    }

    fn recv_message(
        self: &Arc<Self>,
        msg: Message,
        interfaces: &Arc<InterfaceRegistry>,
        tasks: &TaskGroup,
        error_hook: &ErrorHook,
    ) {
        log::debug!(target: LOG_TARGET, "<- {}", msg);
        match Endpoint::parse(msg.source()) {
            Ok(source) => {
                let conn = self.connect(&source);
                conn.on_recv(&msg);
            },
            Err(_) => {
                log::warn!(
                    target: LOG_TARGET,
                    "dropping message with invalid source '{}': {}",
                    msg.source(),
                    msg
                );
                return;
            },
        }

        if msg.is_request() {
            metrics::rpc_requests_total(msg.subject()).inc();
            let channel = ReplyChannel::new(msg, Arc::clone(self));
            let interfaces = Arc::clone(interfaces);
            let error_hook = error_hook.clone();
            tasks.spawn(async move {
                interfaces.dispatch(channel, error_hook).await;
            });
        } else {
            // The reply subject is the id of the request being answered. An absent channel is
            // the expected outcome of a late reply after timeout.
            let key = MessageId::from(msg.subject());
            let slot = self.channels.lock().expect("channel table lock poisoned").remove(&key);
            match slot {
                Some(tx) => {
                    let _ = tx.send(Ok(msg));
                },
                None => {
                    log::debug!(
                        target: LOG_TARGET,
                        "reply to unknown subject: {} (msg-id={})",
                        msg.subject(),
                        msg.id()
                    );
                },
            }
        }
    }

    /// Stop accepting sends and close every connection.
    pub(crate) fn shut_down(&self) {
        self.running.store(false, Ordering::SeqCst);
        let connections: Vec<_> = {
            let mut map = self.connections.lock().expect("connection table lock poisoned");
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.close();
        }
        metrics::connection_count().set(0);
    }
}
