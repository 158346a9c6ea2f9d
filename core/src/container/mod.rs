// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The service container.
//!
//! A [`ServiceContainer`] owns the RPC server, the service registry client, the event system and
//! the installed interfaces. Everything else holds a [`ContainerHandle`], a cheap clone used for
//! lookups only, never for lifetime extension.

pub mod tasks;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use hive_shutdown::{Shutdown, ShutdownSignal};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    config::{ConfigurationError, ContainerConfig},
    discovery::{DiscoveryError, ServiceRegistry},
    events::{dispatch_received, Event, EventContext, EventError, EventSystem},
    hooks::ErrorHook,
    interface::{builtin, Interface, InterfaceError, InterfaceRegistry, Proxy},
    message::Message,
    metrics::MetricsAggregator,
    rpc::{RequestChannel, RequestTarget, RpcError, RpcServer},
    serializer,
    services::{versioning, Service, ServiceInstance},
    trace,
    transport::{Endpoint, TransportError},
};

use tasks::TaskGroup;

const LOG_TARGET: &str = "hive::container";

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Interface(#[from] InterfaceError),
    #[error("container is already started")]
    AlreadyStarted,
}

struct ContainerShared {
    config: ContainerConfig,
    server: Arc<RpcServer>,
    registry: Arc<dyn ServiceRegistry>,
    events: Arc<dyn EventSystem>,
    interfaces: Arc<InterfaceRegistry>,
    error_hook: ErrorHook,
    aggregator: Arc<MetricsAggregator>,
    tasks: TaskGroup,
    fqdn: String,
}

/// A cheap handle to a running container, used by handlers, proxies and event back-ends.
#[derive(Clone)]
pub struct ContainerHandle {
    inner: Arc<ContainerShared>,
}

impl ContainerHandle {
    pub fn endpoint(&self) -> &str {
        self.inner.server.endpoint().as_str()
    }

    /// Stable 32-hex hash of this container's endpoint.
    pub fn identity(&self) -> &str {
        self.inner.server.identity()
    }

    pub fn service_name(&self) -> Option<String> {
        self.inner.config.service_name.clone()
    }

    pub fn error_hook(&self) -> &ErrorHook {
        &self.inner.error_hook
    }

    pub fn interfaces(&self) -> &InterfaceRegistry {
        &self.inner.interfaces
    }

    pub fn metrics(&self) -> &MetricsAggregator {
        &self.inner.aggregator
    }

    pub fn server(&self) -> &Arc<RpcServer> {
        &self.inner.server
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout
    }

    pub(crate) fn tasks(&self) -> TaskGroup {
        self.inner.tasks.clone()
    }

    /// Resolve an address into a service view: either a concrete `tcp://` endpoint or a service
    /// name, optionally versioned (`name@version`).
    pub async fn lookup(&self, address: &str) -> Result<Service, RpcError> {
        if address.contains("://") {
            let endpoint =
                Endpoint::parse(address).map_err(|_| RpcError::NotConnected(address.to_string()))?;
            return Ok(Service::with_instances(address, [ServiceInstance::new(
                endpoint.as_str(),
            )]));
        }
        let (name, version_req) = versioning::parse_versioned_name(address)?;
        let service = self.inner.registry.get(&name).await?;
        Ok(match version_req {
            Some(req) => service.with_version(req),
            None => service,
        })
    }

    /// Send a request to an address, returning its reply channel.
    pub async fn send_request<T>(&self, address: &str, subject: &str, body: &T) -> Result<RequestChannel, RpcError>
    where T: Serialize + ?Sized {
        let service = self.lookup(address).await?;
        self.inner
            .server
            .send_request(RequestTarget::Service(service), subject, body, None)
            .await
    }

    /// A typed call proxy for an address.
    pub fn proxy(&self, address: &str) -> Proxy {
        Proxy::new(self.clone(), address)
    }

    pub async fn emit<T>(&self, event_type: &str, body: &T) -> Result<(), EventError>
    where T: Serialize {
        self.emit_delayed(event_type, body, Duration::ZERO).await
    }

    /// Emit an event, delivered after `delay`. The `trace_id` header is inherited from the
    /// ambient trace.
    pub async fn emit_delayed<T>(&self, event_type: &str, body: &T, delay: Duration) -> Result<(), EventError>
    where T: Serialize {
        let mut event = Event::new(event_type, body)?.with_source(self.identity().to_string());
        event
            .headers
            .entry(trace::TRACE_ID_HEADER.to_string())
            .or_insert_with(trace::current_or_new);
        self.inner.events.emit(event, delay).await
    }

    pub async fn discover(&self) -> Result<Vec<String>, DiscoveryError> {
        self.inner.registry.discover().await
    }

    /// Dispatch an event received through the `hive.event` builtin to local subscriptions.
    pub(crate) async fn inject_event(&self, event: Event) -> Result<(), EventError> {
        let context = EventContext {
            hook: self.inner.error_hook.clone(),
            tasks: self.inner.tasks.clone(),
        };
        if dispatch_received(self.inner.events.as_ref(), Some(context), event).await {
            Ok(())
        } else {
            Err(EventError::Emit(
                "this container's event system cannot receive relayed events".to_string(),
            ))
        }
    }
}

/// The long-running process hosting application interfaces.
pub struct ServiceContainer {
    handle: ContainerHandle,
    shutdown: Shutdown,
    inbound: Option<mpsc::Receiver<Message>>,
    registered: Mutex<Vec<(String, ServiceInstance)>>,
    started: bool,
}

impl ServiceContainer {
    /// Bind the transport and assemble the container. Interfaces are installed afterwards with
    /// [`install`](Self::install); nothing runs until [`start`](Self::start).
    pub async fn new(
        config: ContainerConfig,
        registry: Arc<dyn ServiceRegistry>,
        events: Arc<dyn EventSystem>,
    ) -> Result<Self, ContainerError> {
        config.validate()?;
        serializer::init(config.serialization);
        let shutdown = Shutdown::new();
        let (server, inbound) =
            RpcServer::bind(config.rpc.clone(), config.connection.clone(), shutdown.to_signal()).await?;
        let aggregator = Arc::new(MetricsAggregator::new(config.metrics_interval));
        let handle = ContainerHandle {
            inner: Arc::new(ContainerShared {
                config,
                server,
                registry,
                events,
                interfaces: Arc::new(InterfaceRegistry::new()),
                error_hook: ErrorHook::new(),
                aggregator,
                tasks: TaskGroup::new(),
                fqdn: fqdn(),
            }),
        };
        handle.inner.events.install(handle.clone());
        handle
            .inner
            .interfaces
            .register(builtin::builtin_interface(handle.clone())?)?;
        Ok(Self {
            handle,
            shutdown,
            inbound: Some(inbound),
            registered: Mutex::new(Vec::new()),
            started: false,
        })
    }

    pub fn handle(&self) -> ContainerHandle {
        self.handle.clone()
    }

    pub fn endpoint(&self) -> &str {
        self.handle.inner.server.endpoint().as_str()
    }

    pub fn identity(&self) -> &str {
        self.handle.inner.server.identity()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.to_signal()
    }

    /// Install an application interface. Must happen before [`start`](Self::start).
    pub fn install(&self, interface: Interface) -> Result<Arc<Interface>, ContainerError> {
        if self.started {
            return Err(ContainerError::AlreadyStarted);
        }
        Ok(self.handle.inner.interfaces.register(interface)?)
    }

    /// Start the receive loop, subscribe event handlers, start the metrics aggregator and,
    /// when `register` is true, advertise every non-builtin interface with discovery. A failed
    /// registration shuts the container down.
    pub async fn start(&mut self, register: bool) -> Result<(), ContainerError> {
        let inbound = self.inbound.take().ok_or(ContainerError::AlreadyStarted)?;
        let inner = &self.handle.inner;

        let names: Vec<String> = inner.interfaces.all().iter().map(|i| i.name().to_string()).collect();
        log::info!(
            target: LOG_TARGET,
            "starting {} ({})",
            inner.config.service_name.as_deref().unwrap_or("container"),
            names.join(", ")
        );
        if inner.interfaces.all().iter().all(|i| i.is_builtin()) {
            log::warn!(target: LOG_TARGET, "only builtin interfaces installed");
        }

        inner.server.spawn_inbound_loop(
            inbound,
            Arc::clone(&inner.interfaces),
            inner.tasks.clone(),
            inner.error_hook.clone(),
        );
        for interface in inner.interfaces.all() {
            for binding in interface.event_handlers() {
                inner.events.subscribe(Arc::clone(binding), binding.active()).await?;
            }
        }
        inner.aggregator.spawn(self.shutdown.to_signal());
        self.started = true;

        if register {
            if let Err(err) = self.register().await {
                log::error!(target: LOG_TARGET, "registration failed: {}; shutting down", err);
                self.stop().await;
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Advertise every non-builtin interface with the service registry.
    pub async fn register(&self) -> Result<(), DiscoveryError> {
        let inner = &self.handle.inner;
        for interface in inner.interfaces.all() {
            if interface.is_builtin() {
                continue;
            }
            let instance = self.instance_description(&interface);
            inner.registry.register(interface.name(), instance.clone()).await?;
            self.registered
                .lock()
                .expect("registered list lock poisoned")
                .push((interface.name().to_string(), instance));
        }
        Ok(())
    }

    fn instance_description(&self, interface: &Interface) -> ServiceInstance {
        let inner = &self.handle.inner;
        let mut instance = ServiceInstance::new(self.endpoint()).with_fqdn(inner.fqdn.clone());
        if let Some(version) = interface.version() {
            instance = instance.with_version(version.clone());
        }
        if let Some(endpoint) = &inner.config.log_endpoint {
            instance = instance.with_log_endpoint(endpoint.clone());
        }
        if let Some(endpoint) = &inner.config.monitoring_endpoint {
            instance = instance.with_monitoring_endpoint(endpoint.clone());
        }
        if let Some(endpoint) = &inner.config.backdoor_endpoint {
            instance = instance.with_backdoor_endpoint(endpoint.clone());
        }
        instance
    }

    /// Stop the container: unregister from discovery, stop event consumers, cancel every loop,
    /// close all connections and join the task group within the configured grace period.
    pub async fn stop(&mut self) {
        let inner = &self.handle.inner;
        log::info!(target: LOG_TARGET, "stopping container {}", self.endpoint());

        let registered: Vec<_> = {
            let mut list = self.registered.lock().expect("registered list lock poisoned");
            list.drain(..).collect()
        };
        for (name, instance) in registered {
            if let Err(err) = inner.registry.unregister(&name, &instance).await {
                log::warn!(target: LOG_TARGET, "failed to unregister {}: {}", name, err);
            }
        }

        inner.events.stop().await;
        self.shutdown.trigger();
        inner.server.shut_down();

        let aborted = inner.tasks.join_with_grace(inner.config.shutdown_grace).await;
        if aborted > 0 {
            log::warn!(
                target: LOG_TARGET,
                "{} handler task(s) ignored cancellation and were aborted",
                aborted
            );
        }
        self.started = false;
        log::info!(target: LOG_TARGET, "container {} stopped", self.endpoint());
    }
}

fn fqdn() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
