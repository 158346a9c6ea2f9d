// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The coordinator-backed service registry.
//!
//! Layout: `/<chroot>/<namespace>/<interface_name>/<instance_id>`, where instance nodes are
//! ephemeral and hold the serialized [`ServiceInstance`]. Watches are one-shot, ZooKeeper style:
//! every lookup re-installs a watch on the children list and one per child node, keeping the
//! service view current until the container stops. On reconnect every locally advertised
//! instance is re-registered and every cached service re-looked-up.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use hive_shutdown::ShutdownSignal;
use tokio::sync::{broadcast, oneshot};

use crate::{
    config::RegistryConfig,
    discovery::{CoordinatorError, DiscoveryError, ServiceRegistry},
    services::{Service, ServiceInstance},
};

const LOG_TARGET: &str = "hive::discovery::coordinator";

/// A one-shot watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    ChildrenChanged(String),
    Deleted(String),
    DataChanged(String),
}

/// The sending half of a one-shot watch.
pub type Watch = oneshot::Sender<WatchEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Suspended,
    Lost,
}

/// A hierarchical coordination store: ephemeral nodes, atomic create, one-shot watches.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Atomically create an ephemeral node, creating missing parents as persistent nodes.
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinatorError>;

    async fn delete(&self, path: &str) -> Result<(), CoordinatorError>;

    /// Child names of `path`, optionally installing a one-shot watch on the children list.
    async fn get_children(&self, path: &str, watch: Option<Watch>) -> Result<Vec<String>, CoordinatorError>;

    /// Data of the node at `path`, optionally installing a one-shot watch on the node.
    async fn get_data(&self, path: &str, watch: Option<Watch>) -> Result<Vec<u8>, CoordinatorError>;

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent>;
}

#[async_trait]
impl<C: Coordinator> Coordinator for Arc<C> {
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinatorError> {
        (**self).create_ephemeral(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinatorError> {
        (**self).delete(path).await
    }

    async fn get_children(&self, path: &str, watch: Option<Watch>) -> Result<Vec<String>, CoordinatorError> {
        (**self).get_children(path, watch).await
    }

    async fn get_data(&self, path: &str, watch: Option<Watch>) -> Result<Vec<u8>, CoordinatorError> {
        (**self).get_data(path, watch).await
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        (**self).subscribe_session()
    }
}

struct Inner<C> {
    client: C,
    config: RegistryConfig,
    cache: Mutex<HashMap<String, Service>>,
    registered: Mutex<HashMap<(String, String), ServiceInstance>>,
    shutdown: ShutdownSignal,
}

/// Service registry backed by a [`Coordinator`].
pub struct CoordinatorRegistry<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for CoordinatorRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Coordinator> CoordinatorRegistry<C> {
    pub fn new(client: C, config: RegistryConfig, shutdown: ShutdownSignal) -> Self {
        let registry = Self {
            inner: Arc::new(Inner {
                client,
                config,
                cache: Mutex::new(HashMap::new()),
                registered: Mutex::new(HashMap::new()),
                shutdown,
            }),
        };
        registry.spawn_session_task();
        registry
    }

    fn spawn_session_task(&self) {
        let inner = Arc::clone(&self.inner);
        let mut events = inner.client.subscribe_session();
        let mut shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    event = events.recv() => match event {
                        Ok(SessionEvent::Connected) => {
                            log::info!(target: LOG_TARGET, "coordinator connected; resyncing");
                            resync(&inner).await;
                        },
                        Ok(SessionEvent::Suspended) => {
                            log::info!(target: LOG_TARGET, "coordinator connection suspended");
                        },
                        Ok(SessionEvent::Lost) => {
                            log::warn!(target: LOG_TARGET, "coordinator connection lost");
                        },
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Advertise an instance under a namespace other than the configured one. Used by plugins.
    pub async fn register_in_namespace(
        &self,
        namespace: &str,
        name: &str,
        instance: ServiceInstance,
    ) -> Result<(), DiscoveryError> {
        register_instance(&self.inner, namespace, name, &instance).await?;
        self.inner
            .registered
            .lock()
            .expect("registered table lock poisoned")
            .insert((namespace.to_string(), name.to_string()), instance);
        Ok(())
    }
}

#[async_trait]
impl<C: Coordinator> ServiceRegistry for CoordinatorRegistry<C> {
    async fn get(&self, name: &str) -> Result<Service, DiscoveryError> {
        let cached = self
            .inner
            .cache
            .lock()
            .expect("service cache lock poisoned")
            .get(name)
            .cloned();
        if let Some(service) = cached {
            return Ok(service);
        }
        let service = Service::new(name);
        match tokio::time::timeout(self.inner.config.lookup_timeout, lookup(&self.inner, &service)).await {
            Ok(result) => result?,
            Err(_) => return Err(DiscoveryError::LookupFailure(name.to_string())),
        }
        self.inner
            .cache
            .lock()
            .expect("service cache lock poisoned")
            .insert(name.to_string(), service.clone());
        Ok(service)
    }

    async fn discover(&self) -> Result<Vec<String>, DiscoveryError> {
        let path = namespace_path(&self.inner.config);
        match self.inner.client.get_children(&path, None).await {
            Ok(children) => Ok(children),
            Err(CoordinatorError::NoNode(_)) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn register(&self, name: &str, instance: ServiceInstance) -> Result<(), DiscoveryError> {
        let namespace = self.inner.config.namespace.clone();
        register_instance(&self.inner, &namespace, name, &instance).await?;
        self.inner
            .registered
            .lock()
            .expect("registered table lock poisoned")
            .insert((namespace, name.to_string()), instance);
        Ok(())
    }

    async fn unregister(&self, name: &str, instance: &ServiceInstance) -> Result<(), DiscoveryError> {
        let path = instance_path(&self.inner.config, &self.inner.config.namespace, name, &instance.identity);
        match self.inner.client.delete(&path).await {
            Ok(()) | Err(CoordinatorError::NoNode(_)) => {},
            Err(err) => return Err(err.into()),
        }
        self.inner
            .registered
            .lock()
            .expect("registered table lock poisoned")
            .remove(&(self.inner.config.namespace.clone(), name.to_string()));
        Ok(())
    }
}

fn namespace_path(config: &RegistryConfig) -> String {
    format!("{}/{}", config.chroot.trim_end_matches('/'), config.namespace)
}

fn service_path(config: &RegistryConfig, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", config.chroot.trim_end_matches('/'), namespace, name)
}

fn instance_path(config: &RegistryConfig, namespace: &str, name: &str, instance_id: &str) -> String {
    format!("{}/{}", service_path(config, namespace, name), instance_id)
}

async fn resync<C: Coordinator>(inner: &Arc<Inner<C>>) {
    let registered: Vec<_> = {
        let map = inner.registered.lock().expect("registered table lock poisoned");
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    };
    for ((namespace, name), instance) in registered {
        if let Err(err) = register_instance(inner, &namespace, &name, &instance).await {
            log::warn!(target: LOG_TARGET, "failed to re-register {}: {}", name, err);
        }
    }
    let cached: Vec<Service> = {
        let map = inner.cache.lock().expect("service cache lock poisoned");
        map.values().cloned().collect()
    };
    for service in cached {
        if let Err(err) = lookup(inner, &service).await {
            log::warn!(target: LOG_TARGET, "failed to re-lookup {}: {}", service.name(), err);
        }
    }
}

async fn register_instance<C: Coordinator>(
    inner: &Arc<Inner<C>>,
    namespace: &str,
    name: &str,
    instance: &ServiceInstance,
) -> Result<(), DiscoveryError> {
    let path = instance_path(&inner.config, namespace, name, &instance.identity);
    let data = serde_json::to_vec(instance).map_err(|e| DiscoveryError::Serialization(e.to_string()))?;

    // A stale ephemeral from a fast restart is deleted before re-creating the path.
    match inner.client.delete(&path).await {
        Ok(()) | Err(CoordinatorError::NoNode(_)) => {},
        Err(err) => {
            log::debug!(target: LOG_TARGET, "could not clear stale path {}: {}", path, err);
        },
    }

    match tokio::time::timeout(inner.config.register_timeout, inner.client.create_ephemeral(&path, data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(DiscoveryError::RegistrationFailure(name.to_string(), err.to_string())),
        Err(_) => Err(DiscoveryError::RegistrationFailure(
            name.to_string(),
            "timed out".to_string(),
        )),
    }
}

/// Populate `service` from the coordinator and install watches keeping it current.
async fn lookup<C: Coordinator>(inner: &Arc<Inner<C>>, service: &Service) -> Result<(), DiscoveryError> {
    let path = service_path(&inner.config, &inner.config.namespace, service.name());
    let (watch_tx, watch_rx) = oneshot::channel();
    let children = match inner.client.get_children(&path, Some(watch_tx)).await {
        Ok(children) => children,
        Err(CoordinatorError::NoNode(_)) => {
            return Err(DiscoveryError::LookupFailure(service.name().to_string()));
        },
        Err(CoordinatorError::ConnectionLoss) => {
            // Keep the stale view; the session task re-looks-up on reconnect
            log::warn!(target: LOG_TARGET, "lookup of {} hit a disconnected coordinator", service.name());
            return Ok(());
        },
        Err(err) => return Err(err.into()),
    };
    spawn_children_watch(inner, service, watch_rx);
    log::info!(target: LOG_TARGET, "lookup {} {:?}", service.name(), children);

    let mut stale: HashSet<String> = service.instance_ids().into_iter().collect();
    for instance_id in children {
        match fetch_instance(inner, service, &path, &instance_id).await {
            Ok(instance) => {
                service.update(instance);
                stale.remove(&instance_id);
            },
            Err(err) => {
                log::warn!(
                    target: LOG_TARGET,
                    "failed to fetch instance {} of {}: {}",
                    instance_id,
                    service.name(),
                    err
                );
            },
        }
    }
    // Instances present before but absent now were removed while we were not watching
    for instance_id in stale {
        service.remove(&instance_id);
    }
    Ok(())
}

async fn fetch_instance<C: Coordinator>(
    inner: &Arc<Inner<C>>,
    service: &Service,
    base_path: &str,
    instance_id: &str,
) -> Result<ServiceInstance, DiscoveryError> {
    let path = format!("{}/{}", base_path, instance_id);
    let (watch_tx, watch_rx) = oneshot::channel();
    let data = inner.client.get_data(&path, Some(watch_tx)).await?;
    spawn_instance_watch(service.clone(), instance_id.to_string(), watch_rx, inner.shutdown.clone());
    let mut instance: ServiceInstance =
        serde_json::from_slice(&data).map_err(|e| DiscoveryError::Serialization(e.to_string()))?;
    // The node name is authoritative for the identity
    instance.identity = instance_id.to_string();
    Ok(instance)
}

fn spawn_children_watch<C: Coordinator>(
    inner: &Arc<Inner<C>>,
    service: &Service,
    watch: oneshot::Receiver<WatchEvent>,
) {
    let inner = Arc::clone(inner);
    let service = service.clone();
    let mut shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.wait() => {},
            event = watch => {
                if event.is_ok() {
                    // Re-enumerate and diff; lookup re-installs the next one-shot watch
                    match lookup(&inner, &service).await {
                        Ok(()) | Err(DiscoveryError::LookupFailure(_)) => {},
                        Err(err) => {
                            log::warn!(target: LOG_TARGET, "error in service watcher: {}", err);
                        },
                    }
                }
            },
        }
    });
}

fn spawn_instance_watch(
    service: Service,
    instance_id: String,
    watch: oneshot::Receiver<WatchEvent>,
    mut shutdown: ShutdownSignal,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.wait() => {},
            event = watch => {
                if let Ok(WatchEvent::Deleted(_)) = event {
                    service.remove(&instance_id);
                }
            },
        }
    });
}
