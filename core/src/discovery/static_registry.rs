// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! A static, coordinator-less registry.
//!
//! All containers of one process share a [`StaticRegistryHub`]; each gets its own
//! [`StaticServiceRegistry`] client. Registrations update every service view handed out by the
//! hub, so membership events still flow.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    discovery::{DiscoveryError, ServiceRegistry},
    services::{Service, ServiceInstance},
};

#[derive(Default)]
struct HubState {
    instances: HashMap<String, Vec<ServiceInstance>>,
    views: HashMap<String, Vec<Service>>,
}

#[derive(Clone, Default)]
pub struct StaticRegistryHub {
    state: Arc<Mutex<HubState>>,
}

impl StaticRegistryHub {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn registry(&self) -> StaticServiceRegistry {
        StaticServiceRegistry {
            hub: self.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn add(&self, name: &str, instance: ServiceInstance) {
        let mut state = self.state.lock().expect("static hub lock poisoned");
        let instances = state.instances.entry(name.to_string()).or_default();
        instances.retain(|existing| existing.identity != instance.identity);
        instances.push(instance.clone());
        if let Some(views) = state.views.get(name) {
            for view in views {
                view.update(instance.clone());
            }
        }
    }

    fn remove(&self, name: &str, instance: &ServiceInstance) {
        let mut state = self.state.lock().expect("static hub lock poisoned");
        if let Some(instances) = state.instances.get_mut(name) {
            instances.retain(|existing| existing.identity != instance.identity);
        }
        if let Some(views) = state.views.get(name) {
            for view in views {
                view.remove(&instance.identity);
            }
        }
    }

    fn view(&self, name: &str) -> Result<Service, DiscoveryError> {
        let mut state = self.state.lock().expect("static hub lock poisoned");
        let instances = state
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| DiscoveryError::LookupFailure(name.to_string()))?;
        let service = Service::with_instances(name, instances);
        state.views.entry(name.to_string()).or_default().push(service.clone());
        Ok(service)
    }

    fn names(&self) -> Vec<String> {
        let state = self.state.lock().expect("static hub lock poisoned");
        state.instances.keys().cloned().collect()
    }
}

pub struct StaticServiceRegistry {
    hub: StaticRegistryHub,
    cache: Mutex<HashMap<String, Service>>,
}

#[async_trait]
impl ServiceRegistry for StaticServiceRegistry {
    async fn get(&self, name: &str) -> Result<Service, DiscoveryError> {
        if let Some(service) = self.cache.lock().expect("registry cache lock poisoned").get(name) {
            return Ok(service.clone());
        }
        let service = self.hub.view(name)?;
        self.cache
            .lock()
            .expect("registry cache lock poisoned")
            .insert(name.to_string(), service.clone());
        Ok(service)
    }

    async fn discover(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.hub.names())
    }

    async fn register(&self, name: &str, instance: ServiceInstance) -> Result<(), DiscoveryError> {
        self.hub.add(name, instance);
        Ok(())
    }

    async fn unregister(&self, name: &str, instance: &ServiceInstance) -> Result<(), DiscoveryError> {
        self.hub.remove(name, instance);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::services::ServiceEvent;

    #[tokio::test]
    async fn register_then_lookup() {
        let hub = StaticRegistryHub::new();
        let registry = hub.registry();
        registry
            .register("echo", ServiceInstance::new("tcp://127.0.0.1:4000"))
            .await
            .unwrap();
        let service = registry.get("echo").await.unwrap();
        assert_eq!(service.len(), 1);
        assert_eq!(registry.discover().await.unwrap(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn unknown_name_is_a_lookup_failure() {
        let hub = StaticRegistryHub::new();
        let registry = hub.registry();
        assert!(matches!(
            registry.get("missing").await,
            Err(DiscoveryError::LookupFailure(_))
        ));
    }

    #[tokio::test]
    async fn later_registrations_reach_existing_views() {
        let hub = StaticRegistryHub::new();
        let server_registry = hub.registry();
        let client_registry = hub.registry();

        let first = ServiceInstance::new("tcp://127.0.0.1:4000");
        server_registry.register("echo", first.clone()).await.unwrap();
        let view = client_registry.get("echo").await.unwrap();
        let mut events = view.subscribe();

        let second = ServiceInstance::new("tcp://127.0.0.1:4001");
        server_registry.register("echo", second).await.unwrap();
        assert_eq!(view.len(), 2);
        assert!(matches!(events.try_recv().unwrap(), ServiceEvent::Added(_)));

        server_registry.unregister("echo", &first).await.unwrap();
        assert_eq!(view.len(), 1);
        assert!(matches!(events.try_recv().unwrap(), ServiceEvent::Removed(_)));
    }
}
