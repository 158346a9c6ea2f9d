// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Live views of remote service instances.
//!
//! A [`Service`] is the authoritative, observer-notified view of the remote peers providing a
//! named interface. The discovery watcher keeps it current; membership changes are published as
//! [`ServiceEvent`]s on a broadcast channel.

pub mod versioning;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use blake2::{digest::consts::U16, Blake2b, Digest};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const SERVICE_EVENT_CHANNEL_SIZE: usize = 32;

type IdentityHash = Blake2b<U16>;

/// Stable 32-hex identity of an endpoint.
pub fn endpoint_identity(endpoint: &str) -> String {
    let hash = IdentityHash::digest(endpoint.as_bytes());
    data_encoding::HEXLOWER.encode(&hash)
}

/// Immutable descriptor of one remote container instance providing an interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub identity: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backdoor_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
}

impl ServiceInstance {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            identity: endpoint_identity(&endpoint),
            endpoint,
            version: None,
            log_endpoint: None,
            monitoring_endpoint: None,
            backdoor_endpoint: None,
            fqdn: None,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_fqdn(mut self, fqdn: impl Into<String>) -> Self {
        self.fqdn = Some(fqdn.into());
        self
    }

    pub fn with_log_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.log_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_monitoring_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.monitoring_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_backdoor_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.backdoor_endpoint = Some(endpoint.into());
        self
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{} ({})", self.endpoint, version, &self.identity[..8]),
            None => write!(f, "{} ({})", self.endpoint, &self.identity[..8]),
        }
    }
}

/// Emitted to observers when a service's membership changes.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Added(ServiceInstance),
    Updated(ServiceInstance),
    Removed(ServiceInstance),
}

struct ServiceInner {
    name: String,
    instances: RwLock<HashMap<String, ServiceInstance>>,
    events: broadcast::Sender<ServiceEvent>,
}

/// A live view of the instances providing a named interface. Cheap to clone; clones share the
/// same membership and observer channel. A clone may carry its own version requirement, giving a
/// filtered view over the shared membership.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
    version_req: Option<VersionReq>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(SERVICE_EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(ServiceInner {
                name: name.into(),
                instances: RwLock::new(HashMap::new()),
                events,
            }),
            version_req: None,
        }
    }

    pub fn with_instances(name: impl Into<String>, instances: impl IntoIterator<Item = ServiceInstance>) -> Self {
        let service = Self::new(name);
        {
            let mut map = service.inner.instances.write().expect("service instances lock poisoned");
            for instance in instances {
                map.insert(instance.identity.clone(), instance);
            }
        }
        service
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version_req(&self) -> Option<&VersionReq> {
        self.version_req.as_ref()
    }

    /// A filtered view over the same membership, restricted to instances satisfying `req`.
    pub fn with_version(&self, req: VersionReq) -> Service {
        Service {
            inner: Arc::clone(&self.inner),
            version_req: Some(req),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Insert or update an instance, emitting `Added` or `Updated`. An update that changes
    /// nothing emits nothing.
    pub fn update(&self, instance: ServiceInstance) {
        let event = {
            let mut map = self.inner.instances.write().expect("service instances lock poisoned");
            match map.insert(instance.identity.clone(), instance.clone()) {
                None => Some(ServiceEvent::Added(instance)),
                Some(previous) if previous != instance => Some(ServiceEvent::Updated(instance)),
                Some(_) => None,
            }
        };
        if let Some(event) = event {
            let _ = self.inner.events.send(event);
        }
    }

    /// Remove an instance by identity, emitting `Removed` if it was present.
    pub fn remove(&self, identity: &str) -> Option<ServiceInstance> {
        let removed = {
            let mut map = self.inner.instances.write().expect("service instances lock poisoned");
            map.remove(identity)
        };
        if let Some(instance) = removed.clone() {
            let _ = self.inner.events.send(ServiceEvent::Removed(instance));
        }
        removed
    }

    /// Instances visible through this view, honouring the version requirement if any.
    pub fn instances(&self) -> Vec<ServiceInstance> {
        let map = self.inner.instances.read().expect("service instances lock poisoned");
        map.values()
            .filter(|instance| self.matches_version(instance))
            .cloned()
            .collect()
    }

    /// All instances regardless of version requirement.
    pub fn all_instances(&self) -> Vec<ServiceInstance> {
        let map = self.inner.instances.read().expect("service instances lock poisoned");
        map.values().cloned().collect()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let map = self.inner.instances.read().expect("service instances lock poisoned");
        map.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.instances.read().expect("service instances lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches_version(&self, instance: &ServiceInstance) -> bool {
        match (&self.version_req, &instance.version) {
            (None, _) => true,
            (Some(req), Some(version)) => req.matches(version),
            // A versioned lookup never routes to an unversioned instance
            (Some(_), None) => false,
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.name)
            .field("instances", &self.len())
            .field("version_req", &self.version_req)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn instance(endpoint: &str, version: Option<&str>) -> ServiceInstance {
        let mut inst = ServiceInstance::new(endpoint);
        if let Some(v) = version {
            inst = inst.with_version(Version::parse(v).unwrap());
        }
        inst
    }

    #[test]
    fn identity_is_stable_32_hex() {
        let a = endpoint_identity("tcp://127.0.0.1:4000");
        let b = endpoint_identity("tcp://127.0.0.1:4000");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, endpoint_identity("tcp://127.0.0.1:4001"));
    }

    #[test]
    fn update_emits_added_then_updated() {
        let service = Service::new("echo");
        let mut events = service.subscribe();

        service.update(instance("tcp://127.0.0.1:4000", None));
        assert!(matches!(events.try_recv().unwrap(), ServiceEvent::Added(_)));

        // Same content again: no event
        service.update(instance("tcp://127.0.0.1:4000", None));
        assert!(events.try_recv().is_err());

        service.update(instance("tcp://127.0.0.1:4000", Some("1.0.0")));
        assert!(matches!(events.try_recv().unwrap(), ServiceEvent::Updated(_)));
    }

    #[test]
    fn remove_emits_removed_once() {
        let service = Service::new("echo");
        let inst = instance("tcp://127.0.0.1:4000", None);
        service.update(inst.clone());
        let mut events = service.subscribe();
        assert!(service.remove(&inst.identity).is_some());
        assert!(matches!(events.try_recv().unwrap(), ServiceEvent::Removed(_)));
        assert!(service.remove(&inst.identity).is_none());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn version_filtered_view() {
        let service = Service::new("foo");
        service.update(instance("tcp://127.0.0.1:4001", Some("1.1.0")));
        service.update(instance("tcp://127.0.0.1:4002", Some("1.5.0")));
        service.update(instance("tcp://127.0.0.1:4003", Some("2.1.0")));

        let v12 = service.with_version(versioning::compatible(&Version::new(1, 2, 0)));
        let visible: Vec<_> = v12.instances().into_iter().map(|i| i.endpoint).collect();
        assert_eq!(visible, vec!["tcp://127.0.0.1:4002"]);

        let v17 = service.with_version(versioning::compatible(&Version::new(1, 7, 0)));
        assert!(v17.instances().is_empty());

        let v20 = service.with_version(versioning::compatible(&Version::new(2, 0, 0)));
        let visible: Vec<_> = v20.instances().into_iter().map(|i| i.endpoint).collect();
        assert_eq!(visible, vec!["tcp://127.0.0.1:4003"]);

        // The filtered view shares membership with the unfiltered one
        assert_eq!(service.len(), 3);
        assert_eq!(v17.len(), 3);
    }
}
