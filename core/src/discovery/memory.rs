// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! An in-process [`Coordinator`].
//!
//! Implements the full contract — ephemeral nodes bound to a client session, one-shot child and
//! data watches, session events — against a shared in-memory tree. Used by tests and
//! single-process deployments; [`MemoryCoordinator::expire_session`] simulates a coordinator
//! session loss.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::discovery::{Coordinator, CoordinatorError, SessionEvent, Watch, WatchEvent};

const LOG_TARGET: &str = "hive::discovery::memory";

const SESSION_EVENT_CHANNEL_SIZE: usize = 16;

struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    child_watches: HashMap<String, Vec<Watch>>,
    data_watches: HashMap<String, Vec<Watch>>,
    next_session_id: u64,
}

impl Tree {
    fn fire_child_watches(&mut self, path: &str) {
        if let Some(watches) = self.child_watches.remove(path) {
            for watch in watches {
                let _ = watch.send(WatchEvent::ChildrenChanged(path.to_string()));
            }
        }
    }

    fn fire_data_watches(&mut self, path: &str, event: WatchEvent) {
        if let Some(watches) = self.data_watches.remove(path) {
            for watch in watches {
                let _ = watch.send(event.clone());
            }
        }
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            self.fire_data_watches(path, WatchEvent::Deleted(path.to_string()));
            if let Some(parent) = parent_path(path) {
                self.fire_child_watches(&parent);
            }
        }
    }
}

/// The shared tree. Each container connects with [`client`](Self::client), getting its own
/// session; ephemeral nodes disappear when their session expires.
#[derive(Clone, Default)]
pub struct MemoryCoordinatorHub {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryCoordinatorHub {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn client(&self) -> MemoryCoordinator {
        let session_id = {
            let mut tree = self.tree.lock().expect("coordinator tree lock poisoned");
            tree.next_session_id += 1;
            tree.next_session_id
        };
        let (session_events, _) = broadcast::channel(SESSION_EVENT_CHANNEL_SIZE);
        MemoryCoordinator {
            tree: Arc::clone(&self.tree),
            session_id,
            session_events,
        }
    }
}

/// One client session against a [`MemoryCoordinatorHub`].
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
    session_id: u64,
    session_events: broadcast::Sender<SessionEvent>,
}

impl MemoryCoordinator {
    /// Drop every ephemeral node owned by this session and emit `Lost`, as a coordinator would
    /// when a client session expires.
    pub fn expire_session(&self) {
        let expired: Vec<String> = {
            let tree = self.tree.lock().expect("coordinator tree lock poisoned");
            tree.nodes
                .iter()
                .filter(|(_, node)| node.ephemeral_owner == Some(self.session_id))
                .map(|(path, _)| path.clone())
                .collect()
        };
        log::debug!(
            target: LOG_TARGET,
            "expiring session {} ({} ephemeral node(s))",
            self.session_id,
            expired.len()
        );
        let mut tree = self.tree.lock().expect("coordinator tree lock poisoned");
        for path in expired {
            tree.remove_node(&path);
        }
        drop(tree);
        let _ = self.session_events.send(SessionEvent::Lost);
    }

    /// Emit `Connected`, prompting the registry to re-register and re-lookup.
    pub fn reconnect(&self) {
        let _ = self.session_events.send(SessionEvent::Connected);
    }
}

impl Drop for MemoryCoordinator {
    fn drop(&mut self) {
        let expired: Vec<String> = {
            let tree = self.tree.lock().expect("coordinator tree lock poisoned");
            tree.nodes
                .iter()
                .filter(|(_, node)| node.ephemeral_owner == Some(self.session_id))
                .map(|(path, _)| path.clone())
                .collect()
        };
        let mut tree = self.tree.lock().expect("coordinator tree lock poisoned");
        for path in expired {
            tree.remove_node(&path);
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinatorError> {
        validate_path(path)?;
        let mut tree = self.tree.lock().expect("coordinator tree lock poisoned");
        if tree.nodes.contains_key(path) {
            return Err(CoordinatorError::NodeExists(path.to_string()));
        }
        // Create missing parents as persistent nodes
        let mut created_parents = Vec::new();
        let mut ancestor = parent_path(path);
        while let Some(current) = ancestor {
            if tree.nodes.contains_key(&current) || current == "/" {
                break;
            }
            tree.nodes.insert(current.clone(), Node {
                data: Vec::new(),
                ephemeral_owner: None,
            });
            created_parents.push(current.clone());
            ancestor = parent_path(&current);
        }
        tree.nodes.insert(path.to_string(), Node {
            data,
            ephemeral_owner: Some(self.session_id),
        });
        for parent in created_parents {
            if let Some(grandparent) = parent_path(&parent) {
                tree.fire_child_watches(&grandparent);
            }
        }
        if let Some(parent) = parent_path(path) {
            tree.fire_child_watches(&parent);
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinatorError> {
        validate_path(path)?;
        let mut tree = self.tree.lock().expect("coordinator tree lock poisoned");
        if !tree.nodes.contains_key(path) {
            return Err(CoordinatorError::NoNode(path.to_string()));
        }
        let child_prefix = format!("{}/", path);
        if tree.nodes.keys().any(|key| key.starts_with(&child_prefix)) {
            return Err(CoordinatorError::Backend(format!("node {} has children", path)));
        }
        tree.remove_node(path);
        Ok(())
    }

    async fn get_children(&self, path: &str, watch: Option<Watch>) -> Result<Vec<String>, CoordinatorError> {
        validate_path(path)?;
        let mut tree = self.tree.lock().expect("coordinator tree lock poisoned");
        if !tree.nodes.contains_key(path) {
            return Err(CoordinatorError::NoNode(path.to_string()));
        }
        let prefix = format!("{}/", path);
        let children = tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect();
        if let Some(watch) = watch {
            tree.child_watches.entry(path.to_string()).or_default().push(watch);
        }
        Ok(children)
    }

    async fn get_data(&self, path: &str, watch: Option<Watch>) -> Result<Vec<u8>, CoordinatorError> {
        validate_path(path)?;
        let mut tree = self.tree.lock().expect("coordinator tree lock poisoned");
        let data = match tree.nodes.get(path) {
            Some(node) => node.data.clone(),
            None => return Err(CoordinatorError::NoNode(path.to_string())),
        };
        if let Some(watch) = watch {
            tree.data_watches.entry(path.to_string()).or_default().push(watch);
        }
        Ok(data)
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events.subscribe()
    }
}

fn parent_path(path: &str) -> Option<String> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        // Children of the root still notify watches on "/"
        return if path.len() > 1 { Some("/".to_string()) } else { None };
    }
    Some(path[..idx].to_string())
}

fn validate_path(path: &str) -> Result<(), CoordinatorError> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(CoordinatorError::Backend(format!("invalid path {:?}", path)));
    }
    Ok(())
}
