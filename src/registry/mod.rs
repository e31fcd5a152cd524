//! Node registry
//!
//! In-memory view of the gateway fleet: node metadata, reachability and load
//! gauges. Load gauges are never trusted across restarts; they are rebuilt
//! from the ledger with [`NodeRegistry::rebuild_loads`].
//!
//! The registry also hands out per-node provisioning locks so that the
//! capacity check and the load update of one provisioning happen without a
//! concurrent provisioning on the same node in between.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{EntityKind, Error, Result};
use crate::models::{Node, NodeId};

/// Registry of known gateway nodes
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Node>>,

    /// One serialization slot per node for the provisioning path
    slots: Mutex<HashMap<NodeId, Arc<Mutex<()>>>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the registry contents, e.g. with nodes loaded from storage
    pub async fn load(&self, nodes: Vec<Node>) {
        let mut map = self.nodes.write().await;
        map.clear();
        for node in nodes {
            map.insert(node.id, node);
        }
    }

    /// Active nodes ordered by id
    pub async fn list_active(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.active)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// All nodes, including deactivated ones, ordered by id
    pub async fn list_all(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    pub async fn get(&self, id: NodeId) -> Result<Node> {
        self.nodes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(EntityKind::Node, id))
    }

    /// Insert or replace a node. The existing load gauge is kept on update.
    pub async fn upsert(&self, mut node: Node) {
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.get(&node.id) {
            node.current_load = existing.current_load;
        }
        nodes.insert(node.id, node);
    }

    /// Record a probe result. Returns the previous reachability.
    pub async fn set_reachable(&self, id: NodeId, reachable: bool) -> Result<bool> {
        self.update(id, |node| {
            let previous = node.reachable;
            node.reachable = reachable;
            previous
        })
        .await
    }

    pub async fn record_health_check(&self, id: NodeId, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |node| node.last_health_check = Some(at))
            .await
    }

    pub async fn set_active(&self, id: NodeId, active: bool) -> Result<()> {
        self.update(id, |node| node.active = active).await
    }

    /// Set one node's gauge to a count derived from the ledger
    pub async fn set_load(&self, id: NodeId, load: u32) -> Result<()> {
        self.update(id, |node| node.current_load = load).await
    }

    /// Rebuild every gauge from ledger counts. Nodes absent from `loads`
    /// have no active credentials.
    pub async fn rebuild_loads(&self, loads: &HashMap<NodeId, u32>) {
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            node.current_load = loads.get(&node.id).copied().unwrap_or(0);
        }
    }

    /// Acquire the provisioning slot for a node
    pub async fn lock_node(&self, id: NodeId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(id).or_default())
        };
        slot.lock_owned().await
    }

    /// Get registry statistics
    pub async fn stats(&self) -> RegistryStats {
        let nodes = self.nodes.read().await;

        let mut stats = RegistryStats {
            total_nodes: nodes.len(),
            ..Default::default()
        };

        for node in nodes.values().filter(|n| n.active) {
            stats.active_nodes += 1;
            if node.reachable {
                stats.reachable_nodes += 1;
            }
            stats.total_capacity += u64::from(node.max_capacity);
            stats.total_load += u64::from(node.current_load);
        }

        stats
    }

    async fn update<T>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> T) -> Result<T> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(EntityKind::Node, id))?;
        Ok(f(node))
    }
}

/// Registry statistics over active nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub reachable_nodes: usize,
    pub total_capacity: u64,
    pub total_load: u64,
}

impl RegistryStats {
    /// Fleet utilization percentage
    pub fn utilization(&self) -> f64 {
        if self.total_capacity == 0 {
            0.0
        } else {
            (self.total_load as f64 / self.total_capacity as f64) * 100.0
        }
    }
}
