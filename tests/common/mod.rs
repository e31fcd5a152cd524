//! Common test utilities

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gatefleet::models::{NewNode, NewTariff, Node, NodeId, Protocol, Role, Tariff, UserId};
use gatefleet::orchestrator::{Orchestrator, OrchestratorSettings};
use gatefleet::remote::{
    CreateCredential, NodeConnector, NodeControl, NodeStatus, RemoteCredentialRecord, RemoteError,
};
use gatefleet::storage::{AccountRepository, NodeRepository, Store};

pub const ADMIN: UserId = 1;

/// In-memory gateway node
pub struct MemoryNode {
    id: NodeId,
    reachable: AtomicBool,
    credentials: Mutex<HashMap<String, RemoteCredentialRecord>>,
    next_id: AtomicUsize,
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
}

#[allow(dead_code)]
impl MemoryNode {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            reachable: AtomicBool::new(true),
            credentials: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn remote_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.credentials.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn remote_count(&self) -> usize {
        self.credentials.lock().unwrap().len()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Plant a credential the ledger knows nothing about
    pub fn plant(&self, id: &str, created_at_ms: Option<i64>) {
        self.credentials.lock().unwrap().insert(
            id.to_string(),
            RemoteCredentialRecord {
                id: id.to_string(),
                label: "planted".to_string(),
                owner_id: None,
                created_at_ms,
                enabled: true,
            },
        );
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Transport("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl NodeControl for MemoryNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn create_credential(&self, request: &CreateCredential) -> Result<String, RemoteError> {
        self.check()?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        // Give concurrent provisioning a chance to interleave
        tokio::task::yield_now().await;

        let id = format!("n{}-{}", self.id, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.credentials.lock().unwrap().insert(
            id.clone(),
            RemoteCredentialRecord {
                id: id.clone(),
                label: request.label.clone(),
                owner_id: Some(request.owner_id),
                created_at_ms: Some(Utc::now().timestamp_millis()),
                enabled: true,
            },
        );
        Ok(id)
    }

    async fn delete_credential(&self, remote_id: &str) -> Result<bool, RemoteError> {
        self.check()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(self.credentials.lock().unwrap().remove(remote_id).is_some())
    }

    async fn list_credentials(&self) -> Result<Vec<RemoteCredentialRecord>, RemoteError> {
        self.check()?;
        Ok(self.credentials.lock().unwrap().values().cloned().collect())
    }

    async fn health_status(&self) -> Result<NodeStatus, RemoteError> {
        self.check()?;
        Ok(NodeStatus {
            version: Some("test".to_string()),
            ..Default::default()
        })
    }
}

/// Connector handing out one [`MemoryNode`] per node id
#[derive(Default)]
pub struct MemoryFleet {
    nodes: Mutex<HashMap<NodeId, Arc<MemoryNode>>>,
}

impl MemoryFleet {
    pub fn node(&self, id: NodeId) -> Arc<MemoryNode> {
        Arc::clone(
            self.nodes
                .lock()
                .unwrap()
                .entry(id)
                .or_insert_with(|| Arc::new(MemoryNode::new(id))),
        )
    }
}

impl NodeConnector for MemoryFleet {
    fn connect(&self, node: &Node) -> Result<Arc<dyn NodeControl>, RemoteError> {
        Ok(self.node(node.id))
    }
}

/// Store, fleet and orchestrator wired together
pub struct TestFleet {
    pub store: Arc<Store>,
    pub fleet: Arc<MemoryFleet>,
    pub orchestrator: Orchestrator,
}

#[allow(dead_code)]
impl TestFleet {
    pub async fn rebootstrap(&self) -> Orchestrator {
        Orchestrator::bootstrap(
            self.store.clone(),
            self.fleet.clone(),
            OrchestratorSettings::default(),
        )
        .await
        .unwrap()
    }
}

/// Fresh fleet with a super admin (id [`ADMIN`]) and nodes of the given
/// capacities, registered before bootstrap
pub async fn test_fleet(capacities: &[u32]) -> TestFleet {
    test_fleet_with(capacities, OrchestratorSettings::default()).await
}

pub async fn test_fleet_with(capacities: &[u32], settings: OrchestratorSettings) -> TestFleet {
    let store = Arc::new(Store::in_memory().unwrap());
    store
        .ensure_user(ADMIN, Some("root"), Role::SuperAdmin)
        .unwrap();

    for (i, capacity) in capacities.iter().enumerate() {
        store.insert_node(&new_node(&format!("n{}", i + 1), *capacity)).unwrap();
    }

    let fleet = Arc::new(MemoryFleet::default());
    let orchestrator = Orchestrator::bootstrap(store.clone(), fleet.clone(), settings)
        .await
        .unwrap();

    TestFleet {
        store,
        fleet,
        orchestrator,
    }
}

pub fn new_node(name: &str, capacity: u32) -> NewNode {
    NewNode {
        name: name.to_string(),
        endpoint: format!("http://{name}.internal:2053/panel"),
        username: "admin".to_string(),
        password: "secret".to_string(),
        location: Some("test".to_string()),
        public_host: format!("{name}.example.net"),
        public_port: 443,
        protocol: Protocol::Vless,
        max_capacity: capacity,
    }
}

#[allow(dead_code)]
pub fn add_user(store: &Store, user_id: UserId, role: Role) {
    store.ensure_user(user_id, None, role).unwrap();
}

#[allow(dead_code)]
pub fn monthly_tariff(store: &Store, traffic_gb: u64) -> Tariff {
    store
        .insert_tariff(&NewTariff {
            name: format!("{traffic_gb} GB / 30 days"),
            duration_days: 30,
            traffic_gb,
            price: 4.99,
        })
        .unwrap()
}

/// Node ids in insertion order
#[allow(dead_code)]
pub async fn node_ids(orchestrator: &Orchestrator) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = orchestrator.list_nodes().await.into_iter().map(|n| n.id).collect();
    ids.sort();
    ids
}
