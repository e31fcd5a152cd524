//! In-memory node doubles for unit tests

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    CreateCredential, NodeConnector, NodeControl, NodeStatus, RemoteCredentialRecord, RemoteError,
};
use crate::models::{Node, NodeId};

pub(crate) struct FakeNode {
    id: NodeId,
    pub reachable: AtomicBool,
    pub credentials: Mutex<HashMap<String, RemoteCredentialRecord>>,
    pub deletes: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            reachable: AtomicBool::new(true),
            credentials: Mutex::new(HashMap::new()),
            deletes: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn remote_count(&self) -> usize {
        self.credentials.lock().unwrap().len()
    }

    pub fn insert_remote(&self, id: &str, created_at_ms: Option<i64>) {
        self.credentials.lock().unwrap().insert(
            id.to_string(),
            RemoteCredentialRecord {
                id: id.to_string(),
                label: String::new(),
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
            Err(RemoteError::Timeout)
        }
    }
}

#[async_trait]
impl NodeControl for FakeNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn create_credential(&self, request: &CreateCredential) -> Result<String, RemoteError> {
        self.check()?;
        let id = format!("{}-{}", self.id, self.next_id.fetch_add(1, Ordering::SeqCst));
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
        Ok(NodeStatus::default())
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    nodes: Mutex<HashMap<NodeId, Arc<FakeNode>>>,
}

impl FakeConnector {
    pub fn node(&self, id: NodeId) -> Arc<FakeNode> {
        Arc::clone(
            self.nodes
                .lock()
                .unwrap()
                .entry(id)
                .or_insert_with(|| Arc::new(FakeNode::new(id))),
        )
    }
}

impl NodeConnector for FakeConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn NodeControl>, RemoteError> {
        Ok(self.node(node.id))
    }
}
