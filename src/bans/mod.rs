//! Ban propagation
//!
//! A scoped ban revokes the user's credentials on one node. A global ban runs
//! the scoped procedure on every active node in parallel and always records a
//! `global` ban fact, whatever the per-node outcome. Credentials left active
//! on unreachable nodes are retried by the reconciliation loop through
//! [`BanEngine::retry_global_orphans`].
//!
//! Synchronous ban calls never retry beyond the control client's own retry
//! budget; they report how many credentials were revoked.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{BanScope, Credential, NewBan, Node, NodeId, UserId};
use crate::registry::NodeRegistry;
use crate::remote::NodeConnector;
use crate::storage::{FleetStore, NewAction};

/// Actor id used for actions taken by the fleet itself
pub const SYSTEM_ACTOR: UserId = 0;

/// Revocation result for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRevocation {
    pub node_id: NodeId,
    pub attempted: usize,
    pub succeeded: usize,

    /// Last failure seen on this node, if any
    pub error: Option<String>,
}

/// Partial-success report of one ban request
#[derive(Debug, Clone, Serialize)]
pub struct BanOutcome {
    pub target: UserId,
    pub scope: BanScope,
    pub attempted: usize,
    pub succeeded: usize,
    pub nodes: Vec<NodeRevocation>,

    /// Whether a ban fact was written
    pub ban_recorded: bool,
}

impl BanOutcome {
    pub fn is_complete(&self) -> bool {
        self.attempted == self.succeeded
    }
}

/// Revokes credentials and records ban facts
pub struct BanEngine {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn FleetStore>,
    connector: Arc<dyn NodeConnector>,
}

impl BanEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<dyn FleetStore>,
        connector: Arc<dyn NodeConnector>,
    ) -> Self {
        Self {
            registry,
            store,
            connector,
        }
    }

    /// Revoke one credential remotely, then deactivate it in the ledger and
    /// recount the node's gauge. The ledger is left untouched when the node
    /// call fails.
    pub(crate) async fn revoke(&self, node: &Node, credential: &Credential) -> Result<()> {
        let result = async {
            let control = self
                .connector
                .connect(node)
                .map_err(|e| Error::from_remote(node.id, e))?;
            control
                .delete_credential(&credential.remote_id)
                .await
                .map_err(|e| Error::from_remote(node.id, e))
        }
        .await;

        metrics::record_revocation(result.is_ok());
        let existed = result?;
        if !existed {
            tracing::debug!(
                node_id = %node.id,
                credential_id = credential.id,
                "Remote credential already absent"
            );
        }

        self.store.deactivate(credential.id)?;
        let load = self.store.count_active_on_node(node.id)?;
        self.registry.set_load(node.id, load).await?;
        Ok(())
    }

    /// Revoke a batch of credentials that all live on `node`
    async fn revoke_on_node(&self, node: &Node, credentials: &[Credential]) -> NodeRevocation {
        let mut report = NodeRevocation {
            node_id: node.id,
            attempted: credentials.len(),
            succeeded: 0,
            error: None,
        };

        for credential in credentials {
            match self.revoke(node, credential).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    tracing::warn!(
                        node_id = %node.id,
                        credential_id = credential.id,
                        error = %e,
                        "Failed to revoke credential"
                    );
                    report.error = Some(e.to_string());
                }
            }
        }

        report
    }

    /// Ban a user on one node.
    ///
    /// Each revoked credential records one node-scope ban fact. A user with
    /// no credentials on the node still gets a fact, so placement keeps
    /// excluding the node for them.
    #[tracing::instrument(skip_all, fields(actor = actor_id, target = target_id, scope = "node"))]
    pub async fn ban_on_node(
        &self,
        actor_id: UserId,
        target_id: UserId,
        node_id: NodeId,
        reason: &str,
    ) -> Result<BanOutcome> {
        let node = self.registry.get(node_id).await?;
        let credentials = self.store.active_for_user_on_node(target_id, node_id)?;

        let mut report = NodeRevocation {
            node_id,
            attempted: credentials.len(),
            succeeded: 0,
            error: None,
        };
        let mut recorded = 0usize;

        for credential in &credentials {
            match self.revoke(&node, credential).await {
                Ok(()) => {
                    report.succeeded += 1;
                    self.store.record_ban(&NewBan {
                        user_id: target_id,
                        scope: BanScope::Node(node_id),
                        actor_id,
                        reason: reason.to_string(),
                        remote_id: Some(credential.remote_id.clone()),
                    })?;
                    recorded += 1;
                }
                Err(e) => {
                    tracing::warn!(credential_id = credential.id, error = %e, "Failed to revoke credential");
                    report.error = Some(e.to_string());
                }
            }
        }

        if credentials.is_empty() {
            self.store.record_ban(&NewBan {
                user_id: target_id,
                scope: BanScope::Node(node_id),
                actor_id,
                reason: reason.to_string(),
                remote_id: None,
            })?;
            recorded += 1;
        }

        let outcome = BanOutcome {
            target: target_id,
            scope: BanScope::Node(node_id),
            attempted: report.attempted,
            succeeded: report.succeeded,
            nodes: vec![report],
            ban_recorded: recorded > 0,
        };

        self.finish(actor_id, reason, &outcome)?;
        Ok(outcome)
    }

    /// Ban a user fleet-wide
    #[tracing::instrument(skip_all, fields(actor = actor_id, target = target_id, scope = "global"))]
    pub async fn ban_global(
        &self,
        actor_id: UserId,
        target_id: UserId,
        reason: &str,
    ) -> Result<BanOutcome> {
        let by_node = group_by_node(self.store.active_for_user(target_id)?);
        let nodes = self.registry.list_active().await;

        let futures = nodes.iter().map(|node| {
            let credentials = by_node.get(&node.id).map(Vec::as_slice).unwrap_or(&[]);
            self.revoke_on_node(node, credentials)
        });
        let reports: Vec<NodeRevocation> = join_all(futures)
            .await
            .into_iter()
            .filter(|r| r.attempted > 0)
            .collect();

        self.store.record_ban(&NewBan {
            user_id: target_id,
            scope: BanScope::Global,
            actor_id,
            reason: reason.to_string(),
            remote_id: None,
        })?;

        let outcome = BanOutcome {
            target: target_id,
            scope: BanScope::Global,
            attempted: reports.iter().map(|r| r.attempted).sum(),
            succeeded: reports.iter().map(|r| r.succeeded).sum(),
            nodes: reports,
            ban_recorded: true,
        };

        self.finish(actor_id, reason, &outcome)?;
        Ok(outcome)
    }

    fn finish(&self, actor_id: UserId, reason: &str, outcome: &BanOutcome) -> Result<()> {
        metrics::record_ban(outcome.scope.as_str());

        tracing::info!(
            actor = actor_id,
            target = outcome.target,
            scope = %outcome.scope,
            attempted = outcome.attempted,
            succeeded = outcome.succeeded,
            "Ban applied"
        );

        self.store.log_action(
            &NewAction::new(actor_id, "ban")
                .target(outcome.target)
                .details(format!(
                    "scope={} revoked={}/{} reason={reason}",
                    outcome.scope, outcome.succeeded, outcome.attempted
                )),
        )
    }

    /// Clear every ban fact against a user. Revoked credentials are not
    /// restored. Returns the number of facts removed.
    pub fn unban(&self, actor_id: UserId, target_id: UserId) -> Result<usize> {
        let cleared = self.store.clear_bans(target_id)?;
        self.store.log_action(
            &NewAction::new(actor_id, "unban")
                .target(target_id)
                .details(format!("cleared={cleared}")),
        )?;

        tracing::info!(actor = actor_id, target = target_id, cleared, "User unbanned");
        Ok(cleared)
    }

    /// Clear ban facts held against moderators and administrators.
    /// Returns the users whose bans were cleared.
    pub fn auto_unban_privileged(&self) -> Result<Vec<UserId>> {
        let users: BTreeSet<UserId> = self
            .store
            .bans_against_privileged()?
            .into_iter()
            .map(|ban| ban.user_id)
            .collect();

        for &user in &users {
            let cleared = self.store.clear_bans(user)?;
            self.store.log_action(
                &NewAction::new(SYSTEM_ACTOR, "auto_unban")
                    .target(user)
                    .details(format!("cleared={cleared}")),
            )?;
            tracing::info!(target = user, cleared, "Cleared bans against privileged user");
        }

        Ok(users.into_iter().collect())
    }

    /// Re-attempt revocation of credentials still active for globally banned
    /// users. Returns how many were revoked on this pass.
    pub async fn retry_global_orphans(&self) -> Result<usize> {
        let users: BTreeSet<UserId> = self
            .store
            .global_bans()?
            .into_iter()
            .map(|ban| ban.user_id)
            .collect();

        let mut revoked = 0;
        for user in users {
            for (node_id, credentials) in group_by_node(self.store.active_for_user(user)?) {
                let node = match self.registry.get(node_id).await {
                    Ok(node) => node,
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, error = %e, "Orphan on unknown node");
                        continue;
                    }
                };

                let report = self.revoke_on_node(&node, &credentials).await;
                revoked += report.succeeded;
                if report.succeeded < report.attempted {
                    tracing::debug!(
                        node_id = %node_id,
                        target = user,
                        orphans = report.attempted - report.succeeded,
                        "Global ban orphans still pending"
                    );
                }
            }
        }

        Ok(revoked)
    }

    /// Credentials still active for globally banned users
    pub fn pending_orphans(&self) -> Result<usize> {
        let users: BTreeSet<UserId> = self
            .store
            .global_bans()?
            .into_iter()
            .map(|ban| ban.user_id)
            .collect();

        let mut pending = 0;
        for user in users {
            pending += self.store.active_for_user(user)?.len();
        }
        Ok(pending)
    }
}

fn group_by_node(credentials: Vec<Credential>) -> BTreeMap<NodeId, Vec<Credential>> {
    let mut grouped: BTreeMap<NodeId, Vec<Credential>> = BTreeMap::new();
    for credential in credentials {
        grouped.entry(credential.node_id).or_default().push(credential);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::{NewCredential, NewNode, Protocol, Role};
    use crate::remote::fake::FakeConnector;
    use crate::storage::{
        AccountRepository, BanRepository, NodeRepository, Store, SubscriptionLedger,
    };

    struct Fixture {
        engine: BanEngine,
        store: Arc<Store>,
        connector: Arc<FakeConnector>,
        nodes: Vec<NodeId>,
    }

    async fn fixture(node_count: usize) -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let registry = Arc::new(NodeRegistry::new());
        let connector = Arc::new(FakeConnector::default());

        let mut nodes = Vec::new();
        for i in 0..node_count {
            let node = store
                .insert_node(&NewNode {
                    name: format!("n{i}"),
                    endpoint: format!("http://10.0.0.{i}:2053"),
                    username: "admin".to_string(),
                    password: "pw".to_string(),
                    location: None,
                    public_host: format!("n{i}.example.net"),
                    public_port: 443,
                    protocol: Protocol::Vless,
                    max_capacity: 10,
                })
                .unwrap();
            nodes.push(node.id);
            registry.upsert(node).await;
        }

        let engine = BanEngine::new(registry, store.clone(), connector.clone());
        Fixture {
            engine,
            store,
            connector,
            nodes,
        }
    }

    fn grant(f: &Fixture, owner: UserId, node: NodeId) -> Credential {
        let fake = f.connector.node(node);
        let remote_id = format!("r-{owner}-{}", fake.remote_count() + 1);
        fake.insert_remote(&remote_id, Some(0));
        f.store
            .provision(&NewCredential {
                owner_id: owner,
                node_id: node,
                tariff_id: None,
                is_free: true,
                remote_id,
                client_uuid: uuid::Uuid::new_v4().to_string(),
                label: "test".to_string(),
                quota_bytes: 1,
                issued_at: Utc::now(),
                expiry_days: 30,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_scoped_ban_revokes_only_that_node() {
        let f = fixture(2).await;
        grant(&f, 7, f.nodes[0]);
        grant(&f, 7, f.nodes[1]);
        f.engine.registry.set_load(f.nodes[0], 1).await.unwrap();

        let outcome = f.engine.ban_on_node(1, 7, f.nodes[0], "spam").await.unwrap();
        assert_eq!((outcome.attempted, outcome.succeeded), (1, 1));
        assert!(outcome.ban_recorded);

        assert!(f.store.active_for_user_on_node(7, f.nodes[0]).unwrap().is_empty());
        assert_eq!(f.store.active_for_user_on_node(7, f.nodes[1]).unwrap().len(), 1);
        assert!(f.store.banned_node_ids(7).unwrap().contains(&f.nodes[0]));
        assert_eq!(f.engine.registry.get(f.nodes[0]).await.unwrap().current_load, 0);
        assert!(!f.store.has_global_ban(7).unwrap());
    }

    #[tokio::test]
    async fn test_scoped_ban_failure_keeps_credential() {
        let f = fixture(1).await;
        grant(&f, 7, f.nodes[0]);
        f.connector.node(f.nodes[0]).set_reachable(false);

        let outcome = f.engine.ban_on_node(1, 7, f.nodes[0], "spam").await.unwrap();
        assert_eq!((outcome.attempted, outcome.succeeded), (1, 0));
        assert!(!outcome.ban_recorded);
        assert!(outcome.nodes[0].error.is_some());
        assert_eq!(f.store.active_for_user(7).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scoped_ban_without_credentials_records_fact() {
        let f = fixture(1).await;

        let outcome = f.engine.ban_on_node(1, 7, f.nodes[0], "spam").await.unwrap();
        assert_eq!(outcome.attempted, 0);
        assert!(outcome.ban_recorded);
        assert_eq!(f.store.bans_for_user(7).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_global_ban_partial_then_retry() {
        let f = fixture(2).await;
        grant(&f, 7, f.nodes[0]);
        grant(&f, 7, f.nodes[1]);
        f.connector.node(f.nodes[1]).set_reachable(false);

        let outcome = f.engine.ban_global(1, 7, "abuse").await.unwrap();
        assert_eq!((outcome.attempted, outcome.succeeded), (2, 1));
        assert!(outcome.ban_recorded);
        assert!(f.store.has_global_ban(7).unwrap());
        assert_eq!(f.engine.pending_orphans().unwrap(), 1);

        assert_eq!(f.engine.retry_global_orphans().await.unwrap(), 0);

        f.connector.node(f.nodes[1]).set_reachable(true);
        assert_eq!(f.engine.retry_global_orphans().await.unwrap(), 1);
        assert_eq!(f.engine.pending_orphans().unwrap(), 0);
        assert_eq!(f.connector.node(f.nodes[1]).remote_count(), 0);
    }

    #[tokio::test]
    async fn test_unban_and_auto_unban() {
        let f = fixture(1).await;
        f.store.ensure_user(7, None, Role::User).unwrap();
        f.store.ensure_user(8, None, Role::Moderator).unwrap();

        f.engine.ban_global(1, 7, "abuse").await.unwrap();
        f.engine.ban_global(1, 8, "abuse").await.unwrap();

        assert_eq!(f.engine.auto_unban_privileged().unwrap(), vec![8]);
        assert!(f.store.has_global_ban(7).unwrap());
        assert!(!f.store.has_global_ban(8).unwrap());

        assert_eq!(f.engine.unban(1, 7).unwrap(), 1);
        assert!(!f.store.has_global_ban(7).unwrap());

        let actions = f.store.recent_actions(10).unwrap();
        assert!(actions.iter().any(|a| a.action == "auto_unban"));
        assert!(actions.iter().any(|a| a.action == "unban"));
    }
}
