//! Reconciliation loop
//!
//! One periodic background task converging the ledger and the fleet. Each
//! cycle:
//!
//! 1. probes every active node, marking reachability and raising or
//!    resolving `node_unreachable` alerts
//! 2. expires stale credentials and revokes them on their nodes (best effort)
//! 3. sweeps remote listings for credentials with no active ledger record
//!    that are older than the grace period
//! 4. retries revocation of credentials left behind by global bans
//! 5. optionally clears bans held against privileged users
//! 6. rebuilds the registry load gauges from the ledger
//!
//! A failing step is recorded in the [`CycleReport`] and the cycle carries on.
//! The loop takes no lock shared with the provisioning path.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bans::BanEngine;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{Node, NodeId, UserId};
use crate::notifications::{AlertKind, AlertManager, AlertSeverity, AlertTarget};
use crate::registry::NodeRegistry;
use crate::remote::{NodeConnector, RemoteCredentialRecord};
use crate::storage::FleetStore;

/// Loop tuning
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub interval: std::time::Duration,

    /// Minimum age of a remote credential before the reverse sweep deletes it
    pub orphan_grace: Duration,

    pub auto_unban_privileged: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(300),
            orphan_grace: Duration::minutes(15),
            auto_unban_privileged: true,
        }
    }
}

impl From<&Config> for ReconcileSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.reconcile_interval(),
            orphan_grace: config.orphan_grace(),
            auto_unban_privileged: config.reconcile.auto_unban_privileged,
        }
    }
}

/// Summary of one reconciliation cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub probed: usize,
    pub unreachable: Vec<NodeId>,
    pub recovered: Vec<NodeId>,

    /// Credentials deactivated by the expiry sweep
    pub expired: usize,

    /// Expired credentials whose remote counterpart was deleted
    pub expired_revoked: usize,

    /// Remote credentials deleted by the reverse sweep
    pub swept: usize,

    /// Global-ban orphans revoked on this pass
    pub orphans_revoked: usize,

    /// Global-ban orphans still pending after this pass
    pub orphans_pending: usize,

    pub unbanned: Vec<UserId>,
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Periodic convergence task
pub struct Reconciler {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn FleetStore>,
    connector: Arc<dyn NodeConnector>,
    bans: Arc<BanEngine>,
    alerts: Arc<AlertManager>,
    settings: ReconcileSettings,

    /// First sighting of unknown remote credentials that carry no creation
    /// time, keyed by node and remote id
    undated: Mutex<HashMap<(NodeId, String), DateTime<Utc>>>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<dyn FleetStore>,
        connector: Arc<dyn NodeConnector>,
        bans: Arc<BanEngine>,
        alerts: Arc<AlertManager>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            registry,
            store,
            connector,
            bans,
            alerts,
            settings,
            undated: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Run one full cycle at `now`
    #[tracing::instrument(skip(self))]
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        self.probe_nodes(now, &mut report).await;

        if let Err(e) = self.expire_credentials(now, &mut report).await {
            report.errors.push(format!("expiry sweep: {e}"));
        }

        self.sweep_orphans(now, &mut report).await;

        match self.bans.retry_global_orphans().await {
            Ok(revoked) => report.orphans_revoked = revoked,
            Err(e) => report.errors.push(format!("global ban retry: {e}")),
        }
        match self.bans.pending_orphans() {
            Ok(pending) => report.orphans_pending = pending,
            Err(e) => report.errors.push(format!("orphan count: {e}")),
        }

        if self.settings.auto_unban_privileged {
            match self.bans.auto_unban_privileged() {
                Ok(users) => report.unbanned = users,
                Err(e) => report.errors.push(format!("privileged unban: {e}")),
            }
        }

        if let Err(e) = self.rebuild_loads().await {
            report.errors.push(format!("load rebuild: {e}"));
        }

        self.update_subsystem_alerts(now, &report).await;

        let elapsed = started.elapsed().as_secs_f64();
        metrics::record_reconcile_cycle(report.is_clean(), elapsed, report.expired, report.swept);

        tracing::info!(
            probed = report.probed,
            unreachable = report.unreachable.len(),
            expired = report.expired,
            swept = report.swept,
            orphans = report.orphans_pending,
            errors = report.errors.len(),
            duration_ms = (elapsed * 1000.0) as u64,
            "Reconciliation cycle finished"
        );

        report
    }

    async fn probe_nodes(&self, now: DateTime<Utc>, report: &mut CycleReport) {
        let nodes = self.registry.list_active().await;
        report.probed = nodes.len();

        let probes = nodes.iter().map(|node| async move {
            let result = match self.connector.connect(node) {
                Ok(control) => control.health_status().await,
                Err(e) => Err(e),
            };
            (node, result)
        });

        for (node, result) in join_all(probes).await {
            let reachable = result.is_ok();
            let previous = match self.registry.set_reachable(node.id, reachable).await {
                Ok(previous) => previous,
                Err(e) => {
                    report.errors.push(format!("registry: {e}"));
                    continue;
                }
            };
            if let Err(e) = self.registry.record_health_check(node.id, now).await {
                report.errors.push(format!("registry: {e}"));
            }

            let target = AlertTarget::Node(node.id);
            match result {
                Ok(status) => {
                    tracing::debug!(node_id = %node.id, version = ?status.version, "Node healthy");
                    if !previous {
                        report.recovered.push(node.id);
                    }
                    self.alerts
                        .resolve(&target, AlertKind::NodeUnreachable, now)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(node_id = %node.id, error = %e, "Health probe failed");
                    report.unreachable.push(node.id);
                    self.alerts
                        .raise(
                            target,
                            AlertKind::NodeUnreachable,
                            AlertSeverity::Critical,
                            format!("node {} ({}) failed its health probe: {e}", node.id, node.name),
                            now,
                        )
                        .await;
                }
            }
        }
    }

    async fn expire_credentials(&self, now: DateTime<Utc>, report: &mut CycleReport) -> Result<()> {
        let expired = self.store.expire_stale(now)?;
        report.expired = expired.len();

        let touched: BTreeSet<NodeId> = expired.iter().map(|c| c.node_id).collect();
        for node_id in touched {
            let load = self.store.count_active_on_node(node_id)?;
            if let Err(e) = self.registry.set_load(node_id, load).await {
                tracing::debug!(node_id = %node_id, error = %e, "Expired credentials on unknown node");
            }
        }

        for credential in &expired {
            let node = match self.registry.get(credential.node_id).await {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!(credential_id = credential.id, error = %e, "Expired credential on unknown node");
                    continue;
                }
            };

            match self.delete_remote(&node, &credential.remote_id).await {
                Ok(_) => report.expired_revoked += 1,
                Err(e) => tracing::warn!(
                    node_id = %node.id,
                    credential_id = credential.id,
                    error = %e,
                    "Failed to revoke expired credential; left to the reverse sweep"
                ),
            }
        }

        Ok(())
    }

    async fn sweep_orphans(&self, now: DateTime<Utc>, report: &mut CycleReport) {
        let nodes: Vec<Node> = self
            .registry
            .list_active()
            .await
            .into_iter()
            .filter(|n| n.reachable)
            .collect();

        for node in nodes {
            match self.sweep_node(&node, now).await {
                Ok(swept) => report.swept += swept,
                Err(e) => {
                    tracing::warn!(node_id = %node.id, error = %e, "Reverse sweep failed");
                    report.errors.push(format!("reverse sweep on node {}: {e}", node.id));
                }
            }
        }
    }

    /// Delete remote credentials with no active ledger record on `node`
    async fn sweep_node(&self, node: &Node, now: DateTime<Utc>) -> Result<usize> {
        let control = self
            .connector
            .connect(node)
            .map_err(|e| Error::from_remote(node.id, e))?;
        let remote = control
            .list_credentials()
            .await
            .map_err(|e| Error::from_remote(node.id, e))?;

        let known: HashSet<String> = self
            .store
            .active_on_node(node.id)?
            .into_iter()
            .map(|c| c.remote_id)
            .collect();

        let stale: Vec<&RemoteCredentialRecord> = {
            let listed: HashSet<&str> = remote.iter().map(|r| r.id.as_str()).collect();
            let mut undated = self.undated.lock().await;
            undated.retain(|(node_id, id), _| {
                *node_id != node.id || (listed.contains(id.as_str()) && !known.contains(id))
            });

            let mut stale = Vec::new();
            for record in remote.iter().filter(|r| !known.contains(&r.id)) {
                // Undated records age from the cycle that first listed them
                let created_at = match record.created_at() {
                    Some(created_at) => created_at,
                    None => *undated.entry((node.id, record.id.clone())).or_insert(now),
                };
                if now - created_at >= self.settings.orphan_grace {
                    stale.push(record);
                }
            }
            stale
        };

        let mut swept = 0;
        for record in stale {
            match control.delete_credential(&record.id).await {
                Ok(_) => {
                    swept += 1;
                    self.undated.lock().await.remove(&(node.id, record.id.clone()));
                    tracing::info!(node_id = %node.id, remote_id = %record.id, "Deleted orphaned remote credential");
                }
                Err(e) => tracing::warn!(
                    node_id = %node.id,
                    remote_id = %record.id,
                    error = %e,
                    "Failed to delete orphaned remote credential"
                ),
            }
        }

        Ok(swept)
    }

    async fn delete_remote(&self, node: &Node, remote_id: &str) -> Result<bool> {
        let control = self
            .connector
            .connect(node)
            .map_err(|e| Error::from_remote(node.id, e))?;
        let deleted = control
            .delete_credential(remote_id)
            .await
            .map_err(|e| Error::from_remote(node.id, e));
        metrics::record_revocation(deleted.is_ok());
        deleted
    }

    async fn rebuild_loads(&self) -> Result<()> {
        let loads = self.store.active_load_by_node()?;
        self.registry.rebuild_loads(&loads).await;

        for node in self.registry.list_all().await {
            metrics::set_node_state(node.id, node.current_load, node.reachable);
        }
        metrics::set_active_credentials(self.store.count_active()?);
        Ok(())
    }

    async fn update_subsystem_alerts(&self, now: DateTime<Utc>, report: &CycleReport) {
        let reconcile = AlertTarget::Subsystem("reconcile".to_string());
        if report.is_clean() {
            self.alerts
                .resolve(&reconcile, AlertKind::ReconcileFailure, now)
                .await;
        } else {
            self.alerts
                .raise(
                    reconcile,
                    AlertKind::ReconcileFailure,
                    AlertSeverity::Warning,
                    report.errors.join("; "),
                    now,
                )
                .await;
        }

        let bans = AlertTarget::Subsystem("bans".to_string());
        if report.orphans_pending == 0 {
            self.alerts
                .resolve(&bans, AlertKind::OrphanBacklog, now)
                .await;
        } else {
            self.alerts
                .raise(
                    bans,
                    AlertKind::OrphanBacklog,
                    AlertSeverity::Warning,
                    format!(
                        "{} credentials of globally banned users are still active",
                        report.orphans_pending
                    ),
                    now,
                )
                .await;
        }
    }

    /// Start the periodic loop. The first cycle runs immediately.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let token = CancellationToken::new();
        let cancel = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                interval_secs = self.settings.interval.as_secs(),
                "Reconciliation loop started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_cycle(Utc::now()).await;
                    }
                }
            }

            tracing::info!("Reconciliation loop stopped");
        });

        ReconcilerHandle { token, task }
    }
}

/// Lifecycle handle of a running reconciliation loop
pub struct ReconcilerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Token that stops the loop when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the loop and wait for the in-flight cycle to finish
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Reconciliation task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewCredential, NewNode, Protocol};
    use crate::remote::fake::FakeConnector;
    use crate::storage::{NodeRepository, Store, SubscriptionLedger};

    struct Fixture {
        reconciler: Arc<Reconciler>,
        registry: Arc<NodeRegistry>,
        store: Arc<Store>,
        connector: Arc<FakeConnector>,
        alerts: Arc<AlertManager>,
        node: NodeId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let registry = Arc::new(NodeRegistry::new());
        let connector = Arc::new(FakeConnector::default());
        let alerts = Arc::new(AlertManager::new(Duration::hours(1)));

        let node = store
            .insert_node(&NewNode {
                name: "n1".to_string(),
                endpoint: "http://10.0.0.1:2053".to_string(),
                username: "admin".to_string(),
                password: "pw".to_string(),
                location: None,
                public_host: "n1.example.net".to_string(),
                public_port: 443,
                protocol: Protocol::Vless,
                max_capacity: 10,
            })
            .unwrap();
        let node_id = node.id;
        registry.upsert(node).await;

        let bans = Arc::new(BanEngine::new(
            registry.clone(),
            store.clone(),
            connector.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            store.clone(),
            connector.clone(),
            bans,
            alerts.clone(),
            ReconcileSettings {
                interval: std::time::Duration::from_millis(20),
                ..ReconcileSettings::default()
            },
        ));

        Fixture {
            reconciler,
            registry,
            store,
            connector,
            alerts,
            node: node_id,
        }
    }

    #[tokio::test]
    async fn test_unreachable_node_alerts_once_and_recovers() {
        let f = fixture().await;
        let fake = f.connector.node(f.node);
        fake.set_reachable(false);

        let t0 = Utc::now();
        let report = f.reconciler.run_cycle(t0).await;
        assert_eq!(report.unreachable, vec![f.node]);
        assert!(!f.registry.get(f.node).await.unwrap().reachable);
        assert!(f
            .alerts
            .is_firing(&AlertTarget::Node(f.node), AlertKind::NodeUnreachable));

        f.reconciler.run_cycle(t0 + Duration::minutes(5)).await;
        let fired = f
            .alerts
            .history()
            .iter()
            .filter(|a| a.kind == AlertKind::NodeUnreachable)
            .count();
        assert_eq!(fired, 1);

        fake.set_reachable(true);
        let report = f.reconciler.run_cycle(t0 + Duration::minutes(10)).await;
        assert_eq!(report.recovered, vec![f.node]);
        assert!(f.registry.get(f.node).await.unwrap().reachable);
        assert!(!f
            .alerts
            .is_firing(&AlertTarget::Node(f.node), AlertKind::NodeUnreachable));
    }

    #[tokio::test]
    async fn test_rebuilds_load_from_ledger() {
        let f = fixture().await;
        f.registry.set_load(f.node, 9).await.unwrap();

        let now = Utc::now();
        f.store
            .provision(&NewCredential {
                owner_id: 7,
                node_id: f.node,
                tariff_id: None,
                is_free: true,
                remote_id: "r-1".to_string(),
                client_uuid: "u-1".to_string(),
                label: "a".to_string(),
                quota_bytes: 1,
                issued_at: now,
                expiry_days: 30,
            })
            .unwrap();
        f.connector.node(f.node).insert_remote("r-1", Some(0));

        let report = f.reconciler.run_cycle(now).await;
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(f.registry.get(f.node).await.unwrap().current_load, 1);
        assert_eq!(report.swept, 0);
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let f = fixture().await;
        let handle = f.reconciler.clone().spawn();
        assert!(handle.is_running());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.stop().await;

        assert!(f.registry.get(f.node).await.unwrap().last_health_check.is_some());
    }
}
