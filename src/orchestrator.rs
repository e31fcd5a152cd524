//! Fleet orchestrator
//!
//! Public entry point used by the chat and admin front ends. Wires the
//! registry, the ledger, the control clients and the ban engine together:
//!
//! - [`Orchestrator::provision`] chooses a node, creates the credential
//!   remotely, then records it in the ledger
//! - [`Orchestrator::ban`] and [`Orchestrator::unban`] check the actor's
//!   capabilities and delegate to the [`BanEngine`]
//! - [`Orchestrator::stats`] reports fleet figures
//!
//! Provisioning holds the chosen node's slot from the capacity check until
//! the load gauge is updated, so concurrent requests cannot over-subscribe
//! a node.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::bans::{BanEngine, BanOutcome};
use crate::config::Config;
use crate::descriptor::{self, ConnectionConfig};
use crate::error::{EntityKind, Error, Result};
use crate::metrics;
use crate::models::{
    BanScope, Capabilities, Credential, NewCredential, NewNode, NewTariff, Node, NodeId, Role,
    Tariff, UserAccount, UserId, BYTES_PER_GIB,
};
use crate::notifications::AlertManager;
use crate::placement::{select_node, PlacementPolicy};
use crate::reconcile::{ReconcileSettings, Reconciler};
use crate::registry::{NodeRegistry, RegistryStats};
use crate::remote::{CreateCredential, NodeConnector};
use crate::storage::{FleetStore, NewAction};

// ============================================================================
// Requests and results
// ============================================================================

/// A validated provisioning request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub owner_id: UserId,

    /// User acting on behalf of the owner; the owner when absent
    #[serde(default)]
    pub actor_id: Option<UserId>,

    /// `None` requests a free-tier grant
    #[serde(default)]
    pub tariff_id: Option<i64>,

    #[serde(default)]
    pub is_free: bool,

    #[serde(default)]
    pub label: Option<String>,

    /// Ask for placement on a full node; requires the over-capacity capability
    #[serde(default)]
    pub allow_over_capacity: bool,
}

impl ProvisionRequest {
    pub fn paid(owner_id: UserId, tariff_id: i64) -> Self {
        Self {
            owner_id,
            tariff_id: Some(tariff_id),
            ..Self::default()
        }
    }

    pub fn free(owner_id: UserId) -> Self {
        Self {
            owner_id,
            is_free: true,
            ..Self::default()
        }
    }

    pub fn on_behalf_of(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn over_capacity(mut self) -> Self {
        self.allow_over_capacity = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub credential: Credential,
    pub config: ConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRequest {
    pub actor_id: UserId,
    pub target_id: UserId,
    pub scope: BanScope,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetireOutcome {
    pub node_id: NodeId,

    /// Credentials deleted on the node
    pub revoked: usize,

    /// Credentials deactivated in the ledger
    pub deactivated: usize,
}

/// Fleet figures for the admin front end
#[derive(Debug, Clone, Serialize)]
pub struct FleetStats {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub active_credentials: u64,
    pub utilization: f64,

    /// Reported by an external revenue ledger, when one is attached
    pub total_revenue: Option<f64>,
}

/// Read-only passthrough to the payments ledger
pub trait RevenueSource: Send + Sync {
    fn total_revenue(&self) -> Result<f64>;
}

/// Values the orchestrator reads from [`Config`]
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub free_quota_bytes: u64,
    pub free_duration_days: u32,
    pub allow_over_capacity_for_privileged: bool,
    pub reconcile: ReconcileSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            free_quota_bytes: config.free_tier.quota_gb.saturating_mul(BYTES_PER_GIB),
            free_duration_days: config.free_tier.duration_days,
            allow_over_capacity_for_privileged: config.placement.allow_over_capacity_for_privileged,
            reconcile: ReconcileSettings::from(config),
        }
    }
}

/// Grant parameters resolved from the tariff or the free tier
struct Grant {
    tariff_id: Option<i64>,
    is_free: bool,
    quota_bytes: u64,
    days: u32,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn FleetStore>,
    connector: Arc<dyn NodeConnector>,
    bans: Arc<BanEngine>,
    settings: OrchestratorSettings,
    revenue: Option<Arc<dyn RevenueSource>>,
}

impl Orchestrator {
    /// Load persisted nodes into a fresh registry and rebuild every load
    /// gauge from the ledger.
    pub async fn bootstrap(
        store: Arc<dyn FleetStore>,
        connector: Arc<dyn NodeConnector>,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        let registry = Arc::new(NodeRegistry::new());
        registry.load(store.list_nodes()?).await;
        registry.rebuild_loads(&store.active_load_by_node()?).await;

        let stats = registry.stats().await;
        tracing::info!(
            nodes = stats.total_nodes,
            active_nodes = stats.active_nodes,
            load = stats.total_load,
            "Fleet registry loaded"
        );

        let bans = Arc::new(BanEngine::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&connector),
        ));

        Ok(Self {
            registry,
            store,
            connector,
            bans,
            settings,
            revenue: None,
        })
    }

    pub fn with_revenue_source(mut self, source: Arc<dyn RevenueSource>) -> Self {
        self.revenue = Some(source);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn FleetStore> {
        &self.store
    }

    pub fn ban_engine(&self) -> &Arc<BanEngine> {
        &self.bans
    }

    /// Build the reconciliation loop over the same registry and ledger
    pub fn reconciler(&self, alerts: Arc<AlertManager>) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.connector),
            Arc::clone(&self.bans),
            alerts,
            self.settings.reconcile.clone(),
        )
    }

    fn account(&self, user_id: UserId) -> Result<UserAccount> {
        self.store
            .get_user(user_id)?
            .ok_or_else(|| Error::not_found(EntityKind::User, user_id))
    }

    fn require(
        &self,
        actor_id: UserId,
        action: &'static str,
        allowed: impl FnOnce(&Capabilities) -> bool,
    ) -> Result<UserAccount> {
        let actor = self.account(actor_id)?;
        if !allowed(&actor.role.capabilities()) {
            return Err(Error::PermissionDenied {
                actor: actor_id,
                action,
            });
        }
        Ok(actor)
    }

    // ------------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------------

    /// Provision a credential and render its connection descriptor
    #[tracing::instrument(
        skip_all,
        fields(owner = request.owner_id, tariff = ?request.tariff_id, free = request.is_free)
    )]
    pub async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionOutcome> {
        let result = self.try_provision(&request).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(Error::Banned { .. }) => "banned",
            Err(Error::NoCapacity) => "no_capacity",
            Err(Error::TariffNotFound(_)) => "tariff_not_found",
            Err(Error::FreeLimitReached { .. }) => "free_limit",
            Err(Error::NodeUnreachable { .. } | Error::NodeRejected { .. }) => "node_error",
            Err(_) => "error",
        };
        metrics::record_provision(outcome);

        match &result {
            Ok(done) => tracing::info!(
                credential_id = done.credential.id,
                node_id = %done.credential.node_id,
                "Credential provisioned"
            ),
            Err(e) => tracing::warn!(error = %e, outcome, "Provisioning failed"),
        }

        result
    }

    async fn try_provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome> {
        let owner = self.account(request.owner_id)?;
        let actor = match request.actor_id {
            Some(actor_id) if actor_id != owner.user_id => self.account(actor_id)?,
            _ => owner.clone(),
        };
        let caps = actor.role.capabilities();

        if self.store.has_global_ban(owner.user_id)? {
            if !caps.bypass_bans {
                return Err(Error::Banned {
                    user_id: owner.user_id,
                });
            }
            tracing::warn!(
                actor = actor.user_id,
                owner = owner.user_id,
                role = %actor.role,
                "Provisioning for a globally banned user under ban override"
            );
        }

        let grant = self.resolve_grant(request)?;

        if grant.is_free {
            if let Some(limit) = caps.max_free_connections {
                if self.store.count_free_grants(owner.user_id)? >= limit {
                    return Err(Error::FreeLimitReached {
                        user_id: owner.user_id,
                        limit,
                    });
                }
            }
        }

        if request.allow_over_capacity && !caps.over_capacity {
            return Err(Error::PermissionDenied {
                actor: actor.user_id,
                action: "provision over capacity",
            });
        }
        let policy = PlacementPolicy {
            allow_over_capacity: request.allow_over_capacity
                && self.settings.allow_over_capacity_for_privileged,
        };

        let label = request
            .label
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| default_label(owner.user_id));

        let banned_nodes = self.store.banned_node_ids(owner.user_id)?;
        let mut excluded: HashSet<NodeId> = HashSet::new();
        let mut last_failure: Option<Error> = None;

        loop {
            let loads = self.store.active_load_by_node()?;
            let candidates: Vec<Node> = self
                .registry
                .list_active()
                .await
                .into_iter()
                .filter(|n| n.reachable)
                .filter(|n| !banned_nodes.contains(&n.id) && !excluded.contains(&n.id))
                .map(|mut n| {
                    n.current_load = loads.get(&n.id).copied().unwrap_or(0);
                    n
                })
                .collect();

            let node = match select_node(&candidates, &policy) {
                Ok(node) => node.clone(),
                Err(e) => return Err(last_failure.unwrap_or(e)),
            };

            let _slot = self.registry.lock_node(node.id).await;

            // Another request may have filled the node since the snapshot
            let live = self.store.count_active_on_node(node.id)?;
            self.registry.set_load(node.id, live).await?;
            if !policy.allow_over_capacity && live >= node.max_capacity {
                excluded.insert(node.id);
                continue;
            }

            match self.create_on(&node, owner.user_id, &grant, &label).await {
                Ok(credential) => {
                    let load = self.store.count_active_on_node(node.id)?;
                    self.registry.set_load(node.id, load).await?;

                    let config = descriptor::render(&node, &credential)?;
                    return Ok(ProvisionOutcome { credential, config });
                }
                Err(e @ Error::NodeUnreachable { .. }) => {
                    tracing::warn!(node_id = %node.id, error = %e, "Node unreachable, trying next candidate");
                    self.registry.set_reachable(node.id, false).await?;
                    excluded.insert(node.id);
                    last_failure = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn resolve_grant(&self, request: &ProvisionRequest) -> Result<Grant> {
        match request.tariff_id {
            Some(tariff_id) => {
                let tariff = self
                    .store
                    .get_tariff(tariff_id)?
                    .filter(|t| t.active)
                    .ok_or(Error::TariffNotFound(tariff_id))?;
                Ok(Grant {
                    tariff_id: Some(tariff.id),
                    is_free: request.is_free,
                    quota_bytes: tariff.quota_bytes(),
                    days: tariff.duration_days,
                })
            }
            None => Ok(Grant {
                tariff_id: None,
                is_free: true,
                quota_bytes: self.settings.free_quota_bytes,
                days: self.settings.free_duration_days,
            }),
        }
    }

    /// Remote create, then ledger insert. A failed insert triggers a best
    /// effort remote delete so no orphan is left behind.
    async fn create_on(
        &self,
        node: &Node,
        owner_id: UserId,
        grant: &Grant,
        label: &str,
    ) -> Result<Credential> {
        let control = self
            .connector
            .connect(node)
            .map_err(|e| Error::from_remote(node.id, e))?;

        let issued_at = Utc::now();
        let client_uuid = Uuid::new_v4().to_string();
        let expires_at = issued_at + Duration::days(i64::from(grant.days));

        let remote_id = control
            .create_credential(&CreateCredential {
                client_uuid: client_uuid.clone(),
                label: label.to_string(),
                owner_id,
                quota_bytes: grant.quota_bytes,
                expires_at_ms: expires_at.timestamp_millis(),
            })
            .await
            .map_err(|e| Error::from_remote(node.id, e))?;

        let inserted = self.store.provision(&NewCredential {
            owner_id,
            node_id: node.id,
            tariff_id: grant.tariff_id,
            is_free: grant.is_free,
            remote_id: remote_id.clone(),
            client_uuid,
            label: label.to_string(),
            quota_bytes: grant.quota_bytes,
            issued_at,
            expiry_days: grant.days,
        });

        match inserted {
            Ok(credential) => Ok(credential),
            Err(e) => {
                tracing::error!(node_id = %node.id, remote_id = %remote_id, error = %e, "Ledger insert failed after remote create");
                if let Err(cleanup) = control.delete_credential(&remote_id).await {
                    tracing::warn!(
                        node_id = %node.id,
                        remote_id = %remote_id,
                        error = %cleanup,
                        "Cleanup delete failed; left to the reverse sweep"
                    );
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Bans
    // ------------------------------------------------------------------------

    pub async fn ban(&self, request: BanRequest) -> Result<BanOutcome> {
        let actor = self.require(request.actor_id, "ban users", |c| c.can_ban)?;
        if request.scope == BanScope::Global && !actor.role.capabilities().can_ban_globally {
            return Err(Error::PermissionDenied {
                actor: actor.user_id,
                action: "ban users fleet-wide",
            });
        }

        let target = self.account(request.target_id)?;
        if target.role.is_privileged() && target.role >= actor.role {
            return Err(Error::PermissionDenied {
                actor: actor.user_id,
                action: "ban a user of equal or higher role",
            });
        }

        match request.scope {
            BanScope::Node(node_id) => {
                self.bans
                    .ban_on_node(actor.user_id, target.user_id, node_id, &request.reason)
                    .await
            }
            BanScope::Global => {
                self.bans
                    .ban_global(actor.user_id, target.user_id, &request.reason)
                    .await
            }
        }
    }

    /// Clear a user's bans. Nothing is re-provisioned.
    pub fn unban(&self, actor_id: UserId, target_id: UserId) -> Result<usize> {
        self.require(actor_id, "unban users", |c| c.can_ban)?;
        self.account(target_id)?;
        self.bans.unban(actor_id, target_id)
    }

    // ------------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------------

    pub async fn stats(&self) -> Result<FleetStats> {
        let registry = self.registry.stats().await;
        let revenue = match &self.revenue {
            Some(source) => Some(source.total_revenue()?),
            None => None,
        };

        Ok(FleetStats {
            utilization: registry.utilization(),
            registry,
            active_credentials: self.store.count_active()?,
            total_revenue: revenue,
        })
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    pub fn ensure_user(&self, user_id: UserId, username: Option<&str>) -> Result<UserAccount> {
        self.store.ensure_user(user_id, username, Role::User)
    }

    pub fn set_role(&self, actor_id: UserId, target_id: UserId, role: Role) -> Result<()> {
        self.require(actor_id, "assign roles", |c| c.can_assign_roles)?;
        self.store.set_role(target_id, role)?;
        self.store.log_action(
            &NewAction::new(actor_id, "set_role")
                .target(target_id)
                .details(format!("role={role}")),
        )?;
        tracing::info!(actor = actor_id, target = target_id, %role, "Role changed");
        Ok(())
    }

    pub async fn add_node(&self, actor_id: UserId, node: NewNode) -> Result<Node> {
        self.require(actor_id, "manage servers", |c| c.can_manage_servers)?;
        let node = self.store.insert_node(&node)?;
        self.registry.upsert(node.clone()).await;
        self.store.log_action(
            &NewAction::new(actor_id, "add_node")
                .target(node.id.0)
                .details(format!("name={} capacity={}", node.name, node.max_capacity)),
        )?;
        tracing::info!(actor = actor_id, node_id = %node.id, name = %node.name, "Node added");
        Ok(node)
    }

    /// Revoke (best effort) and deactivate every credential on a node, then
    /// deactivate the node itself.
    pub async fn retire_node(&self, actor_id: UserId, node_id: NodeId) -> Result<RetireOutcome> {
        self.require(actor_id, "manage servers", |c| c.can_manage_servers)?;
        let node = self.registry.get(node_id).await?;

        self.registry.set_active(node_id, false).await?;
        let _slot = self.registry.lock_node(node_id).await;

        let mut outcome = RetireOutcome {
            node_id,
            revoked: 0,
            deactivated: 0,
        };

        for credential in self.store.active_on_node(node_id)? {
            match self.bans.revoke(&node, &credential).await {
                Ok(()) => outcome.revoked += 1,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, credential_id = credential.id, error = %e, "Revocation failed during retirement");
                    self.store.deactivate(credential.id)?;
                }
            }
            outcome.deactivated += 1;
        }

        self.store.set_node_active(node_id, false)?;
        self.registry.set_load(node_id, 0).await?;
        self.store.log_action(
            &NewAction::new(actor_id, "retire_node")
                .target(node_id.0)
                .details(format!(
                    "revoked={} deactivated={}",
                    outcome.revoked, outcome.deactivated
                )),
        )?;

        tracing::info!(
            actor = actor_id,
            node_id = %node_id,
            revoked = outcome.revoked,
            deactivated = outcome.deactivated,
            "Node retired"
        );
        Ok(outcome)
    }

    pub fn add_tariff(&self, actor_id: UserId, tariff: NewTariff) -> Result<Tariff> {
        self.require(actor_id, "manage tariffs", |c| c.can_manage_servers)?;
        let tariff = self.store.insert_tariff(&tariff)?;
        self.store.log_action(
            &NewAction::new(actor_id, "add_tariff")
                .target(tariff.id)
                .details(tariff.name.clone()),
        )?;
        Ok(tariff)
    }

    pub async fn list_nodes(&self) -> Vec<Node> {
        self.registry.list_all().await
    }

    pub fn list_tariffs(&self) -> Result<Vec<Tariff>> {
        self.store.list_tariffs(false)
    }
}

fn default_label(owner_id: UserId) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("u{owner_id}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;
    use crate::remote::fake::FakeConnector;
    use crate::storage::{AccountRepository, Store, SubscriptionLedger};

    const ADMIN: UserId = 1;

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<Store>,
        connector: Arc<FakeConnector>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let connector = Arc::new(FakeConnector::default());
        store.ensure_user(ADMIN, Some("root"), Role::SuperAdmin).unwrap();

        let orchestrator = Orchestrator::bootstrap(
            store.clone(),
            connector.clone(),
            OrchestratorSettings::default(),
        )
        .await
        .unwrap();

        Fixture {
            orchestrator,
            store,
            connector,
        }
    }

    fn new_node(name: &str, capacity: u32) -> NewNode {
        NewNode {
            name: name.to_string(),
            endpoint: format!("http://{name}.internal:2053"),
            username: "admin".to_string(),
            password: "pw".to_string(),
            location: None,
            public_host: format!("{name}.example.net"),
            public_port: 443,
            protocol: Protocol::Vless,
            max_capacity: capacity,
        }
    }

    #[tokio::test]
    async fn test_provision_unknown_owner() {
        let f = fixture().await;
        let err = f
            .orchestrator
            .provision(ProvisionRequest::free(99))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: EntityKind::User, .. }));
    }

    #[tokio::test]
    async fn test_free_limit_for_plain_user() {
        let f = fixture().await;
        f.orchestrator.add_node(ADMIN, new_node("a", 10)).await.unwrap();
        f.orchestrator.ensure_user(7, None).unwrap();

        let err = f
            .orchestrator
            .provision(ProvisionRequest::free(7))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FreeLimitReached { limit: 0, .. }));

        let done = f
            .orchestrator
            .provision(ProvisionRequest::free(7).on_behalf_of(ADMIN))
            .await
            .unwrap();
        assert!(done.credential.is_free);
        assert_eq!(done.credential.quota_bytes, 100 * BYTES_PER_GIB);
    }

    #[tokio::test]
    async fn test_failover_to_next_node() {
        let f = fixture().await;
        let a = f.orchestrator.add_node(ADMIN, new_node("a", 10)).await.unwrap();
        let b = f.orchestrator.add_node(ADMIN, new_node("b", 10)).await.unwrap();
        f.connector.node(a.id).set_reachable(false);

        let done = f
            .orchestrator
            .provision(ProvisionRequest::free(ADMIN))
            .await
            .unwrap();
        assert_eq!(done.credential.node_id, b.id);
        assert!(!f.orchestrator.registry().get(a.id).await.unwrap().reachable);
    }

    #[tokio::test]
    async fn test_all_nodes_unreachable_reports_node_error() {
        let f = fixture().await;
        let a = f.orchestrator.add_node(ADMIN, new_node("a", 10)).await.unwrap();
        f.connector.node(a.id).set_reachable(false);

        let err = f
            .orchestrator
            .provision(ProvisionRequest::free(ADMIN))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_moderator_cannot_ban_globally() {
        let f = fixture().await;
        f.store.ensure_user(5, None, Role::Moderator).unwrap();
        f.orchestrator.ensure_user(7, None).unwrap();

        let err = f
            .orchestrator
            .ban(BanRequest {
                actor_id: 5,
                target_id: 7,
                scope: BanScope::Global,
                reason: "spam".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { actor: 5, .. }));
    }

    #[tokio::test]
    async fn test_retire_node_deactivates_credentials() {
        let f = fixture().await;
        let a = f.orchestrator.add_node(ADMIN, new_node("a", 10)).await.unwrap();
        f.orchestrator
            .provision(ProvisionRequest::free(ADMIN))
            .await
            .unwrap();

        let outcome = f.orchestrator.retire_node(ADMIN, a.id).await.unwrap();
        assert_eq!((outcome.revoked, outcome.deactivated), (1, 1));
        assert!(f.store.active_on_node(a.id).unwrap().is_empty());
        assert!(!f.orchestrator.registry().get(a.id).await.unwrap().active);

        let err = f
            .orchestrator
            .provision(ProvisionRequest::free(ADMIN))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCapacity));
    }
}
