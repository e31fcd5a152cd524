//! gatefleet - gateway fleet orchestrator
//!
//! Provisions per-user access credentials on a fleet of proxy gateway nodes,
//! keeps a local ledger of issued credentials consistent with the nodes, and
//! propagates bans per node or fleet-wide.
//!
//! # Architecture
//!
//! - [`registry`] - in-memory node view, load gauges and per-node locks
//! - [`remote`] - REST control channel to one node, with retries
//! - [`placement`] - lowest-load-ratio node selection
//! - [`storage`] - SQLite ledger, bans, accounts and audit log
//! - [`bans`] - scoped and global ban propagation
//! - [`reconcile`] - periodic expiry, health probes and orphan sweeps
//! - [`orchestrator`] - the public operations
//! - [`server`] - axum REST front, `/health` and `/metrics`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gatefleet::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(Store::open(&config.database.path)?);
//!     let connector = Arc::new(HttpConnector::new(ClientConfig::from(&config.remote))?);
//!     let fleet = Orchestrator::bootstrap(store, connector, OrchestratorSettings::from(&config)).await?;
//!
//!     let outcome = fleet.provision(ProvisionRequest::paid(42, 1)).await?;
//!     println!("{}", outcome.config.uri);
//!     Ok(())
//! }
//! ```

pub mod bans;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod placement;
pub mod reconcile;
pub mod registry;
pub mod remote;
pub mod server;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bans::{BanEngine, BanOutcome};
    pub use crate::config::Config;
    pub use crate::descriptor::ConnectionConfig;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{
        Ban, BanScope, Credential, Node, NodeId, Protocol, Role, Tariff, UserAccount, UserId,
    };
    pub use crate::notifications::AlertManager;
    pub use crate::orchestrator::{
        BanRequest, FleetStats, Orchestrator, OrchestratorSettings, ProvisionOutcome,
        ProvisionRequest,
    };
    pub use crate::reconcile::{Reconciler, ReconcilerHandle};
    pub use crate::registry::NodeRegistry;
    pub use crate::remote::{ClientConfig, HttpConnector, NodeConnector, NodeControl};
    pub use crate::storage::{FleetStore, Store};
}

pub use models::{Credential, Node, NodeId};
