//! Alerting for fleet health
//!
//! Reconciliation raises alerts when nodes stop answering or a cycle step
//! fails. The [`AlertManager`] enforces a cooldown per (target, kind) pair so
//! a sustained outage does not produce an alert storm, and routes fired and
//! resolved alerts to every registered [`Channel`].
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │      AlertManager                          │
//! │  - Cooldown per (target, kind)             │
//! │  - Active alerts and history               │
//! │  - Channel routing                         │
//! └────────────────────────────────────────────┘
//!                     │
//!         ┌───────────┴───────────┐
//!         ▼                       ▼
//!   ┌─────────┐             ┌─────────┐
//!   │ Webhook │             │   Log   │
//!   │ Channel │             │ Channel │
//!   └─────────┘             └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gatefleet::notifications::{AlertKind, AlertManager, AlertSeverity, AlertTarget};
//!
//! let mut manager = AlertManager::new(chrono::Duration::hours(1));
//! manager.add_webhook_channel("https://hooks.example.com/alerts", None)?;
//!
//! manager
//!     .raise(
//!         AlertTarget::Node(node_id),
//!         AlertKind::NodeUnreachable,
//!         AlertSeverity::Critical,
//!         "node stopped answering health probes",
//!         chrono::Utc::now(),
//!     )
//!     .await;
//! ```

pub mod channels;
mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::NodeId;

pub use channels::log::LogChannel;
pub use channels::webhook::{WebhookChannel, WebhookConfig};
pub use channels::Channel;
pub use manager::AlertManager;

/// Severity level of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational alerts for tracking purposes
    Info,
    /// Warning alerts that require attention
    Warning,
    /// Critical alerts requiring immediate action
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an alert is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AlertTarget {
    Node(NodeId),
    Subsystem(String),
}

impl fmt::Display for AlertTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node:{id}"),
            Self::Subsystem(name) => write!(f, "subsystem:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Health probe failed
    NodeUnreachable,
    /// A reconciliation step returned an error
    ReconcileFailure,
    /// Revocations for globally banned users are still pending
    OrphanBacklog,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeUnreachable => "node_unreachable",
            Self::ReconcileFailure => "reconcile_failure",
            Self::OrphanBacklog => "orphan_backlog",
        }
    }
}

/// Alert status in the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

/// An alert instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub target: AlertTarget,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub fired_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(
        target: AlertTarget,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        fired_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            kind,
            severity,
            status: AlertStatus::Firing,
            message: message.into(),
            fired_at,
            resolved_at: None,
        }
    }

    /// Cooldown key; one per (target, kind)
    pub fn key(&self) -> (AlertTarget, AlertKind) {
        (self.target.clone(), self.kind)
    }

    pub fn resolve(&mut self, at: DateTime<Utc>) {
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(at);
    }

    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Firing
    }

    /// Format alert for display
    pub fn format_message(&self) -> String {
        format!(
            "[{severity}] {target} {kind}: {message} ({status} since {at})",
            severity = self.severity.as_str().to_uppercase(),
            target = self.target,
            kind = self.kind.as_str(),
            message = self.message,
            status = self.status.as_str(),
            at = self
                .resolved_at
                .unwrap_or(self.fired_at)
                .format("%Y-%m-%d %H:%M:%S UTC"),
        )
    }
}
