//! Unified error handling for the gatefleet crate
//!
//! Every public orchestrator operation returns [`Result`], whose error side is
//! the typed [`Error`] taxonomy. Callers branch on the variant (or on
//! [`Error::category`]) instead of parsing messages.
//!
//! # Architecture
//!
//! - [`Error`] - unified error enum used across module boundaries
//! - [`ErrorCategory`] - coarse classification for handling strategies
//! - [`RemoteError`] - control-channel failures, converted into [`Error`] with
//!   the node id attached via [`Error::from_remote`]
//!
//! # Usage
//!
//! ```rust,ignore
//! use gatefleet::error::{Error, ErrorCategory};
//!
//! fn render(err: &Error) -> String {
//!     if err.category() == ErrorCategory::Remote && err.is_recoverable() {
//!         tracing::warn!(error = %err, "node temporarily unavailable");
//!     }
//!     err.user_message()
//! }
//! ```

use thiserror::Error;

use crate::models::{NodeId, UserId};

pub use crate::remote::error::RemoteError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Gateway node control-channel errors
    Remote,
    /// No node could take the credential
    Placement,
    /// Ledger / SQLite errors
    Storage,
    /// Rejected by a fleet policy (bans, roles, limits)
    Policy,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Placement => "placement",
            Self::Storage => "storage",
            Self::Policy => "policy",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Kind of entity referenced by a [`Error::NotFound`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Node,
    Credential,
    Tariff,
    Ban,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::User => "user",
            Self::Node => "node",
            Self::Credential => "credential",
            Self::Tariff => "tariff",
            Self::Ban => "ban",
        };
        f.write_str(label)
    }
}

/// Unified error type for the gatefleet crate
#[derive(Error, Debug)]
pub enum Error {
    /// Transport failure or timeout talking to a node, after local retries
    #[error("node {node_id} unreachable: {reason}")]
    NodeUnreachable { node_id: NodeId, reason: String },

    /// Node refused the request with a permanent (4xx, not 429) status
    #[error("node {node_id} rejected request with status {status}: {message}")]
    NodeRejected {
        node_id: NodeId,
        status: u16,
        message: String,
    },

    /// Placement found no node able to host a new credential
    #[error("no gateway node has free capacity")]
    NoCapacity,

    /// Duplicate record in the ledger
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown user, node, credential or tariff
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    /// Owner carries a global ban
    #[error("user {user_id} is banned")]
    Banned { user_id: UserId },

    /// Requested tariff does not exist or is retired
    #[error("tariff not found: {0}")]
    TariffNotFound(i64),

    /// Free-grant limit reached for the owner
    #[error("user {user_id} reached the free connection limit ({limit})")]
    FreeLimitReached { user_id: UserId, limit: u32 },

    /// Actor's role lacks the capability for the action
    #[error("user {actor} is not allowed to {action}")]
    PermissionDenied { actor: UserId, action: &'static str },

    /// Database errors
    #[error("database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Attach a node id to a control-channel failure.
    ///
    /// 4xx responses other than 429 become [`Error::NodeRejected`]; everything
    /// else is treated as the node being unreachable.
    pub fn from_remote(node_id: NodeId, err: RemoteError) -> Self {
        match err {
            RemoteError::Status { status, body } if !RemoteError::status_is_retryable(status) => {
                Self::NodeRejected {
                    node_id,
                    status,
                    message: body,
                }
            }
            other => Self::NodeUnreachable {
                node_id,
                reason: other.to_string(),
            },
        }
    }

    pub fn not_found(entity: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NodeUnreachable { .. } | Self::NoCapacity)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NodeUnreachable { .. } | Self::NodeRejected { .. } => ErrorCategory::Remote,
            Self::NoCapacity => ErrorCategory::Placement,
            Self::Conflict(_) | Self::Database(_) | Self::Json(_) => ErrorCategory::Storage,
            Self::NotFound { .. }
            | Self::Banned { .. }
            | Self::TariffNotFound(_)
            | Self::FreeLimitReached { .. }
            | Self::PermissionDenied { .. } => ErrorCategory::Policy,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// Reason suitable for end users. Never includes node addresses,
    /// SQL errors or response bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::NodeUnreachable { .. } => {
                "The gateway server is temporarily unavailable, please try again later".to_string()
            }
            Self::NodeRejected { .. } => "The gateway server refused the request".to_string(),
            Self::NoCapacity => "No servers are available right now".to_string(),
            Self::Conflict(_) => "The connection already exists".to_string(),
            Self::NotFound { entity, .. } => format!("Unknown {entity}"),
            Self::Banned { .. } => "This account is banned".to_string(),
            Self::TariffNotFound(_) => "Tariff not found".to_string(),
            Self::FreeLimitReached { limit, .. } => {
                format!("Free connection limit reached ({limit})")
            }
            Self::PermissionDenied { action, .. } => format!("You are not allowed to {action}"),
            Self::Database(_) | Self::Json(_) | Self::Config(_) | Self::Other { .. } => {
                "Internal error".to_string()
            }
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
