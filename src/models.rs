//! Core data structures for the gateway fleet
//!
//! Nodes, credentials (subscriptions), bans, tariffs and user accounts, plus
//! the role capability table used to authorize requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bytes in one gibibyte; tariff traffic is sold in GiB.
pub const BYTES_PER_GIB: u64 = 1 << 30;

/// External user identifier (chat platform id)
pub type UserId = i64;

/// Ledger credential identifier
pub type CredentialId = i64;

// ============================================================================
// Node
// ============================================================================

/// Gateway node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proxy protocol served by a node's client-facing inbound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vless => "vless",
            Self::Vmess => "vmess",
            Self::Trojan => "trojan",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vless" => Ok(Self::Vless),
            "vmess" => Ok(Self::Vmess),
            "trojan" => Ok(Self::Trojan),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

/// Credentials for a node's control endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for NodeAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A gateway node as known to the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,

    /// Base URL of the REST control endpoint
    pub endpoint: String,

    #[serde(skip_serializing)]
    pub auth: NodeAuth,

    pub location: Option<String>,

    /// Host and port clients connect to
    pub public_host: String,
    pub public_port: u16,
    pub protocol: Protocol,

    /// Operator flag; inactive nodes never receive new credentials
    pub active: bool,

    /// Result of the most recent health probe
    pub reachable: bool,

    pub max_capacity: u32,

    /// Gauge of active credentials, always derived from the ledger
    pub current_load: u32,

    pub last_health_check: Option<DateTime<Utc>>,
}

impl Node {
    /// True when the node may be offered to placement
    pub fn is_schedulable(&self) -> bool {
        self.active && self.reachable
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_capacity
    }

    /// Load ratio for display; a zero-capacity node is always full
    pub fn load_ratio(&self) -> f64 {
        if self.max_capacity == 0 {
            f64::INFINITY
        } else {
            f64::from(self.current_load) / f64::from(self.max_capacity)
        }
    }
}

/// Operator input for registering a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNode {
    pub name: String,
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub location: Option<String>,
    pub public_host: String,
    pub public_port: u16,
    pub protocol: Protocol,
    pub max_capacity: u32,
}

// ============================================================================
// Credential
// ============================================================================

/// A per-user access grant materialized on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub owner_id: UserId,
    pub node_id: NodeId,

    /// Identifier assigned by the node's control API
    pub remote_id: String,

    /// Per-client secret embedded in the connection descriptor
    pub client_uuid: String,

    pub label: String,

    /// `None` for free-tier grants
    pub tariff_id: Option<i64>,
    pub is_free: bool,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub quota_bytes: u64,

    pub active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Ledger insert payload, built once the remote node accepted the credential
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub owner_id: UserId,
    pub node_id: NodeId,
    pub tariff_id: Option<i64>,
    pub is_free: bool,
    pub remote_id: String,
    pub client_uuid: String,
    pub label: String,
    pub quota_bytes: u64,
    pub issued_at: DateTime<Utc>,
    pub expiry_days: u32,
}

// ============================================================================
// Ban
// ============================================================================

/// Where a ban applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "node_id", rename_all = "lowercase")]
pub enum BanScope {
    Node(NodeId),
    Global,
}

impl BanScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node(_) => "node",
            Self::Global => "global",
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(*id),
            Self::Global => None,
        }
    }
}

impl fmt::Display for BanScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node:{id}"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// A recorded ban fact. Represents policy intent, not remote completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ban {
    pub id: i64,
    pub user_id: UserId,
    pub scope: BanScope,
    pub actor_id: UserId,
    pub reason: String,

    /// Remote credential revoked by this fact (node-scope only)
    pub remote_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBan {
    pub user_id: UserId,
    pub scope: BanScope,
    pub actor_id: UserId,
    pub reason: String,
    pub remote_id: Option<String>,
}

// ============================================================================
// Tariffs and accounts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    pub id: i64,
    pub name: String,
    pub duration_days: u32,
    pub traffic_gb: u64,
    pub price: f64,
    pub active: bool,
}

impl Tariff {
    pub fn quota_bytes(&self) -> u64 {
        self.traffic_gb.saturating_mul(BYTES_PER_GIB)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTariff {
    pub name: String,
    pub duration_days: u32,
    pub traffic_gb: u64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    pub username: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Fleet role of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Moderator,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    /// Moderators and above are exempt from lasting bans
    pub fn is_privileged(&self) -> bool {
        *self >= Self::Moderator
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::User => Capabilities {
                can_manage_servers: false,
                can_ban: false,
                can_ban_globally: false,
                can_assign_roles: false,
                max_free_connections: Some(0),
                bypass_bans: false,
                over_capacity: false,
            },
            Self::Moderator => Capabilities {
                can_manage_servers: false,
                can_ban: true,
                can_ban_globally: false,
                can_assign_roles: false,
                max_free_connections: Some(5),
                bypass_bans: false,
                over_capacity: false,
            },
            Self::Admin => Capabilities {
                can_manage_servers: true,
                can_ban: true,
                can_ban_globally: true,
                can_assign_roles: false,
                max_free_connections: None,
                bypass_bans: true,
                over_capacity: true,
            },
            Self::SuperAdmin => Capabilities {
                can_manage_servers: true,
                can_ban: true,
                can_ban_globally: true,
                can_assign_roles: true,
                max_free_connections: None,
                bypass_bans: true,
                over_capacity: true,
            },
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "moderator" => Ok(Self::Moderator),
            "admin" => Ok(Self::Admin),
            "super_admin" | "superadmin" => Ok(Self::SuperAdmin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a role may do, looked up once per request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_manage_servers: bool,
    pub can_ban: bool,
    pub can_ban_globally: bool,
    pub can_assign_roles: bool,
    /// `None` means unlimited
    pub max_free_connections: Option<u32>,
    /// May provision for a globally banned owner
    pub bypass_bans: bool,
    /// May request placement on a full node
    pub over_capacity: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(load: u32, cap: u32) -> Node {
        Node {
            id: NodeId(1),
            name: "n1".to_string(),
            endpoint: "http://127.0.0.1:2053".to_string(),
            auth: NodeAuth {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
            location: None,
            public_host: "gw.example.net".to_string(),
            public_port: 443,
            protocol: Protocol::Vless,
            active: true,
            reachable: true,
            max_capacity: cap,
            current_load: load,
            last_health_check: None,
        }
    }

    #[test]
    fn test_node_capacity() {
        assert!(node(9, 10).has_capacity());
        assert!(!node(10, 10).has_capacity());
        assert!(!node(0, 0).has_capacity());
        assert!(node(0, 0).load_ratio().is_infinite());
        assert!((node(1, 10).load_ratio() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_node_auth_debug_redacts_password() {
        let rendered = format!("{:?}", node(0, 1).auth);
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_role_capabilities() {
        assert!(!Role::User.capabilities().can_ban);
        assert!(Role::Moderator.capabilities().can_ban);
        assert!(!Role::Moderator.capabilities().can_ban_globally);
        assert_eq!(Role::Moderator.capabilities().max_free_connections, Some(5));
        assert_eq!(Role::Admin.capabilities().max_free_connections, None);
        assert!(Role::SuperAdmin.capabilities().can_assign_roles);
        assert!(!Role::Admin.capabilities().can_assign_roles);
    }

    #[test]
    fn test_role_privilege_order() {
        assert!(!Role::User.is_privileged());
        assert!(Role::Moderator.is_privileged());
        assert!(Role::SuperAdmin.is_privileged());
        assert_eq!("super_admin".parse::<Role>().unwrap(), Role::SuperAdmin);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_tariff_quota() {
        let tariff = Tariff {
            id: 1,
            name: "Basic".to_string(),
            duration_days: 30,
            traffic_gb: 50,
            price: 5.0,
            active: true,
        };
        assert_eq!(tariff.quota_bytes(), 50 * 1_073_741_824);
    }

    #[test]
    fn test_ban_scope_serialization() {
        let json = serde_json::to_value(BanScope::Node(NodeId(3))).unwrap();
        assert_eq!(json["scope"], "node");
        assert_eq!(json["node_id"], 3);

        let global: BanScope = serde_json::from_str(r#"{"scope":"global"}"#).unwrap();
        assert_eq!(global, BanScope::Global);
    }
}
