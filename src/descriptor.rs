//! Connection descriptors
//!
//! Renders the client-side configuration string for an active credential.
//! The mapping is deterministic: the same node and credential always render
//! the same descriptor.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use url::form_urlencoded::byte_serialize;

use crate::error::Result;
use crate::models::{Credential, Node, Protocol};

/// Renderable client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionConfig {
    pub protocol: Protocol,
    pub uri: String,
}

#[derive(Serialize)]
struct VmessDescriptor<'a> {
    v: &'static str,
    ps: &'a str,
    add: &'a str,
    port: String,
    id: &'a str,
    aid: &'static str,
    scy: &'static str,
    net: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    host: &'static str,
    path: &'static str,
    tls: &'static str,
}

fn encode_label(label: &str) -> String {
    byte_serialize(label.as_bytes()).collect::<String>().replace('+', "%20")
}

/// Host part of a URI authority. IPv6 literals are bracketed.
fn authority_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Render the descriptor for `credential` hosted on `node`
pub fn render(node: &Node, credential: &Credential) -> Result<ConnectionConfig> {
    let host = node.public_host.as_str();
    let port = node.public_port;
    let id = credential.client_uuid.as_str();

    let uri = match node.protocol {
        Protocol::Vless => format!(
            "vless://{id}@{}:{port}?type=tcp&security=none#{}",
            authority_host(host),
            encode_label(&credential.label)
        ),
        Protocol::Trojan => format!(
            "trojan://{id}@{}:{port}?type=tcp&security=tls#{}",
            authority_host(host),
            encode_label(&credential.label)
        ),
        Protocol::Vmess => {
            let descriptor = VmessDescriptor {
                v: "2",
                ps: &credential.label,
                add: host.trim_start_matches('[').trim_end_matches(']'),
                port: port.to_string(),
                id,
                aid: "0",
                scy: "auto",
                net: "tcp",
                kind: "none",
                host: "",
                path: "",
                tls: "",
            };
            let json = serde_json::to_string(&descriptor)?;
            format!("vmess://{}", STANDARD.encode(json))
        }
    };

    Ok(ConnectionConfig {
        protocol: node.protocol,
        uri,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeAuth, NodeId};
    use chrono::Utc;

    fn node(protocol: Protocol) -> Node {
        Node {
            id: NodeId(1),
            name: "fra-1".to_string(),
            endpoint: "http://10.0.0.1:2053".to_string(),
            auth: NodeAuth {
                username: "admin".to_string(),
                password: "pw".to_string(),
            },
            location: None,
            public_host: "fra.example.net".to_string(),
            public_port: 8443,
            protocol,
            active: true,
            reachable: true,
            max_capacity: 10,
            current_load: 0,
            last_health_check: None,
        }
    }

    fn credential() -> Credential {
        let now = Utc::now();
        Credential {
            id: 1,
            owner_id: 42,
            node_id: NodeId(1),
            remote_id: "r-1".to_string(),
            client_uuid: "6f1c7c2e-8a3b-4e0f-9a55-1c2d3e4f5a6b".to_string(),
            label: "alice phone".to_string(),
            tariff_id: Some(1),
            is_free: false,
            issued_at: now,
            expires_at: now,
            quota_bytes: 0,
            active: true,
            deactivated_at: None,
        }
    }

    #[test]
    fn test_vless_descriptor() {
        let config = render(&node(Protocol::Vless), &credential()).unwrap();
        assert_eq!(
            config.uri,
            "vless://6f1c7c2e-8a3b-4e0f-9a55-1c2d3e4f5a6b@fra.example.net:8443?type=tcp&security=none#alice%20phone"
        );
    }

    #[test]
    fn test_trojan_descriptor() {
        let config = render(&node(Protocol::Trojan), &credential()).unwrap();
        assert!(config.uri.starts_with("trojan://6f1c7c2e-"));
        assert!(config.uri.contains("security=tls"));
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let mut n = node(Protocol::Trojan);
        n.public_host = "2001:db8::10".to_string();
        let config = render(&n, &credential()).unwrap();
        assert!(config.uri.contains("@[2001:db8::10]:8443?"), "{}", config.uri);

        n.public_host = "[2001:db8::10]".to_string();
        let config = render(&n, &credential()).unwrap();
        assert!(config.uri.contains("@[2001:db8::10]:8443?"), "{}", config.uri);

        n.protocol = Protocol::Vmess;
        let config = render(&n, &credential()).unwrap();
        let decoded = STANDARD
            .decode(config.uri.strip_prefix("vmess://").unwrap())
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(json["add"], "2001:db8::10");
    }

    #[test]
    fn test_vmess_descriptor_decodes() {
        let config = render(&node(Protocol::Vmess), &credential()).unwrap();
        let encoded = config.uri.strip_prefix("vmess://").unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&decoded).unwrap();

        assert_eq!(json["add"], "fra.example.net");
        assert_eq!(json["port"], "8443");
        assert_eq!(json["id"], "6f1c7c2e-8a3b-4e0f-9a55-1c2d3e4f5a6b");
        assert_eq!(json["ps"], "alice phone");
        assert_eq!(json["type"], "none");
    }

    #[test]
    fn test_render_is_deterministic() {
        let n = node(Protocol::Vmess);
        let c = credential();
        assert_eq!(render(&n, &c).unwrap(), render(&n, &c).unwrap());
    }
}
