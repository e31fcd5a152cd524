//! Persisted node definitions

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{map_conflict, Store};
use crate::error::{EntityKind, Error, Result};
use crate::models::{NewNode, Node, NodeAuth, NodeId, Protocol};
use crate::utils::to_millis;

pub trait NodeRepository: Send + Sync {
    /// Persist a new node. Names are unique.
    fn insert_node(&self, node: &NewNode) -> Result<Node>;

    fn get_node(&self, id: NodeId) -> Result<Option<Node>>;

    fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Soft activation flag; nodes are never deleted
    fn set_node_active(&self, id: NodeId, active: bool) -> Result<()>;
}

const NODE_COLUMNS: &str = "id, name, endpoint, username, password, location, public_host, \
    public_port, protocol, max_capacity, active";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let protocol: String = row.get(8)?;
    Ok(Node {
        id: NodeId(row.get(0)?),
        name: row.get(1)?,
        endpoint: row.get(2)?,
        auth: NodeAuth {
            username: row.get(3)?,
            password: row.get(4)?,
        },
        location: row.get(5)?,
        public_host: row.get(6)?,
        public_port: row.get(7)?,
        protocol: protocol.parse().unwrap_or(Protocol::Vless),
        max_capacity: row.get(9)?,
        active: row.get(10)?,
        // Runtime state, filled in by the registry and reconciliation
        reachable: true,
        current_load: 0,
        last_health_check: None,
    })
}

impl NodeRepository for Store {
    fn insert_node(&self, node: &NewNode) -> Result<Node> {
        let id = {
            let conn = self.conn()?;
            conn.execute(
                r#"
                INSERT INTO nodes
                    (name, endpoint, username, password, location, public_host, public_port,
                     protocol, max_capacity, active, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10)
                "#,
                params![
                    node.name,
                    node.endpoint,
                    node.username,
                    node.password,
                    node.location,
                    node.public_host,
                    node.public_port,
                    node.protocol.as_str(),
                    node.max_capacity,
                    to_millis(Utc::now()),
                ],
            )
            .map_err(|e| map_conflict(e, || format!("node name '{}' already exists", node.name)))?;
            NodeId(conn.last_insert_rowid())
        };

        self.get_node(id)?
            .ok_or_else(|| Error::not_found(EntityKind::Node, id))
    }

    fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id.0], node_from_row)
            .optional()?)
    }

    fn list_nodes(&self) -> Result<Vec<Node>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], node_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn set_node_active(&self, id: NodeId, active: bool) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE nodes SET active = ?2 WHERE id = ?1",
            params![id.0, active],
        )?;

        if changed == 0 {
            return Err(Error::not_found(EntityKind::Node, id));
        }
        Ok(())
    }
}
