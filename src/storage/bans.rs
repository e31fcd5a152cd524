//! Ban facts

use chrono::Utc;
use rusqlite::{params, Row};
use std::collections::HashSet;

use super::Store;
use crate::error::{EntityKind, Error, Result};
use crate::models::{Ban, BanScope, NewBan, NodeId, UserId};
use crate::utils::{from_millis, to_millis};

pub trait BanRepository: Send + Sync {
    fn record_ban(&self, ban: &NewBan) -> Result<Ban>;

    fn bans_for_user(&self, user: UserId) -> Result<Vec<Ban>>;

    fn has_global_ban(&self, user: UserId) -> Result<bool>;

    /// Nodes the user is banned from by node-scope facts
    fn banned_node_ids(&self, user: UserId) -> Result<HashSet<NodeId>>;

    fn global_bans(&self) -> Result<Vec<Ban>>;

    /// Remove every ban fact for a user, returning how many were removed
    fn clear_bans(&self, user: UserId) -> Result<usize>;

    fn remove_ban(&self, id: i64) -> Result<()>;

    /// Ban facts whose target currently holds a privileged role
    fn bans_against_privileged(&self) -> Result<Vec<Ban>>;
}

const BAN_COLUMNS: &str = "b.id, b.user_id, b.scope, b.node_id, b.actor_id, b.reason, b.remote_id, b.created_at";

fn ban_from_row(row: &Row<'_>) -> rusqlite::Result<Ban> {
    let scope: String = row.get(2)?;
    let node_id: Option<i64> = row.get(3)?;
    let scope = match (scope.as_str(), node_id) {
        ("node", Some(id)) => BanScope::Node(NodeId(id)),
        _ => BanScope::Global,
    };

    Ok(Ban {
        id: row.get(0)?,
        user_id: row.get(1)?,
        scope,
        actor_id: row.get(4)?,
        reason: row.get(5)?,
        remote_id: row.get(6)?,
        created_at: from_millis(row.get(7)?),
    })
}

impl Store {
    fn query_bans(&self, sql_tail: &str, params: impl rusqlite::Params) -> Result<Vec<Ban>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {BAN_COLUMNS} FROM bans b {sql_tail}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, ban_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl BanRepository for Store {
    fn record_ban(&self, ban: &NewBan) -> Result<Ban> {
        let created_at = from_millis(to_millis(Utc::now()));
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO bans (user_id, scope, node_id, actor_id, reason, remote_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                ban.user_id,
                ban.scope.as_str(),
                ban.scope.node_id().map(|n| n.0),
                ban.actor_id,
                ban.reason,
                ban.remote_id,
                to_millis(created_at),
            ],
        )?;

        Ok(Ban {
            id: conn.last_insert_rowid(),
            user_id: ban.user_id,
            scope: ban.scope,
            actor_id: ban.actor_id,
            reason: ban.reason.clone(),
            remote_id: ban.remote_id.clone(),
            created_at,
        })
    }

    fn bans_for_user(&self, user: UserId) -> Result<Vec<Ban>> {
        self.query_bans("WHERE b.user_id = ?1 ORDER BY b.id", params![user])
    }

    fn has_global_ban(&self, user: UserId) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bans WHERE user_id = ?1 AND scope = 'global'",
            params![user],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn banned_node_ids(&self, user: UserId) -> Result<HashSet<NodeId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT node_id FROM bans
             WHERE user_id = ?1 AND scope = 'node' AND node_id IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![user], |row| Ok(NodeId(row.get(0)?)))?;
        Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
    }

    fn global_bans(&self) -> Result<Vec<Ban>> {
        self.query_bans("WHERE b.scope = 'global' ORDER BY b.id", [])
    }

    fn clear_bans(&self, user: UserId) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM bans WHERE user_id = ?1", params![user])?)
    }

    fn remove_ban(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        match conn.execute("DELETE FROM bans WHERE id = ?1", params![id])? {
            0 => Err(Error::not_found(EntityKind::Ban, id)),
            _ => Ok(()),
        }
    }

    fn bans_against_privileged(&self) -> Result<Vec<Ban>> {
        self.query_bans(
            "JOIN users u ON u.user_id = b.user_id
             WHERE u.role IN ('moderator', 'admin', 'super_admin')
             ORDER BY b.id",
            [],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::storage::AccountRepository;

    fn ban(user: UserId, scope: BanScope) -> NewBan {
        NewBan {
            user_id: user,
            scope,
            actor_id: 1,
            reason: "abuse".to_string(),
            remote_id: None,
        }
    }

    #[test]
    fn test_record_and_query() {
        let store = Store::in_memory().unwrap();

        let recorded = store.record_ban(&ban(7, BanScope::Node(NodeId(2)))).unwrap();
        assert_eq!(recorded.scope, BanScope::Node(NodeId(2)));
        store.record_ban(&ban(7, BanScope::Global)).unwrap();
        store.record_ban(&ban(8, BanScope::Node(NodeId(3)))).unwrap();

        let bans = store.bans_for_user(7).unwrap();
        assert_eq!(bans.len(), 2);
        assert_eq!(bans[0], recorded);

        assert!(store.has_global_ban(7).unwrap());
        assert!(!store.has_global_ban(8).unwrap());
        assert_eq!(
            store.banned_node_ids(8).unwrap(),
            HashSet::from([NodeId(3)])
        );
        assert_eq!(store.global_bans().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_and_remove() {
        let store = Store::in_memory().unwrap();
        store.record_ban(&ban(7, BanScope::Global)).unwrap();
        let node_ban = store.record_ban(&ban(7, BanScope::Node(NodeId(1)))).unwrap();

        store.remove_ban(node_ban.id).unwrap();
        assert!(matches!(
            store.remove_ban(node_ban.id),
            Err(Error::NotFound { .. })
        ));

        assert_eq!(store.clear_bans(7).unwrap(), 1);
        assert!(!store.has_global_ban(7).unwrap());
        assert_eq!(store.clear_bans(7).unwrap(), 0);
    }

    #[test]
    fn test_bans_against_privileged() {
        let store = Store::in_memory().unwrap();
        store.ensure_user(10, Some("mod"), Role::Moderator).unwrap();
        store.ensure_user(11, Some("plain"), Role::User).unwrap();

        store.record_ban(&ban(10, BanScope::Global)).unwrap();
        store.record_ban(&ban(11, BanScope::Global)).unwrap();
        store.record_ban(&ban(12, BanScope::Global)).unwrap();

        let privileged = store.bans_against_privileged().unwrap();
        assert_eq!(privileged.len(), 1);
        assert_eq!(privileged[0].user_id, 10);
    }
}
