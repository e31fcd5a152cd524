//! Subscription ledger
//!
//! Authoritative local record of issued credentials. Node load gauges are
//! derived from it, and reconciliation compares node listings against it.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;

use super::{map_conflict, to_sql_u64, Store};
use crate::error::{EntityKind, Error, Result};
use crate::models::{Credential, CredentialId, NewCredential, NodeId, UserId};
use crate::utils::{from_millis, to_millis};

/// Ledger of issued credentials
pub trait SubscriptionLedger: Send + Sync {
    /// Insert a credential accepted by its node. Fails with
    /// [`Error::Conflict`] if the node already has a record for the remote id.
    fn provision(&self, new: &NewCredential) -> Result<Credential>;

    /// Mark a credential inactive. Returns false if it already was.
    fn deactivate(&self, id: CredentialId) -> Result<bool>;

    fn get_credential(&self, id: CredentialId) -> Result<Credential>;

    fn active_for_user(&self, owner: UserId) -> Result<Vec<Credential>>;

    fn active_on_node(&self, node: NodeId) -> Result<Vec<Credential>>;

    fn active_for_user_on_node(&self, owner: UserId, node: NodeId) -> Result<Vec<Credential>>;

    /// Deactivate and return every active credential with `expires_at <= now`
    fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Credential>>;

    /// Active credential count per node
    fn active_load_by_node(&self) -> Result<HashMap<NodeId, u32>>;

    fn count_active_on_node(&self, node: NodeId) -> Result<u32>;

    fn count_active(&self) -> Result<u64>;

    /// Free grants ever issued to a user, active or not
    fn count_free_grants(&self, owner: UserId) -> Result<u32>;
}

const CREDENTIAL_COLUMNS: &str = "id, owner_id, node_id, remote_id, client_uuid, label, tariff_id, \
    is_free, issued_at, expires_at, quota_bytes, active, deactivated_at";

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        node_id: NodeId(row.get(2)?),
        remote_id: row.get(3)?,
        client_uuid: row.get(4)?,
        label: row.get(5)?,
        tariff_id: row.get(6)?,
        is_free: row.get(7)?,
        issued_at: from_millis(row.get(8)?),
        expires_at: from_millis(row.get(9)?),
        quota_bytes: row.get::<_, i64>(10)?.max(0) as u64,
        active: row.get(11)?,
        deactivated_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
    })
}

impl Store {
    fn query_credentials(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Credential>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE {filter} ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, credential_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl SubscriptionLedger for Store {
    fn provision(&self, new: &NewCredential) -> Result<Credential> {
        let expires_at = new.issued_at + Duration::days(i64::from(new.expiry_days));
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO credentials
                (owner_id, node_id, remote_id, client_uuid, label, tariff_id, is_free,
                 issued_at, expires_at, quota_bytes, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)
            "#,
            params![
                new.owner_id,
                new.node_id.0,
                new.remote_id,
                new.client_uuid,
                new.label,
                new.tariff_id,
                new.is_free,
                to_millis(new.issued_at),
                to_millis(expires_at),
                to_sql_u64(new.quota_bytes),
            ],
        )
        .map_err(|e| {
            map_conflict(e, || {
                format!(
                    "remote credential '{}' already recorded for node {}",
                    new.remote_id, new.node_id
                )
            })
        })?;

        Ok(Credential {
            id: conn.last_insert_rowid(),
            owner_id: new.owner_id,
            node_id: new.node_id,
            remote_id: new.remote_id.clone(),
            client_uuid: new.client_uuid.clone(),
            label: new.label.clone(),
            tariff_id: new.tariff_id,
            is_free: new.is_free,
            issued_at: from_millis(to_millis(new.issued_at)),
            expires_at: from_millis(to_millis(expires_at)),
            quota_bytes: new.quota_bytes,
            active: true,
            deactivated_at: None,
        })
    }

    fn deactivate(&self, id: CredentialId) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE credentials SET active = 0, deactivated_at = ?2 WHERE id = ?1 AND active = 1",
            params![id, to_millis(Utc::now())],
        )?;

        if changed == 1 {
            return Ok(true);
        }

        let exists: Option<i64> = conn
            .query_row("SELECT id FROM credentials WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;

        match exists {
            Some(_) => Ok(false),
            None => Err(Error::not_found(EntityKind::Credential, id)),
        }
    }

    fn get_credential(&self, id: CredentialId) -> Result<Credential> {
        self.query_credentials("id = ?1", params![id])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(EntityKind::Credential, id))
    }

    fn active_for_user(&self, owner: UserId) -> Result<Vec<Credential>> {
        self.query_credentials("owner_id = ?1 AND active = 1", params![owner])
    }

    fn active_on_node(&self, node: NodeId) -> Result<Vec<Credential>> {
        self.query_credentials("node_id = ?1 AND active = 1", params![node.0])
    }

    fn active_for_user_on_node(&self, owner: UserId, node: NodeId) -> Result<Vec<Credential>> {
        self.query_credentials(
            "owner_id = ?1 AND node_id = ?2 AND active = 1",
            params![owner, node.0],
        )
    }

    fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Credential>> {
        let now_ms = to_millis(now);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut expired = {
            let sql = format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credentials
                 WHERE active = 1 AND expires_at <= ?1 ORDER BY id"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![now_ms], credential_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        tx.execute(
            "UPDATE credentials SET active = 0, deactivated_at = ?1
             WHERE active = 1 AND expires_at <= ?1",
            params![now_ms],
        )?;
        tx.commit()?;

        for credential in &mut expired {
            credential.active = false;
            credential.deactivated_at = Some(from_millis(now_ms));
        }

        Ok(expired)
    }

    fn active_load_by_node(&self) -> Result<HashMap<NodeId, u32>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, COUNT(*) FROM credentials WHERE active = 1 GROUP BY node_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((NodeId(row.get(0)?), row.get::<_, i64>(1)? as u32))
        })?;

        let mut loads = HashMap::new();
        for row in rows {
            let (node, count) = row?;
            loads.insert(node, count);
        }
        Ok(loads)
    }

    fn count_active_on_node(&self, node: NodeId) -> Result<u32> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM credentials WHERE node_id = ?1 AND active = 1",
            params![node.0],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    fn count_active(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM credentials WHERE active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_free_grants(&self, owner: UserId) -> Result<u32> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM credentials WHERE owner_id = ?1 AND is_free = 1",
            params![owner],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }
}
