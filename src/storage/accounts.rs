//! Users, tariffs and the action audit log

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{to_sql_u64, Store};
use crate::error::{EntityKind, Error, Result};
use crate::models::{NewTariff, Role, Tariff, UserAccount, UserId};
use crate::utils::{from_millis, to_millis};

/// Audit log entry to append
#[derive(Debug, Clone)]
pub struct NewAction {
    pub actor_id: UserId,
    pub action: &'static str,
    pub target_id: Option<i64>,
    pub details: String,
}

impl NewAction {
    pub fn new(actor_id: UserId, action: &'static str) -> Self {
        Self {
            actor_id,
            action,
            target_id: None,
            details: String::new(),
        }
    }

    pub fn target(mut self, target_id: i64) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Stored audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: i64,
    pub actor_id: UserId,
    pub action: String,
    pub target_id: Option<i64>,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

pub trait AccountRepository: Send + Sync {
    /// Create the user if missing. An existing user keeps its role.
    fn ensure_user(&self, user_id: UserId, username: Option<&str>, role: Role) -> Result<UserAccount>;

    fn get_user(&self, user_id: UserId) -> Result<Option<UserAccount>>;

    fn set_role(&self, user_id: UserId, role: Role) -> Result<()>;

    fn insert_tariff(&self, tariff: &NewTariff) -> Result<Tariff>;

    fn get_tariff(&self, id: i64) -> Result<Option<Tariff>>;

    fn list_tariffs(&self, include_inactive: bool) -> Result<Vec<Tariff>>;

    fn set_tariff_active(&self, id: i64, active: bool) -> Result<()>;

    fn log_action(&self, action: &NewAction) -> Result<()>;

    /// Most recent entries first
    fn recent_actions(&self, limit: usize) -> Result<Vec<ActionRecord>>;
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserAccount> {
    let role: String = row.get(2)?;
    Ok(UserAccount {
        user_id: row.get(0)?,
        username: row.get(1)?,
        role: role.parse().unwrap_or(Role::User),
        created_at: from_millis(row.get(3)?),
    })
}

fn tariff_from_row(row: &Row<'_>) -> rusqlite::Result<Tariff> {
    Ok(Tariff {
        id: row.get(0)?,
        name: row.get(1)?,
        duration_days: row.get(2)?,
        traffic_gb: row.get::<_, i64>(3)?.max(0) as u64,
        price: row.get(4)?,
        active: row.get(5)?,
    })
}

impl AccountRepository for Store {
    fn ensure_user(&self, user_id: UserId, username: Option<&str>, role: Role) -> Result<UserAccount> {
        {
            let conn = self.conn()?;
            conn.execute(
                r#"
                INSERT INTO users (user_id, username, role, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(user_id) DO UPDATE SET
                    username = COALESCE(excluded.username, users.username)
                "#,
                params![user_id, username, role.as_str(), to_millis(Utc::now())],
            )?;
        }

        self.get_user(user_id)?
            .ok_or_else(|| Error::not_found(EntityKind::User, user_id))
    }

    fn get_user(&self, user_id: UserId) -> Result<Option<UserAccount>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT user_id, username, role, created_at FROM users WHERE user_id = ?1",
                params![user_id],
                user_from_row,
            )
            .optional()?)
    }

    fn set_role(&self, user_id: UserId, role: Role) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET role = ?2 WHERE user_id = ?1",
            params![user_id, role.as_str()],
        )?;

        if changed == 0 {
            return Err(Error::not_found(EntityKind::User, user_id));
        }
        Ok(())
    }

    fn insert_tariff(&self, tariff: &NewTariff) -> Result<Tariff> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tariffs (name, duration_days, traffic_gb, price, active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![
                tariff.name,
                tariff.duration_days,
                to_sql_u64(tariff.traffic_gb),
                tariff.price
            ],
        )?;

        Ok(Tariff {
            id: conn.last_insert_rowid(),
            name: tariff.name.clone(),
            duration_days: tariff.duration_days,
            traffic_gb: tariff.traffic_gb,
            price: tariff.price,
            active: true,
        })
    }

    fn get_tariff(&self, id: i64) -> Result<Option<Tariff>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, name, duration_days, traffic_gb, price, active FROM tariffs WHERE id = ?1",
                params![id],
                tariff_from_row,
            )
            .optional()?)
    }

    fn list_tariffs(&self, include_inactive: bool) -> Result<Vec<Tariff>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, duration_days, traffic_gb, price, active FROM tariffs
             WHERE active = 1 OR ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![include_inactive], tariff_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn set_tariff_active(&self, id: i64, active: bool) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tariffs SET active = ?2 WHERE id = ?1",
            params![id, active],
        )?;

        if changed == 0 {
            return Err(Error::not_found(EntityKind::Tariff, id));
        }
        Ok(())
    }

    fn log_action(&self, action: &NewAction) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO action_log (actor_id, action, target_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                action.actor_id,
                action.action,
                action.target_id,
                action.details,
                to_millis(Utc::now())
            ],
        )?;
        Ok(())
    }

    fn recent_actions(&self, limit: usize) -> Result<Vec<ActionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, actor_id, action, target_id, details, created_at FROM action_log
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ActionRecord {
                id: row.get(0)?,
                actor_id: row.get(1)?,
                action: row.get(2)?,
                target_id: row.get(3)?,
                details: row.get(4)?,
                created_at: from_millis(row.get(5)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_user_keeps_role() {
        let store = Store::in_memory().unwrap();

        let created = store.ensure_user(42, Some("alice"), Role::User).unwrap();
        assert_eq!(created.role, Role::User);

        store.set_role(42, Role::Moderator).unwrap();
        let again = store.ensure_user(42, None, Role::User).unwrap();
        assert_eq!(again.role, Role::Moderator);
        assert_eq!(again.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_set_role_unknown_user() {
        let store = Store::in_memory().unwrap();
        assert!(matches!(
            store.set_role(1, Role::Admin),
            Err(Error::NotFound { entity: EntityKind::User, .. })
        ));
        assert!(store.get_user(1).unwrap().is_none());
    }

    #[test]
    fn test_tariffs() {
        let store = Store::in_memory().unwrap();
        let basic = store
            .insert_tariff(&NewTariff {
                name: "30-day / 50GB".to_string(),
                duration_days: 30,
                traffic_gb: 50,
                price: 4.99,
            })
            .unwrap();
        let legacy = store
            .insert_tariff(&NewTariff {
                name: "legacy".to_string(),
                duration_days: 7,
                traffic_gb: 5,
                price: 1.0,
            })
            .unwrap();
        store.set_tariff_active(legacy.id, false).unwrap();

        assert_eq!(store.get_tariff(basic.id).unwrap(), Some(basic.clone()));
        assert_eq!(store.list_tariffs(false).unwrap(), vec![basic]);
        assert_eq!(store.list_tariffs(true).unwrap().len(), 2);
        assert!(store.get_tariff(99).unwrap().is_none());
    }

    #[test]
    fn test_action_log_order() {
        let store = Store::in_memory().unwrap();
        store.log_action(&NewAction::new(1, "ban").target(7).details("scope=global")).unwrap();
        store.log_action(&NewAction::new(1, "unban").target(7)).unwrap();

        let actions = store.recent_actions(10).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action, "unban");
        assert_eq!(actions[1].details, "scope=global");
        assert_eq!(store.recent_actions(1).unwrap().len(), 1);
    }
}
