//! Persistent ban store
//!
//! One row per (jail, address) in `bans`, plus a `ban_history` table that
//! outlives individual bans so repeat offenders can be escalated. Times are
//! stored as Unix seconds. Opening a store whose contents cannot be read
//! fails with [`StoreError::Corrupt`]; callers must not start with an empty
//! ban set in that case.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::BanRecord;

const SCHEMA_VERSION: i64 = 1;

const BAN_COLUMNS: &str =
    "jail, ip, banned_at, expires_at, ban_count, action_ref, source, reason, enforced";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    #[error("{0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt
                ) =>
            {
                StoreError::Corrupt(err.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => {
                StoreError::Corrupt(format!("undecodable row: {}", err))
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Thread-safe store handle
#[derive(Clone)]
pub struct BanStore {
    conn: Arc<Mutex<Connection>>,
}

impl BanStore {
    /// Open or create the store. A missing or zero-length file is a fresh
    /// store; anything unreadable is reported as corruption.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;
        info!("Opened ban store at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(StoreError::Corrupt(format!("integrity check failed: {}", check)));
        }

        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        // Every row must decode; a partially readable store is not trusted
        let rows = store.list_active()?;
        debug!("Ban store holds {} active bans", rows.len());

        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bans (
                jail TEXT NOT NULL,
                ip TEXT NOT NULL,
                banned_at INTEGER NOT NULL,
                expires_at INTEGER,
                ban_count INTEGER NOT NULL DEFAULT 1,
                action_ref TEXT NOT NULL,
                source TEXT NOT NULL,
                reason TEXT NOT NULL,
                enforced INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (jail, ip)
            );
            CREATE INDEX IF NOT EXISTS idx_bans_expires ON bans(expires_at);
            CREATE INDEX IF NOT EXISTS idx_bans_ip ON bans(ip);

            -- Survives unbans so repeat offenders can be escalated
            CREATE TABLE IF NOT EXISTS ban_history (
                jail TEXT NOT NULL,
                ip TEXT NOT NULL,
                ban_count INTEGER NOT NULL,
                last_banned_at INTEGER NOT NULL,
                last_expires_at INTEGER,
                PRIMARY KEY (jail, ip)
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match version.map(|v| v.parse::<i64>()) {
            None => {
                conn.execute(
                    "INSERT INTO settings (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(Ok(v)) if v <= SCHEMA_VERSION => {}
            Some(Ok(v)) => {
                return Err(StoreError::Corrupt(format!(
                    "store schema version {} is newer than supported {}",
                    v, SCHEMA_VERSION
                )))
            }
            Some(Err(_)) => {
                return Err(StoreError::Corrupt("unreadable schema version".to_string()))
            }
        }

        Ok(())
    }

    // ==================== Ban Operations ====================

    /// Insert a ban, or refresh an existing one to the later expiry
    /// (permanent beats any finite expiry). Returns the stored row.
    pub fn upsert(&self, ban: &BanRecord) -> StoreResult<BanRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!("SELECT {} FROM bans WHERE jail = ? AND ip = ?", BAN_COLUMNS),
                params![ban.jail_id, ban.address.to_string()],
                row_to_ban,
            )
            .optional()?;

        let stored = match existing {
            Some(current) => {
                let expires_at = match (current.expires_at, ban.expires_at) {
                    (None, _) | (_, None) => None,
                    (Some(a), Some(b)) => Some(a.max(b)),
                };
                let refreshed = BanRecord {
                    expires_at,
                    ban_count: current.ban_count.max(ban.ban_count),
                    enforced: current.enforced || ban.enforced,
                    ..current
                };
                tx.execute(
                    "UPDATE bans SET expires_at = ?, ban_count = ?, enforced = ? WHERE jail = ? AND ip = ?",
                    params![
                        refreshed.expires_at.map(|t| t.timestamp()),
                        refreshed.ban_count,
                        refreshed.enforced,
                        refreshed.jail_id,
                        refreshed.address.to_string()
                    ],
                )?;
                refreshed
            }
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO bans ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        BAN_COLUMNS
                    ),
                    params![
                        ban.jail_id,
                        ban.address.to_string(),
                        ban.banned_at.timestamp(),
                        ban.expires_at.map(|t| t.timestamp()),
                        ban.ban_count,
                        ban.action_ref,
                        ban.source.to_string(),
                        ban.reason,
                        ban.enforced
                    ],
                )?;
                truncate_to_secs(ban.clone())
            }
        };

        tx.execute(
            r#"
            INSERT INTO ban_history (jail, ip, ban_count, last_banned_at, last_expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(jail, ip) DO UPDATE SET
                ban_count = MAX(ban_count, excluded.ban_count),
                last_banned_at = excluded.last_banned_at,
                last_expires_at = excluded.last_expires_at
            "#,
            params![
                stored.jail_id,
                stored.address.to_string(),
                stored.ban_count,
                stored.banned_at.timestamp(),
                stored.expires_at.map(|t| t.timestamp())
            ],
        )?;

        tx.commit()?;
        Ok(stored)
    }

    pub fn get(&self, jail: &str, ip: &IpAddr) -> StoreResult<Option<BanRecord>> {
        let conn = self.conn.lock();
        let ban = conn
            .query_row(
                &format!("SELECT {} FROM bans WHERE jail = ? AND ip = ?", BAN_COLUMNS),
                params![jail, ip.to_string()],
                row_to_ban,
            )
            .optional()?;
        Ok(ban)
    }

    /// Every stored ban, oldest first
    pub fn list_active(&self) -> StoreResult<Vec<BanRecord>> {
        self.query_bans("1 = 1 ORDER BY banned_at, jail, ip", params![])
    }

    pub fn list_for_jail(&self, jail: &str) -> StoreResult<Vec<BanRecord>> {
        self.query_bans("jail = ? ORDER BY banned_at, ip", params![jail])
    }

    pub fn list_for_address(&self, ip: &IpAddr) -> StoreResult<Vec<BanRecord>> {
        self.query_bans("ip = ? ORDER BY jail", params![ip.to_string()])
    }

    /// Finite bans whose expiry is at or before `t`, soonest first
    pub fn expiring_before(&self, t: DateTime<Utc>) -> StoreResult<Vec<BanRecord>> {
        self.query_bans(
            "expires_at IS NOT NULL AND expires_at <= ? ORDER BY expires_at",
            params![t.timestamp()],
        )
    }

    /// Bans the backend has not confirmed
    pub fn unenforced(&self) -> StoreResult<Vec<BanRecord>> {
        self.query_bans("enforced = 0 ORDER BY banned_at", params![])
    }

    fn query_bans(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<BanRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM bans WHERE {}", BAN_COLUMNS, clause))?;
        let bans = stmt
            .query_map(params, row_to_ban)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bans)
    }

    pub fn set_enforced(&self, jail: &str, ip: &IpAddr, enforced: bool) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE bans SET enforced = ? WHERE jail = ? AND ip = ?",
            params![enforced, jail, ip.to_string()],
        )?;
        Ok(rows > 0)
    }

    pub fn remove(&self, jail: &str, ip: &IpAddr) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM bans WHERE jail = ? AND ip = ?",
            params![jail, ip.to_string()],
        )?;
        Ok(rows > 0)
    }

    /// Delete only if the row is still expired at `now`; a concurrent
    /// refresh wins over a stale expiry decision
    pub fn remove_if_expired(
        &self,
        jail: &str,
        ip: &IpAddr,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM bans WHERE jail = ? AND ip = ? AND expires_at IS NOT NULL AND expires_at <= ?",
            params![jail, ip.to_string(), now.timestamp()],
        )?;
        Ok(rows > 0)
    }

    // ==================== History ====================

    /// Bans recorded for this address in this jail so far
    pub fn ban_count(&self, jail: &str, ip: &IpAddr) -> StoreResult<u32> {
        let conn = self.conn.lock();
        let count = conn
            .query_row(
                "SELECT ban_count FROM ban_history WHERE jail = ? AND ip = ?",
                params![jail, ip.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Seed history directly, e.g. when importing from another host
    pub fn set_history(
        &self,
        jail: &str,
        ip: &IpAddr,
        ban_count: u32,
        last_banned_at: DateTime<Utc>,
        last_expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO ban_history (jail, ip, ban_count, last_banned_at, last_expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(jail, ip) DO UPDATE SET
                ban_count = excluded.ban_count,
                last_banned_at = excluded.last_banned_at,
                last_expires_at = excluded.last_expires_at
            "#,
            params![
                jail,
                ip.to_string(),
                ban_count,
                last_banned_at.timestamp(),
                last_expires_at.map(|t| t.timestamp())
            ],
        )?;
        Ok(())
    }

    pub fn forget_history(&self, jail: &str, ip: &IpAddr) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM ban_history WHERE jail = ? AND ip = ?",
            params![jail, ip.to_string()],
        )?;
        Ok(rows > 0)
    }

    /// Drop history whose last ban ended more than `dbpurgeage` seconds
    /// before `now` and has no active ban. Permanent history is kept.
    pub fn purge(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let age = self.purge_age()?;
        let cutoff = now.timestamp() - age as i64;

        let conn = self.conn.lock();
        let rows = conn.execute(
            r#"
            DELETE FROM ban_history
            WHERE last_expires_at IS NOT NULL
              AND last_expires_at < ?1
              AND NOT EXISTS (
                  SELECT 1 FROM bans b WHERE b.jail = ban_history.jail AND b.ip = ban_history.ip
              )
            "#,
            params![cutoff],
        )?;

        if rows > 0 {
            debug!("Purged {} ban history entries", rows);
        }
        Ok(rows)
    }

    // ==================== Settings ====================

    pub fn purge_age(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'dbpurgeage'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(v) => v
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("invalid dbpurgeage '{}'", v))),
            None => Ok(crate::config::GeneralConfig::default().dbpurgeage),
        }
    }

    pub fn set_purge_age(&self, secs: u64) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES ('dbpurgeage', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [secs.to_string()],
        )?;
        Ok(())
    }

    /// (total, unenforced) ban counts
    pub fn counts(&self) -> StoreResult<(u64, u64)> {
        let conn = self.conn.lock();
        let counts = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN enforced = 0 THEN 1 ELSE 0 END), 0) FROM bans",
            [],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;
        Ok(counts)
    }

    /// Checkpoint the WAL so the main file is self-contained
    pub fn flush(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .optional()?;
        Ok(())
    }
}

fn row_to_ban(row: &Row<'_>) -> rusqlite::Result<BanRecord> {
    let ip: String = row.get(1)?;
    let source: String = row.get(6)?;

    Ok(BanRecord {
        jail_id: row.get(0)?,
        address: ip.parse().map_err(|e| conversion_error(1, e))?,
        banned_at: from_timestamp(2, row.get(2)?)?,
        expires_at: row
            .get::<_, Option<i64>>(3)?
            .map(|t| from_timestamp(3, t))
            .transpose()?,
        ban_count: row.get(4)?,
        action_ref: row.get(5)?,
        source: source.parse().map_err(|e: String| conversion_error(6, e))?,
        reason: row.get(7)?,
        enforced: row.get(8)?,
    })
}

fn from_timestamp(idx: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| conversion_error(idx, format!("timestamp {} out of range", secs)))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

/// The store keeps whole seconds
fn truncate_to_secs(mut ban: BanRecord) -> BanRecord {
    let trunc = |t: DateTime<Utc>| Utc.timestamp_opt(t.timestamp(), 0).single().unwrap_or(t);
    ban.banned_at = trunc(ban.banned_at);
    ban.expires_at = ban.expires_at.map(trunc);
    ban
}
