//! rusqlite-backed reference implementation of the repository traits.
//! Schema and locking style mirrored from the teacher's `vault/vault_db.rs`
//! (`Connection` behind a `tokio::sync::Mutex`, WAL journal mode, one
//! `CREATE TABLE IF NOT EXISTS` per table run at open time).

use crate::error::{AppError, AppResult};
use crate::models::{Connection as DomainConnection, Market, MarketMetrics, RateLimitLog, Snapshot, SyncState, SyncStatus, UserId, VenueId};
use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection as SqlConnection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Schema version stamped into a single-row table, so a future migration can
/// tell which shape an existing database file is in.
const SCHEMA_VERSION: i64 = 1;

pub struct SqliteRepository {
    conn: Arc<Mutex<SqlConnection>>,
}

impl SqliteRepository {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let conn = SqlConnection::open(path)
            .context("open sqlite database")
            .map_err(AppError::from)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn = SqlConnection::open_in_memory()
            .context("open in-memory sqlite database")
            .map_err(AppError::from)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: SqlConnection) -> AppResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL).map_err(|e| AppError::internal(e.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (id, version) VALUES (1, ?1)",
            params![SCHEMA_VERSION],
        )
        .map_err(|e| AppError::internal(e.to_string()))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS connections (
    user_id TEXT NOT NULL,
    venue_id TEXT NOT NULL,
    label TEXT NOT NULL,
    encrypted_key TEXT NOT NULL,
    encrypted_secret TEXT NOT NULL,
    encrypted_passphrase TEXT,
    credentials_fingerprint TEXT NOT NULL,
    active INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (user_id, venue_id, label)
);
CREATE INDEX IF NOT EXISTS idx_connections_user ON connections(user_id);
CREATE TABLE IF NOT EXISTS snapshots (
    user_id TEXT NOT NULL,
    venue_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    total_equity REAL NOT NULL,
    realized_balance REAL NOT NULL,
    unrealized_pnl REAL NOT NULL,
    deposits REAL NOT NULL,
    withdrawals REAL NOT NULL,
    breakdown_json TEXT NOT NULL,
    PRIMARY KEY (user_id, venue_id, timestamp)
);
CREATE INDEX IF NOT EXISTS idx_snapshots_user_venue_ts ON snapshots(user_id, venue_id, timestamp DESC);
CREATE TABLE IF NOT EXISTS sync_status (
    user_id TEXT NOT NULL,
    venue_id TEXT NOT NULL,
    last_sync_time TEXT NOT NULL,
    status TEXT NOT NULL,
    total_trades_observed INTEGER NOT NULL,
    last_error TEXT,
    PRIMARY KEY (user_id, venue_id)
);
CREATE TABLE IF NOT EXISTS rate_limit_log (
    user_id TEXT NOT NULL,
    venue_id TEXT NOT NULL,
    last_sync_time TEXT NOT NULL,
    count INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rate_limit_log_user_venue_ts ON rate_limit_log(user_id, venue_id, last_sync_time DESC);
CREATE TABLE IF NOT EXISTS user_preferences (
    user_id TEXT PRIMARY KEY,
    sync_interval_minutes INTEGER NOT NULL
);
";

fn row_to_connection(row: &rusqlite::Row) -> rusqlite::Result<DomainConnection> {
    let user_id: String = row.get(0)?;
    let venue_id: String = row.get(1)?;
    let created_at: String = row.get(8)?;
    Ok(DomainConnection {
        user_id: UserId(user_id.parse().unwrap_or_default()),
        venue_id: VenueId::from_str(&venue_id).unwrap_or(VenueId::Binance),
        label: row.get(2)?,
        encrypted_key: row.get(3)?,
        encrypted_secret: row.get(4)?,
        encrypted_passphrase: row.get(5)?,
        credentials_fingerprint: row.get(6)?,
        active: row.get::<_, i64>(7)? != 0,
        created_at: parse_timestamp(&created_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

#[async_trait::async_trait]
impl crate::repository::ConnectionRepository for SqliteRepository {
    async fn upsert(&self, connection: &DomainConnection) -> AppResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO connections (user_id, venue_id, label, encrypted_key, encrypted_secret, encrypted_passphrase, credentials_fingerprint, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (user_id, venue_id, label) DO UPDATE SET
                encrypted_key = excluded.encrypted_key,
                encrypted_secret = excluded.encrypted_secret,
                encrypted_passphrase = excluded.encrypted_passphrase,
                credentials_fingerprint = excluded.credentials_fingerprint,
                active = excluded.active",
            params![
                connection.user_id.0.to_string(),
                connection.venue_id.as_str(),
                connection.label,
                connection.encrypted_key,
                connection.encrypted_secret,
                connection.encrypted_passphrase,
                connection.credentials_fingerprint,
                connection.active as i64,
                connection.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| AppError::internal(e.to_string()))?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: UserId) -> AppResult<Vec<DomainConnection>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT user_id, venue_id, label, encrypted_key, encrypted_secret, encrypted_passphrase, credentials_fingerprint, active, created_at FROM connections WHERE user_id = ?1")
            .map_err(|e| AppError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![user_id.0.to_string()], row_to_connection)
            .map_err(|e| AppError::internal(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| AppError::internal(e.to_string()))
    }

    async fn list_active(&self) -> AppResult<Vec<DomainConnection>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT user_id, venue_id, label, encrypted_key, encrypted_secret, encrypted_passphrase, credentials_fingerprint, active, created_at FROM connections WHERE active = 1")
            .map_err(|e| AppError::internal(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_connection)
            .map_err(|e| AppError::internal(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| AppError::internal(e.to_string()))
    }

    async fn get(&self, user_id: UserId, venue_id: VenueId, label: &str) -> AppResult<Option<DomainConnection>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT user_id, venue_id, label, encrypted_key, encrypted_secret, encrypted_passphrase, credentials_fingerprint, active, created_at FROM connections WHERE user_id = ?1 AND venue_id = ?2 AND label = ?3",
            params![user_id.0.to_string(), venue_id.as_str(), label],
            row_to_connection,
        )
        .optional()
        .map_err(|e| AppError::internal(e.to_string()))
    }

    async fn deactivate(&self, user_id: UserId, venue_id: VenueId, label: &str) -> AppResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE connections SET active = 0 WHERE user_id = ?1 AND venue_id = ?2 AND label = ?3",
            params![user_id.0.to_string(), venue_id.as_str(), label],
        )
        .map_err(|e| AppError::internal(e.to_string()))?;
        Ok(())
    }
}

fn breakdown_to_json(breakdown: &HashMap<Market, MarketMetrics>) -> String {
    let as_strings: HashMap<String, MarketMetrics> =
        breakdown.iter().map(|(k, v)| (k.as_str().to_string(), *v)).collect();
    serde_json::to_string(&as_strings).unwrap_or_else(|_| "{}".to_string())
}

fn breakdown_from_json(s: &str) -> HashMap<Market, MarketMetrics> {
    let as_strings: HashMap<String, MarketMetrics> = serde_json::from_str(s).unwrap_or_default();
    as_strings
        .into_iter()
        .filter_map(|(k, v)| market_from_str(&k).map(|m| (m, v)))
        .collect()
}

fn market_from_str(s: &str) -> Option<Market> {
    Some(match s {
        "global" => Market::Global,
        "spot" => Market::Spot,
        "swap" => Market::Swap,
        "stocks" => Market::Stocks,
        "futures" => Market::Futures,
        "options" => Market::Options,
        "commodities" => Market::Commodities,
        "forex" => Market::Forex,
        "cfd" => Market::Cfd,
        "earn" => Market::Earn,
        "margin" => Market::Margin,
        _ => return None,
    })
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
    let user_id: String = row.get(0)?;
    let venue_id: String = row.get(1)?;
    let timestamp: String = row.get(2)?;
    let breakdown_json: String = row.get(8)?;
    Ok(Snapshot {
        user_id: UserId(user_id.parse().unwrap_or_default()),
        venue_id: VenueId::from_str(&venue_id).unwrap_or(VenueId::Binance),
        timestamp: parse_timestamp(&timestamp),
        total_equity: row.get(3)?,
        realized_balance: row.get(4)?,
        unrealized_pnl: row.get(5)?,
        deposits: row.get(6)?,
        withdrawals: row.get(7)?,
        breakdown: breakdown_from_json(&breakdown_json),
    })
}

#[async_trait::async_trait]
impl crate::repository::SnapshotRepository for SqliteRepository {
    async fn insert(&self, snapshot: &Snapshot) -> AppResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO snapshots (user_id, venue_id, timestamp, total_equity, realized_balance, unrealized_pnl, deposits, withdrawals, breakdown_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (user_id, venue_id, timestamp) DO UPDATE SET
                total_equity = excluded.total_equity,
                realized_balance = excluded.realized_balance,
                unrealized_pnl = excluded.unrealized_pnl,
                deposits = excluded.deposits,
                withdrawals = excluded.withdrawals,
                breakdown_json = excluded.breakdown_json",
            params![
                snapshot.user_id.0.to_string(),
                snapshot.venue_id.as_str(),
                snapshot.timestamp.to_rfc3339(),
                snapshot.total_equity,
                snapshot.realized_balance,
                snapshot.unrealized_pnl,
                snapshot.deposits,
                snapshot.withdrawals,
                breakdown_to_json(&snapshot.breakdown),
            ],
        )
        .map_err(|e| AppError::internal(e.to_string()))?;
        Ok(())
    }

    async fn latest(&self, user_id: UserId, venue_id: VenueId) -> AppResult<Option<Snapshot>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT user_id, venue_id, timestamp, total_equity, realized_balance, unrealized_pnl, deposits, withdrawals, breakdown_json
             FROM snapshots WHERE user_id = ?1 AND venue_id = ?2 ORDER BY timestamp DESC LIMIT 1",
            params![user_id.0.to_string(), venue_id.as_str()],
            row_to_snapshot,
        )
        .optional()
        .map_err(|e| AppError::internal(e.to_string()))
    }

    async fn between(
        &self,
        user_id: UserId,
        venue_id: VenueId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Snapshot>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT user_id, venue_id, timestamp, total_equity, realized_balance, unrealized_pnl, deposits, withdrawals, breakdown_json
                 FROM snapshots WHERE user_id = ?1 AND venue_id = ?2 AND timestamp >= ?3 AND timestamp <= ?4 ORDER BY timestamp ASC",
            )
            .map_err(|e| AppError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(
                params![user_id.0.to_string(), venue_id.as_str(), from.to_rfc3339(), to.to_rfc3339()],
                row_to_snapshot,
            )
            .map_err(|e| AppError::internal(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| AppError::internal(e.to_string()))
    }

    async fn latest_for_all_venues(&self, user_id: UserId) -> AppResult<Vec<Snapshot>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT s.user_id, s.venue_id, s.timestamp, s.total_equity, s.realized_balance, s.unrealized_pnl, s.deposits, s.withdrawals, s.breakdown_json
                 FROM snapshots s
                 INNER JOIN (
                    SELECT venue_id, MAX(timestamp) AS max_ts FROM snapshots WHERE user_id = ?1 GROUP BY venue_id
                 ) latest ON s.venue_id = latest.venue_id AND s.timestamp = latest.max_ts
                 WHERE s.user_id = ?1",
            )
            .map_err(|e| AppError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![user_id.0.to_string()], row_to_snapshot)
            .map_err(|e| AppError::internal(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| AppError::internal(e.to_string()))
    }
}

fn sync_state_from_str(s: &str) -> SyncState {
    match s {
        "syncing" => SyncState::Syncing,
        "completed" => SyncState::Completed,
        "error" => SyncState::Error,
        _ => SyncState::Pending,
    }
}

fn sync_state_as_str(s: SyncState) -> &'static str {
    match s {
        SyncState::Pending => "pending",
        SyncState::Syncing => "syncing",
        SyncState::Completed => "completed",
        SyncState::Error => "error",
    }
}

#[async_trait::async_trait]
impl crate::repository::SyncStatusRepository for SqliteRepository {
    async fn set(&self, status: &SyncStatus) -> AppResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sync_status (user_id, venue_id, last_sync_time, status, total_trades_observed, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (user_id, venue_id) DO UPDATE SET
                last_sync_time = excluded.last_sync_time,
                status = excluded.status,
                total_trades_observed = excluded.total_trades_observed,
                last_error = excluded.last_error",
            params![
                status.user_id.0.to_string(),
                status.venue_id.as_str(),
                status.last_sync_time.to_rfc3339(),
                sync_state_as_str(status.status),
                status.total_trades_observed as i64,
                status.last_error,
            ],
        )
        .map_err(|e| AppError::internal(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, user_id: UserId, venue_id: VenueId) -> AppResult<Option<SyncStatus>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT user_id, venue_id, last_sync_time, status, total_trades_observed, last_error FROM sync_status WHERE user_id = ?1 AND venue_id = ?2",
            params![user_id.0.to_string(), venue_id.as_str()],
            |row| {
                let user_id: String = row.get(0)?;
                let venue_id: String = row.get(1)?;
                let last_sync_time: String = row.get(2)?;
                let status: String = row.get(3)?;
                Ok(SyncStatus {
                    user_id: UserId(user_id.parse().unwrap_or_default()),
                    venue_id: VenueId::from_str(&venue_id).unwrap_or(VenueId::Binance),
                    last_sync_time: parse_timestamp(&last_sync_time),
                    status: sync_state_from_str(&status),
                    total_trades_observed: row.get::<_, i64>(4)? as u64,
                    last_error: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::internal(e.to_string()))
    }
}

#[async_trait::async_trait]
impl crate::repository::RateLimitRepository for SqliteRepository {
    async fn record(&self, log: &RateLimitLog) -> AppResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO rate_limit_log (user_id, venue_id, last_sync_time, count) VALUES (?1, ?2, ?3, ?4)",
            params![
                log.user_id.0.to_string(),
                log.venue_id.as_str(),
                log.last_sync_time.to_rfc3339(),
                log.count as i64,
            ],
        )
        .map_err(|e| AppError::internal(e.to_string()))?;
        Ok(())
    }

    async fn last(&self, user_id: UserId, venue_id: VenueId) -> AppResult<Option<RateLimitLog>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT user_id, venue_id, last_sync_time, count FROM rate_limit_log WHERE user_id = ?1 AND venue_id = ?2 ORDER BY last_sync_time DESC LIMIT 1",
            params![user_id.0.to_string(), venue_id.as_str()],
            |row| {
                let user_id: String = row.get(0)?;
                let venue_id: String = row.get(1)?;
                let last_sync_time: String = row.get(2)?;
                Ok(RateLimitLog {
                    user_id: UserId(user_id.parse().unwrap_or_default()),
                    venue_id: VenueId::from_str(&venue_id).unwrap_or(VenueId::Binance),
                    last_sync_time: parse_timestamp(&last_sync_time),
                    count: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::internal(e.to_string()))
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "DELETE FROM rate_limit_log WHERE last_sync_time < ?1",
                params![cutoff.to_rfc3339()],
            )
            .map_err(|e| AppError::internal(e.to_string()))?;
        Ok(affected as u64)
    }
}

#[async_trait::async_trait]
impl crate::repository::UserPreferencesRepository for SqliteRepository {
    async fn get_sync_interval_minutes(&self, user_id: UserId) -> AppResult<Option<i64>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT sync_interval_minutes FROM user_preferences WHERE user_id = ?1",
            params![user_id.0.to_string()],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| AppError::internal(e.to_string()))
    }

    async fn set_sync_interval_minutes(&self, user_id: UserId, minutes: i64) -> AppResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_preferences (user_id, sync_interval_minutes) VALUES (?1, ?2)
             ON CONFLICT (user_id) DO UPDATE SET sync_interval_minutes = excluded.sync_interval_minutes",
            params![user_id.0.to_string(), minutes],
        )
        .map_err(|e| AppError::internal(e.to_string()))?;
        Ok(())
    }
}
