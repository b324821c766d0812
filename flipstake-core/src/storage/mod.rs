pub mod audit_store;
pub mod outcome_store;
pub mod signature_store;
pub mod wager_store;

pub use audit_store::AuditStore;
pub use outcome_store::OutcomeStore;
pub use signature_store::SignatureStore;
pub use wager_store::{DepositRecord, WagerStore};

use crate::error::{FlipstakeError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                FlipstakeError::internal(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // Wagers table. Escrow addresses and deposit signatures never repeat.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS wagers (
                id TEXT PRIMARY KEY,
                stake INTEGER NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                creator_side TEXT NOT NULL,
                creator_wallet TEXT NOT NULL,
                creator_escrow TEXT UNIQUE NOT NULL,
                creator_secret BLOB NOT NULL,
                creator_deposit TEXT UNIQUE,
                acceptor_side TEXT,
                acceptor_wallet TEXT,
                acceptor_escrow TEXT UNIQUE,
                acceptor_secret BLOB,
                acceptor_deposit TEXT UNIQUE,
                created_at INTEGER NOT NULL,
                accepting_at INTEGER,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_wagers_status ON wagers (status, created_at)",
            [],
        )?;

        // Used signatures table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS used_signatures (
                signature TEXT PRIMARY KEY,
                payer TEXT NOT NULL,
                purpose TEXT NOT NULL,
                used_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Outcomes table, written once per wager
        conn.execute(
            "CREATE TABLE IF NOT EXISTS outcomes (
                wager_id TEXT PRIMARY KEY,
                entropy_height INTEGER NOT NULL,
                entropy TEXT NOT NULL,
                digest TEXT NOT NULL,
                side TEXT NOT NULL,
                winner TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (wager_id) REFERENCES wagers(id)
            )",
            [],
        )?;

        // Settlement legs table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settlement_legs (
                wager_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount INTEGER NOT NULL,
                signature TEXT,
                status TEXT NOT NULL,
                error TEXT,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (wager_id) REFERENCES wagers(id),
                PRIMARY KEY (wager_id, seq)
            )",
            [],
        )?;

        // Escrows detached by abandoned claims
        conn.execute(
            "CREATE TABLE IF NOT EXISTS retired_escrows (
                address TEXT PRIMARY KEY,
                wager_id TEXT NOT NULL,
                encrypted_secret BLOB NOT NULL,
                retired_at INTEGER NOT NULL,
                needs_recovery INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (wager_id) REFERENCES wagers(id)
            )",
            [],
        )?;

        // Audit log
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wager_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                actor TEXT,
                amount INTEGER,
                signature TEXT,
                detail TEXT,
                at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_wager ON audit_log (wager_id, id)",
            [],
        )?;

        Ok(())
    }

    pub async fn get_connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

pub(crate) fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

/// Parses a text column into one of the closed domain enums.
pub(crate) fn parse_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = FlipstakeError>,
{
    T::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
