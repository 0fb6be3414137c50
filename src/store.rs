//! Key-tracking store.
//!
//! A single SQLite file with two keyspaces: `pubkeybirthdays` maps a
//! public-key fingerprint to the instant it was first presented, and
//! `certserial` holds the monotonic certificate serial counter. The file is
//! created mode 0600 and held under an exclusive advisory lock for the
//! process lifetime, so a second instance cannot share the database.
//!
//! Every mutation commits before the call returns. Serial allocation runs
//! read-increment-write inside one write transaction; concurrent requests
//! can never observe the same value.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("database file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt first-seen timestamp: {0}")]
    BadTimestamp(#[from] chrono::ParseError),

    #[error("database file is locked by another process")]
    Locked,

    #[error("database lock poisoned")]
    Poisoned,
}

pub struct KeyStore {
    conn: Mutex<Connection>,
    /// Advisory lock holder; the lock drops with the store.
    _lock: std::fs::File,
}

impl KeyStore {
    /// Open the store at `path`, creating the file (mode 0600) if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            _lock: lock,
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pubkeybirthdays (
                fingerprint BLOB PRIMARY KEY,
                first_seen TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS certserial (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// First-seen timestamp for a fingerprint, if it has one.
    pub fn first_seen(&self, fingerprint: &[u8]) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT first_seen FROM pubkeybirthdays WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(ts) => Ok(Some(DateTime::parse_from_rfc3339(&ts)?.with_timezone(&Utc))),
            None => Ok(None),
        }
    }

    /// Record the first sighting of a fingerprint. The first writer wins;
    /// the surviving timestamp is returned and never advances afterwards.
    pub fn record_first_seen(
        &self,
        fingerprint: &[u8],
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO pubkeybirthdays (fingerprint, first_seen) VALUES (?1, ?2)",
            params![fingerprint, now.to_rfc3339()],
        )?;
        let raw: String = conn.query_row(
            "SELECT first_seen FROM pubkeybirthdays WHERE fingerprint = ?1",
            params![fingerprint],
            |row| row.get(0),
        )?;
        Ok(DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc))
    }

    /// Allocate the next certificate serial.
    ///
    /// An absent counter initializes to 1, so a counter previously seeded to
    /// 1 at CA generation hands out 2 for the first client certificate.
    pub fn next_serial(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<u64> = tx
            .query_row(
                "SELECT value FROM certserial WHERE name = 'serial'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let next = match current {
            Some(n) => n + 1,
            None => 1,
        };
        tx.execute(
            "INSERT INTO certserial (name, value) VALUES ('serial', ?1)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![next],
        )?;
        tx.commit()?;
        Ok(next)
    }

    /// Seed the serial counter. Used once, when the CA is generated.
    pub fn set_serial(&self, value: u64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO certserial (name, value) VALUES ('serial', ?1)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![value],
        )?;
        Ok(())
    }
}
