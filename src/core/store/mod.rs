//! Relational store
//!
//! SQLite in WAL mode. Every mutating operation opens its own connection and
//! runs exactly one `BEGIN IMMEDIATE` transaction on it, so writers serialize
//! on the database while readers keep going. A [`StoreTx`] owns the connection,
//! the transaction's advisory locks and its deadline; dropping it without
//! committing rolls back and releases the locks.

pub mod dao;
pub mod schema;

use crate::config::EngineConfig;
use crate::core::lock::{LockCoordinator, LockScope};
use crate::error::{AllocError, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handle on one database file
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    busy_timeout: Duration,
    locks: LockCoordinator,
}

impl Store {
    /// Open (creating if needed) the database named by the config
    pub fn open(config: &EngineConfig) -> Result<Self> {
        Self::open_with_locks(config, LockCoordinator::global())
    }

    /// Open with a dedicated lock table
    pub fn open_with_locks(config: &EngineConfig, locks: LockCoordinator) -> Result<Self> {
        config.validate()?;
        let store = Store {
            path: config.database_path.clone(),
            busy_timeout: config.busy_timeout(),
            locks,
        };

        let conn = store.connect()?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        schema::create(&conn)?;
        debug!(path = %store.path.display(), "store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    /// New connection for reads outside a transaction
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Start a write transaction bounded by `deadline`
    pub fn begin(&self, deadline: Option<Instant>) -> Result<StoreTx> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(AllocError::DeadlineExceeded);
        }
        let conn = self.connect()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(StoreTx {
            conn,
            locks: self.locks.scope(),
            deadline,
            finished: false,
        })
    }
}

/// One open write transaction
#[derive(Debug)]
pub struct StoreTx {
    conn: Connection,
    locks: LockScope,
    deadline: Option<Instant>,
    finished: bool,
}

impl StoreTx {
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Fail with `DeadlineExceeded` once the request deadline has passed
    pub fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(AllocError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Take a transaction-scoped advisory lock without waiting
    pub fn acquire_lock(&mut self, key: &str) -> Result<u64> {
        self.check_deadline()?;
        self.locks.try_acquire(key)
    }

    pub fn holds_lock(&self, key: &str) -> bool {
        self.locks.holds(key)
    }

    pub fn commit(mut self) -> Result<()> {
        self.check_deadline()?;
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        self.locks.release_all();
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let result = self.conn.execute_batch("ROLLBACK");
        self.locks.release_all();
        result.map_err(AllocError::from)
    }
}

impl Drop for StoreTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!(error = %e, "rollback on drop failed");
        }
        self.locks.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Store {
        let config = EngineConfig::with_database(dir.path().join("alloc.db"));
        Store::open_with_locks(&config, LockCoordinator::new()).unwrap()
    }

    fn count_sites(store: &Store) -> i64 {
        store
            .connect()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM sites", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_commit_persists_and_releases_locks() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let mut tx = store.begin(None).unwrap();
        tx.acquire_lock("k").unwrap();
        tx.conn()
            .execute(
                "INSERT INTO sites (id, name, provider_id) VALUES (?1, 's', ?2)",
                rusqlite::params![uuid::Uuid::new_v4(), uuid::Uuid::new_v4()],
            )
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(count_sites(&store), 1);
        assert!(!store.locks().is_held("k"));
    }

    #[test]
    fn test_drop_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        {
            let mut tx = store.begin(None).unwrap();
            tx.acquire_lock("k").unwrap();
            tx.conn()
                .execute(
                    "INSERT INTO sites (id, name, provider_id) VALUES (?1, 's', ?2)",
                    rusqlite::params![uuid::Uuid::new_v4(), uuid::Uuid::new_v4()],
                )
                .unwrap();
            assert!(store.locks().is_held("k"));
        }

        assert_eq!(count_sites(&store), 0);
        assert!(!store.locks().is_held("k"));
    }

    #[test]
    fn test_explicit_rollback_releases_locks() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let mut tx = store.begin(None).unwrap();
        tx.acquire_lock("k").unwrap();
        tx.conn()
            .execute(
                "INSERT INTO sites (id, name, provider_id) VALUES (?1, 's', ?2)",
                rusqlite::params![uuid::Uuid::new_v4(), uuid::Uuid::new_v4()],
            )
            .unwrap();
        tx.rollback().unwrap();

        assert_eq!(count_sites(&store), 0);
        assert!(!store.locks().is_held("k"));
        store.begin(None).unwrap().commit().unwrap();
    }

    #[test]
    fn test_expired_deadline() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let past = Instant::now() - Duration::from_millis(1);
        assert!(matches!(store.begin(Some(past)), Err(AllocError::DeadlineExceeded)));

        let tx = store
            .begin(Some(Instant::now() + Duration::from_millis(20)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(tx.check_deadline(), Err(AllocError::DeadlineExceeded)));
        assert!(matches!(tx.commit(), Err(AllocError::DeadlineExceeded)));
    }
}
