//! SQLite persistence for ldapsync.
//!
//! A single [`Database`] holds the local documents (identities and groups
//! with their revision history), the audit log and small `kv_state` values.
//! The schema is versioned through `user_version`; see [`schema`].

pub mod documents;
pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// Shared handle to the ldapsync database.
///
/// The connection sits behind a `Mutex`, so one `Database` can back an engine
/// that is shared between the scheduler and blocking worker threads.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file at `path` in WAL mode.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        Self::configure(conn, true)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        Self::configure(Connection::open_in_memory()?, false)
    }

    fn configure(conn: Connection, wal: bool) -> Result<Self, DatabaseError> {
        if wal {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        debug!(wal, "database connection configured");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Apply every pending migration.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        self.initialize_to(schema::latest_version())
    }

    /// Apply pending migrations up to `version`. A store left below the
    /// latest version reports no federated identity support.
    pub fn initialize_to(&self, version: u32) -> Result<(), DatabaseError> {
        let conn = self.conn();
        schema::run_migrations_to(&conn, version)?;
        info!(version = schema::get_schema_version(&conn)?, "database schema ready");
        Ok(())
    }

    /// Current schema version.
    pub fn schema_version(&self) -> Result<u32, DatabaseError> {
        schema::get_schema_version(&self.conn())
    }

    /// Lock the connection, recovering it if a previous holder panicked.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in one transaction: committed on `Ok`, rolled back on `Err`.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
