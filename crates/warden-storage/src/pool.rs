//! Shared SQLite connection.
//!
//! Every caller goes through one connection behind a mutex, so at most one
//! statement batch runs at a time. Batches are short (a traffic cycle, an
//! enforcement pass, one admin edit) and the jobs tick seconds apart. WAL
//! mode keeps a second process reading the file unblocked while we commit.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use crate::error::Result;
use crate::schema::run_migrations;

/// How long a statement waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const PRAGMAS: &str = "
    PRAGMA foreign_keys = ON;
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
";

/// Cloneable handle to the migrated connection.
#[derive(Clone)]
pub struct ConnectionPool {
    conn: Arc<Mutex<Connection>>,
}

/// Exclusive access to the connection until dropped.
pub type PooledConnection<'a> = MutexGuard<'a, Connection>;

impl ConnectionPool {
    /// Opens (creating if needed) the database file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Connection::open(path)?)
    }

    /// Opens a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::open(Connection::open_in_memory()?)
    }

    fn open(conn: Connection) -> Result<Self> {
        conn.execute_batch(PRAGMAS)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the connection, waiting for any other holder.
    pub fn get(&self) -> PooledConnection<'_> {
        self.conn.lock()
    }
}
