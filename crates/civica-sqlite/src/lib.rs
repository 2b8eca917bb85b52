//! SQLite storage backend for Civica
//!
//! One [`CivicaSqliteDatabase`] implements both the saga state-store and the
//! civic record-store traits over a shared connection pool, so a saga's
//! bookkeeping and the rows it mutates live in the same backing file.

use std::path::Path;
use std::sync::Arc;

use civica_common::database::Error;
use rusqlite::Connection;

pub mod macros;
pub mod migrations;
pub mod pool;
pub mod stmt;

mod records;
mod state;

use pool::{Pool, PooledConnection, Target};

/// Number of pooled connections for on-disk databases
const POOL_SIZE: usize = 20;

/// SQLite-backed state store and record store
#[derive(Debug, Clone)]
pub struct CivicaSqliteDatabase {
    pool: Arc<Pool>,
}

impl CivicaSqliteDatabase {
    /// Open (or create) the backing file and run migrations
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::open(Target::File(path.as_ref().to_path_buf()), POOL_SIZE)
    }

    /// Fresh shared in-memory database, used by tests
    pub fn memory() -> Result<Self, Error> {
        Self::open(Target::Memory, 1)
    }

    fn open(target: Target, max_size: usize) -> Result<Self, Error> {
        let db = Self {
            pool: Pool::new(target, max_size),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), Error> {
        let conn = self.conn()?;
        conn.execute_batch(migrations::INIT_SQL)
            .map_err(stmt::to_db_error)?;

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(stmt::to_db_error)?;
        if version as usize != migrations::DB_VERSION {
            return Err(Error::Internal(format!(
                "Unexpected schema version {version}, wanted {}",
                migrations::DB_VERSION
            )));
        }

        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection, Error> {
        self.pool.get().map_err(|e| Error::Database(Box::new(e)))
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction on one pooled
    /// connection, committing on success and rolling back on error.
    pub(crate) fn in_tx<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Connection) -> Result<T, Error>,
    {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(stmt::to_db_error)?;

        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT").map_err(stmt::to_db_error)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    tracing::error!("Failed to roll back transaction: {rollback_err}");
                }
                Err(err)
            }
        }
    }
}
