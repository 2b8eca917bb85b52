//! Very simple connection pool, to avoid an external dependency on r2d2 and
//! other crates. Connections are created lazily up to `max_size` and callers
//! park on a condvar when the pool is exhausted.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use rusqlite::Connection;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Mutex Poison Error
    #[error("Internal: PoisonError")]
    PoisonError,

    /// Internal database error
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Where the database lives
#[derive(Debug, Clone)]
pub enum Target {
    /// On-disk backing file inside the system-data directory
    File(PathBuf),
    /// Shared in-memory database; the pool is capped at one connection so
    /// every caller sees the same data
    Memory,
}

/// Pool of SQLite connections sharing one target and pragma set
#[derive(Debug)]
pub struct Pool {
    target: Target,
    queue: Mutex<Vec<Connection>>,
    in_use: AtomicUsize,
    max_size: usize,
    waiter: Condvar,
}

/// A connection checked out of the pool; returned on drop
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<Pool>,
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self.pool.queue.lock().expect("idle connections");
            idle.push(conn);
            self.pool.in_use.fetch_sub(1, Ordering::AcqRel);

            // Notify a waiting thread
            self.pool.waiter.notify_one();
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already dropped")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already dropped")
    }
}

fn open_connection(target: &Target) -> Result<Connection, Error> {
    let conn = match target {
        Target::File(path) => Connection::open(path)?,
        Target::Memory => Connection::open_in_memory()?,
    };

    // Apply pragmas
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "normal")?;
    conn.pragma_update(None, "temp_store", "memory")?;
    conn.pragma_update(None, "foreign_keys", "on")?;

    Ok(conn)
}

impl Pool {
    /// Creates a new pool. Memory targets are clamped to a single
    /// connection because each in-memory connection is its own database.
    pub fn new(target: Target, max_size: usize) -> Arc<Self> {
        let max_size = match target {
            Target::Memory => 1,
            Target::File(_) => max_size,
        };

        Arc::new(Self {
            target,
            queue: Default::default(),
            in_use: Default::default(),
            waiter: Default::default(),
            max_size,
        })
    }

    /// Check a connection out, creating one lazily while under `max_size`,
    /// otherwise waiting for a return
    pub fn get(self: &Arc<Self>) -> Result<PooledConnection, Error> {
        let mut idle = self.queue.lock().map_err(|_| Error::PoisonError)?;

        loop {
            if let Some(conn) = idle.pop() {
                drop(idle);
                self.in_use.fetch_add(1, Ordering::AcqRel);

                return Ok(PooledConnection {
                    conn: Some(conn),
                    pool: self.clone(),
                });
            }

            if self.in_use.load(Ordering::Relaxed) < self.max_size {
                drop(idle);
                self.in_use.fetch_add(1, Ordering::AcqRel);

                return Ok(PooledConnection {
                    conn: Some(open_connection(&self.target)?),
                    pool: self.clone(),
                });
            }

            idle = self.waiter.wait(idle).map_err(|_| Error::PoisonError)?;
        }
    }
}
