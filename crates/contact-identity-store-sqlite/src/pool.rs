use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use contact_identity_core::StoreError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, warn};

use crate::MEMORY_DATABASE;

pub(crate) type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// r2d2 pool of SQLite connections to one database.
///
/// Connections open lazily up to `max_connections` and carry the WAL,
/// foreign-key and busy-timeout settings from the manager's init hook. A
/// checkout waits at most `acquire_timeout` before failing with
/// [`StoreError::PoolExhausted`].
pub(crate) struct ConnectionPool {
    inner: RwLock<Option<Pool<SqliteConnectionManager>>>,
    max_connections: u32,
    acquire_timeout: Duration,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_connections: usize,
    pub open_connections: usize,
    pub idle_connections: usize,
    pub closed: bool,
}

impl ConnectionPool {
    pub(crate) fn new(
        path: &Path,
        max_connections: usize,
        acquire_timeout: Duration,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let max_connections = u32::try_from(max_connections.max(1)).unwrap_or(u32::MAX);
        // r2d2 rejects a zero checkout timeout.
        let acquire_timeout = acquire_timeout.max(Duration::from_millis(1));

        let manager = if path == Path::new(MEMORY_DATABASE) {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path)
        }
        .with_init(move |conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;",
            )?;
            conn.busy_timeout(busy_timeout)
        });

        let pool = Pool::builder()
            .max_size(max_connections)
            .min_idle(Some(0))
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(acquire_timeout)
            .build(manager)
            .map_err(|err| {
                StoreError::Connection(format!(
                    "failed to build sqlite pool for {}: {err}",
                    path.display()
                ))
            })?;

        Ok(Self {
            inner: RwLock::new(Some(pool)),
            max_connections,
            acquire_timeout,
        })
    }

    pub(crate) fn acquire(&self) -> Result<PooledConnection, StoreError> {
        let pool = self.handle()?;
        pool.get().map_err(|err| {
            let state = pool.state();
            if state.connections < self.max_connections {
                // The pool had room, so the manager failed to open a connection.
                return StoreError::Connection(err.to_string());
            }
            let waited_ms = u64::try_from(self.acquire_timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(
                waited_ms,
                max_connections = self.max_connections,
                "sqlite connection pool exhausted"
            );
            StoreError::PoolExhausted { waited_ms }
        })
    }

    /// Refuses further checkouts and drops the pool handle. Connections that
    /// are checked out close when they are returned.
    pub(crate) fn close(&self) {
        let taken = match self.inner.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(pool) = taken {
            let state = pool.state();
            debug!(
                open_connections = state.connections,
                idle_connections = state.idle_connections,
                "closed sqlite connection pool"
            );
        }
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let max_connections = self.max_connections as usize;
        match self.handle() {
            Ok(pool) => {
                let state = pool.state();
                PoolStatus {
                    max_connections,
                    open_connections: state.connections as usize,
                    idle_connections: state.idle_connections as usize,
                    closed: false,
                }
            }
            Err(_) => PoolStatus {
                max_connections,
                open_connections: 0,
                idle_connections: 0,
                closed: true,
            },
        }
    }

    fn handle(&self) -> Result<Pool<SqliteConnectionManager>, StoreError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| StoreError::Connection("connection pool lock poisoned".to_string()))?;
        guard
            .clone()
            .ok_or_else(|| StoreError::Connection("connection pool is closed".to_string()))
    }
}
