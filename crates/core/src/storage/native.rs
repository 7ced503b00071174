//! In-process storage driver.
//!
//! Opens the SQLite file at a fixed path on first use and executes every
//! primitive directly on the calling task. Concurrent callers contend on the
//! connection mutex; transactions are additionally serialized by the
//! handle's [`TransactionGate`].
//!
//! Plain `exec` calls are not gated. They share the one connection, so a
//! read issued while another caller's transaction is open sees that
//! transaction's uncommitted rows.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::schema::ensure_schema;
use super::sqlite::{self, BEGIN_SQL, COMMIT_SQL, ROLLBACK_SQL};
use super::{Rows, SqlValue, StorageDriver, StorageHandle, TransactionGate};
use crate::errors::StorageError;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle wrapping a SQLite connection owned by the calling process.
///
/// The inner connection is wrapped in a `Mutex` so that the handle is
/// `Send + Sync`, enabling use inside `Arc`.
pub struct NativeHandle {
    conn: Mutex<Connection>,
    gate: TransactionGate,
}

impl NativeHandle {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = sqlite::open_file(path)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self::from_connection(sqlite::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            gate: TransactionGate::default(),
        }
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn run_control(&self, sql: &str) -> Result<(), StorageError> {
        self.conn()
            .execute_batch(sql)
            .map_err(|e| StorageError::Statement(e.to_string()))
    }
}

#[async_trait]
impl StorageHandle for NativeHandle {
    async fn exec(&self, sql: &str, params: Vec<SqlValue>) -> Result<Rows, StorageError> {
        let conn = self.conn();
        sqlite::run_statement(&conn, sql, &params).map_err(|e| StorageError::Statement(e.to_string()))
    }

    async fn begin_transaction(&self) -> Result<(), StorageError> {
        self.gate.enter().await;
        if let Err(e) = self.run_control(BEGIN_SQL) {
            self.gate.leave();
            return Err(e);
        }
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), StorageError> {
        // On failure the transaction stays open until the caller rolls back.
        self.run_control(COMMIT_SQL)?;
        self.gate.leave();
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<(), StorageError> {
        let result = self.run_control(ROLLBACK_SQL);
        self.gate.leave();
        result
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Driver that owns one lazily opened [`NativeHandle`].
pub struct NativeDriver {
    path: Option<PathBuf>,
    handle: OnceCell<Arc<NativeHandle>>,
}

impl NativeDriver {
    /// Driver for the database file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            handle: OnceCell::new(),
        }
    }

    /// Driver for a session-only in-memory database.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            handle: OnceCell::new(),
        }
    }

    async fn open(&self) -> Result<Arc<NativeHandle>, StorageError> {
        let handle = match &self.path {
            Some(path) => NativeHandle::open(path),
            None => NativeHandle::in_memory(),
        }
        .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        ensure_schema(&handle).await?;
        info!(location = %self.describe(), "native storage handle ready");
        Ok(Arc::new(handle))
    }
}

#[async_trait]
impl StorageDriver for NativeDriver {
    async fn open_handle(&self) -> Result<Arc<dyn StorageHandle>, StorageError> {
        let handle = self.handle.get_or_try_init(|| self.open()).await?;
        debug!("reusing native storage handle");
        Ok(handle.clone() as Arc<dyn StorageHandle>)
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("native sqlite at {}", path.display()),
            None => "native sqlite (in-memory)".to_string(),
        }
    }
}
