//! Storage drivers for the local SQLite store.
//!
//! Two environment variants sit behind one [`StorageDriver`] interface:
//!
//! - [`native::NativeDriver`] opens the database in-process and executes
//!   statements on the caller's task.
//! - [`worker::WorkerDriver`] hosts the database on a dedicated worker thread
//!   and hands out a proxy that forwards every primitive over the
//!   [`crate::rpc`] protocol.
//!
//! Repository code only ever sees [`StorageHandle`] and its three primitives:
//! `exec`, `begin_transaction` and `commit_transaction`/`rollback_transaction`.

pub mod native;
pub mod schema;
pub mod sqlite;
pub mod worker;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::config::{StorageBackend, StorageConfig};
use crate::errors::StorageError;

pub use native::NativeDriver;
pub use worker::{WorkerDriver, WorkerStatus};

// ---------------------------------------------------------------------------
// Values and rows
// ---------------------------------------------------------------------------

/// A single SQL value, as bound to a statement or read from a result row.
///
/// Serialized untagged so that on the worker wire a value is a plain JSON
/// scalar (`null`, number, string) or a byte array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Result rows of one statement, positional by column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rows {
    pub values: Vec<Vec<SqlValue>>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First column of the first row, if any.
    pub fn first_value(&self) -> Option<&SqlValue> {
        self.values.first().and_then(|row| row.first())
    }

    pub fn iter(&self) -> impl Iterator<Item = &[SqlValue]> {
        self.values.iter().map(Vec::as_slice)
    }
}

// ---------------------------------------------------------------------------
// Handle and driver interfaces
// ---------------------------------------------------------------------------

/// An open connection to the persistent engine, owned by a driver.
#[async_trait]
pub trait StorageHandle: Send + Sync {
    /// Execute one statement with positional parameters and collect its rows.
    ///
    /// Not serialized against transactions: on a shared connection the
    /// statement observes whatever transaction is currently open.
    async fn exec(&self, sql: &str, params: Vec<SqlValue>) -> Result<Rows, StorageError>;

    async fn begin_transaction(&self) -> Result<(), StorageError>;

    /// On [`StorageError::CommitIndeterminate`] the transaction is already
    /// closed and must not be rolled back. Any other error leaves it open
    /// for the caller to roll back.
    async fn commit_transaction(&self) -> Result<(), StorageError>;

    async fn rollback_transaction(&self) -> Result<(), StorageError>;
}

/// Platform-specific access to the persistent engine.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Return the driver's handle, opening it and creating the schema on the
    /// first call. Later calls return the same handle.
    async fn open_handle(&self) -> Result<Arc<dyn StorageHandle>, StorageError>;

    /// Short human-readable description of where the data lives.
    fn describe(&self) -> String;
}

/// Build the driver selected by `config.backend`.
pub fn driver_for(config: &StorageConfig) -> Arc<dyn StorageDriver> {
    let path = config.database_path();
    match config.backend {
        StorageBackend::Native => Arc::new(NativeDriver::new(path)),
        StorageBackend::Worker => Arc::new(WorkerDriver::new(Some(path), config.request_timeout())),
    }
}

// ---------------------------------------------------------------------------
// Transaction gate
// ---------------------------------------------------------------------------

/// Single-slot writer gate held from `begin_transaction` until the matching
/// commit or rollback.
///
/// A second `begin_transaction` on the same handle waits here instead of
/// failing with "cannot start a transaction within a transaction".
#[derive(Default)]
pub(crate) struct TransactionGate {
    gate: Arc<tokio::sync::Mutex<()>>,
    held: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl TransactionGate {
    pub(crate) async fn enter(&self) {
        let guard = self.gate.clone().lock_owned().await;
        *self.slot() = Some(guard);
    }

    pub(crate) fn leave(&self) {
        self.slot().take();
    }

    fn slot(&self) -> MutexGuard<'_, Option<OwnedMutexGuard<()>>> {
        self.held.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("transaction gate mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
