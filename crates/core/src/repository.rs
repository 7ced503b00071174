//! Local repository port used by the sync coordinator.
//!
//! One implementation per entity kind, each writing through a
//! [`StorageHandle`] so it works unchanged on either storage driver.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::StorageError;
use crate::models::{CursorToken, Syncable};
use crate::storage::{SqlValue, StorageHandle};

#[async_trait]
pub trait LocalRepository<T: Syncable>: Send + Sync {
    /// Maximum `id` currently stored for `T`, or `None` for an empty table.
    /// Always a fresh single query, never a cached value.
    async fn latest_cursor(&self) -> Result<Option<CursorToken>, StorageError>;

    /// Insert-or-replace every item as one atomic unit: either all rows are
    /// committed or none are. [`StorageError::CommitIndeterminate`] means
    /// the caller cannot tell which; repeating the upsert is safe.
    async fn upsert(&self, items: &[T]) -> Result<(), StorageError>;
}

/// A statement with its positional parameters.
pub type Statement = (&'static str, Vec<SqlValue>);

/// Run `statements` inside one transaction on `handle`.
///
/// Any failure rolls the whole batch back and is reported as
/// [`StorageError::Write`]; a failed rollback is logged, never masked.
/// A commit whose outcome the handle cannot confirm is passed through as
/// [`StorageError::CommitIndeterminate`] without a second rollback.
pub async fn write_batch(
    handle: &dyn StorageHandle,
    statements: Vec<Statement>,
) -> Result<(), StorageError> {
    let count = statements.len();
    handle
        .begin_transaction()
        .await
        .map_err(|e| StorageError::Write {
            detail: format!("cannot begin transaction: {}", e),
        })?;

    for (index, (sql, params)) in statements.into_iter().enumerate() {
        if let Err(e) = handle.exec(sql, params).await {
            rollback(handle).await;
            return Err(StorageError::Write {
                detail: format!("statement {} of {} failed: {}", index + 1, count, e),
            });
        }
    }

    match handle.commit_transaction().await {
        Ok(()) => {}
        Err(e @ StorageError::CommitIndeterminate { .. }) => {
            warn!(statements = count, error = %e, "batch commit outcome unknown");
            return Err(e);
        }
        Err(e) => {
            rollback(handle).await;
            return Err(StorageError::Write {
                detail: format!("commit failed: {}", e),
            });
        }
    }

    debug!(statements = count, "batch committed");
    Ok(())
}

async fn rollback(handle: &dyn StorageHandle) {
    if let Err(e) = handle.rollback_transaction().await {
        warn!(error = %e, "rollback after failed batch also failed");
    }
}

/// Read the single `MAX(id)` value of `table` as a cursor.
pub async fn max_id_cursor(
    handle: &dyn StorageHandle,
    table: &str,
) -> Result<Option<CursorToken>, StorageError> {
    let sql = format!("SELECT MAX(id) FROM {}", table);
    let rows = handle.exec(&sql, Vec::new()).await?;
    match rows.first_value() {
        None | Some(SqlValue::Null) => Ok(None),
        Some(SqlValue::Text(id)) => Ok(Some(CursorToken::new(id.clone()))),
        Some(other) => Err(StorageError::Decode {
            column: format!("{}.id", table),
            detail: format!("expected text, found {:?}", other),
        }),
    }
}
