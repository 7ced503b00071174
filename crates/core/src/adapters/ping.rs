//! Repository adapter for [`PingEvent`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::StorageError;
use crate::models::{CursorToken, PingEvent, Syncable};
use crate::repository::{max_id_cursor, write_batch, LocalRepository, Statement};
use crate::storage::{SqlValue, StorageDriver, StorageHandle};

const TABLE: &str = PingEvent::KIND;

const UPSERT_SQL: &str =
    "INSERT OR REPLACE INTO ping_events (id, message, last_modified) VALUES (?1, ?2, ?3)";

const SELECT_COLUMNS: &str = "SELECT id, message, last_modified FROM ping_events";

/// Persists ping events in the `ping_events` table.
#[derive(Clone)]
pub struct PingEventRepository {
    handle: Arc<dyn StorageHandle>,
}

impl PingEventRepository {
    pub fn new(handle: Arc<dyn StorageHandle>) -> Self {
        Self { handle }
    }

    /// Open (or reuse) the driver's handle and bind the repository to it.
    pub async fn from_driver(driver: &dyn StorageDriver) -> Result<Self, StorageError> {
        Ok(Self::new(driver.open_handle().await?))
    }

    /// Look up one event by id.
    pub async fn get(&self, id: &str) -> Result<Option<PingEvent>, StorageError> {
        let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
        let rows = self.handle.exec(&sql, vec![SqlValue::from(id)]).await?;
        let event = rows.iter().next().map(decode_row).transpose()?;
        Ok(event)
    }

    /// All stored events ordered by id.
    pub async fn list(&self) -> Result<Vec<PingEvent>, StorageError> {
        let sql = format!("{} ORDER BY id", SELECT_COLUMNS);
        let rows = self.handle.exec(&sql, Vec::new()).await?;
        rows.iter().map(decode_row).collect()
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let rows = self
            .handle
            .exec("SELECT COUNT(*) FROM ping_events", Vec::new())
            .await?;
        rows.first_value()
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| StorageError::Decode {
                column: "COUNT(*)".into(),
                detail: "expected an integer".into(),
            })
    }
}

#[async_trait]
impl LocalRepository<PingEvent> for PingEventRepository {
    async fn latest_cursor(&self) -> Result<Option<CursorToken>, StorageError> {
        max_id_cursor(self.handle.as_ref(), TABLE).await
    }

    async fn upsert(&self, items: &[PingEvent]) -> Result<(), StorageError> {
        let statements: Vec<Statement> = items
            .iter()
            .map(|event| {
                (
                    UPSERT_SQL,
                    vec![
                        SqlValue::from(event.id.as_str()),
                        SqlValue::from(event.message.as_str()),
                        SqlValue::from(event.last_modified),
                    ],
                )
            })
            .collect();

        write_batch(self.handle.as_ref(), statements).await?;
        debug!(count = items.len(), "upserted ping events");
        Ok(())
    }
}

fn decode_row(row: &[SqlValue]) -> Result<PingEvent, StorageError> {
    let text = |idx: usize, column: &str| {
        row.get(idx)
            .and_then(SqlValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| StorageError::Decode {
                column: column.to_string(),
                detail: format!("expected text, found {:?}", row.get(idx)),
            })
    };

    Ok(PingEvent {
        id: text(0, "id")?,
        message: text(1, "message")?,
        last_modified: row
            .get(2)
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| StorageError::Decode {
                column: "last_modified".into(),
                detail: format!("expected integer, found {:?}", row.get(2)),
            })?,
    })
}
