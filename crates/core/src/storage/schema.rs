//! Table definitions for every synchronized entity kind.
//!
//! Schema creation is create-if-absent only: applying it to a database that
//! already has the tables is a no-op. It runs through [`StorageHandle::exec`]
//! so the native and the worker drivers share the same path.

use tracing::{debug, info};

use super::{SqlValue, StorageHandle};
use crate::errors::StorageError;

/// One entity table: `(name, ddl)`.
#[derive(Debug, Clone, Copy)]
pub struct TableSchema {
    pub name: &'static str,
    pub ddl: &'static str,
}

/// All entity tables, one per kind, keyed by `id`.
pub static TABLES: &[TableSchema] = &[TableSchema {
    name: "ping_events",
    ddl: r#"
        CREATE TABLE IF NOT EXISTS ping_events (
            id            TEXT    PRIMARY KEY NOT NULL CHECK (length(id) > 0),
            message       TEXT    NOT NULL,
            last_modified INTEGER NOT NULL
        )
        "#,
}];

/// Create every table in [`TABLES`] that does not exist yet.
pub async fn ensure_schema(handle: &dyn StorageHandle) -> Result<(), StorageError> {
    for table in TABLES {
        let existing = handle
            .exec(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                vec![SqlValue::from(table.name)],
            )
            .await?;

        if existing.is_empty() {
            info!(table = table.name, "creating table");
        } else {
            debug!(table = table.name, "table already present");
        }
        handle.exec(table.ddl, Vec::new()).await?;
    }
    Ok(())
}
