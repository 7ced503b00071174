//! rusqlite plumbing shared by the native driver and the worker host.

use std::path::Path;

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql};
use tracing::{debug, info};

use super::{Rows, SqlValue};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Self::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Self::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(f) => Self::Real(f),
            ValueRef::Text(t) => Self::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Self::Blob(b.to_vec()),
        }
    }
}

/// Open a file-backed database with WAL journaling and a busy timeout.
pub fn open_file(path: &Path) -> rusqlite::Result<Connection> {
    info!(path = %path.display(), "opening database");
    let conn = Connection::open(path)?;

    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

    debug!("database opened successfully with WAL mode");
    Ok(conn)
}

/// Open a session-only in-memory database.
pub fn open_in_memory() -> rusqlite::Result<Connection> {
    debug!("opening in-memory database");
    Connection::open_in_memory()
}

/// Prepare `sql`, bind `params` positionally and collect every result row.
///
/// Statements that produce no rows (DDL, INSERT, ...) are stepped to
/// completion and yield empty [`Rows`].
pub fn run_statement(conn: &Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<Rows> {
    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;

    let mut values = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            record.push(SqlValue::from(row.get_ref(idx)?));
        }
        values.push(record);
    }
    Ok(Rows { values })
}

pub const BEGIN_SQL: &str = "BEGIN TRANSACTION;";
pub const COMMIT_SQL: &str = "END TRANSACTION;";
pub const ROLLBACK_SQL: &str = "ROLLBACK TRANSACTION;";
