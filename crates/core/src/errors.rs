//! Error types for the Meldestelle sync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Errors from the remote fetch. Any of these aborts a sync pass before a
/// single row is written.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP-level transport error (network, TLS, timeout, etc.).
    #[error("remote HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote returned a non-success status code.
    #[error("remote returned HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },

    /// The response body is not a JSON array of the expected entity.
    #[error("remote response could not be decoded: {0}")]
    Decode(String),

    /// The configured base URL and endpoint path do not form a valid URL.
    #[error("invalid remote URL '{url}': {detail}")]
    InvalidUrl {
        url: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors from the storage drivers and the worker RPC protocol.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage handle could not be opened, or the worker hosting it has
    /// gone away.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A batch write failed; the whole batch was rolled back.
    #[error("storage write failed, batch rolled back: {detail}")]
    Write {
        detail: String,
    },

    /// A worker response could not be correlated with this call.
    #[error("worker protocol mismatch for request {request_id}: {detail}")]
    ProtocolMismatch {
        request_id: String,
        detail: String,
    },

    /// The worker did not confirm a commit in time. The batch may or may
    /// not be durable; the transaction is closed either way and a retry of
    /// the same upsert is safe.
    #[error("commit outcome unknown for request {request_id}: {detail}")]
    CommitIndeterminate {
        request_id: String,
        detail: String,
    },

    /// A single statement failed.
    #[error("statement failed: {0}")]
    Statement(String),

    /// Underlying rusqlite error while opening or configuring a connection.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A result row could not be mapped to an entity field.
    #[error("cannot decode column '{column}': {detail}")]
    Decode {
        column: String,
        detail: String,
    },

    /// Generic I/O error (e.g. creating the data directory).
    #[error("storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync coordinator errors
// ---------------------------------------------------------------------------

/// Errors surfaced by a sync pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote fetch failed; nothing was written.
    #[error("sync transport error: {0}")]
    Transport(#[from] TransportError),

    /// Reading the cursor or writing the batch failed.
    #[error("sync storage error: {0}")]
    Storage(#[from] StorageError),

    /// Another pass is already in progress on this engine.
    #[error("a sync pass is already running (started at {started_at})")]
    AlreadyRunning {
        started_at: String,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
