//! Domain model types used throughout the sync core.
//!
//! These types bridge the sync coordinator, the repository adapters and the
//! remote fetch client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sync contract
// ---------------------------------------------------------------------------

/// The minimal shape every synchronizable entity exposes.
///
/// `id` is immutable once assigned and is what the cursor is derived from.
/// `revision_marker` is assigned by the remote source and only used for
/// ordering a batch and for observability.
pub trait Syncable: Send + Sync {
    /// Stable name of the entity kind; one local table per kind.
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn revision_marker(&self) -> i64;
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Opaque resumption token: the identifier of the most recently persisted
/// entity of one kind.
///
/// Never cached between passes; always re-derived from storage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorToken(String);

impl CursorToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CursorToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CursorToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Ping event
// ---------------------------------------------------------------------------

/// A ping/heartbeat event as delivered by the ping service's sync endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingEvent {
    pub id: String,
    pub message: String,
    /// Epoch milliseconds of the last modification at the source.
    pub last_modified: i64,
}

impl PingEvent {
    pub fn new(id: impl Into<String>, message: impl Into<String>, last_modified: i64) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            last_modified,
        }
    }
}

impl Syncable for PingEvent {
    const KIND: &'static str = "ping_events";

    fn id(&self) -> &str {
        &self.id
    }

    fn revision_marker(&self) -> i64 {
        self.last_modified
    }
}

// ---------------------------------------------------------------------------
// Sync report
// ---------------------------------------------------------------------------

/// Outcome of a single sync pass for one entity kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub entity: String,
    pub cursor_before: Option<CursorToken>,
    pub cursor_after: Option<CursorToken>,
    /// Entities returned by the remote.
    pub fetched: usize,
    /// Distinct entities written to the local store. Repeated ids in one
    /// batch count once.
    pub written: usize,
    /// Highest revision marker seen in the batch.
    pub max_revision: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncReport {
    /// Whether the pass changed anything locally.
    pub fn has_changes(&self) -> bool {
        self.written > 0
    }
}
