//! Worker side of the storage RPC.
//!
//! A [`WorkerHost`] owns the only connection to the database and runs on its
//! own thread. It drains its inbox strictly in arrival order, so statements
//! from any number of callers execute one at a time, FIFO.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::protocol::{encode, WorkerAction, WorkerRequest, WorkerResponse};
use crate::errors::StorageError;
use crate::storage::sqlite::{self, BEGIN_SQL, COMMIT_SQL, ROLLBACK_SQL};
use crate::storage::Rows;

/// Where the worker's database actually lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Durable file that survives restarts.
    Persistent(PathBuf),
    /// Session-only store used when the durable file could not be opened.
    InMemory { reason: String },
}

impl Backing {
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Persistent(_))
    }
}

impl std::fmt::Display for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persistent(path) => write!(f, "persistent ({})", path.display()),
            Self::InMemory { reason } => write!(f, "in-memory ({})", reason),
        }
    }
}

pub struct WorkerHost {
    conn: Connection,
    backing: Backing,
}

impl WorkerHost {
    /// Open the durable file at `durable_path`, falling back to an in-memory
    /// database if that fails or no path is given. Only a failure of the
    /// fallback itself is an error.
    pub fn open(durable_path: Option<&Path>) -> Result<Self, StorageError> {
        let reason = match durable_path {
            Some(path) => match open_durable(path) {
                Ok(conn) => {
                    info!(path = %path.display(), "storage worker using persistent database");
                    return Ok(Self {
                        conn,
                        backing: Backing::Persistent(path.to_path_buf()),
                    });
                }
                Err(e) => format!("cannot open {}: {}", path.display(), e),
            },
            None => "no durable storage location configured".to_string(),
        };

        warn!(reason = %reason, "persistent storage unavailable, falling back to in-memory database");
        let conn = sqlite::open_in_memory()
            .map_err(|e| StorageError::Unavailable(format!("in-memory fallback failed: {}", e)))?;
        Ok(Self {
            conn,
            backing: Backing::InMemory { reason },
        })
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Decode one raw message, run it, and build the response.
    pub fn handle_message(&mut self, raw: &str) -> WorkerResponse {
        let request: WorkerRequest = match serde_json::from_str(raw) {
            Ok(req) => req,
            Err(e) => {
                // Salvage the id so the caller is not left waiting.
                let id = serde_json::from_str::<serde_json::Value>(raw)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string));
                warn!(error = %e, "rejecting malformed worker request");
                return WorkerResponse::err(id, format!("unsupported request: {}", e));
            }
        };

        let id = request.id.clone();
        match self.execute(request) {
            Ok(rows) => WorkerResponse::ok(id, rows),
            Err(e) => {
                debug!(request_id = %id, error = %e, "worker request failed");
                WorkerResponse::err(Some(id), e)
            }
        }
    }

    fn execute(&mut self, request: WorkerRequest) -> Result<Rows, String> {
        debug!(request_id = %request.id, action = %request.action, "worker processing request");
        match request.action {
            WorkerAction::Exec => {
                let sql = request
                    .sql
                    .ok_or_else(|| "exec: missing query string".to_string())?;
                let params = request.params.unwrap_or_default();
                sqlite::run_statement(&self.conn, &sql, &params).map_err(|e| e.to_string())
            }
            WorkerAction::BeginTransaction => self.control(BEGIN_SQL),
            WorkerAction::EndTransaction => self.control(COMMIT_SQL),
            WorkerAction::RollbackTransaction => self.control(ROLLBACK_SQL),
        }
    }

    fn control(&self, sql: &str) -> Result<Rows, String> {
        self.conn
            .execute_batch(sql)
            .map(|()| Rows::default())
            .map_err(|e| e.to_string())
    }

    /// Serve requests until every sender of `inbox` is gone.
    pub fn run(mut self, mut inbox: mpsc::UnboundedReceiver<String>, outbox: mpsc::UnboundedSender<String>) {
        while let Some(raw) = inbox.blocking_recv() {
            let response = self.handle_message(&raw);
            let encoded = match encode(&response) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!(error = %e, "failed to encode worker response");
                    continue;
                }
            };
            if outbox.send(encoded).is_err() {
                debug!("worker response channel closed");
                break;
            }
        }
        info!("storage worker exiting");
    }
}

fn open_durable(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(sqlite::open_file(path)?)
}

/// Host-side ends of a running worker.
pub struct WorkerChannels {
    pub requests: mpsc::UnboundedSender<String>,
    pub responses: mpsc::UnboundedReceiver<String>,
    /// Resolves once the worker has opened its database.
    pub ready: oneshot::Receiver<Result<Backing, String>>,
}

/// Start a worker thread hosting the database at `durable_path`.
pub fn spawn_worker(durable_path: Option<PathBuf>) -> Result<WorkerChannels, StorageError> {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("storage-worker".into())
        .spawn(move || match WorkerHost::open(durable_path.as_deref()) {
            Ok(host) => {
                let _ = ready_tx.send(Ok(host.backing().clone()));
                host.run(request_rx, response_tx);
            }
            Err(e) => {
                error!(error = %e, "storage worker failed to initialize");
                let _ = ready_tx.send(Err(e.to_string()));
            }
        })
        .map_err(|e| StorageError::Unavailable(format!("cannot spawn storage worker: {}", e)))?;

    Ok(WorkerChannels {
        requests: request_tx,
        responses: response_rx,
        ready: ready_rx,
    })
}
