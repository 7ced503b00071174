//! Host side of the storage RPC: a [`StorageHandle`] proxy.
//!
//! Each call gets a fresh request id and parks a oneshot sender in the
//! pending table. A background dispatcher reads worker responses and routes
//! each one to the waiter with the matching id, so responses may arrive in
//! any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{encode, RequestId, WorkerAction, WorkerRequest, WorkerResponse};
use crate::errors::StorageError;
use crate::storage::{Rows, SqlValue, StorageHandle, TransactionGate};

type Waiter = oneshot::Sender<Result<Rows, StorageError>>;
type Reply = oneshot::Receiver<Result<Rows, StorageError>>;
type PendingTable = Arc<Mutex<HashMap<RequestId, Waiter>>>;

pub struct WorkerClient {
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingTable,
    unmatched: Arc<AtomicU64>,
    request_timeout: Duration,
    gate: TransactionGate,
    dispatcher: JoinHandle<()>,
}

impl WorkerClient {
    /// Build a proxy over an outbound request channel and an inbound
    /// response channel. Must be called inside a Tokio runtime.
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
        request_timeout: Duration,
    ) -> Self {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let unmatched = Arc::new(AtomicU64::new(0));
        let dispatcher = tokio::spawn(dispatch(inbound, pending.clone(), unmatched.clone()));

        Self {
            outbound,
            pending,
            unmatched,
            request_timeout,
            gate: TransactionGate::default(),
            dispatcher,
        }
    }

    /// Responses that could not be routed to any outstanding call.
    pub fn unmatched_responses(&self) -> u64 {
        self.unmatched.load(Ordering::SeqCst)
    }

    /// Number of calls currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Send `request` and park a waiter for its response.
    fn submit(&self, request: &WorkerRequest) -> Result<Reply, StorageError> {
        let id = request.id.clone();
        let raw = encode(request).map_err(|e| StorageError::ProtocolMismatch {
            request_id: id.clone(),
            detail: format!("cannot encode request: {}", e),
        })?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id.clone(), tx);

        if self.outbound.send(raw).is_err() {
            lock_pending(&self.pending).remove(&id);
            return Err(StorageError::Unavailable("storage worker has terminated".into()));
        }
        debug!(request_id = %id, action = %request.action, "sent worker request");
        Ok(rx)
    }

    /// Wait for the response to `id`. `None` when the timeout expired; the
    /// waiter is removed so a late response counts as unmatched.
    async fn await_response(
        &self,
        id: &str,
        rx: Reply,
    ) -> Option<Result<Rows, StorageError>> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(_)) => Some(Err(StorageError::Unavailable(
                "storage worker stopped before responding".into(),
            ))),
            Err(_) => {
                lock_pending(&self.pending).remove(id);
                warn!(request_id = %id, timeout_ms = self.request_timeout.as_millis() as u64, "worker request timed out");
                None
            }
        }
    }

    fn no_response(&self) -> String {
        format!(
            "no correlated response within {} ms",
            self.request_timeout.as_millis()
        )
    }

    async fn call(&self, request: WorkerRequest) -> Result<Rows, StorageError> {
        let rx = self.submit(&request)?;
        match self.await_response(&request.id, rx).await {
            Some(outcome) => outcome,
            None => Err(StorageError::ProtocolMismatch {
                detail: self.no_response(),
                request_id: request.id,
            }),
        }
    }

    /// Run a transaction control action.
    ///
    /// A timed out BEGIN or END is still queued on the worker and runs once
    /// the worker reaches it. A rollback is queued right behind it so the
    /// worker's connection ends up outside any transaction before the gate
    /// opens for the next caller.
    async fn control(&self, action: WorkerAction) -> Result<(), StorageError> {
        let request = WorkerRequest::control(new_request_id(), action);
        let rx = self.submit(&request)?;
        if let Some(outcome) = self.await_response(&request.id, rx).await {
            return outcome.map(|_| ());
        }

        let detail = self.no_response();
        match action {
            WorkerAction::BeginTransaction => {
                self.queue_rollback();
                Err(StorageError::ProtocolMismatch {
                    request_id: request.id,
                    detail,
                })
            }
            WorkerAction::EndTransaction => {
                self.queue_rollback();
                Err(StorageError::CommitIndeterminate {
                    request_id: request.id,
                    detail,
                })
            }
            WorkerAction::Exec | WorkerAction::RollbackTransaction => {
                Err(StorageError::ProtocolMismatch {
                    request_id: request.id,
                    detail,
                })
            }
        }
    }

    /// Enqueue a rollback without waiting for it. The worker answers with an
    /// error when no transaction is open, which is dropped here.
    fn queue_rollback(&self) {
        let request = WorkerRequest::control(new_request_id(), WorkerAction::RollbackTransaction);
        match self.submit(&request) {
            Ok(_dropped) => debug!(request_id = %request.id, "queued compensating rollback"),
            Err(e) => warn!(error = %e, "cannot queue compensating rollback"),
        }
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[async_trait]
impl StorageHandle for WorkerClient {
    async fn exec(&self, sql: &str, params: Vec<SqlValue>) -> Result<Rows, StorageError> {
        self.call(WorkerRequest::exec(new_request_id(), sql, params)).await
    }

    async fn begin_transaction(&self) -> Result<(), StorageError> {
        self.gate.enter().await;
        if let Err(e) = self.control(WorkerAction::BeginTransaction).await {
            self.gate.leave();
            return Err(e);
        }
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), StorageError> {
        match self.control(WorkerAction::EndTransaction).await {
            Ok(()) => {
                self.gate.leave();
                Ok(())
            }
            Err(e @ StorageError::CommitIndeterminate { .. }) => {
                // Already closed by the queued rollback.
                self.gate.leave();
                Err(e)
            }
            // The transaction stays open until the caller rolls back.
            Err(e) => Err(e),
        }
    }

    async fn rollback_transaction(&self) -> Result<(), StorageError> {
        let result = self.control(WorkerAction::RollbackTransaction).await;
        self.gate.leave();
        result
    }
}

fn new_request_id() -> RequestId {
    Uuid::new_v4().to_string()
}

fn lock_pending(pending: &PendingTable) -> MutexGuard<'_, HashMap<RequestId, Waiter>> {
    pending.lock().unwrap_or_else(|poisoned| {
        warn!("pending request table was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Route every inbound response to its waiter until the worker hangs up.
async fn dispatch(
    mut inbound: mpsc::UnboundedReceiver<String>,
    pending: PendingTable,
    unmatched: Arc<AtomicU64>,
) {
    while let Some(raw) = inbound.recv().await {
        let response: WorkerResponse = match serde_json::from_str(&raw) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "discarding undecodable worker response");
                unmatched.fetch_add(1, Ordering::SeqCst);
                continue;
            }
        };

        let Some(id) = response.id.clone() else {
            warn!(error = ?response.error, "discarding worker response without request id");
            unmatched.fetch_add(1, Ordering::SeqCst);
            continue;
        };

        let waiter = lock_pending(&pending).remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response.into_result(&id));
            }
            None => {
                warn!(request_id = %id, "discarding unmatched worker response");
                unmatched.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    // Dropping the waiters wakes every outstanding call with Unavailable.
    lock_pending(&pending).clear();
    debug!("worker response channel closed");
}
