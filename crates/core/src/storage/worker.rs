//! Worker-hosted storage driver.
//!
//! The database lives on a dedicated worker thread and is reached only
//! through [`crate::rpc`] messages. Used where the calling context must not
//! host the engine itself. If the durable file cannot be opened the worker
//! degrades to an in-memory store; the degradation is logged and published
//! on the driver's status channel rather than failing the open.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, OnceCell};
use tracing::{info, warn};

use super::schema::ensure_schema;
use super::{StorageDriver, StorageHandle};
use crate::errors::StorageError;
use crate::rpc::{spawn_worker, Backing, WorkerClient};

/// Lifecycle of the storage worker as seen from the host side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// No handle has been requested yet, or the worker is still opening.
    Starting,
    Ready(Backing),
    Failed(String),
}

pub struct WorkerDriver {
    durable_path: Option<PathBuf>,
    request_timeout: Duration,
    handle: OnceCell<Arc<WorkerClient>>,
    status: watch::Sender<WorkerStatus>,
}

impl WorkerDriver {
    /// Driver whose worker tries `durable_path` first. `None` goes straight
    /// to the in-memory fallback.
    pub fn new(durable_path: Option<PathBuf>, request_timeout: Duration) -> Self {
        let (status, _) = watch::channel(WorkerStatus::Starting);
        Self {
            durable_path,
            request_timeout,
            handle: OnceCell::new(),
            status,
        }
    }

    /// Subscribe to worker status changes, including the in-memory
    /// degradation warning.
    pub fn status(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    async fn start(&self) -> Result<Arc<WorkerClient>, StorageError> {
        match self.try_start().await {
            Ok(client) => Ok(client),
            Err(e) => {
                self.status.send_replace(WorkerStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn try_start(&self) -> Result<Arc<WorkerClient>, StorageError> {
        let channels = spawn_worker(self.durable_path.clone())?;

        let backing = channels
            .ready
            .await
            .map_err(|_| StorageError::Unavailable("storage worker exited during startup".into()))?
            .map_err(StorageError::Unavailable)?;

        if let Backing::InMemory { reason } = &backing {
            warn!(reason = %reason, "storage worker running in-memory; data will not survive this session");
        }

        let client = Arc::new(WorkerClient::from_channels(
            channels.requests,
            channels.responses,
            self.request_timeout,
        ));
        ensure_schema(&*client).await?;

        info!(backing = %backing, "worker storage handle ready");
        self.status.send_replace(WorkerStatus::Ready(backing));
        Ok(client)
    }
}

#[async_trait]
impl StorageDriver for WorkerDriver {
    async fn open_handle(&self) -> Result<Arc<dyn StorageHandle>, StorageError> {
        let client = self.handle.get_or_try_init(|| self.start()).await?;
        Ok(client.clone() as Arc<dyn StorageHandle>)
    }

    fn describe(&self) -> String {
        match self.current_status() {
            WorkerStatus::Ready(backing) => format!("worker sqlite, {}", backing),
            WorkerStatus::Starting => match &self.durable_path {
                Some(path) => format!("worker sqlite at {}", path.display()),
                None => "worker sqlite (in-memory)".to_string(),
            },
            WorkerStatus::Failed(reason) => format!("worker sqlite, failed: {}", reason),
        }
    }
}
