//! Sync engine: one pass over every registered entity kind.
//!
//! The [`SyncEngine`] owns the storage driver chosen by configuration, the
//! coordinator wrapping the remote source, and one repository adapter per
//! entity kind. A pass runs the coordinator for each kind in turn.
//!
//! A lock flag prevents overlapping passes on the same engine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::adapters::PingEventRepository;
use crate::config::{AppConfig, StorageBackend};
use crate::coordinator::SyncCoordinator;
use crate::errors::{CoreError, SyncError};
use crate::models::{CursorToken, PingEvent, SyncReport, Syncable};
use crate::remote::{HttpRemote, RemoteSource};
use crate::repository::LocalRepository;
use crate::storage::{driver_for, StorageDriver};

/// Row count and cursor of one entity table.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntityStatus {
    pub entity: String,
    pub rows: i64,
    pub cursor: Option<CursorToken>,
}

/// Snapshot of the local store for operators.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub backend: StorageBackend,
    /// Human-readable location, including any in-memory degradation.
    pub storage: String,
    pub database_path: PathBuf,
    pub entities: Vec<EntityStatus>,
    pub running: bool,
}

pub struct SyncEngine<S: RemoteSource = HttpRemote> {
    config: AppConfig,
    driver: Arc<dyn StorageDriver>,
    coordinator: SyncCoordinator<S>,
    ping: PingEventRepository,
    running: Arc<AtomicBool>,
    last_started_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine<HttpRemote> {
    /// Build the engine described by `config`: open the configured storage
    /// driver and an HTTP remote for `remote.base_url`.
    pub async fn from_config(config: AppConfig) -> Result<Self, CoreError> {
        let remote = HttpRemote::new(
            &config.remote.base_url,
            config.remote.token.clone(),
            config.remote.timeout(),
        )?;
        let driver = driver_for(&config.storage);
        Self::with_parts(config, driver, remote).await
    }
}

impl<S: RemoteSource> SyncEngine<S> {
    /// Build an engine from explicit parts. The driver's handle is opened
    /// here so schema problems surface before the first pass.
    pub async fn with_parts(
        config: AppConfig,
        driver: Arc<dyn StorageDriver>,
        remote: S,
    ) -> Result<Self, CoreError> {
        let ping = PingEventRepository::from_driver(driver.as_ref()).await?;
        info!(
            backend = %config.storage.backend,
            storage = %driver.describe(),
            "sync engine initialized"
        );

        Ok(Self {
            config,
            driver,
            coordinator: SyncCoordinator::new(remote),
            ping,
            running: Arc::new(AtomicBool::new(false)),
            last_started_at: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub fn ping_events(&self) -> &PingEventRepository {
        &self.ping
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one pass over every entity kind, stopping at the first failure.
    pub async fn run_pass(&self) -> Result<Vec<SyncReport>, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = self
                .last_started()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".into());
            return Err(SyncError::AlreadyRunning { started_at });
        }
        let _guard = PassGuard(self.running.clone());
        self.set_last_started(Utc::now());

        let mut reports = Vec::new();
        let endpoint = self.config.endpoints.ping.to_endpoint();
        match self
            .coordinator
            .perform_sync::<PingEvent, _>(&self.ping, &endpoint)
            .await
        {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!(entity = PingEvent::KIND, error = %e, "sync pass failed");
                return Err(e);
            }
        }

        let written: usize = reports.iter().map(|r| r.written).sum();
        info!(entities = reports.len(), written, "sync pass finished");
        Ok(reports)
    }

    /// Current row count and cursor per entity kind.
    pub async fn status(&self) -> Result<EngineStatus, SyncError> {
        let ping = EntityStatus {
            entity: PingEvent::KIND.to_string(),
            rows: self.ping.count().await?,
            cursor: self.ping.latest_cursor().await?,
        };

        Ok(EngineStatus {
            backend: self.config.storage.backend,
            storage: self.driver.describe(),
            database_path: self.config.storage.database_path(),
            entities: vec![ping],
            running: self.is_running(),
        })
    }

    fn last_started(&self) -> Option<DateTime<Utc>> {
        *self
            .last_started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_last_started(&self, at: DateTime<Utc>) {
        *self
            .last_started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(at);
    }
}

/// Clears the running flag on drop, including on panic.
struct PassGuard(Arc<AtomicBool>);

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
