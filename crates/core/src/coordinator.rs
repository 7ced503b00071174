//! The sync coordinator: pull since cursor, then upsert.
//!
//! One pass per call, generic over the entity type. The cursor is always
//! re-read from the repository so a crash between passes can never leave a
//! stale resumption point behind.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::errors::{SyncError, TransportError};
use crate::models::{SyncReport, Syncable};
use crate::remote::{Endpoint, RemoteSource};
use crate::repository::LocalRepository;

type KindLock = Arc<tokio::sync::Mutex<()>>;

pub struct SyncCoordinator<S: RemoteSource> {
    remote: S,
    /// One guard per entity kind; passes for the same kind never overlap.
    locks: Mutex<HashMap<&'static str, KindLock>>,
}

impl<S: RemoteSource> SyncCoordinator<S> {
    pub fn new(remote: S) -> Self {
        Self {
            remote,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn remote(&self) -> &S {
        &self.remote
    }

    fn lock_for(&self, kind: &'static str) -> KindLock {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| {
            warn!("sync lock table was poisoned, recovering");
            poisoned.into_inner()
        });
        locks.entry(kind).or_default().clone()
    }

    /// Run one sync pass for `T` against `endpoint`.
    ///
    /// A fetch or decode failure returns before anything is written. An
    /// empty batch returns a report with `written == 0` and never touches
    /// the store.
    pub async fn perform_sync<T, R>(
        &self,
        repository: &R,
        endpoint: &Endpoint,
    ) -> Result<SyncReport, SyncError>
    where
        T: Syncable + DeserializeOwned,
        R: LocalRepository<T> + ?Sized,
    {
        let lock = self.lock_for(T::KIND);
        let _guard = lock.lock().await;

        let started_at = Utc::now();
        let cursor_before = repository.latest_cursor().await?;
        debug!(entity = T::KIND, cursor = ?cursor_before, "starting sync pass");

        let body = self.remote.fetch(endpoint, cursor_before.as_ref()).await?;
        let mut batch: Vec<T> = serde_json::from_value(body)
            .map_err(|e| TransportError::Decode(format!("{} batch: {}", T::KIND, e)))?;
        let fetched = batch.len();

        if batch.is_empty() {
            debug!(entity = T::KIND, "remote has nothing new");
            return Ok(SyncReport {
                entity: T::KIND.to_string(),
                cursor_after: cursor_before.clone(),
                cursor_before,
                fetched: 0,
                written: 0,
                max_revision: None,
                started_at,
                completed_at: Utc::now(),
            });
        }

        // Stable: equal markers keep the server's order.
        batch.sort_by_key(|item| item.revision_marker());
        let max_revision = batch.last().map(|item| item.revision_marker());
        // Repeated ids collapse into one row.
        let written = batch.iter().map(|item| item.id()).collect::<HashSet<_>>().len();

        repository.upsert(&batch).await?;
        let cursor_after = repository.latest_cursor().await?;

        info!(
            entity = T::KIND,
            fetched,
            written,
            cursor = ?cursor_after.as_ref().map(|c| c.as_str()),
            "sync pass complete"
        );

        Ok(SyncReport {
            entity: T::KIND.to_string(),
            cursor_before,
            cursor_after,
            fetched,
            written,
            max_revision,
            started_at,
            completed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PingEventRepository;
    use crate::errors::StorageError;
    use crate::models::{CursorToken, PingEvent};
    use crate::storage::NativeDriver;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Serves a queue of canned responses and records every cursor it saw.
    #[derive(Default)]
    struct FakeRemote {
        responses: Mutex<Vec<Result<serde_json::Value, TransportError>>>,
        seen: Mutex<Vec<Option<String>>>,
        delay: Option<Duration>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl FakeRemote {
        fn with(responses: Vec<Result<serde_json::Value, TransportError>>) -> Self {
            let mut responses = responses;
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                ..Default::default()
            }
        }

        fn cursors(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteSource for FakeRemote {
        async fn fetch(
            &self,
            _endpoint: &Endpoint,
            cursor: Option<&CursorToken>,
        ) -> Result<serde_json::Value, TransportError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push(cursor.map(|c| c.as_str().to_string()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.responses.lock().unwrap().pop().unwrap_or_else(|| Ok(json!([])))
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("/sync", "since")
    }

    async fn repo() -> PingEventRepository {
        PingEventRepository::from_driver(&NativeDriver::in_memory())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sync_into_empty_store() {
        let repo = repo().await;
        let coordinator = SyncCoordinator::new(FakeRemote::with(vec![Ok(json!([
            {"id": "e1", "lastModified": 1000, "message": "Ping 1"},
            {"id": "e2", "lastModified": 2000, "message": "Ping 2"}
        ]))]));

        let report = coordinator
            .perform_sync::<PingEvent, _>(&repo, &endpoint())
            .await
            .unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.written, 2);
        assert_eq!(report.cursor_before, None);
        assert_eq!(report.cursor_after, Some(CursorToken::from("e2")));
        assert_eq!(report.max_revision, Some(2000));
        assert_eq!(
            repo.list().await.unwrap(),
            vec![
                PingEvent::new("e1", "Ping 1", 1000),
                PingEvent::new("e2", "Ping 2", 2000)
            ]
        );
        assert_eq!(repo.latest_cursor().await.unwrap(), Some(CursorToken::from("e2")));
        assert_eq!(coordinator.remote().cursors(), vec![None]);
    }

    #[tokio::test]
    async fn test_update_existing_row() {
        let repo = repo().await;
        repo.upsert(&[PingEvent::new("e1", "Ping 1", 1000)]).await.unwrap();

        let coordinator = SyncCoordinator::new(FakeRemote::with(vec![Ok(json!([
            {"id": "e1", "message": "Ping 1 updated", "lastModified": 1500}
        ]))]));
        coordinator
            .perform_sync::<PingEvent, _>(&repo, &endpoint())
            .await
            .unwrap();

        assert_eq!(
            repo.get("e1").await.unwrap(),
            Some(PingEvent::new("e1", "Ping 1 updated", 1500))
        );
        assert_eq!(repo.count().await.unwrap(), 1);
        assert_eq!(coordinator.remote().cursors(), vec![Some("e1".to_string())]);
    }

    #[tokio::test]
    async fn test_resumes_from_cursor_and_empty_batch_writes_nothing() {
        let repo = repo().await;
        let coordinator = SyncCoordinator::new(FakeRemote::with(vec![
            Ok(json!([{"id": "e1", "message": "Ping 1", "lastModified": 1000}])),
            Ok(json!([])),
        ]));

        coordinator
            .perform_sync::<PingEvent, _>(&repo, &endpoint())
            .await
            .unwrap();
        let second = coordinator
            .perform_sync::<PingEvent, _>(&repo, &endpoint())
            .await
            .unwrap();

        assert_eq!(second.written, 0);
        assert!(!second.has_changes());
        assert_eq!(second.cursor_before, second.cursor_after);
        assert_eq!(repo.count().await.unwrap(), 1);
        assert_eq!(
            coordinator.remote().cursors(),
            vec![None, Some("e1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_writes_nothing() {
        let repo = repo().await;
        let coordinator = SyncCoordinator::new(FakeRemote::with(vec![Err(TransportError::Status {
            status: 503,
            body: "maintenance".into(),
        })]));

        let result = coordinator
            .perform_sync::<PingEvent, _>(&repo, &endpoint())
            .await;
        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::Status { status: 503, .. }))
        ));
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_batch_writes_nothing() {
        let repo = repo().await;
        let coordinator = SyncCoordinator::new(FakeRemote::with(vec![Ok(json!([
            {"id": "e1", "message": "Ping 1", "lastModified": 1000},
            {"id": "e2", "message": "missing revision"}
        ]))]));

        let result = coordinator
            .perform_sync::<PingEvent, _>(&repo, &endpoint())
            .await;
        assert!(matches!(result, Err(SyncError::Transport(TransportError::Decode(_)))));
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_propagates_and_rolls_back() {
        let repo = repo().await;
        let coordinator = SyncCoordinator::new(FakeRemote::with(vec![Ok(json!([
            {"id": "e1", "message": "Ping 1", "lastModified": 1000},
            {"id": "", "message": "bad", "lastModified": 2000}
        ]))]));

        let result = coordinator
            .perform_sync::<PingEvent, _>(&repo, &endpoint())
            .await;
        assert!(matches!(result, Err(SyncError::Storage(StorageError::Write { .. }))));
        assert_eq!(repo.latest_cursor().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_highest_revision() {
        let repo = repo().await;
        // Out of revision order, same id twice.
        let coordinator = SyncCoordinator::new(FakeRemote::with(vec![Ok(json!([
            {"id": "e1", "message": "newer", "lastModified": 2000},
            {"id": "e1", "message": "older", "lastModified": 1000}
        ]))]));

        let report = coordinator
            .perform_sync::<PingEvent, _>(&repo, &endpoint())
            .await
            .unwrap();
        assert_eq!(
            repo.get("e1").await.unwrap(),
            Some(PingEvent::new("e1", "newer", 2000))
        );
        assert_eq!(report.fetched, 2);
        assert_eq!(report.written, 1);
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_passes_for_same_entity_are_serialized() {
        let repo = Arc::new(repo().await);
        let remote = FakeRemote {
            delay: Some(Duration::from_millis(30)),
            ..FakeRemote::with(vec![
                Ok(json!([{"id": "e1", "message": "a", "lastModified": 1}])),
                Ok(json!([{"id": "e2", "message": "b", "lastModified": 2}])),
                Ok(json!([{"id": "e3", "message": "c", "lastModified": 3}])),
            ])
        };
        let coordinator = Arc::new(SyncCoordinator::new(remote));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let coordinator = coordinator.clone();
            let repo = repo.clone();
            tasks.push(tokio::spawn(async move {
                coordinator
                    .perform_sync::<PingEvent, _>(&*repo, &endpoint())
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(coordinator.remote().max_active.load(Ordering::SeqCst), 1);
        assert_eq!(repo.count().await.unwrap(), 3);
        // Each pass saw the cursor left by the one before it.
        assert_eq!(
            coordinator.remote().cursors(),
            vec![None, Some("e1".to_string()), Some("e2".to_string())]
        );
    }
}
