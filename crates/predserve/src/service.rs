//! PredictionService: transport-agnostic application context.
//!
//! This service owns:
//! - The prediction engine and the record validator
//! - Status store and job queue clients
//! - Upload/result file layout
//! - Shutdown coordination
//!
//! It is built once at start-up and shared by every transport handler and by
//! the in-process worker. Task state is never held here; it lives in the
//! status store.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use crate::coordinator::BatchCoordinator;
use crate::health::{Health, HealthSnapshot};
use crate::input_validation::{InputValidator, ValidationError};
use crate::predictor::{EngineError, PredictionResult, Predictor};
use crate::queue::{JobDescriptor, QueueError, QueueWorker, TaskQueue, WorkerConfig};
use crate::storage::{DataDirs, StorageError};
use crate::store::{StatusStore, StoreError, Subscription};
use crate::task::{TaskRecord, TaskStatus};
use crate::version::VersionInfo;

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("Invalid prediction input")]
    Validation(Vec<ValidationError>),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Uploaded file is not a readable CSV table: {0}")]
    InvalidUpload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("Failed to inspect upload: {0}")]
    Io(String),
}

/// A batch accepted for background processing.
#[derive(Debug, Clone)]
pub struct AcceptedBatch {
    pub task_id: String,
    pub rows: usize,
}

/// Transport-agnostic prediction service.
pub struct PredictionService {
    predictor: Arc<dyn Predictor>,
    validator: Arc<InputValidator>,
    store: Arc<dyn StatusStore>,
    queue: Arc<dyn TaskQueue>,
    dirs: DataDirs,

    schema: Value,
    version: VersionInfo,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PredictionService {
    pub fn new(
        predictor: Arc<dyn Predictor>,
        store: Arc<dyn StatusStore>,
        queue: Arc<dyn TaskQueue>,
        dirs: DataDirs,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let version = VersionInfo::new().with_model(predictor.version());
        Self {
            predictor,
            validator: Arc::new(InputValidator::for_records()),
            store,
            queue,
            dirs,
            schema: crate::schema::openapi_document(),
            version,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    /// OpenAPI document describing the record schema.
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn dirs(&self) -> &DataDirs {
        &self.dirs
    }

    /// Job body bound to this service's engine, store and file layout.
    pub fn coordinator(&self) -> BatchCoordinator {
        BatchCoordinator::new(
            Arc::clone(&self.predictor),
            Arc::clone(&self.store),
            Arc::clone(&self.validator),
            self.dirs.clone(),
        )
    }

    /// Queue consumer running this service's job body.
    pub fn worker(&self, config: WorkerConfig) -> QueueWorker {
        QueueWorker::new(
            Arc::clone(&self.queue),
            Arc::new(self.coordinator()),
            config,
        )
    }

    pub async fn health(&self) -> HealthSnapshot {
        let (status, error) = match self.store.ping().await {
            Ok(()) => (Health::Ready, None),
            Err(e) => {
                tracing::warn!(error = %e, "Status store health check failed");
                (Health::Unhealthy, Some(e.to_string()))
            }
        };
        HealthSnapshot {
            status,
            store: self.store.backend_name(),
            queue: self.queue.backend_name(),
            error,
            version: self.version.clone(),
        }
    }

    /// Validate one record and run the engine inline.
    pub fn predict(&self, input: &Value) -> Result<PredictionResult, PredictError> {
        let record = self
            .validator
            .validate_record(input)
            .map_err(PredictError::Validation)?;
        let result = self.predictor.predict(&record)?;
        tracing::debug!(
            label = result.label,
            probability = result.probability,
            "Single prediction"
        );
        Ok(result)
    }

    pub fn new_task_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Where the transport should store the upload for `task_id`.
    pub fn upload_path(&self, task_id: &str) -> PathBuf {
        self.dirs.upload_path(task_id)
    }

    /// Accept a stored upload: check it is a CSV table, write the PENDING
    /// record, enqueue the job.
    ///
    /// The upload file is removed on any failure so rejected submissions
    /// leave nothing behind.
    pub async fn submit_batch(&self, task_id: &str) -> Result<AcceptedBatch, SubmitError> {
        let upload_path = self.upload_path(task_id);
        let result = self.accept_upload(task_id, upload_path.clone()).await;
        if result.is_err()
            && let Err(e) = tokio::fs::remove_file(&upload_path).await
        {
            tracing::warn!(%task_id, error = %e, "Failed to remove rejected upload");
        }
        result
    }

    async fn accept_upload(
        &self,
        task_id: &str,
        upload_path: PathBuf,
    ) -> Result<AcceptedBatch, SubmitError> {
        let path = upload_path.clone();
        let rows = tokio::task::spawn_blocking(move || inspect_table(&path))
            .await
            .map_err(|e| SubmitError::Io(e.to_string()))??;

        let record = TaskRecord::pending(task_id);
        self.store.put(&record).await?;

        let job = JobDescriptor {
            task_id: task_id.to_string(),
            upload_path,
        };
        if let Err(e) = self.queue.enqueue(&job).await {
            tracing::error!(%task_id, error = %e, "Failed to enqueue batch job");
            let mut failed = record;
            if failed
                .advance(TaskStatus::Failure, "Failed to queue task")
                .is_ok()
                && let Err(e) = self.store.put_and_publish(&failed).await
            {
                tracing::warn!(%task_id, error = %e, "Failed to record enqueue failure");
            }
            return Err(e.into());
        }

        tracing::info!(%task_id, rows, "Batch accepted");
        Ok(AcceptedBatch {
            task_id: task_id.to_string(),
            rows,
        })
    }

    pub async fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        self.store.get(task_id).await
    }

    pub async fn subscribe(&self, task_id: &str) -> Result<Subscription, StoreError> {
        self.store.subscribe(task_id).await
    }

    /// Path of a result file, if `file_name` is a safe name.
    pub fn result_path(&self, file_name: &str) -> Result<PathBuf, StorageError> {
        self.dirs.resolve_result(file_name)
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

/// Check that `path` holds a well-formed CSV table. Returns the data row
/// count. Field contents are not validated here; that is the job body's work.
fn inspect_table(path: &std::path::Path) -> Result<usize, SubmitError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| SubmitError::Io(e.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|e| SubmitError::InvalidUpload(e.to_string()))?;
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(SubmitError::InvalidUpload("missing header row".to_string()));
    }

    let mut rows = 0;
    for record in reader.records() {
        record.map_err(|e| SubmitError::InvalidUpload(e.to_string()))?;
        rows += 1;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::PredictionResult;
    use crate::queue::{Delivery, MemoryTaskQueue};
    use crate::schema::{PredictionRecord, example_record};
    use crate::store::MemoryStatusStore;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::time::Duration;

    struct FixedModel;

    impl Predictor for FixedModel {
        fn predict(&self, _: &PredictionRecord) -> Result<PredictionResult, EngineError> {
            PredictionResult::from_probability(0.8, 0.5)
        }

        fn version(&self) -> Option<String> {
            Some("fixed-1".to_string())
        }
    }

    struct ClosedQueue;

    #[async_trait]
    impl TaskQueue for ClosedQueue {
        fn backend_name(&self) -> &'static str {
            "closed"
        }

        async fn enqueue(&self, _: &JobDescriptor) -> Result<(), QueueError> {
            Err(QueueError::Closed)
        }

        async fn next(&self, _: Duration) -> Result<Option<Delivery>, QueueError> {
            Err(QueueError::Closed)
        }

        async fn ack(&self, _: &Delivery) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn service_with(queue: Arc<dyn TaskQueue>) -> (tempfile::TempDir, PredictionService) {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.prepare().unwrap();
        let svc = PredictionService::new(
            Arc::new(FixedModel),
            Arc::new(MemoryStatusStore::new()),
            queue,
            dirs,
        );
        (tmp, svc)
    }

    const CSV: &str = "age,job\n35,management\n40,retired\n";

    #[test]
    fn version_includes_model() {
        let (_tmp, svc) = service_with(Arc::new(MemoryTaskQueue::new()));
        assert_eq!(svc.version().model.as_deref(), Some("fixed-1"));
    }

    #[test]
    fn predict_validates_first() {
        let (_tmp, svc) = service_with(Arc::new(MemoryTaskQueue::new()));
        let result = svc.predict(&example_record()).unwrap();
        assert_eq!(result.label, 1);

        let err = svc.predict(&serde_json::json!({"age": 35})).unwrap_err();
        let PredictError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert_eq!(errors.len(), 15);
    }

    #[tokio::test]
    async fn submit_writes_pending_and_enqueues() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let (_tmp, svc) = service_with(queue.clone());
        std::fs::write(svc.upload_path("t-1"), CSV).unwrap();

        let accepted = svc.submit_batch("t-1").await.unwrap();
        assert_eq!(accepted.rows, 2);

        let record = svc.task("t-1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);

        let delivery = queue
            .next(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.job.task_id, "t-1");
        assert_eq!(delivery.job.upload_path, svc.upload_path("t-1"));
        assert!(svc.upload_path("t-1").exists());
    }

    #[tokio::test]
    async fn ragged_upload_is_rejected_and_removed() {
        let (_tmp, svc) = service_with(Arc::new(MemoryTaskQueue::new()));
        std::fs::write(svc.upload_path("t-1"), "a,b\n1,2,3\n").unwrap();

        let err = svc.submit_batch("t-1").await.unwrap_err();
        assert!(matches!(err, SubmitError::InvalidUpload(_)));
        assert!(svc.task("t-1").await.unwrap().is_none());
        assert!(!svc.upload_path("t-1").exists());
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let (_tmp, svc) = service_with(Arc::new(MemoryTaskQueue::new()));
        std::fs::write(svc.upload_path("t-1"), "").unwrap();

        let err = svc.submit_batch("t-1").await.unwrap_err();
        assert!(matches!(err, SubmitError::InvalidUpload(_)));
    }

    #[tokio::test]
    async fn enqueue_failure_cleans_up() {
        let (_tmp, svc) = service_with(Arc::new(ClosedQueue));
        std::fs::write(svc.upload_path("t-1"), CSV).unwrap();
        let mut events = svc.subscribe("t-1").await.unwrap();

        let err = svc.submit_batch("t-1").await.unwrap_err();
        assert!(matches!(err, SubmitError::Queue(QueueError::Closed)));
        assert!(!svc.upload_path("t-1").exists());

        let record = svc.task("t-1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failure);

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, TaskStatus::Failure);
        assert_eq!(event.message, "Failed to queue task");
    }

    #[tokio::test]
    async fn health_reports_backends() {
        let (_tmp, svc) = service_with(Arc::new(MemoryTaskQueue::new()));
        let health = svc.health().await;
        assert!(health.is_ready());
        assert_eq!(health.store, "memory");
        assert_eq!(health.queue, "memory");
    }

    #[tokio::test]
    async fn shutdown_signal_works() {
        let (_tmp, svc) = service_with(Arc::new(MemoryTaskQueue::new()));
        let mut rx = svc.shutdown_rx();
        assert!(!*rx.borrow());

        svc.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(PredictionService::new_task_id(), PredictionService::new_task_id());
    }
}
