//! predserve: prediction service with single-record and batch CSV endpoints.
//!
//! Single records are validated and scored inline. Batch uploads become
//! tracked tasks: the gateway writes a PENDING record and queues a job, a
//! worker runs the job body, and clients poll or subscribe for status.

mod health;
mod version;

pub mod config;
pub mod coordinator;
pub mod input_validation;
pub mod model;
pub mod predictor;
pub mod queue;
pub mod schema;
pub mod service;
pub mod storage;
pub mod store;
pub mod task;
pub mod transport;

pub use config::ServiceConfig;
pub use coordinator::{BatchCoordinator, JobError};
pub use health::{Health, HealthSnapshot};
pub use input_validation::{InputValidator, ValidationError};
pub use model::{LogisticModel, ModelLoadError};
pub use predictor::{EngineError, PredictionResult, Predictor};
pub use queue::{
    JobDescriptor, MemoryTaskQueue, QueueError, QueueWorker, RedisTaskQueue, TaskQueue,
    WorkerConfig,
};
pub use schema::PredictionRecord;
pub use service::{PredictError, PredictionService, SubmitError};
pub use storage::{DataDirs, StorageError};
pub use store::{MemoryStatusStore, RedisStatusStore, StatusStore, StoreError};
pub use task::{TaskRecord, TaskStatus, TaskStatusResponse};
pub use version::{PREDSERVE_VERSION, VersionInfo};
