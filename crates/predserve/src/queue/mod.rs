//! Background job queue.
//!
//! The gateway enqueues one [`JobDescriptor`] per accepted batch upload; a
//! [`QueueWorker`] pulls descriptors and hands them to the batch coordinator.
//! Delivery is at-least-once: a job is acknowledged only after its body
//! returns, so a crashed worker leaves it to be redelivered.
//!
//! ## Configuration
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379
//! QUEUE_NAME=predserve:jobs
//! WORKER_CONCURRENCY=1
//! QUEUE_POLL_TIMEOUT_SECS=5
//! ```

mod memory;
mod redis;

pub use memory::MemoryTaskQueue;
pub use redis::RedisTaskQueue;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};

use crate::coordinator::BatchCoordinator;

/// Message placed on the queue for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub task_id: String,
    pub upload_path: PathBuf,
}

/// A job taken off the queue, pending acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: JobDescriptor,
    /// Raw queue payload, used to remove the in-flight entry on ack.
    receipt: String,
}

impl Delivery {
    fn new(job: JobDescriptor, receipt: String) -> Self {
        Self { job, receipt }
    }

    fn receipt(&self) -> &str {
        &self.receipt
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue connection error: {0}")]
    Connection(String),
    #[error("Redis error: {0}")]
    Redis(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Queue is closed")]
    Closed,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn enqueue(&self, job: &JobDescriptor) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next job.
    async fn next(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Mark a delivered job as done. It will not be redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

/// Worker loop settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions.
    pub concurrency: usize,
    /// How long a single poll blocks before re-checking for shutdown.
    pub poll_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_timeout: Duration::from_secs(5),
        }
    }
}

/// Pulls jobs off a [`TaskQueue`] and runs them through the coordinator.
pub struct QueueWorker {
    queue: Arc<dyn TaskQueue>,
    coordinator: Arc<BatchCoordinator>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        coordinator: Arc<BatchCoordinator>,
        config: WorkerConfig,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            queue,
            coordinator,
            config: WorkerConfig {
                concurrency,
                ..config
            },
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Run until `shutdown` flips to true, then wait for in-flight jobs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        tracing::info!(
            backend = self.queue.backend_name(),
            concurrency = self.config.concurrency,
            "Starting queue worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let delivery = tokio::select! {
                result = self.queue.next(self.config.poll_timeout) => result,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let delivery = match delivery {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(QueueError::Closed) => {
                    tracing::info!("Queue closed, stopping worker");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to poll queue");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let queue = Arc::clone(&self.queue);
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                let task_id = delivery.job.task_id.clone();
                tracing::info!(%task_id, "Processing batch job");
                coordinator.run(&delivery.job).await;
                if let Err(e) = queue.ack(&delivery).await {
                    tracing::warn!(%task_id, error = %e, "Failed to acknowledge job");
                }
                drop(permit);
            });
        }

        // Every permit back means every spawned job finished.
        let _ = self
            .semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;
        tracing::info!("Queue worker stopped");
        Ok(())
    }
}
