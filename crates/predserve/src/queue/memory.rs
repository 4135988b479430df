//! In-process job queue backed by an unbounded tokio channel.
//!
//! Jobs do not survive a restart; acknowledgement is a no-op.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::{Delivery, JobDescriptor, QueueError, TaskQueue};

pub struct MemoryTaskQueue {
    tx: mpsc::UnboundedSender<JobDescriptor>,
    rx: Mutex<mpsc::UnboundedReceiver<JobDescriptor>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, job: &JobDescriptor) -> Result<(), QueueError> {
        self.tx.send(job.clone()).map_err(|_| QueueError::Closed)
    }

    async fn next(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(job)) => Ok(Some(Delivery::new(job, String::new()))),
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Ok(None),
        }
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }
}
