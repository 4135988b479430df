//! Reliable Redis job queue.
//!
//! Producers LPUSH descriptors onto the queue list. Consumers move each one
//! onto a processing list with BRPOPLPUSH and LREM it once the job body has
//! returned. Entries left on the processing list by a crashed consumer are
//! pushed back onto the queue by [`RedisTaskQueue::recover`].

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tokio::sync::Mutex;

use super::{Delivery, JobDescriptor, QueueError, TaskQueue};

pub struct RedisTaskQueue {
    client: redis::Client,
    conn: ConnectionManager,
    /// Connection reserved for blocking pops, opened on first poll and kept
    /// until a command on it fails.
    blocking: Mutex<Option<MultiplexedConnection>>,
    queue_name: String,
    processing_name: String,
}

impl RedisTaskQueue {
    pub async fn new(url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(url).map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(None),
            queue_name: queue_name.to_string(),
            processing_name: processing_list(queue_name),
        })
    }

    /// Requeue jobs a previous consumer took but never acknowledged.
    ///
    /// Run once at worker start-up, before polling. Returns the number of
    /// jobs moved back.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        loop {
            let entry: Option<String> = conn
                .rpoplpush(&self.processing_name, &self.queue_name)
                .await
                .map_err(|e| QueueError::Redis(e.to_string()))?;
            if entry.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            tracing::warn!(
                queue = %self.queue_name,
                moved,
                "Requeued unacknowledged jobs"
            );
        }
        Ok(moved)
    }

    async fn blocking_conn(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut slot = self.blocking.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

fn processing_list(queue_name: &str) -> String {
    format!("{queue_name}:processing")
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, job: &JobDescriptor) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, &payload)
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))
    }

    async fn next(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        // Blocking pops use their own connection so they never stall the
        // shared one.
        let mut conn = self.blocking_conn().await?;

        let payload: Option<String> = match conn
            .brpoplpush(
                &self.queue_name,
                &self.processing_name,
                timeout.as_secs_f64(),
            )
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                *self.blocking.lock().await = None;
                return Err(QueueError::Redis(e.to_string()));
            }
        };

        let Some(payload) = payload else {
            return Ok(None);
        };
        match serde_json::from_str::<JobDescriptor>(&payload) {
            Ok(job) => Ok(Some(Delivery::new(job, payload))),
            Err(e) => {
                tracing::error!(error = %e, payload = %payload, "Discarding malformed job");
                let _ = conn
                    .lrem::<_, _, ()>(&self.processing_name, 1, &payload)
                    .await;
                Err(QueueError::Serialization(e.to_string()))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(&self.processing_name, 1, delivery.receipt())
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))
    }
}
