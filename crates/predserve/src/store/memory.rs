//! In-process status store.
//!
//! Records live in a DashMap; each task gets a broadcast channel on first
//! subscribe. Used when no Redis URL is configured and in tests.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;

use super::{StatusStore, StoreError, Subscription};
use crate::task::TaskRecord;

/// Per-task event buffer. A subscriber that falls further behind than this
/// skips the oldest events.
const EVENT_BUFFER: usize = 64;

#[derive(Default)]
pub struct MemoryStatusStore {
    records: DashMap<String, TaskRecord>,
    channels: DashMap<String, broadcast::Sender<TaskRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.get(task_id).map(|r| r.value().clone()))
    }

    async fn put(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.records.insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn publish(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let Some(sender) = self.channels.get(&record.task_id).map(|s| s.value().clone()) else {
            return Ok(());
        };
        // No receivers is not an error: nobody is listening right now.
        let _ = sender.send(record.clone());

        // Nothing follows a terminal event. Dropping the last sender lets
        // receivers drain what is buffered and then see the stream end.
        if record.is_terminal() {
            self.channels.remove(&record.task_id);
        }
        Ok(())
    }

    async fn subscribe(&self, task_id: &str) -> Result<Subscription, StoreError> {
        // Channels whose subscribers all went away, e.g. lookups of unknown tasks.
        self.channels.retain(|_, sender| sender.receiver_count() > 0);

        let receiver = self
            .channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_BUFFER).0)
            .subscribe();

        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(record) => return Some((record, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Status subscriber lagged, skipping events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
