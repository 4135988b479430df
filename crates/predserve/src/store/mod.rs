//! Task status store.
//!
//! The store is the single source of truth for task state and doubles as the
//! publish/subscribe bus for task events. Two backends:
//! - **Redis**: shared between gateway and worker processes
//! - **Memory**: single-process deployments and tests
//!
//! Every write replaces the whole record; there are no partial updates.

mod memory;
mod redis;

pub use memory::MemoryStatusStore;
pub use redis::RedisStatusStore;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::task::TaskRecord;

/// Namespace shared by every key this crate writes.
pub const KEY_NAMESPACE: &str = "predserve";

/// Store key holding a task record.
pub fn record_key(task_id: &str) -> String {
    format!("{KEY_NAMESPACE}:task:{task_id}")
}

/// Pub/sub channel carrying a task's events.
pub fn event_channel(task_id: &str) -> String {
    format!("{KEY_NAMESPACE}:task-events:{task_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Status store connection error: {0}")]
    Connection(String),
    #[error("Status store error: {0}")]
    Database(String),
    #[error("Status record serialization error: {0}")]
    Serialization(String),
}

/// Live feed of a task's published records, in publish order.
pub type Subscription = BoxStream<'static, TaskRecord>;

#[async_trait]
pub trait StatusStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    async fn put(&self, record: &TaskRecord) -> Result<(), StoreError>;

    async fn publish(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Subscribe to a task's events. Only events published after this call
    /// returns are delivered.
    async fn subscribe(&self, task_id: &str) -> Result<Subscription, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Write the record, then publish it.
    async fn put_and_publish(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.put(record).await?;
        self.publish(record).await
    }
}
