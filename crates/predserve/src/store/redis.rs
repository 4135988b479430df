//! Redis status store.
//!
//! Records are stored as JSON strings under [`record_key`]; events are
//! published as the same JSON on [`event_channel`]. Subscriptions use a
//! dedicated pub/sub connection per subscriber.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{StatusStore, StoreError, Subscription, event_channel, record_key};
use crate::task::TaskRecord;

#[derive(Clone)]
pub struct RedisStatusStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStatusStore {
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { client, conn })
    }
}

fn encode(record: &TaskRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(json: &str) -> Result<TaskRecord, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(record_key(task_id))
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        json.as_deref().map(decode).transpose()
    }

    async fn put(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let json = encode(record)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(record_key(&record.task_id), &json)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn publish(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let json = encode(record)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(event_channel(&record.task_id), &json)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn subscribe(&self, task_id: &str) -> Result<Subscription, StoreError> {
        let channel = event_channel(task_id);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let channel = channel.clone();
            async move {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(%channel, error = %e, "Dropping unreadable task event");
                        return None;
                    }
                };
                match decode(&payload) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!(%channel, error = %e, "Dropping malformed task event");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}
