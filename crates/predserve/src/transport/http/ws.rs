//! Task event websocket.
//!
//! Each connection forwards one task's status events, in publish order, until
//! a terminal status has been sent or the client goes away. The client never
//! needs to send anything.

use std::sync::Arc;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::StreamExt;
use serde_json::json;

use crate::service::PredictionService;
use crate::task::TaskRecord;

pub(super) async fn task_events(
    ws: WebSocketUpgrade,
    State(service): State<Arc<PredictionService>>,
    Path(task_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| relay(socket, service, task_id))
}

async fn relay(mut socket: WebSocket, service: Arc<PredictionService>, task_id: String) {
    tracing::debug!(%task_id, "Task event subscriber connected");

    // Subscribe before reading the record: an update landing between the two
    // is then delivered as an event instead of being missed.
    let mut events = match service.subscribe(&task_id).await {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(%task_id, error = %e, "Failed to subscribe to task events");
            send_error(&mut socket, &task_id, "Status store unavailable").await;
            return;
        }
    };

    let current = match service.task(&task_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            send_error(&mut socket, &task_id, "Task not found").await;
            return;
        }
        Err(e) => {
            tracing::warn!(%task_id, error = %e, "Failed to read task");
            send_error(&mut socket, &task_id, "Status store unavailable").await;
            return;
        }
    };

    if send_record(&mut socket, &current).await.is_err() {
        return;
    }
    if current.is_terminal() {
        close(&mut socket).await;
        return;
    }

    let mut last_sent = current;
    let mut shutdown = service.shutdown_rx();
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(record) => {
                    // Already covered by the snapshot.
                    if record.updated_at < last_sent.updated_at || record == last_sent {
                        continue;
                    }
                    if send_record(&mut socket, &record).await.is_err() {
                        return;
                    }
                    if record.is_terminal() {
                        break;
                    }
                    last_sent = record;
                }
                None => {
                    tracing::warn!(%task_id, "Task event stream ended");
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    tracing::debug!(%task_id, "Task event subscriber disconnected");
                    return;
                }
                Some(Ok(_)) => {}
            },
            _ = shutdown.changed() => break,
        }
    }
    close(&mut socket).await;
}

async fn send_record(socket: &mut WebSocket, record: &TaskRecord) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(&record.to_response()).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}

async fn send_error(socket: &mut WebSocket, task_id: &str, error: &str) {
    let payload = json!({ "task_id": task_id, "error": error }).to_string();
    if socket.send(Message::Text(payload.into())).await.is_ok() {
        close(socket).await;
    }
}

async fn close(socket: &mut WebSocket) {
    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogisticModel;
    use crate::queue::MemoryTaskQueue;
    use crate::storage::DataDirs;
    use crate::store::{MemoryStatusStore, StatusStore};
    use crate::task::TaskStatus;
    use crate::transport::http::routes;
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    struct Harness {
        _tmp: tempfile::TempDir,
        store: Arc<MemoryStatusStore>,
        addr: SocketAddr,
    }

    async fn spawn_server() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStatusStore::new());
        let service = Arc::new(PredictionService::new(
            Arc::new(LogisticModel::from_json(r#"{"intercept": 0.0}"#).unwrap()),
            store.clone(),
            Arc::new(MemoryTaskQueue::new()),
            DataDirs::new(tmp.path()),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, routes(service)).await.unwrap() });
        Harness {
            _tmp: tmp,
            store,
            addr,
        }
    }

    type Client =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn connect(addr: SocketAddr, task_id: &str) -> Client {
        let url = format!("ws://{addr}/ws/task/{task_id}");
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    async fn next_json(client: &mut Client) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(msg.to_text().unwrap()).unwrap()
    }

    async fn expect_closed(client: &mut Client) {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap();
        assert!(
            matches!(msg, None | Some(Ok(ClientMessage::Close(_))) | Some(Err(_))),
            "expected close, got {msg:?}"
        );
    }

    #[tokio::test]
    async fn finished_task_is_sent_immediately() {
        let h = spawn_server().await;
        let mut record = TaskRecord::pending("t-1");
        record.advance(TaskStatus::Running, "Reading CSV file").unwrap();
        record.succeed(2, "results_t-1.csv".to_string()).unwrap();
        h.store.put(&record).await.unwrap();

        let mut client = connect(h.addr, "t-1").await;
        let event = next_json(&mut client).await;
        assert_eq!(event["status"], "SUCCESS");
        assert_eq!(event["results_download_url"], "/results/results_t-1.csv");
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn forwards_events_until_terminal() {
        let h = spawn_server().await;
        let mut record = TaskRecord::pending("t-1");
        h.store.put(&record).await.unwrap();

        let mut client = connect(h.addr, "t-1").await;
        let snapshot = next_json(&mut client).await;
        assert_eq!(snapshot["status"], "PENDING");

        record.advance(TaskStatus::Running, "Reading CSV file").unwrap();
        h.store.put_and_publish(&record).await.unwrap();
        let event = next_json(&mut client).await;
        assert_eq!(event["status"], "RUNNING");
        assert_eq!(event["message"], "Reading CSV file");

        record.advance(TaskStatus::Failure, "bad file").unwrap();
        h.store.put_and_publish(&record).await.unwrap();
        let event = next_json(&mut client).await;
        assert_eq!(event["status"], "FAILURE");
        assert!(event["results_download_url"].is_null());

        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn unknown_task_gets_error_then_close() {
        let h = spawn_server().await;
        let mut client = connect(h.addr, "missing").await;
        let event = next_json(&mut client).await;
        assert_eq!(event["task_id"], "missing");
        assert_eq!(event["error"], "Task not found");
        expect_closed(&mut client).await;
    }
}
