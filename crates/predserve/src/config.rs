//! Environment-driven service configuration.
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379   # unset: in-memory store and queue
//! HOST=0.0.0.0
//! PORT=8000
//! AWAIT_EXPLICIT_SHUTDOWN=false
//! MODEL_PATH=model/model.json
//! DATA_DIR=data
//! WORKER_CONCURRENCY=1
//! QUEUE_NAME=predserve:jobs
//! QUEUE_POLL_TIMEOUT_SECS=5
//! MAX_UPLOAD_BYTES=104857600
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::WorkerConfig;
use crate::transport::ServerConfig;

pub const DEFAULT_QUEUE_NAME: &str = "predserve:jobs";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Store and queue connection string. `None` selects in-memory backends.
    pub redis_url: Option<String>,
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub model_path: PathBuf,
    /// Root of `uploads/` and `results/`.
    pub data_dir: PathBuf,
    pub queue_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            server: ServerConfig::default(),
            worker: WorkerConfig::default(),
            model_path: PathBuf::from("model/model.json"),
            data_dir: PathBuf::from("data"),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unparseable values fall back
    /// to their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| -> Option<String> {
            lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        };

        Self {
            redis_url: parsed("REDIS_URL"),
            server: ServerConfig {
                host: parsed("HOST").unwrap_or(defaults.server.host),
                port: parse_or("PORT", parsed("PORT"), defaults.server.port),
                await_explicit_shutdown: parsed("AWAIT_EXPLICIT_SHUTDOWN")
                    .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                    .unwrap_or(defaults.server.await_explicit_shutdown),
                max_upload_bytes: parse_or(
                    "MAX_UPLOAD_BYTES",
                    parsed("MAX_UPLOAD_BYTES"),
                    defaults.server.max_upload_bytes,
                ),
            },
            worker: WorkerConfig {
                concurrency: parse_or(
                    "WORKER_CONCURRENCY",
                    parsed("WORKER_CONCURRENCY"),
                    defaults.worker.concurrency,
                )
                .max(1),
                poll_timeout: Duration::from_secs(parse_or(
                    "QUEUE_POLL_TIMEOUT_SECS",
                    parsed("QUEUE_POLL_TIMEOUT_SECS"),
                    defaults.worker.poll_timeout.as_secs(),
                )),
            },
            model_path: parsed("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            data_dir: parsed("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            queue_name: parsed("QUEUE_NAME").unwrap_or(defaults.queue_name),
        }
    }
}

fn parse_or<T: FromStr>(key: &str, value: Option<String>, default: T) -> T {
    match value {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparseable setting");
            default
        }),
    }
}
