use std::process;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use predserve::{
    DataDirs, LogisticModel, MemoryStatusStore, MemoryTaskQueue, PredictionService,
    RedisStatusStore, RedisTaskQueue, ServiceConfig, StatusStore, TaskQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// HTTP gateway only; jobs are consumed elsewhere.
    Serve,
    /// Job consumer only.
    Worker,
    Both,
}

impl Mode {
    fn runs_gateway(self) -> bool {
        matches!(self, Mode::Serve | Mode::Both)
    }

    fn runs_worker(self) -> bool {
        matches!(self, Mode::Worker | Mode::Both)
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: predserve-server [serve|worker|all]");
            eprintln!();
            eprintln!("Modes:");
            eprintln!("  serve     HTTP gateway only (requires REDIS_URL)");
            eprintln!("  worker    Batch job consumer only (requires REDIS_URL)");
            eprintln!("  all       Gateway and in-process worker [default]");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(mode)) {
        tracing::error!(error = ?e, "predserve-server exited with error");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    let mut mode: Option<Mode> = None;

    for arg in args.iter().skip(1) {
        let parsed = match arg.as_str() {
            "serve" => Mode::Serve,
            "worker" => Mode::Worker,
            "all" => Mode::Both,
            "--help" | "-h" => return Err(String::new()),
            flag if flag.starts_with('-') => return Err(format!("unknown flag: {flag}")),
            other => return Err(format!("unknown mode '{other}'")),
        };
        if mode.is_some() {
            return Err(format!("unexpected argument: {arg}"));
        }
        mode = Some(parsed);
    }

    Ok(mode.unwrap_or(Mode::Both))
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PREDSERVE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("predserve={level},predserve_server={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(mode: Mode) -> anyhow::Result<()> {
    let config = ServiceConfig::from_env();
    tracing::info!(
        ?mode,
        version = predserve::PREDSERVE_VERSION,
        redis = config.redis_url.is_some(),
        "Starting predserve"
    );

    let model = LogisticModel::load(&config.model_path)
        .with_context(|| format!("loading model from {}", config.model_path.display()))?;
    tracing::info!(path = %config.model_path.display(), "Model loaded");

    let dirs = DataDirs::new(&config.data_dir);
    dirs.prepare()?;

    let (store, queue): (Arc<dyn StatusStore>, Arc<dyn TaskQueue>) = match &config.redis_url {
        Some(url) => {
            let store: Arc<dyn StatusStore> = Arc::new(
                RedisStatusStore::new(url)
                    .await
                    .context("connecting status store")?,
            );
            let redis_queue = RedisTaskQueue::new(url, &config.queue_name)
                .await
                .context("connecting job queue")?;
            if mode.runs_worker() {
                redis_queue.recover().await?;
            }
            let queue: Arc<dyn TaskQueue> = Arc::new(redis_queue);
            (store, queue)
        }
        None => {
            if mode != Mode::Both {
                bail!("REDIS_URL must be set to run the gateway and worker separately");
            }
            tracing::warn!("REDIS_URL not set, using in-memory status store and job queue");
            let store: Arc<dyn StatusStore> = Arc::new(MemoryStatusStore::new());
            let queue: Arc<dyn TaskQueue> = Arc::new(MemoryTaskQueue::new());
            (store, queue)
        }
    };

    let service = Arc::new(PredictionService::new(
        Arc::new(model),
        store,
        queue,
        dirs,
    ));

    let worker = if mode.runs_worker() {
        let worker = service.worker(config.worker.clone());
        let shutdown = service.shutdown_rx();
        Some(tokio::spawn(async move { worker.run(shutdown).await }))
    } else {
        None
    };

    if mode.runs_gateway() {
        predserve::transport::serve(config.server.clone(), Arc::clone(&service)).await?;
    } else {
        wait_for_signal().await;
    }
    service.trigger_shutdown();

    if let Some(worker) = worker {
        worker.await??;
        tracing::info!("Worker stopped");
    }

    Ok(())
}

/// Worker-only shutdown: SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
