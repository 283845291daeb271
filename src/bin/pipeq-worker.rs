//! pipeq-worker - reference pipeline worker
//!
//! Connects to NATS, warms the model cache, consumes `frame.generation` jobs
//! with a simulated generation handler, runs the scaling monitor and serves
//! the admin routes until Ctrl-C.

use clap::Parser;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use pipeq::admin::{self, AdminState};
use pipeq::{
    AutoScaler, Broker, HandlerError, InMemoryBroker, NatsBroker, QueueManager, QueueMessage,
    ResourceWarmer, WorkerConfig, WorkerPool,
};

#[derive(Parser)]
#[command(name = "pipeq-worker")]
#[command(version, about = "Pipeline worker consuming jobs from a NATS queue", long_about = None)]
struct Cli {
    /// YAML configuration file (environment variables still override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subject to consume jobs from
    #[arg(short, long, default_value = "frame.generation")]
    subject: String,

    /// Queue group shared by competing workers
    #[arg(short, long)]
    queue_group: Option<String>,

    /// Admin HTTP port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Use the process-local broker instead of NATS
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => WorkerConfig::load_from_file(path),
        None => WorkerConfig::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    pipeq::telemetry::init_tracing(&config.logging);

    if let Err(e) = run(cli, config).await {
        tracing::error!("Worker failed: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli, config: WorkerConfig) -> pipeq::Result<()> {
    let broker: Arc<dyn Broker> = if cli.in_memory {
        Arc::new(InMemoryBroker::new())
    } else {
        Arc::new(NatsBroker::new(config.nats.clone()))
    };

    let warmer = Arc::new(ResourceWarmer::from_config(&config.warmup));
    let pool = Arc::new(WorkerPool::new(config.scaler.min_workers));
    let queue = Arc::new(
        QueueManager::new(broker, &config)
            .with_warm_gate(warmer.clone())
            .with_worker_pool(pool.clone()),
    );

    queue.connect().await?;
    warmer.warm_cache().await?;

    let queue_group = cli
        .queue_group
        .clone()
        .unwrap_or_else(|| format!("{}s", config.service_name));
    queue
        .subscribe_to_queue(&cli.subject, generate_frame, Some(&queue_group))
        .await?;

    let scaler = Arc::new(AutoScaler::new(queue.clone(), &config.scaler).with_worker_pool(pool));
    let monitor = scaler.clone().spawn_monitor(config.scaler.check_interval());

    let app = admin::router(
        AdminState::new(queue.clone())
            .with_scaler(scaler)
            .with_warmer(warmer),
    );

    let port = cli.port.unwrap_or(config.admin.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("{} admin listening on {}", config.service_name, addr);
    tracing::info!("Consuming {} in queue group {}", cli.subject, queue_group);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor.abort();
    let cancelled = queue.shutdown().await?;
    tracing::info!("Shut down with {} pending retries cancelled", cancelled);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Simulated frame generation: validates the job, spends time per inference
/// step and returns canned metadata.
async fn generate_frame(message: QueueMessage) -> Result<Value, HandlerError> {
    let frame_id = message
        .payload
        .get("frame_id")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::new("Invalid message format: missing frame_id"))?;

    let request = message
        .payload
        .get("request")
        .and_then(Value::as_object)
        .ok_or_else(|| HandlerError::new("Invalid message format: missing request"))?;

    let steps = request
        .get("num_inference_steps")
        .and_then(Value::as_u64)
        .unwrap_or(25);

    for _ in 0..steps {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(json!({ "status": "success", "frame_id": frame_id }))
}
