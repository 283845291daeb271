//! # pipeq: job queue client for AI pipeline workers
//!
//! Each pipeline worker (illustration, export, animatic, ...) embeds a
//! [`QueueManager`] that consumes jobs from a publish/subscribe transport and
//! runs them through a worker-specific [`MessageHandler`].
//!
//! ## Features
//!
//! - **At-least-once delivery**: failed handlers are retried with jittered
//!   backoff (`[1, 5, 15, 60, 300]` seconds by default)
//! - **Dead-lettering**: messages that exhaust their retries are quarantined
//!   and announced on `<subject>.dlq`; they re-enter processing only through
//!   an explicit replay
//! - **Adaptive scaling**: an [`AutoScaler`] sizes a [`WorkerPool`] from the
//!   in-flight backlog, one step per cooldown
//! - **Warm-up gate**: a [`ResourceWarmer`] loads an expensive resource once
//!   and dispatch waits for it
//! - **Admin surface**: axum routes for stats, DLQ listing and replay
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipeq::{HandlerError, NatsBroker, QueueManager, QueueMessage, WorkerConfig};
//!
//! let config = WorkerConfig::from_env()?;
//! let broker = Arc::new(NatsBroker::new(config.nats.clone()));
//! let queue = Arc::new(QueueManager::new(broker, &config));
//! queue.connect().await?;
//!
//! queue
//!     .subscribe_to_queue(
//!         "frame.generation",
//!         |message: QueueMessage| async move {
//!             let frame_id = message.payload.get("frame_id").cloned();
//!             Ok::<_, HandlerError>(serde_json::json!({ "frame_id": frame_id }))
//!         },
//!         Some("illustration-workers"),
//!     )
//!     .await?;
//! ```

pub mod admin;
pub mod backoff;
pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod scaler;
pub mod telemetry;
pub mod warmer;

// Re-export key types
pub use backoff::BackoffPolicy;
pub use broker::{Broker, Delivery, DeliveryCallback, InMemoryBroker, NatsBroker, NatsConfig};
pub use config::{
    AdminConfig, LoggingConfig, RetryConfig, ScalerConfig, WarmupConfig, WorkerConfig,
};
pub use error::{BoxError, HandlerError, QueueError, Result};
pub use message::{
    DeadLetterEnvelope, MessageStatus, Payload, QueueMessage, ReplyEnvelope, WireEnvelope,
};
pub use queue::{MessageHandler, QueueManager, QueueStats};
pub use scaler::{AutoScaler, QueueStatsSource, ScalingDecision, WorkerPool, WorkerPoolState};
pub use warmer::{ResourceWarmer, SimulatedModelLoader, WarmupLoader};
