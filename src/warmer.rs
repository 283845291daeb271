//! One-shot warm-up gate for an expensive shared resource (typically a model
//! that must be loaded and exercised before the first real job).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use crate::config::WarmupConfig;
use crate::error::{BoxError, QueueError, Result};
use crate::telemetry;

/// The expensive resource being warmed.
#[async_trait]
pub trait WarmupLoader: Send + Sync {
    /// Load the resource (weights, caches, ...).
    async fn load(&self) -> std::result::Result<(), BoxError>;

    /// Run one warm-up inference; `round` is 1-based.
    async fn infer(&self, round: u32) -> std::result::Result<(), BoxError>;
}

/// Stand-in loader that only spends time, used until a real model backend is
/// wired into the worker.
pub struct SimulatedModelLoader {
    model_path: String,
    load_time: Duration,
    inference_time: Duration,
}

impl SimulatedModelLoader {
    pub fn new(model_path: impl Into<String>, load_time: Duration, inference_time: Duration) -> Self {
        Self {
            model_path: model_path.into(),
            load_time,
            inference_time,
        }
    }

    pub fn from_config(config: &WarmupConfig) -> Self {
        Self::new(
            config.model_path.clone(),
            Duration::from_millis(config.load_time_ms),
            Duration::from_millis(config.inference_time_ms),
        )
    }
}

#[async_trait]
impl WarmupLoader for SimulatedModelLoader {
    async fn load(&self) -> std::result::Result<(), BoxError> {
        tracing::info!(model_path = %self.model_path, "Loading model");
        tokio::time::sleep(self.load_time).await;
        Ok(())
    }

    async fn infer(&self, _round: u32) -> std::result::Result<(), BoxError> {
        tokio::time::sleep(self.inference_time).await;
        Ok(())
    }
}

pub struct ResourceWarmer {
    loader: Arc<dyn WarmupLoader>,
    rounds: u32,
    warmed: watch::Sender<bool>,
    // serializes concurrent warm_cache calls so the load runs once
    warming: Mutex<()>,
}

impl ResourceWarmer {
    pub fn new(loader: Arc<dyn WarmupLoader>, rounds: u32) -> Self {
        let (warmed, _) = watch::channel(false);
        Self {
            loader,
            rounds,
            warmed,
            warming: Mutex::new(()),
        }
    }

    pub fn from_config(config: &WarmupConfig) -> Self {
        Self::new(Arc::new(SimulatedModelLoader::from_config(config)), config.rounds)
    }

    /// Load and exercise the resource unless that already succeeded.
    ///
    /// On failure the warmer stays cold and the next call starts over.
    pub async fn warm_cache(&self) -> Result<()> {
        if self.check_cache_status() {
            return Ok(());
        }

        let _guard = self.warming.lock().await;
        if self.check_cache_status() {
            return Ok(());
        }

        tracing::info!("Warming up resource cache...");
        let loader = self.loader.clone();
        let rounds = self.rounds;
        telemetry::with_span(tracing::info_span!("cache.warm", rounds), async move {
            loader
                .load()
                .await
                .map_err(|e| QueueError::Warmup(format!("load failed: {}", e)))?;

            for round in 1..=rounds {
                loader
                    .infer(round)
                    .await
                    .map_err(|e| QueueError::Warmup(format!("warm-up inference {} failed: {}", round, e)))?;
                tracing::info!("Warmup inference {}/{} completed", round, rounds);
            }
            Ok::<(), QueueError>(())
        })
        .await?;

        self.warmed.send_replace(true);
        tracing::info!("Resource cache warmed up successfully");
        Ok(())
    }

    pub fn check_cache_status(&self) -> bool {
        *self.warmed.borrow()
    }

    /// Resolves once a warm-up has succeeded. Dispatch waits here.
    pub async fn wait_until_warmed(&self) {
        let mut receiver = self.warmed.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = receiver.wait_for(|warmed| *warmed).await;
    }
}
