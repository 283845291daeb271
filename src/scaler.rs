//! Adaptive worker-count control loop.
//!
//! The scaler watches the queue manager's backlog and moves the worker count
//! one step at a time inside `[min_workers, max_workers]`, with a cooldown
//! between steps. State is per process; separate worker processes do not
//! coordinate.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ScalerConfig;
use crate::queue::QueueStats;

/// Where the scaler reads backlog from.
#[async_trait]
pub trait QueueStatsSource: Send + Sync {
    async fn queue_stats(&self) -> QueueStats;
}

#[derive(Debug, Clone)]
pub struct WorkerPoolState {
    pub current_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// `None` until the first scaling action
    pub last_scale_time: Option<Instant>,
    pub cooldown: Duration,
}

impl WorkerPoolState {
    pub fn new(config: &ScalerConfig) -> Self {
        Self {
            current_workers: config.min_workers,
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            last_scale_time: None,
            cooldown: config.cooldown(),
        }
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.last_scale_time
            .map(|last| now.duration_since(last) < self.cooldown)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> WorkerPoolSnapshot {
        WorkerPoolSnapshot {
            current_workers: self.current_workers,
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            cooldown_secs: self.cooldown.as_secs(),
            secs_since_last_scale: self.last_scale_time.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolSnapshot {
    pub current_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub cooldown_secs: u64,
    pub secs_since_last_scale: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    CoolingDown,
    Unchanged,
    ScaledUp(usize),
    ScaledDown(usize),
}

/// Bounds how many handler invocations run at once. The scaler resizes it.
pub struct WorkerPool {
    slots: StdMutex<PoolSlots>,
    released: Notify,
}

struct PoolSlots {
    size: usize,
    active: usize,
}

/// Held for the duration of one handler invocation.
pub struct WorkerSlot {
    pool: Arc<WorkerPool>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.pool.lock().active -= 1;
        self.pool.released.notify_waiters();
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: StdMutex::new(PoolSlots { size, active: 0 }),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolSlots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn acquire(self: &Arc<Self>) -> WorkerSlot {
        loop {
            // registered before the check so a release in between is not missed
            let released = self.released.notified();
            {
                let mut slots = self.lock();
                if slots.active < slots.size {
                    slots.active += 1;
                    return WorkerSlot { pool: self.clone() };
                }
            }
            released.await;
        }
    }

    /// Shrinking never interrupts running work; it only holds back new slots
    /// until enough are released.
    pub fn resize(&self, size: usize) {
        self.lock().size = size;
        self.released.notify_waiters();
    }

    pub fn size(&self) -> usize {
        self.lock().size
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }
}

pub struct AutoScaler {
    source: Arc<dyn QueueStatsSource>,
    state: Mutex<WorkerPoolState>,
    pool: Option<Arc<WorkerPool>>,
}

impl AutoScaler {
    pub fn new(source: Arc<dyn QueueStatsSource>, config: &ScalerConfig) -> Self {
        Self {
            source,
            state: Mutex::new(WorkerPoolState::new(config)),
            pool: None,
        }
    }

    /// Resize `pool` whenever the worker count changes.
    pub fn with_worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        pool.resize(self.state.get_mut().current_workers);
        self.pool = Some(pool);
        self
    }

    /// One control-loop step: at most one worker up or down.
    pub async fn check_scaling_needs(&self) -> ScalingDecision {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.cooling_down(now) {
            return ScalingDecision::CoolingDown;
        }

        let processing = self.source.queue_stats().await.processing_messages;
        let current = state.current_workers;

        let decision = if processing > current * 2 && current < state.max_workers {
            state.current_workers += 1;
            tracing::info!(processing, "Scaled up to {} workers", state.current_workers);
            ScalingDecision::ScaledUp(state.current_workers)
        } else if processing < current / 2 && current > state.min_workers {
            state.current_workers -= 1;
            tracing::info!(processing, "Scaled down to {} workers", state.current_workers);
            ScalingDecision::ScaledDown(state.current_workers)
        } else {
            return ScalingDecision::Unchanged;
        };

        state.last_scale_time = Some(now);
        if let Some(pool) = &self.pool {
            pool.resize(state.current_workers);
        }
        decision
    }

    pub async fn current_workers(&self) -> usize {
        self.state.lock().await.current_workers
    }

    pub async fn state(&self) -> WorkerPoolState {
        self.state.lock().await.clone()
    }

    /// Run `check_scaling_needs` every `interval` until the handle is aborted.
    pub fn spawn_monitor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let decision = self.check_scaling_needs().await;
                tracing::debug!(?decision, "Scaling check");
            }
        })
    }
}
