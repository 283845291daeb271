//! Queue manager: message lifecycle on top of a [`Broker`].
//!
//! Delivery → decode envelope → in-flight record → handler → complete (and
//! reply) or fail. Failures are retried through cancellable delayed
//! republishes until `max_retries` is exceeded, after which the record moves
//! to the dead-letter table and a dead-letter envelope is published to
//! `<subject>.dlq`.
//!
//! Both tables sit behind one lock so a record is never visible in both.
//! Pending retries are not bounded: a burst of failures schedules one timer
//! per message.

pub mod delayed;
pub mod handler;

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::backoff::BackoffPolicy;
use crate::broker::{Broker, Delivery, DeliveryCallback};
use crate::config::WorkerConfig;
use crate::error::{HandlerError, QueueError, Result};
use crate::message::{
    dead_letter_subject, DeadLetterEnvelope, MessageStatus, Payload, QueueMessage, ReplyEnvelope,
    WireEnvelope,
};
use crate::scaler::{QueueStatsSource, WorkerPool};
use crate::telemetry;
use crate::warmer::ResourceWarmer;

pub use delayed::{DelayedTasks, TaskKind};
pub use handler::MessageHandler;

/// Read-only snapshot of queue state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub processing_messages: usize,
    pub dlq_messages: usize,
    pub service: String,
    pub connected: bool,
}

#[derive(Default)]
struct Tables {
    processing: HashMap<String, QueueMessage>,
    dead_letter: HashMap<String, QueueMessage>,
}

pub struct QueueManager {
    service_name: String,
    max_retries: u32,
    completed_retention: Duration,
    backoff: BackoffPolicy,
    broker: Arc<dyn Broker>,
    tables: RwLock<Tables>,
    tasks: Arc<DelayedTasks>,
    warm_gate: Option<Arc<ResourceWarmer>>,
    worker_pool: Option<Arc<WorkerPool>>,
}

impl QueueManager {
    pub fn new(broker: Arc<dyn Broker>, config: &WorkerConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            max_retries: config.retry.max_retries,
            completed_retention: config.retry.completed_retention(),
            backoff: BackoffPolicy::from_config(&config.retry),
            broker,
            tables: RwLock::new(Tables::default()),
            tasks: Arc::new(DelayedTasks::new()),
            warm_gate: None,
            worker_pool: None,
        }
    }

    /// Hold every dispatch until `warmer` reports warm.
    pub fn with_warm_gate(mut self, warmer: Arc<ResourceWarmer>) -> Self {
        self.warm_gate = Some(warmer);
        self
    }

    /// Run handlers only while holding a slot from `pool`.
    pub fn with_worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn connect(&self) -> Result<()> {
        self.broker.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.broker.disconnect().await
    }

    /// Publish `payload` on `subject` and return the new message id without
    /// waiting for it to be processed.
    pub async fn publish_message(
        &self,
        subject: &str,
        payload: Payload,
        reply_to: Option<String>,
    ) -> Result<String> {
        let envelope = WireEnvelope::new(&self.service_name, payload, reply_to);
        self.publish_envelope(subject, &envelope).await?;
        tracing::info!(message_id = %envelope.id, subject, "Published message");
        Ok(envelope.id)
    }

    async fn publish_envelope(&self, subject: &str, envelope: &WireEnvelope) -> Result<()> {
        self.broker.publish(subject, envelope.encode()?).await
    }

    /// Subscribe `handler` to `subject`. With a queue group, each message goes
    /// to one subscriber of the group.
    pub async fn subscribe_to_queue<H>(
        self: &Arc<Self>,
        subject: &str,
        handler: H,
        queue_group: Option<&str>,
    ) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let manager: Weak<Self> = Arc::downgrade(self);

        let callback: DeliveryCallback = Arc::new(move |delivery: Delivery| {
            let manager = manager.clone();
            let handler = handler.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    manager.dispatch(delivery, handler).await;
                }
            }
            .boxed()
        });

        self.broker.subscribe(subject, queue_group, callback).await?;
        tracing::info!(subject, queue_group = ?queue_group, "Subscribed to queue");
        Ok(())
    }

    async fn dispatch(self: Arc<Self>, delivery: Delivery, handler: Arc<dyn MessageHandler>) {
        let envelope = match WireEnvelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // no well-formed record exists, so nothing to retry or dead-letter
                tracing::error!(subject = %delivery.subject, error = %e, "Dropping malformed message");
                return;
            }
        };

        let mut message = QueueMessage::from_envelope(&envelope, self.max_retries);
        {
            let mut tables = self.tables.write().await;
            if tables.dead_letter.contains_key(&message.id) {
                tracing::warn!(
                    message_id = %message.id,
                    "Ignoring delivery of a dead-lettered message; replay it explicitly"
                );
                return;
            }
            // a retry redelivery keeps the last failure until the message completes or is replayed
            if let Some(previous) = tables.processing.get(&message.id) {
                message.error_message = previous.error_message.clone();
            }
            tables.processing.insert(message.id.clone(), message.clone());
        }
        self.tasks.cancel(TaskKind::Evict, &message.id);

        if let Some(warmer) = &self.warm_gate {
            warmer.wait_until_warmed().await;
        }
        let _slot = match &self.worker_pool {
            Some(pool) => Some(pool.acquire().await),
            None => None,
        };

        let span = tracing::info_span!(
            "queue.handle",
            message_id = %message.id,
            subject = %delivery.subject,
            retry_count = message.retry_count
        );
        let invocation = async move {
            AssertUnwindSafe(handler.handle(message))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::new(panic_message(panic.as_ref()))))
        };
        match telemetry::with_span(span, invocation).await {
            Ok(result) => self.complete(&envelope, result).await,
            Err(e) => self.handle_failure(&delivery.subject, envelope, e).await,
        }
    }

    async fn complete(self: &Arc<Self>, envelope: &WireEnvelope, result: Value) {
        {
            let mut tables = self.tables.write().await;
            match tables.processing.get_mut(&envelope.id) {
                Some(message) => {
                    message.status = MessageStatus::Completed;
                    message.processed_at = Some(Utc::now());
                }
                None => tracing::debug!(message_id = %envelope.id, "Completed message was deleted in flight"),
            }
        }

        if let Some(reply_to) = &envelope.reply_to {
            let reply = ReplyEnvelope::completed(&envelope.id, result);
            let sent = match serde_json::to_vec(&reply) {
                Ok(bytes) => self.broker.publish(reply_to, bytes).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                tracing::warn!(message_id = %envelope.id, reply_to = %reply_to, error = %e, "Failed to send reply");
            }
        }

        tracing::info!(message_id = %envelope.id, "Message processed successfully");
        self.schedule_eviction(&envelope.id);
    }

    /// Completed records stay visible for `completed_retention`, then go.
    fn schedule_eviction(self: &Arc<Self>, message_id: &str) {
        let manager = Arc::downgrade(self);
        let id = message_id.to_string();
        self.tasks.schedule(TaskKind::Evict, message_id, self.completed_retention, async move {
            if let Some(manager) = manager.upgrade() {
                manager.evict_completed(&id).await;
            }
        });
    }

    async fn evict_completed(&self, message_id: &str) {
        let mut tables = self.tables.write().await;
        let completed = tables
            .processing
            .get(message_id)
            .map(|m| m.status == MessageStatus::Completed)
            .unwrap_or(false);
        if completed {
            tables.processing.remove(message_id);
            tracing::debug!(message_id, "Evicted completed message");
        }
    }

    async fn handle_failure(self: &Arc<Self>, subject: &str, envelope: WireEnvelope, error: HandlerError) {
        let mut tables = self.tables.write().await;
        let Some(message) = tables.processing.get_mut(&envelope.id) else {
            tracing::warn!(message_id = %envelope.id, "Failed message is no longer tracked");
            return;
        };

        message.retry_count += 1;
        message.error_message = Some(error.to_string());

        if message.retry_count <= message.max_retries {
            message.status = MessageStatus::Retry;
            let retry_count = message.retry_count;
            drop(tables);

            let delay = self.backoff.delay(retry_count);
            tracing::warn!(
                message_id = %envelope.id,
                retry_count,
                delay_secs = delay.as_secs_f64(),
                error = %error,
                "Retrying message"
            );
            self.schedule_retry(subject, WireEnvelope { retry_count, ..envelope }, delay);
            return;
        }

        message.status = MessageStatus::DeadLetter;
        let Some(message) = tables.processing.remove(&envelope.id) else {
            return;
        };
        tables.dead_letter.insert(message.id.clone(), message.clone());
        drop(tables);

        tracing::error!(
            message_id = %message.id,
            retry_count = message.retry_count,
            "Message moved to DLQ"
        );

        let dlq_subject = dead_letter_subject(subject);
        let dead_letter = DeadLetterEnvelope {
            original_message: message,
            error: error.to_string(),
            moved_to_dlq_at: Utc::now(),
        };
        let sent = match serde_json::to_vec(&dead_letter) {
            Ok(bytes) => self.broker.publish(&dlq_subject, bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            tracing::error!(subject = %dlq_subject, error = %e, "Failed to publish dead-letter envelope");
        }
    }

    /// Republish `envelope` to `subject` once `delay` has passed. The new
    /// delivery goes through the subscription pipeline like any other.
    fn schedule_retry(self: &Arc<Self>, subject: &str, envelope: WireEnvelope, delay: Duration) {
        let manager = Arc::downgrade(self);
        let subject = subject.to_string();
        let message_id = envelope.id.clone();

        self.tasks.schedule(TaskKind::Retry, &message_id, delay, async move {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match manager.publish_envelope(&subject, &envelope).await {
                Ok(()) => tracing::info!(
                    message_id = %envelope.id,
                    subject = %subject,
                    retry_count = envelope.retry_count,
                    "Retried message"
                ),
                Err(e) => tracing::error!(
                    message_id = %envelope.id,
                    subject = %subject,
                    error = %e,
                    "Failed to republish message for retry"
                ),
            }
        });
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        let tables = self.tables.read().await;
        QueueStats {
            processing_messages: tables.processing.len(),
            dlq_messages: tables.dead_letter.len(),
            service: self.service_name.clone(),
            connected: self.broker.is_connected(),
        }
    }

    /// Move a dead-lettered message back into processing and republish it to
    /// `subject` under its original id.
    pub async fn republish_dlq_message(&self, message_id: &str, subject: &str) -> Result<String> {
        let envelope = {
            let mut tables = self.tables.write().await;
            let mut message = tables
                .dead_letter
                .remove(message_id)
                .ok_or_else(|| QueueError::DlqNotFound(message_id.to_string()))?;

            message.status = MessageStatus::Pending;
            message.retry_count = 0;
            message.error_message = None;
            message.processed_at = None;

            let envelope = message.to_envelope(&self.service_name);
            tables.processing.insert(message.id.clone(), message);
            envelope
        };

        if let Err(e) = self.publish_envelope(subject, &envelope).await {
            // keep the record replayable
            let mut tables = self.tables.write().await;
            if let Some(mut message) = tables.processing.remove(message_id) {
                message.status = MessageStatus::DeadLetter;
                tables.dead_letter.insert(message.id.clone(), message);
            }
            return Err(e);
        }

        tracing::info!(message_id, subject, "Republished DLQ message");
        Ok(envelope.id)
    }

    pub async fn get_message(&self, message_id: &str) -> Option<QueueMessage> {
        let tables = self.tables.read().await;
        tables
            .processing
            .get(message_id)
            .or_else(|| tables.dead_letter.get(message_id))
            .cloned()
    }

    pub async fn list_dlq_messages(&self) -> Vec<QueueMessage> {
        let tables = self.tables.read().await;
        let mut messages: Vec<QueueMessage> = tables.dead_letter.values().cloned().collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        messages
    }

    /// Drop a message from whichever table holds it and cancel its timers.
    pub async fn delete_message(&self, message_id: &str) -> Result<QueueMessage> {
        let removed = {
            let mut tables = self.tables.write().await;
            tables
                .processing
                .remove(message_id)
                .or_else(|| tables.dead_letter.remove(message_id))
        };
        let message = removed.ok_or_else(|| QueueError::MessageNotFound(message_id.to_string()))?;

        self.tasks.cancel(TaskKind::Retry, message_id);
        self.tasks.cancel(TaskKind::Evict, message_id);
        tracing::info!(message_id, "Deleted message");
        Ok(message)
    }

    pub fn pending_retries(&self) -> usize {
        self.tasks.pending(TaskKind::Retry)
    }

    /// Cancel pending retries and evictions, then disconnect the broker.
    /// In-flight handler invocations are not waited for.
    pub async fn shutdown(&self) -> Result<usize> {
        let cancelled = self.tasks.cancel_all();
        tracing::info!(cancelled, "Cancelled pending delayed tasks");
        self.broker.disconnect().await?;
        Ok(cancelled)
    }
}

/// Describe a caught handler panic so it can travel the normal failure path.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("handler panicked: {}", detail)
}

#[async_trait]
impl QueueStatsSource for QueueManager {
    async fn queue_stats(&self) -> QueueStats {
        self.get_queue_stats().await
    }
}
