/// NATS transport for the queue manager
///
/// Core NATS publish/subscribe: delivery is at-most-once at the transport
/// level, the queue manager layers retries and dead-lettering on top.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::{Broker, Delivery, DeliveryCallback};
use crate::error::{QueueError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    /// Connection name reported to the NATS server
    pub connection_name: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            connection_name: None,
        }
    }
}

pub struct NatsBroker {
    config: NatsConfig,
    client: RwLock<Option<async_nats::Client>>,
    subscriptions: RwLock<Vec<JoinHandle<()>>>,
}

impl NatsBroker {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    fn client(&self) -> Result<async_nats::Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(QueueError::NotConnected)
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn connect(&self) -> Result<()> {
        let mut options = async_nats::ConnectOptions::new();
        if let Some(name) = &self.config.connection_name {
            options = options.name(name.as_str());
        }

        let client = options
            .connect(self.config.url.as_str())
            .await
            .map_err(|e| QueueError::TransportConnect {
                url: self.config.url.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!("Connected to NATS at {}", self.config.url);

        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let client = self.client()?;
        client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| QueueError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        callback: DeliveryCallback,
    ) -> Result<()> {
        let client = self.client()?;

        let mut subscriber = match queue_group {
            Some(group) => client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await
                .map_err(|e| subscribe_error(subject, e))?,
            None => client
                .subscribe(subject.to_string())
                .await
                .map_err(|e| subscribe_error(subject, e))?,
        };

        let task = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let delivery = Delivery {
                    subject: message.subject.to_string(),
                    payload: message.payload.to_vec(),
                };
                tokio::spawn(callback(delivery));
            }
        });

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let tasks = std::mem::take(
            &mut *self.subscriptions.write().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }

        let client = self.client.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                tracing::warn!("Failed to flush NATS connection on disconnect: {}", e);
            }
            tracing::info!("Disconnected from NATS");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|client| client.connection_state() == async_nats::connection::State::Connected)
            .unwrap_or(false)
    }
}

fn subscribe_error(subject: &str, err: impl std::fmt::Display) -> QueueError {
    QueueError::Subscribe {
        subject: subject.to_string(),
        reason: err.to_string(),
    }
}
