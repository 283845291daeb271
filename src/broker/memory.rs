//! Process-local broker.
//!
//! Mirrors the NATS delivery model closely enough to exercise the queue
//! manager without a server: subject wildcards, fan-out to plain subscribers,
//! round-robin to exactly one member of each queue group. Every publish is
//! recorded so tests can inspect what went over the "wire".

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;

use super::{subject_matches, Broker, Delivery, DeliveryCallback};
use crate::error::{QueueError, Result};

struct Subscription {
    pattern: String,
    queue_group: Option<String>,
    callback: DeliveryCallback,
}

pub struct InMemoryBroker {
    connected: AtomicBool,
    refuse_connections: bool,
    subscriptions: RwLock<Vec<Subscription>>,
    published: Mutex<Vec<Delivery>>,
    round_robin: AtomicUsize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            refuse_connections: false,
            subscriptions: RwLock::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// A broker whose `connect` always fails, for startup-failure paths.
    pub fn unreachable() -> Self {
        Self {
            refuse_connections: true,
            ..Self::new()
        }
    }

    /// Every message published so far, in publish order.
    pub fn published(&self) -> Vec<Delivery> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads published on exactly `subject`, decoded as JSON.
    pub fn published_json(&self, subject: &str) -> Vec<serde_json::Value> {
        self.published()
            .into_iter()
            .filter(|d| d.subject == subject)
            .filter_map(|d| serde_json::from_slice(&d.payload).ok())
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::NotConnected)
        }
    }

    /// Pick recipients: all plain subscribers plus one member per queue group.
    fn recipients(&self, subject: &str) -> Vec<DeliveryCallback> {
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut recipients = Vec::new();
        let mut groups: BTreeMap<&str, Vec<&DeliveryCallback>> = BTreeMap::new();

        for sub in subscriptions.iter().filter(|s| subject_matches(&s.pattern, subject)) {
            match &sub.queue_group {
                Some(group) => groups.entry(group.as_str()).or_default().push(&sub.callback),
                None => recipients.push(sub.callback.clone()),
            }
        }

        if !groups.is_empty() {
            let turn = self.round_robin.fetch_add(1, Ordering::Relaxed);
            for members in groups.values() {
                recipients.push(members[turn % members.len()].clone());
            }
        }

        recipients
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        if self.refuse_connections {
            return Err(QueueError::TransportConnect {
                url: "memory://".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_connected()?;

        let delivery = Delivery {
            subject: subject.to_string(),
            payload,
        };
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delivery.clone());

        for callback in self.recipients(subject) {
            tokio::spawn(callback(delivery.clone()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        callback: DeliveryCallback,
    ) -> Result<()> {
        self.ensure_connected()?;

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                pattern: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                callback,
            });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
