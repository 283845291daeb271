/// Publish/subscribe transport abstraction
///
/// The queue manager only needs four things from a transport: connect,
/// publish bytes to a subject, subscribe a callback (optionally within a
/// competing-consumers queue group) and disconnect.

pub mod memory;
pub mod nats;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;

pub use memory::InMemoryBroker;
pub use nats::{NatsBroker, NatsConfig};

/// A message as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Callback invoked once per delivered message. Brokers run every invocation
/// on its own task so a slow handler never stalls the delivery loop.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish the transport session. Failure is fatal to the caller and
    /// is not retried here.
    async fn connect(&self) -> Result<()>;

    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Register `callback` for messages on `subject`. With a queue group each
    /// message goes to exactly one member of the group.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        callback: DeliveryCallback,
    ) -> Result<()>;

    /// Release the session. Safe to call when not connected.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// NATS-style subject matching: `*` matches one token, a trailing `>` matches
/// one or more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
