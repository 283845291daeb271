/// Handler capability invoked by the queue manager for each delivered message

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::HandlerError;
use crate::message::QueueMessage;

/// Business logic behind a subscription.
///
/// The returned value is sent as `result` in the reply envelope when the
/// message carries a `replyTo` subject.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> Result<Value, HandlerError>;
}

/// Any async function or closure `Fn(QueueMessage) -> Future<Result<Value, HandlerError>>`
/// is a handler.
#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: QueueMessage) -> Result<Value, HandlerError> {
        self(message).await
    }
}
