/// Queue message records and the wire envelopes exchanged over the broker
///
/// Timestamps travel as fractional epoch seconds so envelopes stay readable by
/// the other pipeline workers; field names are camelCase on the way out and
/// the older snake_case spellings are accepted on the way in.

use chrono::{DateTime, Utc};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{QueueError, Result};

/// Opaque business payload carried by a message.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retry,
    DeadLetter,
}

/// One unit of work, either in flight or quarantined in the dead-letter table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: String,
    pub payload: Payload,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(with = "epoch_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "epoch_seconds::option")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl QueueMessage {
    /// Build the in-flight record for a freshly decoded envelope.
    pub fn from_envelope(envelope: &WireEnvelope, max_retries: u32) -> Self {
        Self {
            id: envelope.id.clone(),
            payload: envelope.data.clone(),
            status: MessageStatus::Processing,
            retry_count: envelope.retry_count,
            max_retries,
            created_at: envelope.created_at.unwrap_or_else(Utc::now),
            processed_at: None,
            error_message: None,
            reply_to: envelope.reply_to.clone(),
        }
    }

    /// Envelope that re-enters this record into the subscription pipeline.
    pub fn to_envelope(&self, service: &str) -> WireEnvelope {
        WireEnvelope {
            id: self.id.clone(),
            data: self.payload.clone(),
            reply_to: self.reply_to.clone(),
            created_at: Some(self.created_at),
            service: service.to_string(),
            retry_count: self.retry_count,
        }
    }
}

/// Envelope published on a work subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub id: String,
    pub data: Payload,
    #[serde(default, alias = "reply_to")]
    pub reply_to: Option<String>,
    #[serde(default, alias = "created_at", with = "epoch_seconds::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub service: String,
    #[serde(default, alias = "retry_count")]
    pub retry_count: u32,
}

impl WireEnvelope {
    pub fn new(service: &str, data: Payload, reply_to: Option<String>) -> Self {
        Self {
            id: generate_message_id(service),
            data,
            reply_to,
            created_at: Some(Utc::now()),
            service: service.to_string(),
            retry_count: 0,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::EnvelopeDecode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Published to `replyTo` after a successful handler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    pub message_id: String,
    pub status: String,
    pub result: Value,
}

impl ReplyEnvelope {
    pub fn completed(message_id: &str, result: Value) -> Self {
        Self {
            message_id: message_id.to_string(),
            status: "completed".to_string(),
            result,
        }
    }
}

/// Published to `<subject>.dlq` when a message exhausts its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEnvelope {
    pub original_message: QueueMessage,
    pub error: String,
    #[serde(with = "epoch_seconds")]
    pub moved_to_dlq_at: DateTime<Utc>,
}

/// `<service>_<epoch-ms>_<4-digit-random>`
pub fn generate_message_id(service: &str) -> String {
    let suffix: u16 = rand::rng().random_range(1000..=9999);
    format!("{}_{}_{}", service, Utc::now().timestamp_millis(), suffix)
}

pub fn dead_letter_subject(subject: &str) -> String {
    format!("{}.dlq", subject)
}

/// Serde adapter for timestamps expressed as fractional epoch seconds.
pub(crate) mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn to_secs(t: &DateTime<Utc>) -> f64 {
        t.timestamp_millis() as f64 / 1000.0
    }

    pub fn from_secs(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() {
            return None;
        }
        DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
    }

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(to_secs(t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        from_secs(secs).ok_or_else(|| D::Error::custom(format!("timestamp out of range: {}", secs)))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            t: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => serializer.serialize_some(&to_secs(t)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<f64>::deserialize(deserializer)? {
                Some(secs) => from_secs(secs)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {}", secs))),
                None => Ok(None),
            }
        }
    }
}
