//! Message envelope and per-call options.
//!
//! Every message on the wire is a JSON [`Envelope`]:
//!
//! ```json
//! {
//!   "id": "6f1c…",
//!   "type": "order.created",
//!   "timestamp": "2024-05-01T12:00:00Z",
//!   "source": "orders-api",
//!   "reply": "_INBOX.abc",
//!   "data": { "order_id": 42 },
//!   "metadata": { "traceparent": "00-…" }
//! }
//! ```
//!
//! `data` is kept as raw JSON so the envelope layer never needs to know
//! business schemas. `metadata` only carries tracing context.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

use crate::error::Result;

/// Standard message wrapper exchanged between publishers and subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    id: String,
    #[serde(rename = "type")]
    message_type: String,
    timestamp: DateTime<Utc>,
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply: Option<String>,
    data: Box<RawValue>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, String>,
}

impl Envelope {
    /// Create an envelope around already-encoded JSON data.
    ///
    /// Assigns a fresh id and the current timestamp.
    pub fn new(message_type: impl Into<String>, source: impl Into<String>, data: Box<RawValue>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            reply: None,
            data,
            metadata: HashMap::new(),
        }
    }

    /// Create an envelope by serializing `data` to JSON.
    pub fn from_data<T: Serialize + ?Sized>(
        message_type: impl Into<String>,
        source: impl Into<String>,
        data: &T,
    ) -> Result<Self> {
        let raw = serde_json::value::to_raw_value(data)?;
        Ok(Self::new(message_type, source, raw))
    }

    /// Decode an envelope from its wire representation.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode the envelope to its wire representation.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    /// Set the subject the sender expects a response on.
    pub fn set_reply(&mut self, reply: impl Into<String>) {
        self.reply = Some(reply.into());
    }

    /// Raw JSON payload.
    pub fn data(&self) -> &RawValue {
        &self.data
    }

    /// Parse the payload into a concrete business type.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.data.get())?)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Mutable access to the tracing carrier.
    pub fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.metadata
    }
}

/// Options for core publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Return once the message is buffered instead of flushing the connection.
    pub async_publish: bool,
}

impl PublishOptions {
    /// Buffer-and-return publish.
    pub fn asynchronous() -> Self {
        Self {
            async_publish: true,
        }
    }
}

/// Options for all subscribe variants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Competing-consumer group. `None` delivers every message to every subscriber.
    pub queue_group: Option<String>,
    /// Maximum concurrent pipeline executions. 0 means unbounded.
    pub max_workers: usize,
}

impl SubscribeOptions {
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }
}

/// Options for persisted pull consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullOptions {
    /// Maximum messages per fetch.
    pub batch_size: usize,
    /// How long a fetch waits for messages before returning what it has.
    pub fetch_timeout: Duration,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: u64,
        sku: String,
    }

    #[test]
    fn test_new_envelopes_get_distinct_ids() {
        let data = OrderCreated {
            order_id: 1,
            sku: "A-1".to_string(),
        };
        let a = Envelope::from_data("order.created", "orders", &data).unwrap();
        let b = Envelope::from_data("order.created", "orders", &data).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.metadata().is_empty());
        assert!(a.reply().is_none());
    }

    #[test]
    fn test_wire_format_field_names() {
        let mut env = Envelope::from_data("order.created", "orders", &42).unwrap();
        env.set_reply("_INBOX.1");
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert_eq!(value["type"], "order.created");
        assert_eq!(value["source"], "orders");
        assert_eq!(value["reply"], "_INBOX.1");
        assert_eq!(value["data"], 42);
        // Empty metadata is omitted from the wire
        assert!(value.get("metadata").is_none());
        // RFC3339 timestamp
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_decode_preserves_data_and_metadata() {
        let data = OrderCreated {
            order_id: 7,
            sku: "B-2".to_string(),
        };
        let mut env = Envelope::from_data("order.created", "orders", &data).unwrap();
        env.metadata_mut()
            .insert("traceparent".to_string(), "00-abc-def-01".to_string());

        let decoded = Envelope::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.id(), env.id());
        assert_eq!(decoded.timestamp(), env.timestamp());
        assert_eq!(decoded.decode_data::<OrderCreated>().unwrap(), data);
        assert_eq!(decoded.metadata()["traceparent"], "00-abc-def-01");
    }

    #[test]
    fn test_decode_accepts_missing_optional_fields() {
        let json = br#"{"id":"1","type":"t","timestamp":"2024-05-01T12:00:00Z","source":"s","data":null}"#;
        let env = Envelope::from_slice(json).unwrap();
        assert!(env.reply().is_none());
        assert!(env.metadata().is_empty());
        assert_eq!(env.data().get(), "null");
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let err = Envelope::from_slice(b"not json").unwrap_err();
        assert!(matches!(err, crate::error::MessagingError::Serialization(_)));
    }

    #[test]
    fn test_pull_options_default() {
        let opts = PullOptions::default();
        assert_eq!(opts.batch_size, 10);
        assert_eq!(opts.fetch_timeout, Duration::from_secs(5));
    }
}
