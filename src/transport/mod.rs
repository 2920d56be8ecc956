//! Broker transport seam.
//!
//! This module contains:
//! - `Transport` trait: a connection to a subject-addressed broker
//! - `PersistentContext` trait: durable streams with acknowledged delivery
//! - `PullConsumer` / `Acker` traits for persisted consumers
//! - Implementations: NATS (core + JetStream), in-process channel broker
//!
//! Everything above this layer (publisher, subscriber, router) talks to the
//! broker only through these traits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::PersistenceConfig;
use crate::error::Result;

pub mod channel;
#[cfg(feature = "nats")]
pub mod nats;
pub mod subject;

pub use channel::ChannelTransport;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;

/// A raw message as delivered by the broker, before envelope decoding.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Subject the message was published on.
    pub subject: String,
    /// Transport-level reply-to subject, if the sender expects a response.
    pub reply: Option<String>,
    /// Encoded envelope.
    pub payload: Bytes,
}

/// Stream of core (unacknowledged) deliveries for one subscription.
///
/// Dropping the stream unsubscribes.
pub type MessageStream = BoxStream<'static, InboundMessage>;

/// Stream of persisted deliveries for a push consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Durable acknowledgement returned by the broker for a persisted publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistAck {
    /// Stream that stored the message.
    pub stream: String,
    /// Stream sequence assigned to the message.
    pub sequence: u64,
    /// Broker detected a duplicate publish.
    pub duplicate: bool,
}

/// A persisted publish whose acknowledgement has not arrived yet.
///
/// Await it to obtain the [`PersistAck`].
pub struct PendingAck {
    inner: BoxFuture<'static, Result<PersistAck>>,
}

impl PendingAck {
    pub fn new(future: impl Future<Output = Result<PersistAck>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(future),
        }
    }
}

impl Future for PendingAck {
    type Output = Result<PersistAck>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for PendingAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAck").finish_non_exhaustive()
    }
}

/// Acknowledgement handle for one persisted delivery.
///
/// Calling neither `ack` nor `nak` before dropping leaves the message
/// unacknowledged; the broker redelivers it after its ack wait.
#[async_trait]
pub trait Acker: Send {
    /// Positive acknowledgement: the message is done.
    async fn ack(&mut self) -> Result<()>;

    /// Negative acknowledgement: redeliver (subject to max-deliver).
    async fn nak(&mut self) -> Result<()>;
}

/// A persisted message paired with its acknowledgement handle.
pub struct Delivery {
    pub message: InboundMessage,
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// A durable consumer that the client polls for batches.
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Fetch up to `batch_size` messages, waiting at most `timeout`.
    ///
    /// An empty batch means nothing arrived in time; it is not an error.
    async fn fetch(&self, batch_size: usize, timeout: Duration) -> Result<Vec<Delivery>>;
}

/// Persistent-messaging context (JetStream-equivalent).
#[async_trait]
pub trait PersistentContext: Send + Sync {
    /// Store a message and wait for the broker's acknowledgement.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PersistAck>;

    /// Store a message without waiting for the acknowledgement.
    async fn publish_async(&self, subject: &str, payload: Bytes) -> Result<PendingAck>;

    /// Create a push consumer. Members of the same queue group share one
    /// durable consumer and compete for deliveries.
    async fn push_consumer(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<DeliveryStream>;

    /// Create or bind a durable pull consumer.
    async fn pull_consumer(&self, subject: &str, durable: &str) -> Result<Arc<dyn PullConsumer>>;
}

/// A connection to a subject-addressed broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name for logs ("nats", "channel").
    fn kind(&self) -> &'static str;

    /// Non-blocking liveness probe.
    fn is_connected(&self) -> bool;

    /// Queue a message for delivery.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish with a transport-level reply-to subject.
    async fn publish_with_reply(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()>;

    /// Wait until buffered messages have been written to the broker.
    async fn flush(&self) -> Result<()>;

    /// Send a request and wait up to `timeout` for the first reply.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration)
        -> Result<InboundMessage>;

    /// Subscribe to a subject (wildcards allowed), optionally in a queue group.
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<MessageStream>;

    /// Build a persistent-messaging context on this connection.
    async fn persistent(&self, settings: &PersistenceConfig)
        -> Result<Arc<dyn PersistentContext>>;

    /// Drain buffered work, then close. Idempotent.
    async fn close(&self) -> Result<()>;
}
