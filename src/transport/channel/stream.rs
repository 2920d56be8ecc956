//! Persisted streams for the channel broker.
//!
//! Every persisted publish is appended to a single in-memory log and
//! mirrored to core subscribers. Consumers keep their own cursor into the
//! log plus a redelivery queue fed by naks and expired ack waits.
//!
//! There is no retention limit: the log keeps every message, acknowledged
//! or not, and durable consumers stay registered until the transport is
//! dropped. The broker is meant for tests and single-process use, not for
//! long-running high-volume streams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use futures::StreamExt;
use tracing::{debug, warn};

use super::ChannelTransport;
use crate::config::PersistenceConfig;
use crate::error::{MessagingError, Result};
use crate::transport::subject;
use crate::transport::{
    Acker, Delivery, DeliveryStream, InboundMessage, PendingAck, PersistAck, PersistentContext,
    PullConsumer,
};

/// Name reported in acks; the channel broker keeps one log.
const STREAM_NAME: &str = "CHANNEL";

#[derive(Clone)]
struct StoredMessage {
    sequence: u64,
    subject: String,
    payload: Bytes,
}

/// Append-only; entries are indexed by `sequence - 1` and never removed.
#[derive(Default)]
struct Log {
    messages: Vec<StoredMessage>,
    consumers: Vec<Weak<Consumer>>,
    durables: HashMap<String, Arc<Consumer>>,
}

struct Shared {
    log: Mutex<Log>,
    closed: AtomicBool,
    max_deliver: i64,
    ack_wait: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct ConsumerState {
    /// Index of the next never-delivered log entry.
    cursor: usize,
    /// Sequences waiting for redelivery.
    redeliver: VecDeque<u64>,
    /// Delivery attempts per outstanding sequence.
    attempts: HashMap<u64, i64>,
}

/// A consumer's view of the log.
struct Consumer {
    filter: String,
    state: Mutex<ConsumerState>,
    notify: Notify,
    shared: Arc<Shared>,
}

impl Consumer {
    fn lock(&self) -> MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the next deliverable message, redeliveries first.
    fn next_delivery(self: &Arc<Self>) -> Option<Delivery> {
        let mut state = self.lock();

        let stored = if let Some(sequence) = state.redeliver.pop_front() {
            let log = self.shared.lock();
            log.messages.get((sequence - 1) as usize).cloned()
        } else {
            let log = self.shared.lock();
            let found = log.messages[state.cursor..]
                .iter()
                .position(|m| subject::matches(&self.filter, &m.subject));
            match found {
                Some(offset) => {
                    let stored = log.messages[state.cursor + offset].clone();
                    state.cursor += offset + 1;
                    Some(stored)
                }
                None => {
                    state.cursor = log.messages.len();
                    None
                }
            }
        }?;

        *state.attempts.entry(stored.sequence).or_insert(0) += 1;

        Some(Delivery {
            message: InboundMessage {
                subject: stored.subject,
                reply: None,
                payload: stored.payload,
            },
            acker: Box::new(ChannelAcker {
                consumer: Arc::clone(self),
                sequence: stored.sequence,
                resolved: false,
            }),
        })
    }

    fn complete(&self, sequence: u64) {
        self.lock().attempts.remove(&sequence);
    }

    /// Queue a sequence for redelivery unless it has used up its attempts.
    fn retry(&self, sequence: u64) {
        let mut state = self.lock();
        let attempts = state.attempts.get(&sequence).copied().unwrap_or(0);
        if self.shared.max_deliver > 0 && attempts >= self.shared.max_deliver {
            state.attempts.remove(&sequence);
            warn!(
                sequence,
                attempts,
                filter = %self.filter,
                "Max deliveries reached, dropping message"
            );
            return;
        }
        state.redeliver.push_back(sequence);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Wait until a delivery is available, the store closes, or `deadline`.
    async fn wait(self: &Arc<Self>, deadline: Option<tokio::time::Instant>) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.next_delivery() {
                return Some(delivery);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Ack handle for a channel delivery.
struct ChannelAcker {
    consumer: Arc<Consumer>,
    sequence: u64,
    resolved: bool,
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&mut self) -> Result<()> {
        if !self.resolved {
            self.resolved = true;
            self.consumer.complete(self.sequence);
        }
        Ok(())
    }

    async fn nak(&mut self) -> Result<()> {
        if !self.resolved {
            self.resolved = true;
            self.consumer.retry(self.sequence);
        }
        Ok(())
    }
}

impl Drop for ChannelAcker {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        // Unacknowledged: redeliver after the ack wait
        let consumer = Arc::clone(&self.consumer);
        let sequence = self.sequence;
        let ack_wait = consumer.shared.ack_wait;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(ack_wait).await;
                consumer.retry(sequence);
            });
        }
    }
}

/// Durable pull consumer over the channel log.
struct ChannelPullConsumer {
    consumer: Arc<Consumer>,
}

#[async_trait]
impl PullConsumer for ChannelPullConsumer {
    async fn fetch(&self, batch_size: usize, timeout: Duration) -> Result<Vec<Delivery>> {
        if self.consumer.shared.closed.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::new();

        match self.consumer.wait(Some(deadline)).await {
            Some(first) => batch.push(first),
            None if self.consumer.shared.closed.load(Ordering::Acquire) => {
                return Err(MessagingError::Closed)
            }
            None => return Ok(batch),
        }

        while batch.len() < batch_size.max(1) {
            match self.consumer.next_delivery() {
                Some(delivery) => batch.push(delivery),
                None => break,
            }
        }

        Ok(batch)
    }
}

/// Persistent context backed by the channel broker.
pub struct ChannelPersistentContext {
    transport: ChannelTransport,
    shared: Arc<Shared>,
}

impl ChannelPersistentContext {
    pub(super) fn new(transport: ChannelTransport, settings: &PersistenceConfig) -> Self {
        Self {
            transport,
            shared: Arc::new(Shared {
                log: Mutex::new(Log::default()),
                closed: AtomicBool::new(false),
                max_deliver: settings.max_deliver,
                ack_wait: settings.ack_wait(),
            }),
        }
    }

    /// Stop all consumers.
    pub(super) fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        for consumer in self.live_consumers() {
            consumer.notify.notify_waiters();
        }
    }

    /// Number of messages retained in the log.
    pub fn stored_count(&self) -> usize {
        self.shared.lock().messages.len()
    }

    fn live_consumers(&self) -> Vec<Arc<Consumer>> {
        let mut log = self.shared.lock();
        log.consumers.retain(|c| c.strong_count() > 0);
        log.consumers.iter().filter_map(Weak::upgrade).collect()
    }

    fn store(&self, subject: &str, payload: Bytes) -> Result<PersistAck> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }
        subject::validate_publish(subject)?;

        let sequence = {
            let mut log = self.shared.lock();
            let sequence = log.messages.len() as u64 + 1;
            log.messages.push(StoredMessage {
                sequence,
                subject: subject.to_string(),
                payload: payload.clone(),
            });
            sequence
        };

        for consumer in self.live_consumers() {
            consumer.notify.notify_waiters();
        }

        // Persisted messages are also visible to core subscribers
        self.transport.route(InboundMessage {
            subject: subject.to_string(),
            reply: None,
            payload,
        });

        debug!(subject = %subject, sequence, "Stored message in channel stream");

        Ok(PersistAck {
            stream: STREAM_NAME.to_string(),
            sequence,
            duplicate: false,
        })
    }

    /// Get or create a consumer. Durable consumers are shared by name and
    /// stay bound to the filter they were created with.
    fn consumer(&self, filter: &str, durable: Option<String>) -> Result<Arc<Consumer>> {
        let mut log = self.shared.lock();
        if let Some(name) = &durable {
            if let Some(existing) = log.durables.get(name) {
                if existing.filter != filter {
                    return Err(MessagingError::Config(format!(
                        "Durable consumer '{}' is bound to '{}', not '{}'",
                        name, existing.filter, filter
                    )));
                }
                return Ok(Arc::clone(existing));
            }
        }

        let consumer = Arc::new(Consumer {
            filter: filter.to_string(),
            state: Mutex::new(ConsumerState::default()),
            notify: Notify::new(),
            shared: Arc::clone(&self.shared),
        });
        log.consumers.push(Arc::downgrade(&consumer));
        if let Some(name) = durable {
            log.durables.insert(name, Arc::clone(&consumer));
        }
        Ok(consumer)
    }
}

#[async_trait]
impl PersistentContext for ChannelPersistentContext {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PersistAck> {
        self.store(subject, payload)
    }

    async fn publish_async(&self, subject: &str, payload: Bytes) -> Result<PendingAck> {
        let ack = self.store(subject, payload);
        Ok(PendingAck::new(async move { ack }))
    }

    async fn push_consumer(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<DeliveryStream> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }
        subject::validate_pattern(subject)?;

        let durable = queue_group.map(|group| format!("push:{}:{}", group, subject));
        let consumer = self.consumer(subject, durable)?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivery = consumer.wait(None) => match delivery {
                        Some(delivery) => {
                            if tx.send(Ok(delivery)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn pull_consumer(&self, subject: &str, durable: &str) -> Result<Arc<dyn PullConsumer>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }
        subject::validate_pattern(subject)?;
        if durable.is_empty() {
            return Err(MessagingError::Config(
                "Pull consumers require a durable name".to_string(),
            ));
        }

        let consumer = self.consumer(subject, Some(format!("pull:{}", durable)))?;
        Ok(Arc::new(ChannelPullConsumer { consumer }))
    }
}
