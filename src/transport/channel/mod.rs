//! In-memory channel-based broker for standalone mode.
//!
//! Implements the full transport contract inside one process: subject
//! wildcards, queue groups, request/reply and persisted streams with
//! ack/nak redelivery. Ideal for local development and testing without
//! external dependencies.

mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::subject;
use super::{InboundMessage, MessageStream, PersistentContext, Transport};
use crate::config::PersistenceConfig;
use crate::error::{MessagingError, Result};

pub use stream::ChannelPersistentContext;

/// A registered subscription.
struct Subscription {
    id: u64,
    pattern: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct RouterState {
    subscriptions: Vec<Subscription>,
    /// Round-robin cursor per queue group.
    group_cursor: HashMap<String, usize>,
}

/// Shared broker state. Cloned handles see the same subjects and streams.
struct Broker {
    state: Mutex<RouterState>,
    next_id: AtomicU64,
    connected: AtomicBool,
    persistent: Mutex<Option<Arc<ChannelPersistentContext>>>,
}

impl Broker {
    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver to matching subscribers. Returns the number of deliveries.
    fn route(&self, message: InboundMessage) -> usize {
        let mut state = self.lock();
        state.subscriptions.retain(|s| !s.sender.is_closed());

        let mut delivered = 0;
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, sub) in state.subscriptions.iter().enumerate() {
            if !subject::matches(&sub.pattern, &message.subject) {
                continue;
            }
            match &sub.queue_group {
                Some(group) => groups.entry(group.clone()).or_default().push(idx),
                None => {
                    if sub.sender.send(message.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }

        // One member per queue group
        for (group, members) in groups {
            let cursor = state.group_cursor.entry(group).or_insert(0);
            let pick = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            if state.subscriptions[pick].sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }

        delivered
    }

    fn register(&self, pattern: &str, queue_group: Option<&str>) -> (u64, MessageStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().subscriptions.push(Subscription {
            id,
            pattern: pattern.to_string(),
            queue_group: queue_group.map(str::to_string),
            sender,
        });
        (id, UnboundedReceiverStream::new(receiver).boxed())
    }

    fn remove(&self, id: u64) {
        self.lock().subscriptions.retain(|s| s.id != id);
    }
}

/// In-process transport.
///
/// Clones share one broker, so a publisher and a subscriber built from
/// clones of the same transport see each other's messages.
#[derive(Clone)]
pub struct ChannelTransport {
    broker: Arc<Broker>,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport {
    /// Create a new, connected, empty broker.
    pub fn new() -> Self {
        info!("Channel transport initialized");
        Self {
            broker: Arc::new(Broker {
                state: Mutex::new(RouterState::default()),
                next_id: AtomicU64::new(1),
                connected: AtomicBool::new(true),
                persistent: Mutex::new(None),
            }),
        }
    }

    /// Number of live subscriptions (closed receivers excluded).
    pub fn subscription_count(&self) -> usize {
        let mut state = self.broker.lock();
        state.subscriptions.retain(|s| !s.sender.is_closed());
        state.subscriptions.len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.broker.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MessagingError::Closed)
        }
    }

    /// Route a message; used by the persistent context to mirror stored
    /// messages to core subscribers.
    pub(crate) fn route(&self, message: InboundMessage) -> usize {
        self.broker.route(message)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> &'static str {
        "channel"
    }

    fn is_connected(&self) -> bool {
        self.broker.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.ensure_connected()?;
        subject::validate_publish(subject)?;
        let receivers = self.broker.route(InboundMessage {
            subject: subject.to_string(),
            reply: None,
            payload,
        });
        debug!(subject = %subject, receivers, "Published message to channel");
        Ok(())
    }

    async fn publish_with_reply(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        self.ensure_connected()?;
        subject::validate_publish(subject)?;
        self.broker.route(InboundMessage {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            payload,
        });
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // Delivery into subscriber queues is synchronous
        self.ensure_connected()
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<InboundMessage> {
        self.ensure_connected()?;
        subject::validate_publish(subject)?;

        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let (id, mut replies) = self.broker.register(&inbox, None);

        let delivered = self.broker.route(InboundMessage {
            subject: subject.to_string(),
            reply: Some(inbox),
            payload,
        });
        if delivered == 0 {
            self.broker.remove(id);
            return Err(MessagingError::NoResponders(subject.to_string()));
        }

        let reply = tokio::time::timeout(timeout, replies.next()).await;
        self.broker.remove(id);

        match reply {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(MessagingError::Closed),
            Err(_) => Err(MessagingError::Timeout(timeout)),
        }
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<MessageStream> {
        self.ensure_connected()?;
        subject::validate_pattern(subject)?;
        let (_, stream) = self.broker.register(subject, queue_group);
        debug!(subject = %subject, queue_group = ?queue_group, "Channel subscription registered");
        Ok(stream)
    }

    async fn persistent(
        &self,
        settings: &PersistenceConfig,
    ) -> Result<Arc<dyn PersistentContext>> {
        self.ensure_connected()?;
        let mut slot = self.broker.persistent.lock().unwrap_or_else(|e| e.into_inner());
        let context = slot
            .get_or_insert_with(|| Arc::new(ChannelPersistentContext::new(self.clone(), settings)))
            .clone();
        Ok(context)
    }

    async fn close(&self) -> Result<()> {
        if !self.broker.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        // Dropping the senders ends every subscription stream
        self.broker.lock().subscriptions.clear();
        let persistent = self
            .broker
            .persistent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(context) = persistent {
            context.shutdown();
        }
        info!("Channel transport closed");
        Ok(())
    }
}
