//! NATS transport implementation.
//!
//! Core publish/subscribe/request go straight to the `async-nats` client.
//! Persisted delivery uses JetStream:
//!
//! - Streams are looked up by subject; configured streams are created on
//!   first use of the persistent context
//! - Push consumers with a queue group share a durable consumer named after
//!   the group and the filter subject, so each message goes to one member
//!   and one group can consume several subjects
//! - Pull consumers are durable and bound by name; a name stays bound to
//!   the filter it was created with
//! - All consumers use `AckPolicy::Explicit` with the configured
//!   `max_deliver` and `ack_wait`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::client::RequestErrorKind;
use async_nats::jetstream::{
    self,
    consumer::{pull, push, AckPolicy},
    AckKind,
};
use async_nats::{ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use super::{
    Acker, Delivery, DeliveryStream, InboundMessage, MessageStream, PendingAck, PersistAck,
    PersistentContext, PullConsumer, Transport,
};
use crate::config::{AuthMethod, ConnectionConfig, PersistenceConfig, StreamConfig};
use crate::error::{MessagingError, Result};

/// NATS connection.
pub struct NatsTransport {
    client: async_nats::Client,
    closed: Arc<AtomicBool>,
}

impl NatsTransport {
    /// Connect using the configured auth, TLS and reconnect policy.
    ///
    /// Fails if the initial handshake does not complete within
    /// `connect_timeout`.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let options = connect_options(config).await?;
        let timeout = config.connect_timeout();

        let client = tokio::time::timeout(timeout, options.connect(config.url.as_str()))
            .await
            .map_err(|_| {
                MessagingError::Connection(format!(
                    "Timed out connecting to {} after {:?}",
                    config.url, timeout
                ))
            })?
            .map_err(|e| {
                MessagingError::Connection(format!("Failed to connect to {}: {}", config.url, e))
            })?;

        info!(url = %config.url, name = %config.name, "Connected to NATS");

        Ok(Self {
            client,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Wrap an already-connected client.
    pub fn from_client(client: async_nats::Client) -> Self {
        Self {
            client,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

/// Build connect options. Auth preference: credentials file > token > user/password.
async fn connect_options(config: &ConnectionConfig) -> Result<ConnectOptions> {
    let options = match config.auth.method() {
        AuthMethod::CredentialsFile(path) => ConnectOptions::with_credentials_file(path.clone())
            .await
            .map_err(|e| {
                MessagingError::Config(format!(
                    "Failed to read credentials file {}: {}",
                    path.display(),
                    e
                ))
            })?,
        AuthMethod::Token(token) => ConnectOptions::with_token(token),
        AuthMethod::UserPassword { username, password } => {
            ConnectOptions::with_user_and_password(username, password)
        }
        AuthMethod::None => ConnectOptions::new(),
    };

    let reconnect_wait = config.reconnect_wait();
    let mut options = options
        .name(&config.name)
        .connection_timeout(config.connect_timeout())
        .request_timeout(Some(config.request_timeout()))
        .max_reconnects(config.max_reconnects)
        .reconnect_delay_callback(move |_attempts| reconnect_wait)
        .event_callback(|event| async move { log_event(event) });

    let tls = &config.tls;
    if tls.insecure_skip_verify {
        return Err(MessagingError::Config(
            "tls.insecure_skip_verify is not supported by the NATS transport".to_string(),
        ));
    }
    if tls.enabled() {
        options = options.require_tls(true);
    }
    if let Some(ca) = &tls.ca_file {
        options = options.add_root_certificates(ca.clone());
    }
    if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
        options = options.add_client_certificate(cert.clone(), key.clone());
    }

    Ok(options)
}

/// Log connection lifecycle events. The client's own reconnect loop
/// governs recovery; this only observes it.
fn log_event(event: Event) {
    match event {
        Event::Connected => info!("NATS connection established"),
        Event::Disconnected => warn!("NATS connection lost, client will reconnect"),
        Event::ServerError(err) => error!(error = %err, "NATS server error"),
        Event::ClientError(err) => error!(error = %err, "NATS client error"),
        other => info!(event = %other, "NATS connection event"),
    }
}

fn inbound(message: async_nats::Message) -> InboundMessage {
    InboundMessage {
        subject: message.subject.to_string(),
        reply: message.reply.map(|r| r.to_string()),
        payload: message.payload,
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn kind(&self) -> &'static str {
        "nats"
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && matches!(
                self.client.connection_state(),
                async_nats::connection::State::Connected
            )
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to publish: {}", e)))
    }

    async fn publish_with_reply(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), payload)
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to publish: {}", e)))
    }

    async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| MessagingError::Connection(format!("Failed to flush: {}", e)))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<InboundMessage> {
        let request = async_nats::Request::new()
            .payload(payload)
            .timeout(Some(timeout));

        match self.client.send_request(subject.to_string(), request).await {
            Ok(message) => Ok(inbound(message)),
            Err(e) => Err(match e.kind() {
                RequestErrorKind::NoResponders => MessagingError::NoResponders(subject.to_string()),
                RequestErrorKind::TimedOut => MessagingError::Timeout(timeout),
                _ => MessagingError::Transport(format!("Request failed: {}", e)),
            }),
        }
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<MessageStream> {
        let subscriber = match queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| MessagingError::Transport(format!("Failed to subscribe: {}", e)))?;

        debug!(subject = %subject, queue_group = ?queue_group, "NATS subscription created");
        Ok(subscriber.map(inbound).boxed())
    }

    async fn persistent(
        &self,
        settings: &PersistenceConfig,
    ) -> Result<Arc<dyn PersistentContext>> {
        let context = jetstream::new(self.client.clone());
        for stream in &settings.streams {
            ensure_stream(&context, stream).await?;
        }
        Ok(Arc::new(NatsPersistentContext {
            context,
            client: self.client.clone(),
            settings: settings.clone(),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Best-effort drain; the socket closes when the last client handle drops
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Flush during close failed");
        }
        info!("NATS transport closed");
        Ok(())
    }
}

/// Ensure the stream exists.
async fn ensure_stream(context: &jetstream::Context, stream: &StreamConfig) -> Result<()> {
    context
        .get_or_create_stream(jetstream::stream::Config {
            name: stream.name.clone(),
            subjects: stream.subjects.clone(),
            ..Default::default()
        })
        .await
        .map_err(|e| {
            MessagingError::Transport(format!("Failed to create stream {}: {}", stream.name, e))
        })?;
    debug!(stream = %stream.name, subjects = ?stream.subjects, "Stream ready");
    Ok(())
}

/// Durable consumer names may not contain `.`, `*`, `>` or whitespace.
fn durable_name(prefix: &str, name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '.' => sanitized.push('_'),
            '*' => sanitized.push_str("STAR"),
            '>' => sanitized.push_str("GT"),
            c if c.is_whitespace() => sanitized.push('-'),
            other => sanitized.push(other),
        }
    }
    format!("{}_{}", prefix, sanitized)
}

/// An existing durable must filter on the subject it is being bound to.
fn ensure_filter(name: &str, bound: &str, requested: &str) -> Result<()> {
    if bound == requested {
        Ok(())
    } else {
        Err(MessagingError::Config(format!(
            "Durable consumer '{}' is bound to '{}', not '{}'",
            name, bound, requested
        )))
    }
}

fn delivery(message: jetstream::Message) -> Delivery {
    let inbound = InboundMessage {
        subject: message.message.subject.to_string(),
        reply: None,
        payload: message.message.payload.clone(),
    };
    Delivery {
        message: inbound,
        acker: Box::new(NatsAcker {
            message,
            resolved: false,
        }),
    }
}

/// JetStream persistent context.
struct NatsPersistentContext {
    context: jetstream::Context,
    client: async_nats::Client,
    settings: PersistenceConfig,
    closed: Arc<AtomicBool>,
}

impl NatsPersistentContext {
    async fn stream_for(&self, subject: &str) -> Result<jetstream::stream::Stream> {
        let name = self.context.stream_by_subject(subject).await.map_err(|e| {
            MessagingError::Transport(format!("No stream captures subject {}: {}", subject, e))
        })?;
        self.context
            .get_stream(&name)
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to get stream {}: {}", name, e)))
    }
}

#[async_trait]
impl PersistentContext for NatsPersistentContext {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PersistAck> {
        let ack = self
            .context
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| MessagingError::Transport(format!("Publish not acknowledged: {}", e)))?;

        Ok(PersistAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn publish_async(&self, subject: &str, payload: Bytes) -> Result<PendingAck> {
        let pending = self
            .context
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to publish: {}", e)))?;

        Ok(PendingAck::new(async move {
            let ack = pending.await.map_err(|e| {
                MessagingError::Transport(format!("Publish not acknowledged: {}", e))
            })?;
            Ok(PersistAck {
                stream: ack.stream,
                sequence: ack.sequence,
                duplicate: ack.duplicate,
            })
        }))
    }

    async fn push_consumer(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<DeliveryStream> {
        let stream = self.stream_for(subject).await?;

        let config = push::Config {
            deliver_subject: self.client.new_inbox(),
            deliver_group: queue_group.map(str::to_string),
            durable_name: queue_group
                .map(|group| durable_name("push", &format!("{}.{}", group, subject))),
            filter_subject: subject.to_string(),
            ack_policy: AckPolicy::Explicit,
            max_deliver: self.settings.max_deliver,
            ack_wait: self.settings.ack_wait(),
            ..Default::default()
        };

        let consumer = match &config.durable_name {
            Some(name) => {
                let name = name.clone();
                stream.get_or_create_consumer(&name, config).await
            }
            None => stream.create_consumer(config).await,
        }
        .map_err(|e| MessagingError::Transport(format!("Failed to create push consumer: {}", e)))?;
        if let Some(name) = &consumer.cached_info().config.durable_name {
            ensure_filter(name, &consumer.cached_info().config.filter_subject, subject)?;
        }

        let messages = consumer
            .messages()
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to open push consumer: {}", e)))?;

        Ok(messages
            .map(|item| {
                item.map(delivery)
                    .map_err(|e| MessagingError::Transport(format!("Push delivery failed: {}", e)))
            })
            .boxed())
    }

    async fn pull_consumer(&self, subject: &str, durable: &str) -> Result<Arc<dyn PullConsumer>> {
        let stream = self.stream_for(subject).await?;
        let name = durable_name("pull", durable);

        let consumer = stream
            .get_or_create_consumer(
                &name,
                pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    max_deliver: self.settings.max_deliver,
                    ack_wait: self.settings.ack_wait(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                MessagingError::Transport(format!("Failed to create pull consumer: {}", e))
            })?;
        ensure_filter(&name, &consumer.cached_info().config.filter_subject, subject)?;

        Ok(Arc::new(NatsPullConsumer {
            consumer,
            client: self.client.clone(),
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct NatsPullConsumer {
    consumer: jetstream::consumer::Consumer<pull::Config>,
    client: async_nats::Client,
    closed: Arc<AtomicBool>,
}

impl NatsPullConsumer {
    /// Closed connections are terminal; everything else is retryable.
    fn classify(&self, message: String) -> MessagingError {
        if self.closed.load(Ordering::Acquire) {
            MessagingError::Closed
        } else {
            warn!(
                state = ?self.client.connection_state(),
                error = %message,
                "Pull fetch failed"
            );
            MessagingError::Transport(message)
        }
    }
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch(&self, batch_size: usize, timeout: Duration) -> Result<Vec<Delivery>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::Closed);
        }

        let mut batch = self
            .consumer
            .fetch()
            .max_messages(batch_size)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| self.classify(format!("Fetch failed: {}", e)))?;

        let mut deliveries = Vec::with_capacity(batch_size);
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| self.classify(format!("Fetch failed: {}", e)))?;
            deliveries.push(delivery(message));
        }
        Ok(deliveries)
    }
}

struct NatsAcker {
    message: jetstream::Message,
    resolved: bool,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&mut self) -> Result<()> {
        if self.resolved {
            return Ok(());
        }
        self.resolved = true;
        self.message
            .ack()
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to ack: {}", e)))
    }

    async fn nak(&mut self) -> Result<()> {
        if self.resolved {
            return Ok(());
        }
        self.resolved = true;
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| MessagingError::Transport(format!("Failed to nak: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;

    #[test]
    fn test_durable_name_sanitized() {
        assert_eq!(durable_name("pull", "orders.worker"), "pull_orders_worker");
        assert_eq!(durable_name("push", "billing"), "push_billing");
        assert_eq!(durable_name("pull", "a.*.>"), "pull_a_STAR_GT");
        assert_eq!(durable_name("pull", "night shift"), "pull_night-shift");
        assert_ne!(
            durable_name("push", "shop.orders.*"),
            durable_name("push", "shop.orders.>")
        );
    }

    #[test]
    fn test_ensure_filter() {
        assert!(ensure_filter("pull_worker", "alpha.>", "alpha.>").is_ok());
        assert!(matches!(
            ensure_filter("pull_worker", "alpha.>", "beta.>"),
            Err(MessagingError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_skip_verify_rejected() {
        let config = ConnectionConfig {
            tls: TlsConfig {
                insecure_skip_verify: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            connect_options(&config).await,
            Err(MessagingError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_credentials_file_is_config_error() {
        let mut config = ConnectionConfig::default();
        config.auth.credentials_file = Some("/nonexistent/app.creds".into());
        assert!(matches!(
            connect_options(&config).await,
            Err(MessagingError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_unreachable_fails_within_timeout() {
        let config = ConnectionConfig {
            url: "nats://127.0.0.1:1".to_string(),
            connect_timeout_ms: 200,
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let result = NatsTransport::connect(&config).await;
        assert!(matches!(result, Err(MessagingError::Connection(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
