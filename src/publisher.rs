//! Outbound message path.
//!
//! Every send runs the same pipeline:
//! 1. encode `data` to JSON
//! 2. validate `(type, bytes)` when a validator is configured
//! 3. require a live connection
//! 4. build the envelope (fresh id and timestamp)
//! 5. inject trace context into metadata
//! 6. encode the envelope
//! 7. hand it to the transport
//!
//! Steps 5-7 form the core function that the middleware chain wraps, so
//! middleware sees the finished envelope and the outcome of the send.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::context::MessageContext;
use crate::envelope::{Envelope, PublishOptions};
use crate::error::{MessagingError, Result};
use crate::middleware::{compose, publish_fn, Middleware, Outbound, PublishFn, SendMode, SendOutcome};
use crate::telemetry::{Telemetry, TracePropagator};
use crate::transport::{PendingAck, PersistAck};
use crate::validation::Validator;

/// Sends envelopes through the shared connection.
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    source: String,
    validator: Option<Arc<dyn Validator>>,
    telemetry: Telemetry,
    middleware: RwLock<Vec<Arc<dyn Middleware<PublishFn>>>>,
}

impl Publisher {
    /// Publisher whose envelope `source` is the connection's client name.
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        let source = connection.config().name.clone();
        Self {
            connection,
            source,
            validator: None,
            telemetry: Telemetry::default(),
            middleware: RwLock::new(Vec::new()),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Append a middleware. The first registered runs outermost.
    pub fn use_middleware(&self, middleware: impl Middleware<PublishFn> + 'static) {
        self.middleware
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(middleware));
    }

    /// Fire-and-forget publish. Flushes unless `opts.async_publish`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        ctx: &MessageContext,
        subject: &str,
        message_type: &str,
        data: &T,
        opts: PublishOptions,
    ) -> Result<()> {
        match self
            .send(ctx, subject, message_type, data, SendMode::Publish(opts))
            .await?
        {
            SendOutcome::Sent => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Send a request and wait for the correlated reply.
    ///
    /// Waits until the earlier of the context deadline and `now + timeout`.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        ctx: &MessageContext,
        subject: &str,
        message_type: &str,
        data: &T,
        timeout: Duration,
    ) -> Result<Envelope> {
        match self
            .send(ctx, subject, message_type, data, SendMode::Request { timeout })
            .await?
        {
            SendOutcome::Reply(envelope) => Ok(envelope),
            other => Err(unexpected(other)),
        }
    }

    /// Persisted publish; returns once the broker has stored the message.
    pub async fn publish_persisted<T: Serialize + ?Sized>(
        &self,
        ctx: &MessageContext,
        subject: &str,
        message_type: &str,
        data: &T,
    ) -> Result<PersistAck> {
        match self
            .send(ctx, subject, message_type, data, SendMode::Persisted)
            .await?
        {
            SendOutcome::Persisted(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    /// Persisted publish; the returned [`PendingAck`] resolves to the broker ack.
    pub async fn publish_persisted_async<T: Serialize + ?Sized>(
        &self,
        ctx: &MessageContext,
        subject: &str,
        message_type: &str,
        data: &T,
    ) -> Result<PendingAck> {
        match self
            .send(ctx, subject, message_type, data, SendMode::PersistedAsync)
            .await?
        {
            SendOutcome::Pending(pending) => Ok(pending),
            other => Err(unexpected(other)),
        }
    }

    /// Publish a response to the subject `request` asked replies on.
    ///
    /// Returns `false` without sending when the request carries no reply subject.
    pub async fn reply<T: Serialize + ?Sized>(
        &self,
        ctx: &MessageContext,
        request: &Envelope,
        message_type: &str,
        data: &T,
    ) -> Result<bool> {
        let Some(reply) = request.reply() else {
            return Ok(false);
        };
        self.publish(ctx, reply, message_type, data, PublishOptions::default())
            .await?;
        Ok(true)
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        ctx: &MessageContext,
        subject: &str,
        message_type: &str,
        data: &T,
        mode: SendMode,
    ) -> Result<SendOutcome> {
        let raw = serde_json::value::to_raw_value(data)?;

        if let Some(validator) = &self.validator {
            validator.validate(message_type, raw.get().as_bytes())?;
        }

        if !self.connection.is_connected() {
            return Err(MessagingError::NotConnected);
        }

        let envelope = Envelope::new(message_type, self.source.as_str(), raw);
        let chain = {
            let middleware = self.middleware.read().unwrap_or_else(|e| e.into_inner());
            compose(&middleware, self.core())
        };

        chain(
            ctx.clone(),
            Outbound {
                subject: subject.to_string(),
                envelope,
                mode,
            },
        )
        .await
    }

    fn core(&self) -> PublishFn {
        let connection = Arc::clone(&self.connection);
        let propagator = Arc::clone(&self.telemetry.propagator);
        publish_fn(move |ctx, outbound| {
            let connection = Arc::clone(&connection);
            let propagator = Arc::clone(&propagator);
            async move { deliver(&connection, propagator.as_ref(), ctx, outbound).await }
        })
    }
}

fn unexpected(outcome: SendOutcome) -> MessagingError {
    MessagingError::Transport(format!("Unexpected send outcome: {:?}", outcome))
}

async fn deliver(
    connection: &ConnectionManager,
    propagator: &dyn TracePropagator,
    ctx: MessageContext,
    outbound: Outbound,
) -> Result<SendOutcome> {
    let Outbound {
        subject,
        mut envelope,
        mode,
    } = outbound;

    propagator.inject(ctx.span(), envelope.metadata_mut());
    let payload = envelope.to_bytes()?;

    match mode {
        SendMode::Publish(opts) => {
            let transport = connection.transport()?;
            transport.publish(&subject, payload).await?;
            if !opts.async_publish {
                transport.flush().await?;
            }
            debug!(subject = %subject, id = %envelope.id(), "Envelope sent");
            Ok(SendOutcome::Sent)
        }
        SendMode::Request { timeout } => {
            let transport = connection.transport()?;
            let deadline = ctx.effective_deadline(timeout);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MessagingError::Timeout(timeout));
            }

            let reply = tokio::time::timeout_at(
                deadline,
                transport.request(&subject, payload, remaining),
            )
            .await
            .map_err(|_| MessagingError::Timeout(remaining))??;

            Ok(SendOutcome::Reply(Envelope::from_slice(&reply.payload)?))
        }
        SendMode::Persisted => {
            let context = connection.persistent_context().await?;
            let ack = context.publish(&subject, payload).await?;
            debug!(
                subject = %subject,
                stream = %ack.stream,
                sequence = ack.sequence,
                "Envelope persisted"
            );
            Ok(SendOutcome::Persisted(ack))
        }
        SendMode::PersistedAsync => {
            let context = connection.persistent_context().await?;
            let pending = context.publish_async(&subject, payload).await?;
            Ok(SendOutcome::Pending(pending))
        }
    }
}
