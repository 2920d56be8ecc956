//! Per-message receive pipeline and in-flight accounting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info_span, warn, Instrument};

use crate::context::MessageContext;
use crate::envelope::Envelope;
use crate::error::MessagingError;
use crate::middleware::HandlerFn;
use crate::telemetry::TracePropagator;
use crate::transport::{Delivery, InboundMessage};
use crate::validation::Validator;

/// What happened to one message.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Undecodable or invalid; never reached the handler.
    Rejected,
    Handled,
    Failed(MessagingError),
}

/// Decode, enrich, validate and dispatch one message.
pub(crate) struct Pipeline {
    pub(crate) handler: HandlerFn,
    pub(crate) validator: Option<Arc<dyn Validator>>,
    pub(crate) propagator: Arc<dyn TracePropagator>,
}

impl Pipeline {
    pub(crate) async fn run(&self, message: InboundMessage) -> Outcome {
        let mut envelope = match Envelope::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    subject = %message.subject,
                    bytes = message.payload.len(),
                    error = %e,
                    "Discarding malformed message"
                );
                return Outcome::Rejected;
            }
        };

        let span = info_span!(
            "messaging.deliver",
            subject = %message.subject,
            message_type = %envelope.message_type(),
            id = %envelope.id(),
        );
        self.propagator.extract(envelope.metadata(), &span);

        if let Some(reply) = message.reply {
            envelope.set_reply(reply);
        }

        if let Some(validator) = &self.validator {
            if let Err(e) = validator.validate(envelope.message_type(), envelope.data().get().as_bytes())
            {
                warn!(
                    subject = %message.subject,
                    message_type = %envelope.message_type(),
                    id = %envelope.id(),
                    error = %e,
                    "Discarding invalid message"
                );
                return Outcome::Rejected;
            }
        }

        let ctx = MessageContext::new().with_span(span.clone());
        match (self.handler)(ctx, message.subject, envelope)
            .instrument(span)
            .await
        {
            Ok(()) => Outcome::Handled,
            Err(e) => Outcome::Failed(e),
        }
    }

    /// Core delivery: failures are logged, there is nothing to acknowledge.
    pub(crate) async fn process_message(&self, message: InboundMessage) {
        let subject = message.subject.clone();
        if let Outcome::Failed(e) = self.run(message).await {
            error!(subject = %subject, error = %e, "Message handler failed");
        }
    }

    /// Persisted delivery: ack on success, nak on handler failure, leave
    /// rejected messages unacknowledged so the broker redelivers them.
    pub(crate) async fn process_delivery(&self, delivery: Delivery) {
        let Delivery {
            message,
            mut acker,
        } = delivery;
        let subject = message.subject.clone();

        match self.run(message).await {
            Outcome::Handled => {
                if let Err(e) = acker.ack().await {
                    error!(subject = %subject, error = %e, "Failed to ack message");
                }
            }
            Outcome::Failed(e) => {
                error!(subject = %subject, error = %e, "Message handler failed, requesting redelivery");
                if let Err(e) = acker.nak().await {
                    error!(subject = %subject, error = %e, "Failed to nak message");
                }
            }
            Outcome::Rejected => {}
        }
    }
}

/// Counts pipelines that have started and not finished.
#[derive(Debug)]
pub(crate) struct InFlight {
    count: watch::Sender<usize>,
}

impl Default for InFlight {
    fn default() -> Self {
        Self {
            count: watch::channel(0).0,
        }
    }
}

impl InFlight {
    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.send_modify(|count| *count += 1);
        InFlightGuard(Arc::clone(self))
    }

    pub(crate) fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until nothing is in flight. Returns false if `grace` expired first.
    pub(crate) async fn wait_idle(&self, grace: Duration) -> bool {
        let mut rx = self.count.subscribe();
        // Bound to a local so the `wait_for` guard drops before `rx`
        #[allow(clippy::let_and_return)]
        let idle = tokio::time::timeout(grace, rx.wait_for(|count| *count == 0))
            .await
            .is_ok();
        idle
    }
}

/// Decrements the in-flight count on drop.
pub(crate) struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.count.send_modify(|count| *count = count.saturating_sub(1));
    }
}
