//! Tracing middleware.
//!
//! Send side: opens a producer span, injects its context into the envelope
//! metadata and runs the wrapped publish inside it.
//!
//! Receive side: opens a consumer span parented on the context extracted
//! from the metadata and hands the handler a context carrying that span.
//!
//! Failures are recorded on the span (`otel.status_code`, `error`) before it
//! closes.

use std::sync::Arc;

use tracing::field::Empty;
use tracing::{info_span, Instrument, Span};

use super::{handler_fn, publish_fn, HandlerFn, Middleware, PublishFn};
use crate::error::MessagingError;
use crate::telemetry::TracePropagator;

/// Opens producer/consumer spans and propagates context through metadata.
#[derive(Clone)]
pub struct TracingMiddleware {
    propagator: Arc<dyn TracePropagator>,
}

impl TracingMiddleware {
    pub fn new(propagator: Arc<dyn TracePropagator>) -> Self {
        Self { propagator }
    }
}

fn record_error(span: &Span, error: &MessagingError) {
    span.record("otel.status_code", "ERROR");
    span.record("error", tracing::field::display(error));
}

impl Middleware<PublishFn> for TracingMiddleware {
    fn wrap(&self, next: PublishFn) -> PublishFn {
        let propagator = Arc::clone(&self.propagator);
        publish_fn(move |ctx, mut outbound| {
            let next = Arc::clone(&next);
            let propagator = Arc::clone(&propagator);
            async move {
                let span = info_span!(
                    parent: ctx.span(),
                    "messaging.publish",
                    otel.kind = "producer",
                    messaging.destination = %outbound.subject,
                    message_type = %outbound.envelope.message_type(),
                    messaging.message.id = %outbound.envelope.id(),
                    messaging.operation = outbound.mode.name(),
                    otel.status_code = Empty,
                    error = Empty,
                );
                propagator.inject(&span, outbound.envelope.metadata_mut());

                let ctx = ctx.with_span(span.clone());
                let result = next(ctx, outbound).instrument(span.clone()).await;
                if let Err(e) = &result {
                    record_error(&span, e);
                }
                result
            }
        })
    }
}

impl Middleware<HandlerFn> for TracingMiddleware {
    fn wrap(&self, next: HandlerFn) -> HandlerFn {
        let propagator = Arc::clone(&self.propagator);
        handler_fn(move |ctx, subject, envelope| {
            let next = Arc::clone(&next);
            let propagator = Arc::clone(&propagator);
            async move {
                let span = info_span!(
                    parent: ctx.span(),
                    "messaging.receive",
                    otel.kind = "consumer",
                    messaging.destination = %subject,
                    message_type = %envelope.message_type(),
                    messaging.message.id = %envelope.id(),
                    messaging.source = %envelope.source(),
                    otel.status_code = Empty,
                    error = Empty,
                );
                propagator.extract(envelope.metadata(), &span);

                let ctx = ctx.with_span(span.clone());
                let result = next(ctx, subject, envelope).instrument(span.clone()).await;
                if let Err(e) = &result {
                    record_error(&span, e);
                }
                result
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::context::MessageContext;
    use crate::envelope::Envelope;
    use crate::middleware::{Outbound, SendMode, SendOutcome};
    use crate::envelope::PublishOptions;

    /// Writes a fixed marker so propagation is observable without OTel.
    struct MarkerPropagator;

    impl TracePropagator for MarkerPropagator {
        fn inject(&self, _span: &Span, carrier: &mut HashMap<String, String>) {
            carrier.insert("traceparent".to_string(), "marker".to_string());
        }

        fn extract(&self, _carrier: &HashMap<String, String>, _span: &Span) {}
    }

    #[tokio::test]
    async fn test_publish_injects_metadata() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let captured = Arc::clone(&seen);
        let core = publish_fn(move |_ctx, outbound: Outbound| {
            let captured = Arc::clone(&captured);
            async move {
                *captured.lock().unwrap() = outbound.envelope.metadata().get("traceparent").cloned();
                Ok(SendOutcome::Sent)
            }
        });

        let middleware = TracingMiddleware::new(Arc::new(MarkerPropagator));
        let chain: PublishFn = middleware.wrap(core);

        let outbound = Outbound {
            subject: "orders.created".to_string(),
            envelope: Envelope::from_data("order.created", "orders", &1).unwrap(),
            mode: SendMode::Publish(PublishOptions::default()),
        };
        chain(MessageContext::new(), outbound).await.unwrap();

        assert_eq!(seen.lock().unwrap().as_deref(), Some("marker"));
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let middleware = TracingMiddleware::new(Arc::new(MarkerPropagator));
        let chain: HandlerFn = middleware.wrap(handler_fn(|_, _, _| async {
            Err(MessagingError::handler("failed"))
        }));

        let env = Envelope::from_data("t", "s", &1).unwrap();
        assert!(matches!(
            chain(MessageContext::new(), "x".to_string(), env).await,
            Err(MessagingError::Handler(_))
        ));
    }
}
