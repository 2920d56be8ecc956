//! Metrics middleware.
//!
//! Emits, for send and receive independently:
//! - `courier.messages.published.total` / `courier.messages.received.total`
//!   counters labeled subject, type, outcome
//! - `courier.messages.publish.duration` / `courier.messages.receive.duration`
//!   histograms (seconds) labeled subject, type

use std::sync::Arc;
use std::time::Instant;

use super::{handler_fn, publish_fn, HandlerFn, Middleware, PublishFn};
use crate::telemetry::{
    outcome_label, subject_label, type_label, MetricsSink, PUBLISHED_TOTAL, PUBLISH_DURATION,
    RECEIVED_TOTAL, RECEIVE_DURATION,
};

/// Records counters and duration histograms into a [`MetricsSink`].
#[derive(Clone)]
pub struct MetricsMiddleware {
    sink: Arc<dyn MetricsSink>,
}

impl MetricsMiddleware {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

fn record(
    sink: &dyn MetricsSink,
    counter: &'static str,
    histogram: &'static str,
    subject: &str,
    message_type: &str,
    success: bool,
    start: Instant,
) {
    sink.observe_histogram(
        histogram,
        start.elapsed().as_secs_f64(),
        &[subject_label(subject), type_label(message_type)],
    );
    sink.increment_counter(
        counter,
        &[
            subject_label(subject),
            type_label(message_type),
            outcome_label(success),
        ],
    );
}

impl Middleware<PublishFn> for MetricsMiddleware {
    fn wrap(&self, next: PublishFn) -> PublishFn {
        let sink = Arc::clone(&self.sink);
        publish_fn(move |ctx, outbound| {
            let next = Arc::clone(&next);
            let sink = Arc::clone(&sink);
            async move {
                let subject = outbound.subject.clone();
                let message_type = outbound.envelope.message_type().to_string();
                let start = Instant::now();

                let result = next(ctx, outbound).await;

                record(
                    sink.as_ref(),
                    PUBLISHED_TOTAL,
                    PUBLISH_DURATION,
                    &subject,
                    &message_type,
                    result.is_ok(),
                    start,
                );
                result
            }
        })
    }
}

impl Middleware<HandlerFn> for MetricsMiddleware {
    fn wrap(&self, next: HandlerFn) -> HandlerFn {
        let sink = Arc::clone(&self.sink);
        handler_fn(move |ctx, subject, envelope| {
            let next = Arc::clone(&next);
            let sink = Arc::clone(&sink);
            async move {
                let labeled_subject = subject.clone();
                let message_type = envelope.message_type().to_string();
                let start = Instant::now();

                let result = next(ctx, subject, envelope).await;

                record(
                    sink.as_ref(),
                    RECEIVED_TOTAL,
                    RECEIVE_DURATION,
                    &labeled_subject,
                    &message_type,
                    result.is_ok(),
                    start,
                );
                result
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MessageContext;
    use crate::envelope::Envelope;
    use crate::error::MessagingError;
    use crate::test_utils::RecordingMetrics;

    #[tokio::test]
    async fn test_receive_metrics_labeled_by_outcome() {
        let metrics = Arc::new(RecordingMetrics::default());
        let middleware = MetricsMiddleware::new(metrics.clone());

        let ok: HandlerFn = middleware.wrap(handler_fn(|_, _, _| async { Ok(()) }));
        let failing: HandlerFn =
            middleware.wrap(handler_fn(|_, _, _| async { Err(MessagingError::handler("x")) }));

        let env = || Envelope::from_data("order.created", "orders", &1).unwrap();
        ok(MessageContext::new(), "orders.created".to_string(), env())
            .await
            .unwrap();
        let _ = failing(MessageContext::new(), "orders.created".to_string(), env()).await;

        assert_eq!(
            metrics.counter(RECEIVED_TOTAL, &[("outcome", "success")]),
            1
        );
        assert_eq!(metrics.counter(RECEIVED_TOTAL, &[("outcome", "error")]), 1);
        assert_eq!(
            metrics.counter(RECEIVED_TOTAL, &[("type", "order.created")]),
            2
        );
        assert_eq!(metrics.observations(RECEIVE_DURATION), 2);
        assert_eq!(metrics.counter(PUBLISHED_TOTAL, &[]), 0);
    }
}
