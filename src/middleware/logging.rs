//! Logging middleware.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use super::{handler_fn, publish_fn, HandlerFn, Middleware, PublishFn};

/// Logs every publish and every handled message after the wrapped call.
///
/// Success is logged at `debug`, failure at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

impl Middleware<PublishFn> for LoggingMiddleware {
    fn wrap(&self, next: PublishFn) -> PublishFn {
        publish_fn(move |ctx, outbound| {
            let next = Arc::clone(&next);
            async move {
                let subject = outbound.subject.clone();
                let message_type = outbound.envelope.message_type().to_string();
                let id = outbound.envelope.id().to_string();
                let source = outbound.envelope.source().to_string();
                let mode = outbound.mode.name();

                let start = Instant::now();
                let result = next(ctx, outbound).await;
                let elapsed = start.elapsed();

                match &result {
                    Ok(_) => debug!(
                        subject = %subject,
                        message_type = %message_type,
                        id = %id,
                        source = %source,
                        mode,
                        elapsed = ?elapsed,
                        "Message published"
                    ),
                    Err(e) => error!(
                        subject = %subject,
                        message_type = %message_type,
                        id = %id,
                        source = %source,
                        mode,
                        elapsed = ?elapsed,
                        error = %e,
                        "Publish failed"
                    ),
                }
                result
            }
        })
    }
}

impl Middleware<HandlerFn> for LoggingMiddleware {
    fn wrap(&self, next: HandlerFn) -> HandlerFn {
        handler_fn(move |ctx, subject, envelope| {
            let next = Arc::clone(&next);
            async move {
                let message_type = envelope.message_type().to_string();
                let id = envelope.id().to_string();
                let source = envelope.source().to_string();
                let logged_subject = subject.clone();

                let start = Instant::now();
                let result = next(ctx, subject, envelope).await;
                let elapsed = start.elapsed();

                match &result {
                    Ok(()) => debug!(
                        subject = %logged_subject,
                        message_type = %message_type,
                        id = %id,
                        source = %source,
                        elapsed = ?elapsed,
                        "Message handled"
                    ),
                    Err(e) => error!(
                        subject = %logged_subject,
                        message_type = %message_type,
                        id = %id,
                        source = %source,
                        elapsed = ?elapsed,
                        error = %e,
                        "Handler failed"
                    ),
                }
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

    #[tokio::test]
    async fn test_logging_passes_result_through() {
        let ok = handler_fn(|_, _, _| async { Ok(()) });
        let failing = handler_fn(|_, _, _| async { Err(MessagingError::handler("nope")) });

        let ok = Middleware::<HandlerFn>::wrap(&LoggingMiddleware, ok);
        let failing = Middleware::<HandlerFn>::wrap(&LoggingMiddleware, failing);

        let env = || Envelope::from_data("t", "s", &1).unwrap();
        assert!(ok(MessageContext::new(), "a".to_string(), env()).await.is_ok());
        assert!(matches!(
            failing(MessageContext::new(), "a".to_string(), env()).await,
            Err(MessagingError::Handler(_))
        ));
    }
}
