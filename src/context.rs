//! Per-call context threaded through publish and handler pipelines.

use std::time::Duration;

use tokio::time::Instant;

/// Context carried alongside every publish call and every delivered message.
///
/// Holds the active tracing span (the cross-cutting parent for anything the
/// call does) and an optional deadline used by `request`.
#[derive(Debug, Clone)]
pub struct MessageContext {
    span: tracing::Span,
    deadline: Option<Instant>,
}

impl Default for MessageContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageContext {
    /// Context parented on whatever span is current for the caller.
    pub fn new() -> Self {
        Self {
            span: tracing::Span::current(),
            deadline: None,
        }
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Effective deadline for an operation bounded by `timeout`.
    ///
    /// The earlier of the context deadline and `now + timeout` wins.
    pub fn effective_deadline(&self, timeout: Duration) -> Instant {
        let local = Instant::now() + timeout;
        match self.deadline {
            Some(deadline) if deadline < local => deadline,
            _ => local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_effective_deadline_prefers_earlier_context_deadline() {
        let ctx = MessageContext::new().with_timeout(Duration::from_millis(10));
        let deadline = ctx.effective_deadline(Duration::from_secs(60));
        assert_eq!(Some(deadline), ctx.deadline());
    }

    #[tokio::test]
    async fn test_effective_deadline_prefers_earlier_timeout() {
        let ctx = MessageContext::new().with_timeout(Duration::from_secs(60));
        let deadline = ctx.effective_deadline(Duration::from_millis(10));
        assert!(deadline < ctx.deadline().unwrap());
    }

    #[tokio::test]
    async fn test_effective_deadline_without_context_deadline() {
        let ctx = MessageContext::new();
        let before = Instant::now();
        let deadline = ctx.effective_deadline(Duration::from_secs(1));
        assert!(deadline >= before + Duration::from_secs(1));
    }
}
