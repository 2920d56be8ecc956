//! Middleware composition for publish and handle paths.
//!
//! A middleware turns a function into another function of the same
//! signature. Registered `[m1, m2, .., mn]` produce the call graph
//! `m1 -> m2 -> .. -> mn -> core`: the list is folded in reverse so the
//! first registered middleware is outermost.
//!
//! Built-ins, each implemented for both paths:
//! - [`LoggingMiddleware`]: outcome and elapsed time per message
//! - [`MetricsMiddleware`]: counters and duration histograms
//! - [`TracingMiddleware`]: producer/consumer spans and context propagation
//!
//! Any `Fn(F) -> F` closure is also a middleware.

mod logging;
mod metrics;
mod trace;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::context::MessageContext;
use crate::envelope::{Envelope, PublishOptions};
use crate::error::Result;
use crate::transport::{PendingAck, PersistAck};

pub use logging::LoggingMiddleware;
pub use metrics::MetricsMiddleware;
pub use trace::TracingMiddleware;

/// How an outbound envelope is handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Core publish.
    Publish(PublishOptions),
    /// Request/reply bounded by `timeout`.
    Request { timeout: Duration },
    /// Persisted publish, wait for the broker ack.
    Persisted,
    /// Persisted publish, return a pending ack.
    PersistedAsync,
}

impl SendMode {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SendMode::Publish(_) => "publish",
            SendMode::Request { .. } => "request",
            SendMode::Persisted => "persisted",
            SendMode::PersistedAsync => "persisted_async",
        }
    }
}

/// An envelope on its way to the transport.
#[derive(Debug)]
pub struct Outbound {
    pub subject: String,
    pub envelope: Envelope,
    pub mode: SendMode,
}

/// Result of a send, by mode.
#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    Reply(Envelope),
    Persisted(PersistAck),
    Pending(PendingAck),
}

/// Publish-path function.
pub type PublishFn =
    Arc<dyn Fn(MessageContext, Outbound) -> BoxFuture<'static, Result<SendOutcome>> + Send + Sync>;

/// Handle-path function: `(ctx, subject, envelope)`.
pub type HandlerFn =
    Arc<dyn Fn(MessageContext, String, Envelope) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps a function of type `F` in another of the same type.
pub trait Middleware<F>: Send + Sync {
    fn wrap(&self, next: F) -> F;
}

impl<F, W> Middleware<F> for W
where
    W: Fn(F) -> F + Send + Sync,
{
    fn wrap(&self, next: F) -> F {
        self(next)
    }
}

/// Build the effective function: first middleware outermost.
pub fn compose<F>(middleware: &[Arc<dyn Middleware<F>>], core: F) -> F {
    middleware.iter().rev().fold(core, |next, m| m.wrap(next))
}

/// Wrap an async closure as a [`HandlerFn`].
pub fn handler_fn<H, Fut>(handler: H) -> HandlerFn
where
    H: Fn(MessageContext, String, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(
        move |ctx: MessageContext, subject: String, envelope: Envelope| -> BoxFuture<'static, Result<()>> {
            Box::pin(handler(ctx, subject, envelope))
        },
    )
}

/// Wrap an async closure as a [`PublishFn`].
pub fn publish_fn<P, Fut>(publish: P) -> PublishFn
where
    P: Fn(MessageContext, Outbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SendOutcome>> + Send + 'static,
{
    Arc::new(
        move |ctx: MessageContext, outbound: Outbound| -> BoxFuture<'static, Result<SendOutcome>> {
            Box::pin(publish(ctx, outbound))
        },
    )
}
