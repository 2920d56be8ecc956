//! Service registration and topic routing.
//!
//! Topics follow `<service>.<action...>`. The [`Router`] resolves the
//! leading segment against the [`ServiceStore`] and dispatches to the
//! service's [`MessageHandler`] capability.

mod router;
mod store;

pub use router::Router;
pub use store::{normalize_name, validate_name, ServiceStore};

use async_trait::async_trait;

use crate::context::MessageContext;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::middleware::HandlerFn;

/// Business logic for messages addressed to a service.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: MessageContext, subject: &str, envelope: Envelope) -> Result<()>;
}

/// A named unit registered with the application.
///
/// Services that do not handle messages return `None` from
/// [`Service::as_message_handler`]; routing to them is an error.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    fn as_message_handler(&self) -> Option<&dyn MessageHandler> {
        None
    }
}

/// Service backed by a [`HandlerFn`].
pub struct HandlerService {
    name: String,
    handler: HandlerFn,
}

impl HandlerService {
    pub fn new(name: impl Into<String>, handler: HandlerFn) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl MessageHandler for HandlerService {
    async fn handle(&self, ctx: MessageContext, subject: &str, envelope: Envelope) -> Result<()> {
        (self.handler)(ctx, subject.to_string(), envelope).await
    }
}

impl Service for HandlerService {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_message_handler(&self) -> Option<&dyn MessageHandler> {
        Some(self)
    }
}
