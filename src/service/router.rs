//! Topic to service resolution.

use std::sync::Arc;

use tracing::debug;

use super::{Service, ServiceStore};
use crate::context::MessageContext;
use crate::envelope::Envelope;
use crate::error::{Result, RouteError};

/// Routes `<service>.<action...>` topics to registered services.
///
/// The router never replies and never retries; errors go back to the caller.
#[derive(Clone)]
pub struct Router {
    services: Arc<ServiceStore>,
}

impl Router {
    pub fn new(services: Arc<ServiceStore>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<ServiceStore> {
        &self.services
    }

    /// Resolve the service addressed by `topic`.
    ///
    /// A topic without `.` is accepted only when it names a registered
    /// service directly.
    pub fn resolve(&self, topic: &str) -> std::result::Result<Arc<dyn Service>, RouteError> {
        if topic.trim().is_empty() {
            return Err(RouteError::InvalidFormat(topic.to_string()));
        }

        let name = match topic.split_once('.') {
            Some((name, _)) if name.trim().is_empty() => {
                return Err(RouteError::InvalidFormat(topic.to_string()))
            }
            Some((name, _)) => name,
            None => {
                return self
                    .services
                    .get(topic)
                    .ok_or_else(|| RouteError::InvalidFormat(topic.to_string()))
            }
        };

        self.services
            .get(name)
            .ok_or_else(|| RouteError::NotFound(name.to_string()))
    }

    /// Resolve `subject` and hand the message to the service's handler.
    /// Handler errors are returned unchanged.
    pub async fn handle_message(
        &self,
        ctx: MessageContext,
        subject: &str,
        envelope: Envelope,
    ) -> Result<()> {
        let service = self.resolve(subject)?;
        let handler = service
            .as_message_handler()
            .ok_or_else(|| RouteError::NotMessageHandler(service.name().to_string()))?;

        debug!(subject = %subject, service = %service.name(), "Dispatching message");
        handler.handle(ctx, subject, envelope).await
    }
}
