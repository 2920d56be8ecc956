//! Built-in control service answering `<app>.<action>` topics.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{AppState, HealthStatus, Signal, HEALTH_STATUS_TYPE};
use crate::context::MessageContext;
use crate::envelope::Envelope;
use crate::error::{MessagingError, Result};
use crate::messenger::Messenger;
use crate::service::{MessageHandler, Service};

pub(crate) struct ControlService {
    name: String,
    signals: mpsc::Sender<Signal>,
    state: watch::Receiver<AppState>,
    messenger: Arc<Messenger>,
}

impl ControlService {
    pub(crate) fn new(
        name: String,
        signals: mpsc::Sender<Signal>,
        state: watch::Receiver<AppState>,
        messenger: Arc<Messenger>,
    ) -> Self {
        Self {
            name,
            signals,
            state,
            messenger,
        }
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        self.signals.try_send(signal).map_err(|e| match e {
            mpsc::error::TrySendError::Full(signal) => {
                warn!(app = %self.name, ?signal, "Lifecycle signal queue full, dropping");
                MessagingError::handler("lifecycle signal queue full")
            }
            mpsc::error::TrySendError::Closed(_) => MessagingError::Closed,
        })
    }

    async fn reply_health(
        &self,
        ctx: &MessageContext,
        request: &Envelope,
        readiness: bool,
    ) -> Result<()> {
        let state = *self.state.borrow();
        let connected = self.messenger.is_connected();
        let ok = !readiness || (state == AppState::Active && connected);
        let status = HealthStatus {
            status: if ok { "ok" } else { "unavailable" }.to_string(),
            state,
            connected,
        };

        let sent = self
            .messenger
            .publisher()
            .reply(ctx, request, HEALTH_STATUS_TYPE, &status)
            .await?;
        if !sent {
            debug!(app = %self.name, "Health check without reply subject");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ControlService {
    async fn handle(&self, ctx: MessageContext, subject: &str, envelope: Envelope) -> Result<()> {
        let action = subject
            .strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or_default();

        match action {
            "start" => self.signal(Signal::Start),
            "stop" => self.signal(Signal::Stop),
            "health.liveness" => self.reply_health(&ctx, &envelope, false).await,
            "health.readiness" => self.reply_health(&ctx, &envelope, true).await,
            other => Err(MessagingError::handler(format!(
                "Unknown control action '{}'",
                other
            ))),
        }
    }
}

impl Service for ControlService {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_message_handler(&self) -> Option<&dyn MessageHandler> {
        Some(self)
    }
}
