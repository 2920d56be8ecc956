//! Application host.
//!
//! An [`Application`] owns a [`Messenger`] and a set of registered services.
//! It is either Dormant or Active:
//!
//! - Dormant + start: subscribe `<svc>` and `<svc>.>` for every
//!   message-handling service, queue group = application name, then Active.
//! - Active + stop: drop the business subscriptions, then Dormant.
//! - Any other combination is a no-op.
//!
//! Signals arrive on a bounded queue from the `<app>.start` / `<app>.stop`
//! control topics or from [`AppHandle`]. The control subscription also
//! answers `<app>.health.liveness` and `<app>.health.readiness`.
//!
//! Messages that fail routing or handling and carry a reply subject get an
//! `error` envelope back with `{"error": <message>}`.

mod control;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::envelope::{PublishOptions, SubscribeOptions};
use crate::error::{MessagingError, Result};
use crate::messenger::Messenger;
use crate::middleware::{handler_fn, HandlerFn};
use crate::service::{normalize_name, validate_name, Router, Service, ServiceStore};
use crate::subscriber::Subscriber;

use control::ControlService;

/// Envelope type of health replies.
pub const HEALTH_STATUS_TYPE: &str = "health.status";
/// Envelope type of error replies.
pub const ERROR_TYPE: &str = "error";

const SIGNAL_QUEUE_CAPACITY: usize = 16;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Dormant,
    Active,
}

/// Data of a `health.status` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// `ok` or `unavailable`.
    pub status: String,
    pub state: AppState,
    pub connected: bool,
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Data of an `error` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

#[derive(Debug)]
pub(crate) enum Signal {
    Start,
    Stop,
    Shutdown,
}

/// Hosts services on a messenger.
pub struct Application {
    name: String,
    messenger: Arc<Messenger>,
    services: Arc<ServiceStore>,
    auto_start: bool,
}

impl Application {
    /// The name is normalized like a service name. It prefixes the control
    /// topics and is the queue group of business subscriptions.
    pub fn new(name: impl Into<String>, messenger: Arc<Messenger>) -> Self {
        Self {
            name: normalize_name(&name.into()),
            messenger,
            services: Arc::new(ServiceStore::new()),
            auto_start: false,
        }
    }

    /// Activate as soon as [`Application::run`] completes.
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &Arc<ServiceStore> {
        &self.services
    }

    /// Register a service. The application name is reserved for control topics.
    pub fn register(&self, service: Arc<dyn Service>) -> Result<()> {
        if normalize_name(service.name()) == self.name {
            return Err(MessagingError::Config(format!(
                "Service name '{}' is reserved for application control",
                self.name
            )));
        }
        self.services.add(service)
    }

    pub fn unregister(&self, name: &str) -> bool {
        normalize_name(name) != self.name && self.services.delete(name).is_some()
    }

    /// Connect, subscribe the control topics and start the lifecycle task.
    pub async fn run(self) -> Result<AppHandle> {
        if self.name.is_empty() {
            return Err(MessagingError::Config(
                "Application name must not be empty".to_string(),
            ));
        }
        validate_name(&self.name)?;
        self.messenger.connect().await?;

        let (state_tx, state_rx) = watch::channel(AppState::Dormant);
        let (signals, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        let router = Router::new(Arc::clone(&self.services));

        self.services.add(Arc::new(ControlService::new(
            self.name.clone(),
            signals.clone(),
            state_rx.clone(),
            Arc::clone(&self.messenger),
        )))?;
        self.messenger
            .subscriber()
            .subscribe(
                &format!("{}.>", self.name),
                dispatcher(router.clone(), Arc::clone(&self.messenger)),
                SubscribeOptions::default(),
            )
            .await?;

        let lifecycle = Lifecycle {
            name: self.name.clone(),
            business: self.messenger.new_subscriber(),
            dispatch: dispatcher(router, Arc::clone(&self.messenger)),
            services: Arc::clone(&self.services),
            state: state_tx,
        };
        let task = tokio::spawn(lifecycle.run(signal_rx));

        if self.auto_start {
            signals
                .send(Signal::Start)
                .await
                .map_err(|_| MessagingError::Closed)?;
        }

        info!(app = %self.name, auto_start = self.auto_start, "Application running");
        Ok(AppHandle {
            name: self.name,
            messenger: self.messenger,
            services: self.services,
            signals,
            state: state_rx,
            task,
        })
    }
}

/// Control over a running [`Application`].
pub struct AppHandle {
    name: String,
    messenger: Arc<Messenger>,
    services: Arc<ServiceStore>,
    signals: mpsc::Sender<Signal>,
    state: watch::Receiver<AppState>,
    task: JoinHandle<()>,
}

impl AppHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AppState {
        *self.state.borrow()
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    /// Registered services. Changes take effect on the next activation.
    pub fn services(&self) -> &Arc<ServiceStore> {
        &self.services
    }

    pub async fn start(&self) -> Result<()> {
        self.signal(Signal::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.signal(Signal::Stop).await
    }

    async fn signal(&self, signal: Signal) -> Result<()> {
        self.signals
            .send(signal)
            .await
            .map_err(|_| MessagingError::Closed)
    }

    /// Wait until the application reaches `target`. False on timeout.
    pub async fn wait_for_state(&self, target: AppState, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, state.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Stop business subscriptions, then close the messenger.
    pub async fn shutdown(self) -> Result<()> {
        info!(app = %self.name, "Shutting down application");
        if self.signals.send(Signal::Shutdown).await.is_err() {
            debug!(app = %self.name, "Lifecycle task already stopped");
        }
        if let Err(e) = self.task.await {
            warn!(app = %self.name, error = %e, "Lifecycle task panicked");
        }
        self.services.delete(&self.name);
        self.messenger.close().await
    }
}

struct Lifecycle {
    name: String,
    business: Subscriber,
    dispatch: HandlerFn,
    services: Arc<ServiceStore>,
    state: watch::Sender<AppState>,
}

impl Lifecycle {
    async fn run(self, mut signals: mpsc::Receiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            let current = *self.state.borrow();
            match (current, signal) {
                (AppState::Dormant, Signal::Start) => self.activate().await,
                (AppState::Active, Signal::Stop) => self.deactivate().await,
                (_, Signal::Shutdown) => break,
                (state, signal) => {
                    debug!(app = %self.name, ?state, ?signal, "Ignoring lifecycle signal")
                }
            }
        }

        let active = *self.state.borrow() == AppState::Active;
        if active {
            self.deactivate().await;
        }
        if let Err(e) = self.business.close().await {
            warn!(app = %self.name, error = %e, "Failed to close business subscriber");
        }
        debug!(app = %self.name, "Lifecycle stopped");
    }

    async fn activate(&self) {
        match self.subscribe_services().await {
            Ok(count) => {
                self.state.send_replace(AppState::Active);
                info!(app = %self.name, subscriptions = count, "Application active");
            }
            Err(e) => {
                error!(app = %self.name, error = %e, "Activation failed, staying dormant");
                if let Err(e) = self.business.unsubscribe().await {
                    warn!(app = %self.name, error = %e, "Failed to roll back subscriptions");
                }
            }
        }
    }

    async fn subscribe_services(&self) -> Result<usize> {
        let opts = SubscribeOptions::default().with_queue_group(self.name.clone());
        for name in self.services.list() {
            if name == self.name {
                continue;
            }
            let handles_messages = self
                .services
                .get(&name)
                .is_some_and(|service| service.as_message_handler().is_some());
            if !handles_messages {
                debug!(app = %self.name, service = %name, "Service does not handle messages");
                continue;
            }

            self.business
                .subscribe(&name, Arc::clone(&self.dispatch), opts.clone())
                .await?;
            self.business
                .subscribe(&format!("{}.>", name), Arc::clone(&self.dispatch), opts.clone())
                .await?;
        }
        Ok(self.business.subscription_count().await)
    }

    async fn deactivate(&self) {
        if let Err(e) = self.business.unsubscribe().await {
            warn!(app = %self.name, error = %e, "Failed to unsubscribe business subjects");
        }
        self.state.send_replace(AppState::Dormant);
        info!(app = %self.name, "Application dormant");
    }
}

/// Route through `router`; failed messages with a reply subject get an error reply.
fn dispatcher(router: Router, messenger: Arc<Messenger>) -> HandlerFn {
    handler_fn(move |ctx, subject, envelope| {
        let router = router.clone();
        let messenger = Arc::clone(&messenger);
        async move {
            let reply_to = envelope.reply().map(str::to_string);
            let result = router.handle_message(ctx.clone(), &subject, envelope).await;

            if let (Err(e), Some(reply_to)) = (&result, reply_to) {
                let reply = ErrorReply {
                    error: e.to_string(),
                };
                if let Err(send_err) = messenger
                    .publisher()
                    .publish(&ctx, &reply_to, ERROR_TYPE, &reply, PublishOptions::default())
                    .await
                {
                    warn!(subject = %subject, error = %send_err, "Failed to send error reply");
                }
            }
            result
        }
    })
}

#[cfg(test)]
mod tests;
