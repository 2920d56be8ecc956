//! Messaging facade.
//!
//! Wires the connection manager, publisher and subscriber together and
//! installs the built-in middleware selected by [`MiddlewareConfig`].
//! Tracing is registered first so logging and metrics run inside the span.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{MessagingConfig, MiddlewareConfig};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::middleware::{LoggingMiddleware, MetricsMiddleware, TracingMiddleware};
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;
use crate::telemetry::Telemetry;
use crate::transport::Transport;
use crate::validation::Validator;

/// Builder for [`Messenger`].
pub struct MessengerBuilder {
    config: MessagingConfig,
    telemetry: Telemetry,
    validator: Option<Arc<dyn Validator>>,
    transport: Option<Arc<dyn Transport>>,
}

impl MessengerBuilder {
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Use an already-open transport instead of connecting.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Messenger {
        let connection = match self.transport {
            Some(transport) => {
                ConnectionManager::with_transport(self.config.connection.clone(), transport)
            }
            None => ConnectionManager::new(self.config.connection.clone()),
        }
        .with_persistence(self.config.persistence.clone());
        let connection = Arc::new(connection);

        let mut publisher =
            Publisher::new(Arc::clone(&connection)).with_telemetry(self.telemetry.clone());
        if let Some(validator) = &self.validator {
            publisher = publisher.with_validator(Arc::clone(validator));
        }
        install_publish_middleware(&publisher, &self.config.middleware, &self.telemetry);

        let subscriber = configured_subscriber(
            Arc::clone(&connection),
            &self.config,
            &self.telemetry,
            self.validator.as_ref(),
        );

        Messenger {
            config: self.config,
            connection,
            publisher: Arc::new(publisher),
            subscriber: Arc::new(subscriber),
            telemetry: self.telemetry,
            validator: self.validator,
        }
    }
}

fn configured_subscriber(
    connection: Arc<ConnectionManager>,
    config: &MessagingConfig,
    telemetry: &Telemetry,
    validator: Option<&Arc<dyn Validator>>,
) -> Subscriber {
    let mut subscriber = Subscriber::new(connection)
        .with_telemetry(telemetry.clone())
        .with_settings(config.subscriber.clone());
    if let Some(validator) = validator {
        subscriber = subscriber.with_validator(Arc::clone(validator));
    }
    install_handler_middleware(&subscriber, &config.middleware, telemetry);
    subscriber
}

fn install_publish_middleware(
    publisher: &Publisher,
    toggles: &MiddlewareConfig,
    telemetry: &Telemetry,
) {
    if toggles.tracing {
        publisher.use_middleware(TracingMiddleware::new(Arc::clone(&telemetry.propagator)));
    }
    if toggles.metrics {
        publisher.use_middleware(MetricsMiddleware::new(Arc::clone(&telemetry.metrics)));
    }
    if toggles.logging {
        publisher.use_middleware(LoggingMiddleware);
    }
}

fn install_handler_middleware(
    subscriber: &Subscriber,
    toggles: &MiddlewareConfig,
    telemetry: &Telemetry,
) {
    if toggles.tracing {
        subscriber.use_middleware(TracingMiddleware::new(Arc::clone(&telemetry.propagator)));
    }
    if toggles.metrics {
        subscriber.use_middleware(MetricsMiddleware::new(Arc::clone(&telemetry.metrics)));
    }
    if toggles.logging {
        subscriber.use_middleware(LoggingMiddleware);
    }
}

/// Connection, publisher and subscriber configured from one [`MessagingConfig`].
pub struct Messenger {
    config: MessagingConfig,
    connection: Arc<ConnectionManager>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    telemetry: Telemetry,
    validator: Option<Arc<dyn Validator>>,
}

impl Messenger {
    pub fn builder(config: MessagingConfig) -> MessengerBuilder {
        MessengerBuilder {
            config,
            telemetry: Telemetry::default(),
            validator: None,
            transport: None,
        }
    }

    /// Messenger with no-op telemetry and no validator.
    pub fn new(config: MessagingConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Client name; the envelope `source` of everything this messenger sends.
    pub fn name(&self) -> &str {
        &self.config.connection.name
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Default timeout for request/reply.
    pub fn request_timeout(&self) -> Duration {
        self.config.connection.request_timeout()
    }

    /// An additional subscriber on the same connection with the same
    /// middleware, validator and settings. Useful for subscription sets
    /// that are started and stopped independently.
    pub fn new_subscriber(&self) -> Subscriber {
        configured_subscriber(
            Arc::clone(&self.connection),
            &self.config,
            &self.telemetry,
            self.validator.as_ref(),
        )
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Close the subscriber (bounded wait for handlers), then the connection.
    pub async fn close(&self) -> Result<()> {
        self.subscriber.close().await?;
        self.connection.close().await?;
        info!(name = %self.name(), "Messenger closed");
        Ok(())
    }
}
