//! Broker connection lifecycle.
//!
//! `ConnectionManager` owns the transport for one client: it validates
//! configuration, opens the connection, memoizes the persistent context and
//! closes everything exactly once. Publishers and subscribers share it
//! through an `Arc`.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{ConnectionConfig, PersistenceConfig, TransportType};
use crate::error::{MessagingError, Result};
use crate::transport::{ChannelTransport, PersistentContext, Transport};

/// Owns the broker connection and the lazily created persistent context.
pub struct ConnectionManager {
    config: ConnectionConfig,
    persistence: PersistenceConfig,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Serializes connect/close and guards the memoized persistent context.
    persistent: Mutex<Option<Arc<dyn PersistentContext>>>,
}

impl ConnectionManager {
    /// Create an unconnected manager.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            persistence: PersistenceConfig::default(),
            transport: RwLock::new(None),
            persistent: Mutex::new(None),
        }
    }

    /// Adopt an already-open transport.
    ///
    /// Lets several managers share one in-process broker.
    pub fn with_transport(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let manager = Self::new(config);
        *manager.write_slot() = Some(transport);
        manager
    }

    /// Settings used when the persistent context is first created.
    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn persistence(&self) -> &PersistenceConfig {
        &self.persistence
    }

    fn read_slot(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<dyn Transport>>> {
        self.transport.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn Transport>>> {
        self.transport.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Establish the connection. No-op when already connected.
    ///
    /// Configuration is validated before any network call.
    #[tracing::instrument(name = "connection.connect", skip_all, fields(name = %self.config.name))]
    pub async fn connect(&self) -> Result<()> {
        let mut persistent = self.persistent.lock().await;
        if self.is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        self.config.validate()?;

        let transport: Arc<dyn Transport> = match self.config.transport_type {
            TransportType::Channel => Arc::new(ChannelTransport::new()),
            TransportType::Nats => connect_nats(&self.config).await?,
        };

        info!(transport = transport.kind(), "Messaging connection established");
        *self.write_slot() = Some(transport);
        // A context built on a previous connection is stale
        *persistent = None;
        Ok(())
    }

    /// Non-blocking liveness probe.
    pub fn is_connected(&self) -> bool {
        self.read_slot()
            .as_ref()
            .is_some_and(|transport| transport.is_connected())
    }

    /// The open transport, or `NotConnected`.
    pub fn transport(&self) -> Result<Arc<dyn Transport>> {
        match self.read_slot().as_ref() {
            Some(transport) if transport.is_connected() => Ok(Arc::clone(transport)),
            _ => Err(MessagingError::NotConnected),
        }
    }

    /// Persistent context, created on first use.
    ///
    /// Creation ensures every configured stream exists.
    pub async fn persistent_context(&self) -> Result<Arc<dyn PersistentContext>> {
        let mut slot = self.persistent.lock().await;
        let transport = self.transport()?;
        if let Some(context) = slot.as_ref() {
            return Ok(Arc::clone(context));
        }

        let context = transport.persistent(&self.persistence).await?;
        debug!(
            transport = transport.kind(),
            streams = self.persistence.streams.len(),
            "Persistent context initialized"
        );
        *slot = Some(Arc::clone(&context));
        Ok(context)
    }

    /// Flush and close the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut persistent = self.persistent.lock().await;
        let transport = self.write_slot().take();
        *persistent = None;

        let Some(transport) = transport else {
            return Ok(());
        };

        if transport.is_connected() {
            if let Err(e) = transport.flush().await {
                debug!(error = %e, "Flush before close failed");
            }
        }
        transport.close().await?;
        info!(transport = transport.kind(), "Messaging connection closed");
        Ok(())
    }
}

#[cfg(feature = "nats")]
async fn connect_nats(config: &ConnectionConfig) -> Result<Arc<dyn Transport>> {
    let transport = crate::transport::NatsTransport::connect(config).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "nats"))]
async fn connect_nats(_config: &ConnectionConfig) -> Result<Arc<dyn Transport>> {
    Err(MessagingError::Config(
        "NATS transport requires the 'nats' feature".to_string(),
    ))
}
