//! Bootstrap utilities for courier binaries.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;
use crate::error::{MessagingError, Result};
use crate::messenger::Messenger;

/// Initialize tracing with the COURIER_LOG environment variable.
///
/// Defaults to "info" level if COURIER_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Backoff for broker connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Whether a failed connect is worth retrying.
///
/// Configuration problems never fix themselves; network failures might.
pub fn is_retryable_connect_error(err: &MessagingError) -> bool {
    matches!(
        err,
        MessagingError::Connection(_) | MessagingError::Timeout(_) | MessagingError::Transport(_)
    )
}

/// Connect `messenger`, retrying transient failures with `backoff`.
pub async fn connect_with_retry(messenger: &Messenger, backoff: ExponentialBuilder) -> Result<()> {
    (|| messenger.connect())
        .retry(backoff)
        .when(is_retryable_connect_error)
        .notify(|err: &MessagingError, delay: Duration| {
            warn!(name = %messenger.name(), error = %err, delay = ?delay, "Connection failed, retrying");
        })
        .await
}
