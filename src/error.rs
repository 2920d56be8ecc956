//! Error types for messaging operations.

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur while connecting, publishing, subscribing or routing.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    // Configuration / validation: surfaced before any network effect.
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Conflicting authentication methods configured: {0}")]
    ConflictingAuth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed for message type '{message_type}': {reason}")]
    Validation {
        message_type: String,
        reason: String,
    },

    // Connectivity
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection closed")]
    Closed,

    #[error("No responders on subject '{0}'")]
    NoResponders(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    // Serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Routing
    #[error(transparent)]
    Route(#[from] RouteError),

    // Business handler failures
    #[error("Handler failed: {0}")]
    Handler(String),
}

impl MessagingError {
    /// Construct a handler error from any displayable value.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Self::Handler(message.to_string())
    }

    /// Returns true if the underlying connection is gone for good.
    ///
    /// Pull loops stop on terminal errors instead of backing off.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::NotConnected)
    }
}

/// Errors produced while resolving a topic to a registered service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Invalid topic format: '{0}'")]
    InvalidFormat(String),

    #[error("Service '{0}' not found")]
    NotFound(String),

    #[error("Service '{0}' does not handle messages")]
    NotMessageHandler(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(MessagingError::Closed.is_terminal());
        assert!(MessagingError::NotConnected.is_terminal());
        assert!(!MessagingError::Transport("boom".to_string()).is_terminal());
        assert!(!MessagingError::Timeout(std::time::Duration::from_secs(1)).is_terminal());
    }

    #[test]
    fn test_route_error_converts() {
        let err: MessagingError = RouteError::NotFound("orders".to_string()).into();
        assert!(matches!(err, MessagingError::Route(RouteError::NotFound(_))));
        assert_eq!(err.to_string(), "Service 'orders' not found");
    }
}
