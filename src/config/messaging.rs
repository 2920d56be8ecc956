//! Messaging connection and behaviour configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MessagingError, Result};

/// URL schemes accepted for the NATS transport.
const NATS_SCHEMES: &[&str] = &["nats", "tls", "ws", "wss"];

/// Transport type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// NATS broker (core + JetStream).
    #[default]
    Nats,
    /// In-process broker, no external dependencies.
    Channel,
}

/// Messaging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Broker connection.
    pub connection: ConnectionConfig,
    /// Middleware toggles.
    pub middleware: MiddlewareConfig,
    /// Persisted delivery defaults.
    pub persistence: PersistenceConfig,
    /// Subscriber behaviour.
    pub subscriber: SubscriberConfig,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transport type discriminator.
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    /// Broker URL (e.g., nats://localhost:4222).
    pub url: String,
    /// Logical client name. Also used as envelope source.
    pub name: String,
    /// Maximum reconnect attempts. `None` retries forever.
    pub max_reconnects: Option<usize>,
    /// Delay between reconnect attempts in milliseconds.
    pub reconnect_wait_ms: u64,
    /// Initial handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Default request/reply timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Authentication (at most one method).
    pub auth: AuthConfig,
    /// TLS material.
    pub tls: TlsConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport_type: TransportType::Nats,
            url: "nats://localhost:4222".to_string(),
            name: "courier".to_string(),
            max_reconnects: Some(60),
            reconnect_wait_ms: 2_000,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            auth: AuthConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Config for the in-process broker.
    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            transport_type: TransportType::Channel,
            url: "channel://local".to_string(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate URL, auth and TLS settings before any network call.
    pub fn validate(&self) -> Result<()> {
        if self.transport_type == TransportType::Nats {
            self.validate_url()?;
        }
        self.auth.validate()?;
        self.tls.validate()?;
        Ok(())
    }

    fn validate_url(&self) -> Result<()> {
        let invalid = |reason: &str| MessagingError::InvalidUrl {
            url: self.url.clone(),
            reason: reason.to_string(),
        };

        // A comma-separated list of servers is allowed
        for server in self.url.split(',').map(str::trim) {
            let parsed = url::Url::parse(server).map_err(|e| invalid(&e.to_string()))?;
            if !NATS_SCHEMES.contains(&parsed.scheme()) {
                return Err(invalid(&format!("unsupported scheme '{}'", parsed.scheme())));
            }
            if parsed.host_str().map_or(true, str::is_empty) {
                return Err(invalid("missing host"));
            }
        }
        Ok(())
    }
}

/// Resolved authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    CredentialsFile(PathBuf),
    Token(String),
    UserPassword { username: String, password: String },
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Path to a NATS credentials (.creds) file.
    pub credentials_file: Option<PathBuf>,
    /// Bearer token.
    pub token: Option<String>,
    /// Username for user/password authentication.
    pub username: Option<String>,
    /// Password for user/password authentication.
    pub password: Option<String>,
}

impl AuthConfig {
    /// Reject configurations that name more than one method.
    pub fn validate(&self) -> Result<()> {
        let mut configured = Vec::new();
        if self.credentials_file.is_some() {
            configured.push("credentials_file");
        }
        if self.token.is_some() {
            configured.push("token");
        }
        if self.username.is_some() || self.password.is_some() {
            configured.push("username/password");
        }
        if configured.len() > 1 {
            return Err(MessagingError::ConflictingAuth(configured.join(", ")));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(MessagingError::Config(
                "username and password must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Pick the method to use: credentials file > token > username/password.
    pub fn method(&self) -> AuthMethod {
        if let Some(path) = &self.credentials_file {
            return AuthMethod::CredentialsFile(path.clone());
        }
        if let Some(token) = &self.token {
            return AuthMethod::Token(token.clone());
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => AuthMethod::UserPassword {
                username: username.clone(),
                password: password.clone(),
            },
            _ => AuthMethod::None,
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Require TLS even if no certificates are configured.
    pub required: bool,
    /// CA certificate bundle (PEM).
    pub ca_file: Option<PathBuf>,
    /// Client certificate (PEM).
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM).
    pub key_file: Option<PathBuf>,
    /// Disable server certificate verification.
    pub insecure_skip_verify: bool,
}

impl TlsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(MessagingError::Config(
                "tls.cert_file and tls.key_file must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// True if any TLS setting is present.
    pub fn enabled(&self) -> bool {
        self.required
            || self.ca_file.is_some()
            || self.cert_file.is_some()
            || self.insecure_skip_verify
    }
}

/// Per-feature middleware toggles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Log every publish and delivery.
    pub logging: bool,
    /// Record counters and duration histograms.
    pub metrics: bool,
    /// Open producer/consumer spans and propagate trace context.
    pub tracing: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            logging: true,
            metrics: false,
            tracing: false,
        }
    }
}

/// A stream the persistent context ensures exists.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subjects captured by the stream (wildcards allowed).
    pub subjects: Vec<String>,
}

/// Persisted delivery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Maximum delivery attempts per message before the broker gives up.
    pub max_deliver: i64,
    /// How long the broker waits for an ack before redelivering, in milliseconds.
    pub ack_wait_ms: u64,
    /// Streams to create on first use of the persistent context.
    pub streams: Vec<StreamConfig>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_deliver: 5,
            ack_wait_ms: 30_000,
            streams: Vec::new(),
        }
    }
}

impl PersistenceConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }
}

/// Subscriber behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// How long `close` waits for in-flight handlers, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// Fixed backoff after a failed pull fetch, in milliseconds.
    pub pull_error_backoff_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 30_000,
            pull_error_backoff_ms: 1_000,
        }
    }
}

impl SubscriberConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn pull_error_backoff(&self) -> Duration {
        Duration::from_millis(self.pull_error_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.transport_type, TransportType::Nats);
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = ConnectionConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MessagingError::InvalidUrl { .. })
        ));

        let config = ConnectionConfig {
            url: "http://localhost:4222".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MessagingError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_server_list_accepted() {
        let config = ConnectionConfig {
            url: "nats://a:4222, nats://b:4222".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_channel_config_skips_url_check() {
        let config = ConnectionConfig::channel("svc");
        assert_eq!(config.transport_type, TransportType::Channel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conflicting_auth_rejected() {
        let auth = AuthConfig {
            token: Some("t".to_string()),
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            ..Default::default()
        };
        let err = auth.validate().unwrap_err();
        assert!(matches!(err, MessagingError::ConflictingAuth(_)));
        assert!(err.to_string().contains("token, username/password"));
    }

    #[test]
    fn test_auth_preference_order() {
        let auth = AuthConfig {
            credentials_file: Some(PathBuf::from("/etc/nats/app.creds")),
            token: Some("t".to_string()),
            ..Default::default()
        };
        assert_eq!(
            auth.method(),
            AuthMethod::CredentialsFile(PathBuf::from("/etc/nats/app.creds"))
        );

        let auth = AuthConfig {
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            ..Default::default()
        };
        assert!(auth.validate().is_ok());
        assert_eq!(
            auth.method(),
            AuthMethod::UserPassword {
                username: "u".to_string(),
                password: "p".to_string()
            }
        );
        assert_eq!(AuthConfig::default().method(), AuthMethod::None);
    }

    #[test]
    fn test_username_without_password_rejected() {
        let auth = AuthConfig {
            username: Some("u".to_string()),
            ..Default::default()
        };
        assert!(matches!(auth.validate(), Err(MessagingError::Config(_))));
    }

    #[test]
    fn test_tls_cert_requires_key() {
        let tls = TlsConfig {
            cert_file: Some(PathBuf::from("client.pem")),
            ..Default::default()
        };
        assert!(tls.validate().is_err());
        assert!(tls.enabled());
        assert!(!TlsConfig::default().enabled());
    }

    #[test]
    fn test_middleware_defaults() {
        let mw = MiddlewareConfig::default();
        assert!(mw.logging);
        assert!(!mw.metrics);
        assert!(!mw.tracing);
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let yaml = r#"
connection:
  type: channel
  name: billing
  auth:
    token: secret
middleware:
  metrics: true
persistence:
  max_deliver: 3
  streams:
    - name: BILLING
      subjects: ["billing.>"]
"#;
        let config: MessagingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.connection.transport_type, TransportType::Channel);
        assert_eq!(config.connection.name, "billing");
        assert_eq!(config.connection.auth.method(), AuthMethod::Token("secret".to_string()));
        assert!(config.middleware.logging);
        assert!(config.middleware.metrics);
        assert_eq!(config.persistence.max_deliver, 3);
        assert_eq!(config.persistence.streams[0].subjects, vec!["billing.>"]);
        assert_eq!(config.subscriber.shutdown_grace(), Duration::from_secs(30));
    }
}
