//! Message payload validation.
//!
//! A [`Validator`] sees the message type and the encoded `data` bytes. On
//! the publish path it runs before any network call; on the receive path a
//! failure drops the message (core) or leaves it unacknowledged (persisted).

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{MessagingError, Result};

/// Validates `(type, data)` pairs.
pub trait Validator: Send + Sync {
    fn validate(&self, message_type: &str, data: &[u8]) -> Result<()>;
}

impl<F> Validator for F
where
    F: Fn(&str, &[u8]) -> Result<()> + Send + Sync,
{
    fn validate(&self, message_type: &str, data: &[u8]) -> Result<()> {
        self(message_type, data)
    }
}

/// Requires named top-level fields per message type.
///
/// Types without a rule pass. `data` must be a JSON object whose listed
/// fields are present and not null.
#[derive(Debug, Clone, Default)]
pub struct RequiredFields {
    rules: HashMap<String, Vec<String>>,
}

impl RequiredFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule for `message_type`.
    pub fn require<I, S>(mut self, message_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .entry(message_type.into())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }
}

fn invalid(message_type: &str, reason: impl Into<String>) -> MessagingError {
    MessagingError::Validation {
        message_type: message_type.to_string(),
        reason: reason.into(),
    }
}

impl Validator for RequiredFields {
    fn validate(&self, message_type: &str, data: &[u8]) -> Result<()> {
        let Some(fields) = self.rules.get(message_type) else {
            return Ok(());
        };

        let value: Value = serde_json::from_slice(data)
            .map_err(|e| invalid(message_type, format!("data is not valid JSON: {}", e)))?;
        let Value::Object(object) = value else {
            return Err(invalid(message_type, "data must be a JSON object"));
        };

        let missing: Vec<&str> = fields
            .iter()
            .filter(|field| object.get(field.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(invalid(
                message_type,
                format!("missing required fields: {}", missing.join(", ")),
            ))
        }
    }
}
