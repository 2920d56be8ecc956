//! Subject syntax helpers.
//!
//! Subjects are dot-separated tokens. In subscription patterns `*` matches
//! exactly one token and `>` (last token only) matches one or more tokens.

use crate::error::{MessagingError, Result};

/// Check if a subject matches a subscription pattern.
///
/// Matching rules:
/// - Exact match: "orders.created" matches "orders.created"
/// - `*` matches a single token: "orders.*" matches "orders.created"
/// - `>` matches the remainder: "orders.>" matches "orders.item.added"
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');

    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => match subject_tokens.next() {
                Some(s) if s == literal => {}
                _ => return false,
            },
        }
    }

    subject_tokens.next().is_none()
}

/// Validate a concrete subject for publishing (no wildcards).
pub fn validate_publish(subject: &str) -> Result<()> {
    validate(subject)?;
    if subject.split('.').any(|t| t == "*" || t == ">") {
        return Err(MessagingError::Config(format!(
            "Wildcards are not allowed in publish subject '{}'",
            subject
        )));
    }
    Ok(())
}

/// Validate a subscription pattern.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    validate(pattern)?;
    let tokens: Vec<&str> = pattern.split('.').collect();
    if let Some(pos) = tokens.iter().position(|t| *t == ">") {
        if pos != tokens.len() - 1 {
            return Err(MessagingError::Config(format!(
                "'>' must be the last token in '{}'",
                pattern
            )));
        }
    }
    Ok(())
}

fn validate(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(MessagingError::Config("Subject must not be empty".to_string()));
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(MessagingError::Config(format!(
            "Subject '{}' contains whitespace",
            subject
        )));
    }
    if subject.split('.').any(str::is_empty) {
        return Err(MessagingError::Config(format!(
            "Subject '{}' contains an empty token",
            subject
        )));
    }
    Ok(())
}
