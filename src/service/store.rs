//! Registered services keyed by normalized name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::Service;
use crate::error::{MessagingError, Result};

/// Trimmed, lower-cased service name.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A service name must be a single subject token: the router resolves only
/// the segment before the first `.`.
pub fn validate_name(name: &str) -> Result<()> {
    let normalized = normalize_name(name);
    if let Some(c) = normalized
        .chars()
        .find(|c| matches!(c, '.' | '*' | '>') || c.is_whitespace())
    {
        return Err(MessagingError::Config(format!(
            "Service name '{}' contains '{}'; names must be a single subject token",
            normalized, c
        )));
    }
    Ok(())
}

/// Thread-safe map from service name to service.
#[derive(Default)]
pub struct ServiceStore {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under its normalized name, replacing any previous
    /// entry. Services with an empty name are ignored; names that are not a
    /// single subject token are rejected.
    pub fn add(&self, service: Arc<dyn Service>) -> Result<()> {
        let name = normalize_name(service.name());
        if name.is_empty() {
            debug!("Ignoring service with empty name");
            return Ok(());
        }
        validate_name(&name)?;
        info!(service = %name, "Registering service");
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, service);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&normalize_name(name))
            .cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&normalize_name(name))
    }

    /// Remove a service. Returns the removed entry, if any.
    pub fn delete(&self, name: &str) -> Option<Arc<dyn Service>> {
        let name = normalize_name(name);
        let removed = self
            .services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&name);
        if removed.is_some() {
            info!(service = %name, "Removed service");
        }
        removed
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Service for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_names_are_normalized() {
        let store = ServiceStore::new();
        store.add(Arc::new(Named("  Orders "))).unwrap();

        assert!(store.exists("orders"));
        assert!(store.exists("ORDERS"));
        assert_eq!(store.get("Orders").unwrap().name(), "  Orders ");
    }

    #[test]
    fn test_empty_name_ignored() {
        let store = ServiceStore::new();
        store.add(Arc::new(Named("   "))).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_list_sorted_and_delete() {
        let store = ServiceStore::new();
        store.add(Arc::new(Named("payments"))).unwrap();
        store.add(Arc::new(Named("billing"))).unwrap();
        store.add(Arc::new(Named("orders"))).unwrap();
        assert_eq!(store.list(), vec!["billing", "orders", "payments"]);

        assert!(store.delete("Orders").is_some());
        assert!(store.delete("orders").is_none());
        assert_eq!(store.list(), vec!["billing", "payments"]);
    }

    #[test]
    fn test_rejects_names_that_are_not_one_token() {
        let store = ServiceStore::new();
        for name in ["orders.v2", "orders*", "orders>", "order service"] {
            let err = store.add(Arc::new(Named(name))).unwrap_err();
            assert!(matches!(err, MessagingError::Config(_)), "{name}");
        }
        assert!(store.list().is_empty());

        // Surrounding whitespace is trimmed, not rejected
        store.add(Arc::new(Named(" orders "))).unwrap();
        assert_eq!(store.list(), vec!["orders"]);
    }

    #[test]
    fn test_add_replaces() {
        let store = ServiceStore::new();
        store.add(Arc::new(Named("orders"))).unwrap();
        store.add(Arc::new(Named("ORDERS"))).unwrap();
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get("orders").unwrap().name(), "ORDERS");
    }
}
