//! Test utilities.
//!
//! Recording sinks and probe handlers for exercising the messaging stack
//! against the in-process channel transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::connection::ConnectionManager;
use crate::envelope::Envelope;
use crate::error::MessagingError;
use crate::middleware::{handler_fn, HandlerFn};
use crate::telemetry::{Label, MetricsSink};
use crate::transport::{ChannelTransport, Transport};

/// Metrics sink that keeps every measurement in memory.
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<Vec<(&'static str, HashMap<String, String>)>>,
    histograms: Mutex<Vec<(&'static str, f64)>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of increments of `name` whose labels include every `(key, value)` in `filter`.
    pub fn counter(&self, name: &str, filter: &[(&str, &str)]) -> usize {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, labels)| {
                *n == name
                    && filter
                        .iter()
                        .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
            })
            .count()
    }

    /// Number of histogram observations recorded for `name`.
    pub fn observations(&self, name: &str) -> usize {
        self.histograms
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == name)
            .count()
    }
}

impl MetricsSink for RecordingMetrics {
    fn increment_counter(&self, name: &'static str, labels: &[Label]) {
        let labels = labels
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        self.counters.lock().unwrap().push((name, labels));
    }

    fn observe_histogram(&self, name: &'static str, value: f64, _labels: &[Label]) {
        self.histograms.lock().unwrap().push((name, value));
    }
}

#[derive(Default)]
struct ProbeState {
    received: Mutex<Vec<(String, Envelope)>>,
    fail_remaining: AtomicUsize,
    always_fail: bool,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    completed: AtomicUsize,
}

/// Handler that records every invocation.
///
/// Can be configured to fail (first `n` calls or always) and to sleep
/// before returning, for concurrency and shutdown tests.
#[derive(Clone, Default)]
pub struct HandlerProbe {
    state: Arc<ProbeState>,
}

impl HandlerProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` invocations, then succeed.
    pub fn failing_first(n: usize) -> Self {
        let probe = Self::default();
        probe.state.fail_remaining.store(n, Ordering::SeqCst);
        probe
    }

    /// Fail every invocation.
    pub fn always_failing() -> Self {
        Self {
            state: Arc::new(ProbeState {
                always_fail: true,
                ..Default::default()
            }),
        }
    }

    /// Sleep for `delay` in every invocation.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Arc::new(ProbeState {
                delay: Some(delay),
                ..Default::default()
            }),
        }
    }

    pub fn handler(&self) -> HandlerFn {
        let state = Arc::clone(&self.state);
        handler_fn(move |_ctx, subject, envelope| {
            let state = Arc::clone(&state);
            async move {
                let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
                state.max_active.fetch_max(active, Ordering::SeqCst);
                state.received.lock().unwrap().push((subject, envelope));

                if let Some(delay) = state.delay {
                    tokio::time::sleep(delay).await;
                }

                let fail = state.always_fail
                    || state
                        .fail_remaining
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();

                state.active.fetch_sub(1, Ordering::SeqCst);
                state.completed.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(MessagingError::handler("probe failure"))
                } else {
                    Ok(())
                }
            }
        })
    }

    /// Invocations started.
    pub fn count(&self) -> usize {
        self.state.received.lock().unwrap().len()
    }

    /// Invocations finished.
    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent invocations observed.
    pub fn max_concurrency(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<(String, Envelope)> {
        self.state.received.lock().unwrap().clone()
    }

    /// Wait until at least `n` invocations have started.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

/// Connected manager on a fresh in-process broker.
pub async fn channel_manager(name: &str) -> Arc<ConnectionManager> {
    let manager = ConnectionManager::new(ConnectionConfig::channel(name));
    manager
        .connect()
        .await
        .expect("channel transport always connects");
    Arc::new(manager)
}

/// Manager on an existing in-process broker, so several clients share it.
pub fn shared_manager(name: &str, transport: &ChannelTransport) -> Arc<ConnectionManager> {
    let transport: Arc<dyn Transport> = Arc::new(transport.clone());
    Arc::new(ConnectionManager::with_transport(
        ConnectionConfig::channel(name),
        transport,
    ))
}
