//! Courier - envelope-based messaging
//!
//! Publish/subscribe over a broker connection with a standard envelope,
//! composable middleware on both paths, persisted (acknowledged) delivery,
//! and topic-routed dispatch to registered services.

pub mod app;
pub mod config;
pub mod connection;
pub mod context;
pub mod envelope;
pub mod error;
pub mod messenger;
pub mod middleware;
pub mod publisher;
pub mod service;
pub mod subscriber;
pub mod telemetry;
pub mod transport;
pub mod utils;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use app::{AppHandle, AppState, Application};
pub use context::MessageContext;
pub use envelope::{Envelope, PublishOptions, PullOptions, SubscribeOptions};
pub use error::{MessagingError, Result, RouteError};
pub use messenger::Messenger;
pub use publisher::Publisher;
pub use service::{HandlerService, MessageHandler, Router, Service, ServiceStore};
pub use subscriber::Subscriber;
