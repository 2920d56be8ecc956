//! courier-echo: Echo service
//!
//! Hosts a single `echo` service that answers every request on `echo` or
//! `echo.>` with the request data. Messages without a reply subject are
//! logged.
//!
//! ## Configuration
//! - First argument or COURIER_CONFIG: YAML config file (optional)
//! - COURIER__*: environment overrides (e.g. COURIER__MESSAGING__CONNECTION__URL)
//! - COURIER_LOG: log filter (default: info)
//!
//! The application name comes from `app.name`; `<app>.start`, `<app>.stop`
//! and `<app>.health.*` control it.

use std::sync::Arc;

use tracing::info;

use courier::config::Config;
use courier::middleware::handler_fn;
use courier::telemetry::Telemetry;
use courier::utils::bootstrap::{connect_with_retry, connection_backoff, init_tracing};
use courier::{Application, HandlerService, Messenger};

const ECHO_REPLY_TYPE: &str = "echo.reply";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let messenger = Arc::new(
        Messenger::builder(config.messaging.clone())
            .telemetry(telemetry())
            .build(),
    );
    connect_with_retry(&messenger, connection_backoff()).await?;

    let app = Application::new(config.app.name.clone(), Arc::clone(&messenger))
        .with_auto_start(config.app.auto_start);

    let responder = Arc::clone(&messenger);
    app.register(Arc::new(HandlerService::new(
        "echo",
        handler_fn(move |ctx, subject, envelope| {
            let responder = Arc::clone(&responder);
            async move {
                let data: serde_json::Value = envelope.decode_data()?;
                let replied = responder
                    .publisher()
                    .reply(&ctx, &envelope, ECHO_REPLY_TYPE, &data)
                    .await?;
                if !replied {
                    info!(subject = %subject, id = %envelope.id(), data = %data, "Echo");
                }
                Ok(())
            }
        }),
    )))?;

    let handle = app.run().await?;
    info!(app = %handle.name(), "courier-echo started, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down courier-echo");
    handle.shutdown().await?;

    Ok(())
}

#[cfg(feature = "otel")]
fn telemetry() -> Telemetry {
    Telemetry::otel()
}

#[cfg(not(feature = "otel"))]
fn telemetry() -> Telemetry {
    Telemetry::default()
}
