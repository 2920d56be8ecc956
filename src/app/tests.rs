use super::*;

use crate::config::Config;
use crate::context::MessageContext;
use crate::envelope::Envelope;
use crate::service::HandlerService;
use crate::test_utils::HandlerProbe;

const WAIT: Duration = Duration::from_secs(2);

fn messenger(name: &str) -> Arc<Messenger> {
    Arc::new(Messenger::new(Config::for_test(name).messaging))
}

fn echo_service(messenger: &Arc<Messenger>) -> Arc<dyn Service> {
    let messenger = Arc::clone(messenger);
    Arc::new(HandlerService::new(
        "orders",
        handler_fn(move |ctx, _subject, envelope| {
            let messenger = Arc::clone(&messenger);
            async move {
                let data: serde_json::Value = envelope.decode_data()?;
                messenger.publisher().reply(&ctx, &envelope, "echo", &data).await?;
                Ok(())
            }
        }),
    ))
}

async fn request(messenger: &Messenger, subject: &str) -> Result<Envelope> {
    messenger
        .publisher()
        .request(
            &MessageContext::new(),
            subject,
            "test.request",
            &serde_json::json!({ "n": 1 }),
            Duration::from_millis(300),
        )
        .await
}

#[test]
fn test_application_name_is_reserved() {
    let app = Application::new("Shop", messenger("shop"));
    assert_eq!(app.name(), "shop");

    let err = app
        .register(Arc::new(HandlerService::new("SHOP", HandlerProbe::new().handler())))
        .unwrap_err();
    assert!(matches!(err, MessagingError::Config(_)));
    assert!(!app.unregister("shop"));
}

#[tokio::test]
async fn test_names_must_be_single_tokens() {
    let app = Application::new("shop", messenger("shop"));
    let err = app
        .register(Arc::new(HandlerService::new(
            "orders.v2",
            HandlerProbe::new().handler(),
        )))
        .unwrap_err();
    assert!(matches!(err, MessagingError::Config(_)));
    assert!(app.services().list().is_empty());

    let messenger = messenger("shop.eu");
    let err = Application::new("shop.eu", Arc::clone(&messenger))
        .run()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MessagingError::Config(_)));
    assert!(!messenger.is_connected());
}

#[tokio::test]
async fn test_control_topics_drive_lifecycle() {
    let messenger = messenger("shop");
    let app = Application::new("shop", Arc::clone(&messenger));
    app.register(echo_service(&messenger)).unwrap();
    let handle = app.run().await.unwrap();
    assert_eq!(handle.state(), AppState::Dormant);

    // Dormant: business subjects are not subscribed
    assert!(request(&messenger, "orders.echo").await.is_err());

    let ctx = MessageContext::new();
    messenger
        .publisher()
        .publish(&ctx, "shop.start", "control", &(), PublishOptions::default())
        .await
        .unwrap();
    assert!(handle.wait_for_state(AppState::Active, WAIT).await);

    let reply = request(&messenger, "orders.echo").await.unwrap();
    assert_eq!(reply.message_type(), "echo");
    assert_eq!(
        reply.decode_data::<serde_json::Value>().unwrap(),
        serde_json::json!({ "n": 1 })
    );
    // Bare service name is subscribed too
    assert!(request(&messenger, "orders").await.is_ok());

    messenger
        .publisher()
        .publish(&ctx, "shop.stop", "control", &(), PublishOptions::default())
        .await
        .unwrap();
    assert!(handle.wait_for_state(AppState::Dormant, WAIT).await);
    assert!(request(&messenger, "orders.echo").await.is_err());

    handle.shutdown().await.unwrap();
    assert!(!messenger.is_connected());
}

#[tokio::test]
async fn test_repeated_start_is_noop() {
    let messenger = messenger("shop");
    let app = Application::new("shop", Arc::clone(&messenger)).with_auto_start(true);
    app.register(echo_service(&messenger)).unwrap();
    let handle = app.run().await.unwrap();
    assert!(handle.wait_for_state(AppState::Active, WAIT).await);

    handle.start().await.unwrap();
    handle.start().await.unwrap();
    // Only one answer per request means no duplicate subscriptions
    assert!(request(&messenger, "orders.echo").await.is_ok());
    assert_eq!(handle.state(), AppState::Active);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_replies() {
    let messenger = messenger("shop");
    let handle = Application::new("shop", Arc::clone(&messenger))
        .run()
        .await
        .unwrap();

    let liveness = request(&messenger, "shop.health.liveness").await.unwrap();
    assert_eq!(liveness.message_type(), HEALTH_STATUS_TYPE);
    assert!(liveness.decode_data::<HealthStatus>().unwrap().is_ok());

    let readiness: HealthStatus = request(&messenger, "shop.health.readiness")
        .await
        .unwrap()
        .decode_data()
        .unwrap();
    assert!(!readiness.is_ok());
    assert_eq!(readiness.state, AppState::Dormant);
    assert!(readiness.connected);

    handle.start().await.unwrap();
    assert!(handle.wait_for_state(AppState::Active, WAIT).await);
    let readiness: HealthStatus = request(&messenger, "shop.health.readiness")
        .await
        .unwrap()
        .decode_data()
        .unwrap();
    assert!(readiness.is_ok());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_produces_error_reply() {
    let messenger = messenger("shop");
    let app = Application::new("shop", Arc::clone(&messenger)).with_auto_start(true);
    app.register(Arc::new(HandlerService::new(
        "billing",
        HandlerProbe::always_failing().handler(),
    )))
    .unwrap();
    let handle = app.run().await.unwrap();
    assert!(handle.wait_for_state(AppState::Active, WAIT).await);

    let reply = request(&messenger, "billing.charge").await.unwrap();
    assert_eq!(reply.message_type(), ERROR_TYPE);
    let body: ErrorReply = reply.decode_data().unwrap();
    assert!(body.error.contains("probe failure"));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_control_action_replies_error() {
    let messenger = messenger("shop");
    let handle = Application::new("shop", Arc::clone(&messenger))
        .run()
        .await
        .unwrap();

    let reply = request(&messenger, "shop.reboot").await.unwrap();
    assert_eq!(reply.message_type(), ERROR_TYPE);

    handle.shutdown().await.unwrap();
}
