//! End-to-end messaging tests against the in-process channel transport.
//!
//! Run with: cargo test --test messaging --features test-utils

use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::config::{
    Config, ConnectionConfig, MessagingConfig, PersistenceConfig, SubscriberConfig,
};
use courier::connection::ConnectionManager;
use courier::middleware::{publish_fn, PublishFn};
use courier::service::HandlerService;
use courier::test_utils::{channel_manager, shared_manager, HandlerProbe};
use courier::transport::ChannelTransport;
use courier::{
    AppState, Application, Envelope, MessageContext, MessagingError, Messenger, PublishOptions,
    Publisher, PullOptions, RouteError, Router, ServiceStore, SubscribeOptions, Subscriber,
};

const WAIT: Duration = Duration::from_secs(2);

fn ctx() -> MessageContext {
    MessageContext::new()
}

async fn publish_n(publisher: &Publisher, subject: &str, n: u32) {
    for i in 0..n {
        publisher
            .publish(&ctx(), subject, "test.event", &i, PublishOptions::default())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_round_trip_preserves_envelope() {
    let manager = channel_manager("orders-api").await;
    let subscriber = Subscriber::new(Arc::clone(&manager));
    let publisher = Publisher::new(manager);
    let probe = HandlerProbe::new();

    subscriber
        .subscribe("orders.*", probe.handler(), SubscribeOptions::default())
        .await
        .unwrap();
    publisher
        .publish(
            &ctx(),
            "orders.created",
            "order.created",
            &serde_json::json!({ "order_id": 42, "items": ["a", "b"] }),
            PublishOptions::asynchronous(),
        )
        .await
        .unwrap();

    assert!(probe.wait_for(1, WAIT).await);
    let (subject, envelope) = probe.received().remove(0);
    assert_eq!(subject, "orders.created");
    assert_eq!(envelope.message_type(), "order.created");
    assert_eq!(envelope.source(), "orders-api");
    assert!(envelope.reply().is_none());
    assert_eq!(
        envelope.decode_data::<serde_json::Value>().unwrap(),
        serde_json::json!({ "order_id": 42, "items": ["a", "b"] })
    );
}

#[tokio::test]
async fn test_fan_out_reaches_every_subscriber() {
    let broker = ChannelTransport::new();
    let first = Subscriber::new(shared_manager("a", &broker));
    let second = Subscriber::new(shared_manager("b", &broker));
    let publisher = Publisher::new(shared_manager("pub", &broker));
    let (a, b) = (HandlerProbe::new(), HandlerProbe::new());

    first
        .subscribe("events", a.handler(), SubscribeOptions::default())
        .await
        .unwrap();
    second
        .subscribe("events", b.handler(), SubscribeOptions::default())
        .await
        .unwrap();
    publish_n(&publisher, "events", 3).await;

    assert!(a.wait_for(3, WAIT).await);
    assert!(b.wait_for(3, WAIT).await);
}

#[tokio::test]
async fn test_queue_group_delivers_each_message_once() {
    let broker = ChannelTransport::new();
    let publisher = Publisher::new(shared_manager("pub", &broker));
    let probes = [HandlerProbe::new(), HandlerProbe::new(), HandlerProbe::new()];
    let mut subscribers = Vec::new();
    for (i, probe) in probes.iter().enumerate() {
        let subscriber = Subscriber::new(shared_manager(&format!("worker-{}", i), &broker));
        subscriber
            .subscribe(
                "jobs.*",
                probe.handler(),
                SubscribeOptions::default().with_queue_group("workers"),
            )
            .await
            .unwrap();
        subscribers.push(subscriber);
    }

    const N: u32 = 30;
    publish_n(&publisher, "jobs.run", N).await;

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let total: usize = probes.iter().map(HandlerProbe::count).sum();
        if total >= N as usize || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let total: usize = probes.iter().map(HandlerProbe::count).sum();
    assert_eq!(total, N as usize);
}

#[tokio::test]
async fn test_request_reply() {
    let manager = channel_manager("rpc").await;
    let subscriber = Subscriber::new(Arc::clone(&manager));
    let publisher = Arc::new(Publisher::new(manager));

    let responder = Arc::clone(&publisher);
    subscriber
        .subscribe(
            "math.double",
            courier::middleware::handler_fn(move |ctx, _subject, envelope| {
                let responder = Arc::clone(&responder);
                async move {
                    let n: i64 = envelope.decode_data()?;
                    responder.reply(&ctx, &envelope, "math.result", &(n * 2)).await?;
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    let reply = publisher
        .request(&ctx(), "math.double", "math.request", &21, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply.message_type(), "math.result");
    assert_eq!(reply.decode_data::<i64>().unwrap(), 42);
}

#[tokio::test]
async fn test_request_timeout_is_bounded() {
    let manager = channel_manager("rpc").await;
    let subscriber = Subscriber::new(Arc::clone(&manager));
    let publisher = Publisher::new(manager);
    subscriber
        .subscribe("silent", HandlerProbe::new().handler(), SubscribeOptions::default())
        .await
        .unwrap();

    let timeout = Duration::from_millis(100);
    let started = tokio::time::Instant::now();
    let err = publisher
        .request(&ctx(), "silent", "ping", &(), timeout)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, MessagingError::Timeout(_)));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(500));
}

#[tokio::test]
async fn test_request_without_responders() {
    let publisher = Publisher::new(channel_manager("rpc").await);
    let err = publisher
        .request(&ctx(), "nobody.home", "ping", &(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::NoResponders(_)));
}

#[tokio::test]
async fn test_push_redelivers_failed_messages() {
    let manager = Arc::new(
        ConnectionManager::new(ConnectionConfig::channel("push")).with_persistence(
            PersistenceConfig {
                max_deliver: 3,
                ack_wait_ms: 20,
                streams: Vec::new(),
            },
        ),
    );
    manager.connect().await.unwrap();
    let subscriber = Subscriber::new(Arc::clone(&manager));
    let publisher = Publisher::new(manager);

    let flaky = HandlerProbe::failing_first(1);
    subscriber
        .subscribe_persisted_push("billing.>", flaky.handler(), SubscribeOptions::default())
        .await
        .unwrap();
    let ack = publisher
        .publish_persisted(&ctx(), "billing.charge", "charge", &100)
        .await
        .unwrap();
    assert!(!ack.duplicate);

    assert!(flaky.wait_for(2, WAIT).await);
    let attempts = flaky.received();
    assert_eq!(attempts[0].1.id(), attempts[1].1.id());
}

#[tokio::test]
async fn test_push_gives_up_after_max_deliver() {
    let manager = Arc::new(
        ConnectionManager::new(ConnectionConfig::channel("push")).with_persistence(
            PersistenceConfig {
                max_deliver: 2,
                ack_wait_ms: 20,
                streams: Vec::new(),
            },
        ),
    );
    manager.connect().await.unwrap();
    let subscriber = Subscriber::new(Arc::clone(&manager));
    let publisher = Publisher::new(manager);

    let broken = HandlerProbe::always_failing();
    subscriber
        .subscribe_persisted_push("billing.>", broken.handler(), SubscribeOptions::default())
        .await
        .unwrap();
    publisher
        .publish_persisted(&ctx(), "billing.charge", "charge", &100)
        .await
        .unwrap();

    assert!(broken.wait_for(2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(broken.count(), 2);
}

#[tokio::test]
async fn test_pull_consumer_resumes_by_durable_name() {
    let manager = channel_manager("pull").await;
    let publisher = Publisher::new(Arc::clone(&manager));
    for n in 0..4 {
        publisher
            .publish_persisted(&ctx(), "reports.daily", "report", &n)
            .await
            .unwrap();
    }

    let opts = PullOptions {
        batch_size: 2,
        fetch_timeout: Duration::from_millis(50),
    };

    let first = Subscriber::new(Arc::clone(&manager));
    let probe = HandlerProbe::new();
    first
        .subscribe_persisted_pull("reports.>", "reporter", probe.handler(), opts)
        .await
        .unwrap();
    assert!(probe.wait_for(4, WAIT).await);
    first.close().await.unwrap();

    publisher
        .publish_persisted(&ctx(), "reports.daily", "report", &4)
        .await
        .unwrap();

    let second = Subscriber::new(manager);
    let resumed = HandlerProbe::new();
    second
        .subscribe_persisted_pull("reports.>", "reporter", resumed.handler(), opts)
        .await
        .unwrap();
    assert!(resumed.wait_for(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen: Vec<u32> = resumed
        .received()
        .iter()
        .map(|(_, envelope)| envelope.decode_data().unwrap())
        .collect();
    assert_eq!(seen, vec![4]);
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let manager = channel_manager("unsub").await;
    let subscriber = Subscriber::new(Arc::clone(&manager));
    let publisher = Publisher::new(manager);
    let probe = HandlerProbe::new();

    subscriber
        .subscribe("ticks", probe.handler(), SubscribeOptions::default())
        .await
        .unwrap();
    publish_n(&publisher, "ticks", 2).await;
    assert!(probe.wait_for(2, WAIT).await);

    subscriber.unsubscribe().await.unwrap();
    publish_n(&publisher, "ticks", 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(probe.count(), 2);
}

#[tokio::test]
async fn test_close_waits_for_in_flight_handler() {
    let manager = channel_manager("close").await;
    let subscriber = Subscriber::new(Arc::clone(&manager)).with_settings(SubscriberConfig {
        shutdown_grace_ms: 5_000,
        pull_error_backoff_ms: 50,
    });
    let publisher = Publisher::new(manager);
    let slow = HandlerProbe::with_delay(Duration::from_millis(200));

    subscriber
        .subscribe("slow", slow.handler(), SubscribeOptions::default())
        .await
        .unwrap();
    publish_n(&publisher, "slow", 1).await;
    assert!(slow.wait_for(1, WAIT).await);
    assert_eq!(slow.completed(), 0);

    subscriber.close().await.unwrap();
    assert_eq!(slow.completed(), 1);
}

#[tokio::test]
async fn test_middleware_runs_outermost_first() {
    let manager = channel_manager("mw").await;
    let publisher = Publisher::new(manager);
    let trail = Arc::new(Mutex::new(Vec::<&'static str>::new()));

    for label in ["A", "B"] {
        let trail = Arc::clone(&trail);
        publisher.use_middleware(move |next: PublishFn| -> PublishFn {
            let trail = Arc::clone(&trail);
            publish_fn(move |ctx, outbound| {
                let next = Arc::clone(&next);
                let trail = Arc::clone(&trail);
                async move {
                    trail.lock().unwrap().push(if label == "A" { "A-pre" } else { "B-pre" });
                    let result = next(ctx, outbound).await;
                    trail.lock().unwrap().push(if label == "A" { "A-post" } else { "B-post" });
                    result
                }
            })
        });
    }

    publisher
        .publish(&ctx(), "audit", "audit.event", &(), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(*trail.lock().unwrap(), vec!["A-pre", "B-pre", "B-post", "A-post"]);
}

#[tokio::test]
async fn test_router_resolution() {
    let store = Arc::new(ServiceStore::new());
    let probe = HandlerProbe::new();
    store.add(Arc::new(HandlerService::new("Orders", probe.handler())))
        .unwrap();
    let router = Router::new(store);
    let envelope = || Envelope::from_data("order.created", "test", &1).unwrap();

    router
        .handle_message(ctx(), "orders.created", envelope())
        .await
        .unwrap();
    router.handle_message(ctx(), "orders", envelope()).await.unwrap();
    assert_eq!(probe.count(), 2);

    let err = router
        .handle_message(ctx(), "shipping.created", envelope())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Route(RouteError::NotFound(_))));

    let err = router.handle_message(ctx(), "", envelope()).await.unwrap_err();
    assert!(matches!(err, MessagingError::Route(RouteError::InvalidFormat(_))));
}

#[tokio::test]
async fn test_application_lifecycle_over_control_topics() {
    let messenger = Arc::new(Messenger::new(Config::for_test("shop").messaging));
    let app = Application::new("shop", Arc::clone(&messenger));
    let orders = HandlerProbe::new();
    app.register(Arc::new(HandlerService::new("orders", orders.handler())))
        .unwrap();
    let handle = app.run().await.unwrap();

    let publisher = messenger.publisher();
    publisher
        .publish(&ctx(), "shop.start", "control", &(), PublishOptions::default())
        .await
        .unwrap();
    assert!(handle.wait_for_state(AppState::Active, WAIT).await);

    publish_n(publisher, "orders.created", 3).await;
    assert!(orders.wait_for(3, WAIT).await);

    publisher
        .publish(&ctx(), "shop.stop", "control", &(), PublishOptions::default())
        .await
        .unwrap();
    assert!(handle.wait_for_state(AppState::Dormant, WAIT).await);

    publish_n(publisher, "orders.created", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orders.count(), 3);

    handle.shutdown().await.unwrap();
    assert!(!messenger.is_connected());
}

#[tokio::test]
async fn test_messenger_requires_connect() {
    let messenger = Messenger::new(MessagingConfig {
        connection: ConnectionConfig::channel("lazy"),
        ..Default::default()
    });
    let err = messenger
        .publisher()
        .publish(&ctx(), "a", "t", &(), PublishOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::NotConnected));

    messenger.connect().await.unwrap();
    messenger
        .publisher()
        .publish(&ctx(), "a", "t", &(), PublishOptions::default())
        .await
        .unwrap();
    messenger.close().await.unwrap();
}
