//! Inbound message path.
//!
//! Each subscription runs a pump task that reads from the transport and
//! spawns one task per message (core and push). Pull subscriptions run one
//! loop that fetches batches and processes them in order.
//!
//! Per message: decode the envelope, extract trace context, copy the
//! transport reply-to, validate, run the middleware chain and handler, then
//! ack or nak persisted deliveries.
//!
//! `close` unsubscribes first, then waits for in-flight handlers up to the
//! configured grace period. Handlers are never cancelled.

mod pipeline;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures::{Stream, StreamExt};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SubscriberConfig;
use crate::connection::ConnectionManager;
use crate::envelope::{PullOptions, SubscribeOptions};
use crate::error::{MessagingError, Result};
use crate::middleware::{compose, HandlerFn, Middleware};
use crate::telemetry::Telemetry;
use crate::transport::PullConsumer;
use crate::validation::Validator;

use pipeline::{InFlight, Pipeline};

/// A running subscription.
struct ActiveSubscription {
    subject: String,
    kind: &'static str,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Receives messages and dispatches them to handlers.
pub struct Subscriber {
    connection: Arc<ConnectionManager>,
    validator: Option<Arc<dyn Validator>>,
    telemetry: Telemetry,
    settings: SubscriberConfig,
    middleware: RwLock<Vec<Arc<dyn Middleware<HandlerFn>>>>,
    subscriptions: Mutex<Vec<ActiveSubscription>>,
    in_flight: Arc<InFlight>,
    closed: AtomicBool,
}

impl Subscriber {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            validator: None,
            telemetry: Telemetry::default(),
            settings: SubscriberConfig::default(),
            middleware: RwLock::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            in_flight: Arc::new(InFlight::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_settings(mut self, settings: SubscriberConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Append a middleware. Applies to subscriptions created afterwards.
    pub fn use_middleware(&self, middleware: impl Middleware<HandlerFn> + 'static) {
        self.middleware
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(middleware));
    }

    /// Number of active subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Subjects of active subscriptions, in subscription order.
    pub async fn subjects(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .map(|s| s.subject.clone())
            .collect()
    }

    /// Subscriptions whose pump task is still running.
    pub async fn running_tasks(&self) -> usize {
        self.subscriptions
            .lock()
            .await
            .iter()
            .filter(|s| !s.task.is_finished())
            .count()
    }

    /// Handlers currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(MessagingError::Closed)
        } else {
            Ok(())
        }
    }

    fn pipeline(&self, handler: HandlerFn) -> Arc<Pipeline> {
        let handler = {
            let middleware = self.middleware.read().unwrap_or_else(|e| e.into_inner());
            compose(&middleware, handler)
        };
        Arc::new(Pipeline {
            handler,
            validator: self.validator.clone(),
            propagator: Arc::clone(&self.telemetry.propagator),
        })
    }

    fn semaphore(opts: &SubscribeOptions) -> Option<Arc<Semaphore>> {
        (opts.max_workers > 0).then(|| Arc::new(Semaphore::new(opts.max_workers)))
    }

    async fn register(
        &self,
        subject: &str,
        kind: &'static str,
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) {
        self.subscriptions.lock().await.push(ActiveSubscription {
            subject: subject.to_string(),
            kind,
            stop,
            task,
        });
        info!(subject = %subject, kind, "Subscribed");
    }

    /// Core subscription. Without a queue group every subscriber gets every
    /// message; within a group exactly one member does.
    pub async fn subscribe(
        &self,
        subject: &str,
        handler: HandlerFn,
        opts: SubscribeOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let transport = self.connection.transport()?;
        let stream = transport
            .subscribe(subject, opts.queue_group.as_deref())
            .await?;

        let pipeline = self.pipeline(handler);
        let (stop, stop_rx) = watch::channel(false);
        let task = spawn_pump(
            stream,
            stop_rx,
            Self::semaphore(&opts),
            Arc::clone(&self.in_flight),
            move |message| {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.process_message(message).await }
            },
        );

        self.register(subject, "core", stop, task).await;
        Ok(())
    }

    /// Persisted push subscription. Handler success acks, failure naks;
    /// undecodable or invalid messages are left for redelivery.
    pub async fn subscribe_persisted_push(
        &self,
        subject: &str,
        handler: HandlerFn,
        opts: SubscribeOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let context = self.connection.persistent_context().await?;
        let deliveries = context
            .push_consumer(subject, opts.queue_group.as_deref())
            .await?;

        let pipeline = self.pipeline(handler);
        let (stop, stop_rx) = watch::channel(false);
        let log_subject = subject.to_string();
        let task = spawn_pump(
            deliveries,
            stop_rx,
            Self::semaphore(&opts),
            Arc::clone(&self.in_flight),
            move |delivery| {
                let pipeline = Arc::clone(&pipeline);
                let subject = log_subject.clone();
                async move {
                    match delivery {
                        Ok(delivery) => pipeline.process_delivery(delivery).await,
                        Err(e) => warn!(subject = %subject, error = %e, "Push delivery error"),
                    }
                }
            },
        );

        self.register(subject, "push", stop, task).await;
        Ok(())
    }

    /// Persisted pull subscription bound to the durable consumer `durable`.
    ///
    /// One loop fetches up to `batch_size` messages per `fetch_timeout` and
    /// processes them in order. An empty fetch is not an error; a closed
    /// connection ends the loop; other errors back off and retry.
    pub async fn subscribe_persisted_pull(
        &self,
        subject: &str,
        durable: &str,
        handler: HandlerFn,
        opts: PullOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let context = self.connection.persistent_context().await?;
        let consumer = context.pull_consumer(subject, durable).await?;

        let pipeline = self.pipeline(handler);
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(pull_loop(
            subject.to_string(),
            consumer,
            pipeline,
            opts,
            self.settings.pull_error_backoff(),
            stop_rx,
            Arc::clone(&self.in_flight),
        ));

        self.register(subject, "pull", stop, task).await;
        Ok(())
    }

    /// Stop every subscription. Handlers already running keep running.
    pub async fn unsubscribe(&self) -> Result<()> {
        let active = std::mem::take(&mut *self.subscriptions.lock().await);
        for subscription in &active {
            let _ = subscription.stop.send(true);
        }
        for subscription in active {
            if let Err(e) = subscription.task.await {
                warn!(subject = %subscription.subject, error = %e, "Subscription task panicked");
            }
            debug!(subject = %subscription.subject, kind = subscription.kind, "Unsubscribed");
        }
        Ok(())
    }

    /// Unsubscribe, then wait for in-flight handlers up to the grace period.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.unsubscribe().await?;

        let grace = self.settings.shutdown_grace();
        if !self.in_flight.wait_idle(grace).await {
            warn!(
                in_flight = self.in_flight.current(),
                grace = ?grace,
                "Grace period expired with handlers still running"
            );
        }
        info!("Subscriber closed");
        Ok(())
    }
}

/// Read items until stopped or the stream ends, spawning one task per item.
///
/// With a semaphore, a permit is taken before the next item is read and
/// held until its task completes.
fn spawn_pump<S, T, F, Fut>(
    mut stream: S,
    mut stop: watch::Receiver<bool>,
    semaphore: Option<Arc<Semaphore>>,
    in_flight: Arc<InFlight>,
    process: F,
) -> JoinHandle<()>
where
    S: Stream<Item = T> + Send + Unpin + 'static,
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let permit = match &semaphore {
                Some(semaphore) => tokio::select! {
                    permit = Arc::clone(semaphore).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    _ = stop.changed() => break,
                },
                None => None,
            };

            let item = tokio::select! {
                item = stream.next() => item,
                _ = stop.changed() => break,
            };
            let Some(item) = item else {
                debug!("Subscription stream ended");
                break;
            };

            let guard = in_flight.enter();
            let work = process(item);
            tokio::spawn(async move {
                work.await;
                drop(permit);
                drop(guard);
            });
        }
    })
}

async fn pull_loop(
    subject: String,
    consumer: Arc<dyn PullConsumer>,
    pipeline: Arc<Pipeline>,
    opts: PullOptions,
    backoff: std::time::Duration,
    mut stop: watch::Receiver<bool>,
    in_flight: Arc<InFlight>,
) {
    'fetch: loop {
        if *stop.borrow() {
            break;
        }

        let fetched = tokio::select! {
            fetched = consumer.fetch(opts.batch_size, opts.fetch_timeout) => fetched,
            _ = stop.changed() => break,
        };

        let batch = match fetched {
            Ok(batch) => batch,
            Err(e) if e.is_terminal() => {
                info!(subject = %subject, error = %e, "Pull consumer closed, stopping");
                break;
            }
            Err(e) => {
                warn!(subject = %subject, error = %e, backoff = ?backoff, "Fetch failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => continue,
                    _ = stop.changed() => break,
                }
            }
        };

        // Unprocessed deliveries left in the batch stay unacknowledged
        for delivery in batch {
            if *stop.borrow() {
                break 'fetch;
            }
            let guard = in_flight.enter();
            let pipeline = Arc::clone(&pipeline);
            let mut task = tokio::spawn(async move {
                pipeline.process_delivery(delivery).await;
                drop(guard);
            });
            tokio::select! {
                result = &mut task => {
                    if let Err(e) = result {
                        warn!(subject = %subject, error = %e, "Pull handler task panicked");
                    }
                }
                _ = stop.changed() => break 'fetch,
            }
        }
    }
    debug!(subject = %subject, "Pull loop stopped");
}
