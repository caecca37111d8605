use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::broker::{Batch, BrokerClient, ConsumerOptions, ConsumerSession, InboundMessage};
use crate::codec;
use crate::config::{CommitPolicy, ConsumerConfig};
use crate::error::{BrokerError, ProcessingError, StreamError};
use crate::progress::ProgressReporter;
use crate::registry::{generate_consumer_id, ConsumerRegistry, RegistryEntry};
use crate::report::FailureReporter;

/// Batch subscriptions always run with this session timeout, whatever the group context says.
pub const BATCH_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Application code that processes delivered documents. Both loops call it
/// with exactly one document at a time.
#[async_trait]
pub trait DocumentHandler<T>: Send + Sync {
    async fn handle(&self, documents: Vec<T>, topic: &str) -> anyhow::Result<()>;
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<T, F, Fut> DocumentHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(Vec<T>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, documents: Vec<T>, topic: &str) -> anyhow::Result<()> {
        (self.0)(documents, topic.to_owned()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<T, F, Fut>(f: F) -> Arc<dyn DocumentHandler<T>>
where
    T: Send + 'static,
    F: Fn(Vec<T>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone)]
pub struct GroupContext {
    pub group_id: String,
    pub session_timeout: Duration,
}

impl GroupContext {
    pub fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_owned(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    pub fn with_session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }
}

fn validate(topic: &str, context: &GroupContext) -> Result<(), StreamError> {
    if topic.trim().is_empty() {
        return Err(StreamError::InvalidArgument(
            "topic must not be empty".to_string(),
        ));
    }
    if context.group_id.trim().is_empty() {
        return Err(StreamError::InvalidArgument(
            "group id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Registers consumer loops against topics. Every successful subscription is
/// recorded in the shared registry and runs until the registry is drained.
#[derive(Clone)]
pub struct Subscriber {
    broker: Arc<dyn BrokerClient>,
    registry: Arc<ConsumerRegistry>,
    config: ConsumerConfig,
    progress: Arc<dyn ProgressReporter>,
    failures: FailureReporter,
}

impl Subscriber {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        registry: Arc<ConsumerRegistry>,
        config: ConsumerConfig,
        progress: Arc<dyn ProgressReporter>,
        failures: FailureReporter,
    ) -> Self {
        Self {
            broker,
            registry,
            config,
            progress,
            failures,
        }
    }

    /// Deliver each message to `handler` as soon as it arrives, without
    /// waiting for earlier invocations to finish. At most `max_in_flight`
    /// invocations run at once; completion order is not delivery order.
    ///
    /// Returns the new consumer id, or `None` if the broker could not be
    /// reached (the failure is logged and reported, nothing is registered).
    pub async fn subscribe<T>(
        &self,
        topic: &str,
        handler: Arc<dyn DocumentHandler<T>>,
        context: &GroupContext,
    ) -> Result<Option<String>, StreamError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        validate(topic, context)?;
        if context.session_timeout.is_zero() {
            return Err(StreamError::InvalidArgument(
                "session timeout must be positive".to_string(),
            ));
        }
        if self.config.max_in_flight == 0 {
            return Err(StreamError::InvalidArgument(
                "max in flight must be at least 1".to_string(),
            ));
        }

        let options = ConsumerOptions {
            group_id: context.group_id.clone(),
            session_timeout: context.session_timeout,
            auto_commit: true,
            batch_size: self.config.batch_size,
            batch_timeout: self.config.batch_timeout.0,
            max_poll_interval: self.config.max_poll_interval.0,
        };
        let Some(session) = self.open_session(topic, options).await else {
            return Ok(None);
        };
        let Some(consumer_id) = self.register(topic, &context.group_id, &session).await else {
            return Ok(None);
        };

        let worker = MessageWorker {
            session,
            topic: topic.to_owned(),
            consumer_id: consumer_id.clone(),
            handler,
            pool: Arc::new(Semaphore::new(self.config.max_in_flight)),
            max_in_flight: self.config.max_in_flight,
            handler_timeout: self.config.handler_timeout(),
            failures: self.failures.clone(),
        };
        tokio::spawn(worker.run());

        Ok(Some(consumer_id))
    }

    /// Deliver batches, handling their messages one after the other and
    /// heartbeating after each one. A failing message ends its batch early.
    pub async fn subscribe_batch<T>(
        &self,
        topic: &str,
        handler: Arc<dyn DocumentHandler<T>>,
        context: &GroupContext,
    ) -> Result<Option<String>, StreamError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        validate(topic, context)?;
        if self.config.batch_size == 0 {
            return Err(StreamError::InvalidArgument(
                "batch size must be at least 1".to_string(),
            ));
        }

        let options = ConsumerOptions {
            group_id: context.group_id.clone(),
            session_timeout: BATCH_SESSION_TIMEOUT,
            auto_commit: false,
            batch_size: self.config.batch_size,
            batch_timeout: self.config.batch_timeout.0,
            max_poll_interval: self.config.max_poll_interval.0,
        };
        let Some(session) = self.open_session(topic, options).await else {
            return Ok(None);
        };
        let Some(consumer_id) = self.register(topic, &context.group_id, &session).await else {
            return Ok(None);
        };

        let worker = BatchWorker {
            session,
            topic: topic.to_owned(),
            consumer_id: consumer_id.clone(),
            handler,
            handler_timeout: self.config.handler_timeout(),
            commit_policy: self.config.commit_policy,
            progress: self.progress.clone(),
            failures: self.failures.clone(),
        };
        tokio::spawn(worker.run());

        Ok(Some(consumer_id))
    }

    async fn open_session(
        &self,
        topic: &str,
        options: ConsumerOptions,
    ) -> Option<Arc<dyn ConsumerSession>> {
        let group_id = options.group_id.clone();
        let session = self.broker.consumer(options);

        let setup = async {
            session.connect().await?;
            session.subscribe(topic).await
        };
        match setup.await {
            Ok(()) => Some(session),
            Err(e) => {
                counter!("doc_stream_subscribe_errors_total").increment(1);
                error!(
                    context = "subscribe",
                    topic = topic,
                    group_id = group_id,
                    "failed to subscribe consumer: {}",
                    e
                );
                self.failures.report("subscribe", topic, &e);
                if let Err(e) = session.disconnect().await {
                    debug!("failed to clean up consumer session: {}", e);
                }
                None
            }
        }
    }

    /// Register the session, or disconnect it if shutdown already drained the
    /// registry while we were connecting.
    async fn register(
        &self,
        topic: &str,
        group_id: &str,
        session: &Arc<dyn ConsumerSession>,
    ) -> Option<String> {
        let consumer_id = generate_consumer_id(topic);
        let registered = self
            .registry
            .register(RegistryEntry {
                topic_name: topic.to_owned(),
                consumer_id: consumer_id.clone(),
                consumer: session.clone(),
            })
            .await;
        if let Err(e) = registered {
            warn!(topic = topic, group_id = group_id, "dropping new consumer: {}", e);
            if let Err(e) = session.disconnect().await {
                debug!("failed to disconnect unregistered consumer: {}", e);
            }
            return None;
        }
        info!(
            topic = topic,
            group_id = group_id,
            consumer_id = consumer_id,
            "consumer subscribed"
        );
        Some(consumer_id)
    }
}

/// Decode one message and run the handler on it, under the optional timeout.
/// A panicking handler is a processing failure like any other.
async fn handle_message<T>(
    handler: &dyn DocumentHandler<T>,
    topic: &str,
    message: &InboundMessage,
    timeout: Option<Duration>,
) -> Result<(), ProcessingError>
where
    T: DeserializeOwned + Send,
{
    let document: T = codec::decode(message.payload.as_deref())?;
    let call = AssertUnwindSafe(handler.handle(vec![document], topic)).catch_unwind();

    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| ProcessingError::Timeout(limit))?,
        None => call.await,
    };
    match outcome {
        Ok(result) => result.map_err(ProcessingError::Handler),
        Err(panic) => Err(ProcessingError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn backoff(attempt: u64) {
    sleep(Duration::from_millis(100 * attempt.min(10))).await;
}

async fn backoff_after_fetch_error(consumer_id: &str, error_count: u64, e: &BrokerError) {
    counter!("doc_stream_fetch_errors_total").increment(1);
    warn!(consumer_id = consumer_id, "failed to fetch from broker: {}", e);
    backoff(error_count).await;
}

struct MessageWorker<T> {
    session: Arc<dyn ConsumerSession>,
    topic: String,
    consumer_id: String,
    handler: Arc<dyn DocumentHandler<T>>,
    pool: Arc<Semaphore>,
    max_in_flight: usize,
    handler_timeout: Option<Duration>,
    failures: FailureReporter,
}

impl<T> MessageWorker<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn run(self) {
        debug!(consumer_id = self.consumer_id, "message loop started");
        let mut error_count = 0;

        while let Some(received) = self.session.recv().await {
            let message = match received {
                Ok(message) => {
                    error_count = 0;
                    message
                }
                Err(e) => {
                    error_count += 1;
                    backoff_after_fetch_error(&self.consumer_id, error_count, &e).await;
                    continue;
                }
            };

            // Wait for a free slot, never for a handler result.
            let Ok(permit) = self.pool.clone().acquire_owned().await else {
                break;
            };
            gauge!("doc_stream_worker_pool_saturation_percent").set(
                1f64 - self.pool.available_permits() as f64 / self.max_in_flight as f64,
            );

            let handler = self.handler.clone();
            let topic = self.topic.clone();
            let failures = self.failures.clone();
            let timeout = self.handler_timeout;
            tokio::spawn(async move {
                let result = handle_message(handler.as_ref(), &topic, &message, timeout).await;
                drop(permit);
                match result {
                    Ok(()) => {
                        counter!("doc_stream_messages_processed_total", "loop" => "message")
                            .increment(1);
                    }
                    Err(e) => {
                        counter!("doc_stream_messages_failed_total", "loop" => "message")
                            .increment(1);
                        error!(
                            context = "each_message",
                            topic = topic,
                            offset = message.offset,
                            "failed to process message: {}",
                            e
                        );
                        failures.report("each_message", &topic, &e);
                    }
                }
            });
        }

        info!(consumer_id = self.consumer_id, "message loop stopped");
    }
}

struct BatchWorker<T> {
    session: Arc<dyn ConsumerSession>,
    topic: String,
    consumer_id: String,
    handler: Arc<dyn DocumentHandler<T>>,
    handler_timeout: Option<Duration>,
    commit_policy: CommitPolicy,
    progress: Arc<dyn ProgressReporter>,
    failures: FailureReporter,
}

#[derive(Debug, PartialEq, Eq)]
struct BatchOutcome {
    handled: usize,
    failed: bool,
    resolved: bool,
}

impl<T> BatchWorker<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn run(self) {
        debug!(consumer_id = self.consumer_id, "batch loop started");
        let mut error_count = 0;
        let mut redeliveries = 0;

        while let Some(fetched) = self.session.next_batch().await {
            match fetched {
                Ok(batch) => {
                    error_count = 0;
                    let outcome = self.process_batch(&batch).await;
                    debug!(
                        consumer_id = self.consumer_id,
                        handled = outcome.handled,
                        failed = outcome.failed,
                        resolved = outcome.resolved,
                        "batch done"
                    );
                    // A rewound batch comes straight back; don't spin on a message that keeps failing.
                    if outcome.failed && !outcome.resolved {
                        redeliveries += 1;
                        backoff(redeliveries).await;
                    } else {
                        redeliveries = 0;
                    }
                }
                Err(e) => {
                    error_count += 1;
                    backoff_after_fetch_error(&self.consumer_id, error_count, &e).await;
                }
            }
        }

        info!(consumer_id = self.consumer_id, "batch loop stopped");
    }

    async fn process_batch(&self, batch: &Batch) -> BatchOutcome {
        if batch.is_empty() {
            return BatchOutcome {
                handled: 0,
                failed: false,
                resolved: false,
            };
        }

        let total = batch.len();
        histogram!("doc_stream_consume_batch_size").record(total as f64);
        let activity = self.progress.start_activity(&format!(
            "processing batch of {} documents from {}",
            total, self.topic
        ));

        let mut handled = 0;
        let mut failure = None;
        for (index, message) in batch.messages.iter().enumerate() {
            if let Err(e) =
                handle_message(self.handler.as_ref(), &self.topic, message, self.handler_timeout)
                    .await
            {
                failure = Some((index, e));
                break;
            }
            handled += 1;

            if let Err(e) = self.session.heartbeat().await {
                warn!(consumer_id = self.consumer_id, "failed to send heartbeat: {}", e);
            }
            self.progress
                .progress(&activity, &format!("{} of {}", index + 1, total));
        }

        counter!("doc_stream_messages_processed_total", "loop" => "batch")
            .increment(handled as u64);

        let failed = match &failure {
            None => {
                self.progress
                    .success(&activity, &format!("processed {total} documents"));
                false
            }
            Some((index, e)) => {
                counter!("doc_stream_messages_failed_total", "loop" => "batch").increment(1);
                error!(
                    context = "each_batch",
                    topic = self.topic,
                    consumer_id = self.consumer_id,
                    "failed to process message {} of {}, skipping {} remaining: {}",
                    index + 1,
                    total,
                    total - index - 1,
                    e
                );
                self.failures.report("each_batch", &self.topic, e);
                true
            }
        };

        let failed_at = failure.as_ref().map(|(index, _)| *index);
        let resolved = match (failed_at, self.commit_policy) {
            (None, _) | (Some(_), CommitPolicy::AutoResolve) => {
                self.resolve(batch).await;
                true
            }
            (Some(index), CommitPolicy::AfterSuccess) => {
                // Keep what was handled, and read the rest again.
                if index > 0 {
                    self.resolve(&Batch::new(batch.messages[..index].to_vec()))
                        .await;
                }
                warn!(
                    consumer_id = self.consumer_id,
                    redelivered = total - index,
                    "rewinding failed batch for redelivery"
                );
                if let Err(e) = self.session.rewind(&batch.messages[index..]).await {
                    warn!(consumer_id = self.consumer_id, "failed to rewind batch: {}", e);
                    self.failures.report("rewind", &self.topic, &e);
                }
                false
            }
        };

        BatchOutcome {
            handled,
            failed,
            resolved,
        }
    }

    async fn resolve(&self, batch: &Batch) {
        if let Err(e) = self.session.resolve_batch(batch).await {
            warn!(consumer_id = self.consumer_id, "failed to resolve batch: {}", e);
            self.failures.report("resolve_batch", &self.topic, &e);
        }
    }
}
