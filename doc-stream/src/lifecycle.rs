use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::signal::unix::SignalKind;
use tracing::info;

use crate::broker::BrokerClient;
use crate::config::ConsumerConfig;
use crate::consumer::{DocumentHandler, GroupContext, Subscriber};
use crate::error::StreamError;
use crate::producer::{DeliveryOutcome, ProducerChannel};
use crate::progress::{ProgressReporter, TracingProgress};
use crate::registry::ConsumerRegistry;
use crate::report::FailureReporter;

/// One broker, one registry: the producer channel and the subscriber share
/// both, and `shutdown` disconnects everything the subscriber registered.
pub struct DocStream {
    producer: ProducerChannel,
    subscriber: Subscriber,
    registry: Arc<ConsumerRegistry>,
}

pub struct DocStreamBuilder {
    broker: Arc<dyn BrokerClient>,
    config: ConsumerConfig,
    progress: Arc<dyn ProgressReporter>,
    failures: FailureReporter,
}

impl DocStreamBuilder {
    pub fn consumer_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn failure_reporter(mut self, failures: FailureReporter) -> Self {
        self.failures = failures;
        self
    }

    pub fn build(self) -> DocStream {
        let registry = Arc::new(ConsumerRegistry::new());
        DocStream {
            producer: ProducerChannel::new(self.broker.clone(), self.failures.clone()),
            subscriber: Subscriber::new(
                self.broker,
                registry.clone(),
                self.config,
                self.progress,
                self.failures,
            ),
            registry,
        }
    }
}

impl DocStream {
    pub fn builder(broker: Arc<dyn BrokerClient>) -> DocStreamBuilder {
        DocStreamBuilder {
            broker,
            config: ConsumerConfig::default(),
            progress: Arc::new(TracingProgress),
            failures: FailureReporter::disabled(),
        }
    }

    pub async fn send<T>(&self, topic: &str, document: &T) -> DeliveryOutcome
    where
        T: Serialize + ?Sized,
    {
        self.producer.send(topic, document).await
    }

    pub async fn send_batch<T>(&self, topic: &str, documents: &[T]) -> DeliveryOutcome
    where
        T: Serialize,
    {
        self.producer.send_batch(topic, documents).await
    }

    pub async fn subscribe<T>(
        &self,
        topic: &str,
        handler: Arc<dyn DocumentHandler<T>>,
        context: &GroupContext,
    ) -> Result<Option<String>, StreamError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.subscriber.subscribe(topic, handler, context).await
    }

    pub async fn subscribe_batch<T>(
        &self,
        topic: &str,
        handler: Arc<dyn DocumentHandler<T>>,
        context: &GroupContext,
    ) -> Result<Option<String>, StreamError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.subscriber.subscribe_batch(topic, handler, context).await
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Disconnect every consumer registered so far. Returns how many were
    /// disconnected; calling it again is harmless.
    pub async fn shutdown(&self) -> usize {
        let disconnected = self.registry.drain_all().await;
        info!(disconnected, "doc stream shut down");
        disconnected
    }
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        received = ctrl_c => {
            received?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::handler_fn;
    use crate::memory::MemoryBroker;
    use crate::progress::NoopProgress;

    #[tokio::test]
    async fn shutdown_disconnects_every_subscription_once() {
        let broker = MemoryBroker::new();
        let stream = DocStream::builder(Arc::new(broker.clone()))
            .progress(Arc::new(NoopProgress))
            .build();
        let handler = handler_fn(|_docs: Vec<serde_json::Value>, _topic: String| async {
            anyhow::Ok(())
        });

        let context = GroupContext::new("g1");
        stream.subscribe("a", handler.clone(), &context).await.unwrap();
        stream.subscribe_batch("b", handler.clone(), &context).await.unwrap();
        stream.subscribe_batch("b", handler, &context).await.unwrap();
        assert_eq!(stream.registry().len().await, 3);

        assert_eq!(stream.shutdown().await, 3);
        assert_eq!(broker.stats().consumer_disconnects, 3);
        assert_eq!(stream.shutdown().await, 0);
        assert_eq!(broker.stats().consumer_disconnects, 3);
    }
}
