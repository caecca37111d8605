use std::sync::Arc;

use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{error, instrument, warn};

use crate::broker::{BrokerClient, ProducerSession};
use crate::codec;
use crate::error::ProduceError;
use crate::report::FailureReporter;

/// What happened to a send. Purely informational: failures are already logged
/// and reported, and callers are free to ignore this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { messages: usize },
    /// Nothing to send, the broker was not contacted.
    Skipped,
    Failed,
}

/// Best-effort publishing of documents. Each call opens its own producer
/// session, publishes, and disconnects. Errors never reach the caller.
#[derive(Clone)]
pub struct ProducerChannel {
    broker: Arc<dyn BrokerClient>,
    failures: FailureReporter,
}

impl ProducerChannel {
    pub fn new(broker: Arc<dyn BrokerClient>, failures: FailureReporter) -> Self {
        Self { broker, failures }
    }

    #[instrument(skip_all, fields(topic = topic))]
    pub async fn send<T>(&self, topic: &str, document: &T) -> DeliveryOutcome
    where
        T: Serialize + ?Sized,
    {
        let result = async {
            let payload = codec::encode(document)?;
            let mut session = self.broker.producer();
            session.connect().await?;
            let sent = session.send(topic, payload).await;
            Self::close(session.as_mut(), topic).await;
            sent.map_err(ProduceError::from)
        }
        .await;

        match result {
            Ok(()) => {
                counter!("doc_stream_documents_produced_total").increment(1);
                DeliveryOutcome::Delivered { messages: 1 }
            }
            Err(e) => self.fail("send", topic, &e),
        }
    }

    #[instrument(skip_all, fields(topic = topic, batch_size = documents.len()))]
    pub async fn send_batch<T>(&self, topic: &str, documents: &[T]) -> DeliveryOutcome
    where
        T: Serialize,
    {
        if documents.is_empty() {
            return DeliveryOutcome::Skipped;
        }

        let result = async {
            let payloads = documents
                .iter()
                .map(codec::encode)
                .collect::<Result<Vec<_>, _>>()?;
            let mut session = self.broker.producer();
            session.connect().await?;
            let sent = session.send_batch(topic, payloads).await;
            Self::close(session.as_mut(), topic).await;
            sent.map_err(ProduceError::from)
        }
        .await;

        match result {
            Ok(()) => {
                counter!("doc_stream_documents_produced_total").increment(documents.len() as u64);
                histogram!("doc_stream_produce_batch_size").record(documents.len() as f64);
                DeliveryOutcome::Delivered {
                    messages: documents.len(),
                }
            }
            Err(e) => self.fail("send_batch", topic, &e),
        }
    }

    // The message is already with the broker at this point, so a failed
    // disconnect does not turn the delivery into a failure.
    async fn close(session: &mut dyn ProducerSession, topic: &str) {
        if let Err(e) = session.disconnect().await {
            warn!(topic = topic, "failed to disconnect producer: {}", e);
        }
    }

    fn fail(&self, context: &'static str, topic: &str, e: &ProduceError) -> DeliveryOutcome {
        counter!("doc_stream_produce_errors_total", "context" => context).increment(1);
        error!(context = context, topic = topic, "failed to produce: {}", e);
        self.failures.report(context, topic, e);
        DeliveryOutcome::Failed
    }
}
