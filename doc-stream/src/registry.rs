use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::ConsumerSession;
use crate::error::RegistryClosed;

pub struct RegistryEntry {
    pub topic_name: String,
    pub consumer_id: String,
    pub consumer: Arc<dyn ConsumerSession>,
}

/// Identifiers are `topic-<uuid v7>`, so several subscriptions to one topic stay distinct.
pub fn generate_consumer_id(topic: &str) -> String {
    format!("{topic}-{}", Uuid::now_v7())
}

/// The table of live consumer sessions. Entries are only ever appended, and
/// only removed all at once by `drain_all` during shutdown. Once drained, the
/// registry refuses new entries.
#[derive(Default)]
pub struct ConsumerRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<RegistryEntry>,
    closed: bool,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connected session. Fails once `drain_all` has run; the
    /// caller still owns the session and must disconnect it.
    pub async fn register(&self, entry: RegistryEntry) -> Result<(), RegistryClosed> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RegistryClosed);
        }
        info!(
            topic = entry.topic_name,
            consumer_id = entry.consumer_id,
            "registered consumer"
        );
        state.entries.push(entry);
        gauge!("doc_stream_registered_consumers").set(state.entries.len() as f64);
        Ok(())
    }

    /// Disconnect and remove every registered consumer, returning how many
    /// were disconnected. A failing disconnect is logged and does not stop
    /// the drain. Calling this again once drained is a no-op.
    pub async fn drain_all(&self) -> usize {
        // Take the entries out first so registrations are never blocked on network calls.
        let drained = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.entries)
        };
        gauge!("doc_stream_registered_consumers").set(0.0);

        if drained.is_empty() {
            return 0;
        }

        info!("disconnecting {} consumers", drained.len());
        for entry in &drained {
            if let Err(e) = entry.consumer.disconnect().await {
                counter!("doc_stream_consumer_disconnect_errors_total").increment(1);
                warn!(
                    topic = entry.topic_name,
                    consumer_id = entry.consumer_id,
                    "failed to disconnect consumer: {}",
                    e
                );
            }
        }

        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn consumer_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .map(|entry| entry.consumer_id.clone())
            .collect()
    }
}
