//! An in-process broker: one partition per topic, group offsets, and call
//! counters. Used by the test suite and by `DOC_STREAM_BROKER=memory` for
//! local runs without Kafka.
//!
//! There is no partition assignment: every session of a group reads the
//! whole topic from its own position, starting at the group's committed
//! offset.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{watch, Notify, OwnedRwLockWriteGuard, RwLock};

use crate::broker::{
    Batch, BrokerClient, ConsumerOptions, ConsumerSession, InboundMessage, ProducerSession,
};
use crate::error::BrokerError;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    log: Mutex<Log>,
    appended: Notify,
    counters: Counters,
    faults: Faults,
    // Consumer connects take a read lock; holding the write side stalls them.
    connect_gate: Arc<RwLock<()>>,
}

#[derive(Default)]
struct Log {
    topics: HashMap<String, Vec<Vec<u8>>>,
    // (group, topic) -> next offset to read
    committed: HashMap<(String, String), usize>,
}

#[derive(Default)]
struct Counters {
    producer_connects: AtomicUsize,
    network_sends: AtomicUsize,
    messages_produced: AtomicUsize,
    consumer_connects: AtomicUsize,
    consumer_disconnects: AtomicUsize,
    heartbeats: AtomicUsize,
    resolved_batches: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    connect: AtomicBool,
    send: AtomicBool,
    disconnect: AtomicBool,
}

/// A snapshot of the broker's call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub producer_connects: usize,
    pub network_sends: usize,
    pub messages_produced: usize,
    pub consumer_connects: usize,
    pub consumer_disconnects: usize,
    pub heartbeats: usize,
    pub resolved_batches: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        let c = &self.shared.counters;
        MemoryStats {
            producer_connects: c.producer_connects.load(Ordering::SeqCst),
            network_sends: c.network_sends.load(Ordering::SeqCst),
            messages_produced: c.messages_produced.load(Ordering::SeqCst),
            consumer_connects: c.consumer_connects.load(Ordering::SeqCst),
            consumer_disconnects: c.consumer_disconnects.load(Ordering::SeqCst),
            heartbeats: c.heartbeats.load(Ordering::SeqCst),
            resolved_batches: c.resolved_batches.load(Ordering::SeqCst),
        }
    }

    /// Number of messages currently stored for `topic`.
    pub fn topic_len(&self, topic: &str) -> usize {
        self.shared.log().topics.get(topic).map_or(0, Vec::len)
    }

    /// Next offset the group will read from `topic`, if it has committed anything.
    pub fn committed_offset(&self, group_id: &str, topic: &str) -> Option<usize> {
        self.shared
            .log()
            .committed
            .get(&(group_id.to_owned(), topic.to_owned()))
            .copied()
    }

    /// Make every subsequent connect (producer and consumer) fail.
    pub fn fail_connects(&self, fail: bool) {
        self.shared.faults.connect.store(fail, Ordering::SeqCst);
    }

    /// Stall every consumer connect until the returned guard is dropped.
    pub async fn hold_connects(&self) -> OwnedRwLockWriteGuard<()> {
        self.shared.connect_gate.clone().write_owned().await
    }

    pub fn fail_sends(&self, fail: bool) {
        self.shared.faults.send.store(fail, Ordering::SeqCst);
    }

    /// Consumer disconnects still close the session, but report an error.
    pub fn fail_disconnects(&self, fail: bool) {
        self.shared.faults.disconnect.store(fail, Ordering::SeqCst);
    }
}

impl Shared {
    fn log(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, topic: &str, payloads: Vec<Vec<u8>>) {
        let count = payloads.len();
        self.log()
            .topics
            .entry(topic.to_owned())
            .or_default()
            .extend(payloads);
        self.counters.network_sends.fetch_add(1, Ordering::SeqCst);
        self.counters
            .messages_produced
            .fetch_add(count, Ordering::SeqCst);
        self.appended.notify_waiters();
    }
}

impl BrokerClient for MemoryBroker {
    fn producer(&self) -> Box<dyn ProducerSession> {
        Box::new(MemoryProducer {
            shared: self.shared.clone(),
            connected: false,
        })
    }

    fn consumer(&self, options: ConsumerOptions) -> Arc<dyn ConsumerSession> {
        let (closed, _) = watch::channel(false);
        Arc::new(MemoryConsumer {
            shared: self.shared.clone(),
            options,
            state: Mutex::new(ConsumerState::default()),
            closed,
        })
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
    connected: bool,
}

impl MemoryProducer {
    fn check_ready(&self) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        if self.shared.faults.send.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected("injected send failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProducerSession for MemoryProducer {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        if self.shared.faults.connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(
                "injected connect failure".to_string(),
            ));
        }
        self.shared
            .counters
            .producer_connects
            .fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.check_ready()?;
        self.shared.append(topic, vec![payload]);
        Ok(())
    }

    async fn send_batch(&mut self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<(), BrokerError> {
        self.check_ready()?;
        self.shared.append(topic, payloads);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.connected = false;
        Ok(())
    }
}

#[derive(Default)]
struct ConsumerState {
    connected: bool,
    topic: Option<String>,
    position: usize,
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    options: ConsumerOptions,
    state: Mutex<ConsumerState>,
    closed: watch::Sender<bool>,
}

impl MemoryConsumer {
    fn state(&self) -> MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, log: &mut Log, topic: &str, next_offset: usize) {
        let entry = log
            .committed
            .entry((self.options.group_id.clone(), topic.to_owned()))
            .or_default();
        *entry = (*entry).max(next_offset);
    }

    /// Take up to `max` messages past our position, if any are available.
    fn take(&self, max: usize) -> Result<Option<Vec<InboundMessage>>, BrokerError> {
        let mut state = self.state();
        let Some(topic) = state.topic.clone() else {
            return Err(BrokerError::NotConnected);
        };

        let mut log = self.shared.log();
        let available = log.topics.get(&topic).map_or(0, Vec::len);
        if state.position >= available {
            return Ok(None);
        }

        let end = available.min(state.position + max.max(1));
        let messages: Vec<InboundMessage> = log.topics[&topic][state.position..end]
            .iter()
            .zip(state.position..end)
            .map(|(payload, offset)| InboundMessage {
                topic: topic.clone(),
                partition: 0,
                offset: offset as i64,
                payload: Some(payload.clone()),
            })
            .collect();

        state.position = end;
        if self.options.auto_commit {
            self.commit(&mut log, &topic, end);
        }

        Ok(Some(messages))
    }

    async fn wait_for(&self, max: usize) -> Option<Result<Vec<InboundMessage>, BrokerError>> {
        let mut closed = self.closed.subscribe();
        loop {
            let notified = self.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if *closed.borrow() {
                return None;
            }

            match self.take(max) {
                Ok(Some(messages)) => return Some(Ok(messages)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = closed.changed() => {}
            }
        }
    }
}

#[async_trait]
impl ConsumerSession for MemoryConsumer {
    async fn connect(&self) -> Result<(), BrokerError> {
        drop(self.shared.connect_gate.read().await);
        if self.shared.faults.connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(
                "injected connect failure".to_string(),
            ));
        }
        self.shared
            .counters
            .consumer_connects
            .fetch_add(1, Ordering::SeqCst);
        self.state().connected = true;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }

        // A group joining a topic for the first time starts at the tail and
        // records it, so later sessions of the group resume from there.
        let mut log = self.shared.log();
        let tail = log.topics.get(topic).map_or(0, Vec::len);
        state.position = *log
            .committed
            .entry((self.options.group_id.clone(), topic.to_owned()))
            .or_insert(tail);
        state.topic = Some(topic.to_owned());
        Ok(())
    }

    async fn recv(&self) -> Option<Result<InboundMessage, BrokerError>> {
        let received = self.wait_for(1).await?;
        Some(received.and_then(|messages| {
            messages
                .into_iter()
                .next()
                .ok_or_else(|| BrokerError::Rejected("empty fetch".to_string()))
        }))
    }

    async fn next_batch(&self) -> Option<Result<Batch, BrokerError>> {
        let received = self.wait_for(self.options.batch_size).await?;
        Some(received.map(Batch::new))
    }

    async fn heartbeat(&self) -> Result<(), BrokerError> {
        if *self.closed.borrow() {
            return Err(BrokerError::Closed);
        }
        self.shared.counters.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resolve_batch(&self, batch: &Batch) -> Result<(), BrokerError> {
        let Some(last) = batch.messages.last() else {
            return Ok(());
        };

        let next_offset = usize::try_from(last.offset + 1)
            .map_err(|_| BrokerError::Rejected(format!("invalid offset {}", last.offset)))?;
        let mut log = self.shared.log();
        self.commit(&mut log, &last.topic, next_offset);
        self.shared
            .counters
            .resolved_batches
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rewind(&self, unprocessed: &[InboundMessage]) -> Result<(), BrokerError> {
        let mut state = self.state();
        let Some(topic) = state.topic.clone() else {
            return Err(BrokerError::NotConnected);
        };

        let earliest = unprocessed
            .iter()
            .filter(|message| message.topic == topic)
            .map(|message| message.offset)
            .min();
        if let Some(offset) = earliest {
            let offset = usize::try_from(offset)
                .map_err(|_| BrokerError::Rejected(format!("invalid offset {offset}")))?;
            state.position = state.position.min(offset);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.shared
            .counters
            .consumer_disconnects
            .fetch_add(1, Ordering::SeqCst);
        self.state().connected = false;
        self.closed.send_replace(true);

        if self.shared.faults.disconnect.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected(
                "injected disconnect failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn options(group_id: &str, auto_commit: bool) -> ConsumerOptions {
        ConsumerOptions {
            group_id: group_id.to_string(),
            session_timeout: Duration::from_secs(30),
            auto_commit,
            batch_size: 10,
            batch_timeout: Duration::from_millis(50),
            max_poll_interval: Duration::from_secs(300),
        }
    }

    async fn produce(broker: &MemoryBroker, topic: &str, payloads: &[&str]) {
        let mut producer = broker.producer();
        producer.connect().await.unwrap();
        producer
            .send_batch(
                topic,
                payloads.iter().map(|p| p.as_bytes().to_vec()).collect(),
            )
            .await
            .unwrap();
        producer.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn subscribes_from_the_tail() {
        let broker = MemoryBroker::new();
        produce(&broker, "docs", &["old"]).await;

        let consumer = broker.consumer(options("g1", false));
        consumer.connect().await.unwrap();
        consumer.subscribe("docs").await.unwrap();
        produce(&broker, "docs", &["new-1", "new-2"]).await;

        let batch = consumer.next_batch().await.unwrap().unwrap();
        let payloads: Vec<_> = batch
            .messages
            .iter()
            .map(|m| m.payload.clone().unwrap())
            .collect();
        assert_eq!(payloads, vec![b"new-1".to_vec(), b"new-2".to_vec()]);
        assert_eq!(batch.messages[0].offset, 1);
    }

    #[tokio::test]
    async fn unresolved_batches_are_redelivered_to_the_group() {
        let broker = MemoryBroker::new();
        let first = broker.consumer(options("g1", false));
        first.connect().await.unwrap();
        first.subscribe("docs").await.unwrap();
        assert_eq!(broker.committed_offset("g1", "docs"), Some(0));
        produce(&broker, "docs", &["a", "b"]).await;

        let batch = first.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        first.disconnect().await.unwrap();

        let second = broker.consumer(options("g1", false));
        second.connect().await.unwrap();
        second.subscribe("docs").await.unwrap();
        let redelivered = second.next_batch().await.unwrap().unwrap();
        assert_eq!(redelivered, batch);

        second.resolve_batch(&redelivered).await.unwrap();
        assert_eq!(broker.committed_offset("g1", "docs"), Some(2));
        assert_eq!(broker.stats().resolved_batches, 1);
    }

    #[tokio::test]
    async fn rewind_redelivers_from_the_first_unprocessed_message() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer(options("g1", false));
        consumer.connect().await.unwrap();
        consumer.subscribe("docs").await.unwrap();
        produce(&broker, "docs", &["a", "b", "c"]).await;

        let batch = consumer.next_batch().await.unwrap().unwrap();
        consumer
            .resolve_batch(&Batch::new(batch.messages[..1].to_vec()))
            .await
            .unwrap();
        consumer.rewind(&batch.messages[1..]).await.unwrap();

        let again = consumer.next_batch().await.unwrap().unwrap();
        assert_eq!(again.messages, batch.messages[1..].to_vec());
        assert_eq!(broker.committed_offset("g1", "docs"), Some(1));
    }

    #[tokio::test]
    async fn held_connects_wait_for_release() {
        let broker = MemoryBroker::new();
        let hold = broker.hold_connects().await;

        let pending = {
            let consumer = broker.consumer(options("g1", false));
            tokio::spawn(async move { consumer.connect().await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.stats().consumer_connects, 0);

        drop(hold);
        assert!(pending.await.unwrap());
        assert_eq!(broker.stats().consumer_connects, 1);
    }

    #[tokio::test]
    async fn disconnect_wakes_pending_fetch() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer(options("g1", true));
        consumer.connect().await.unwrap();
        consumer.subscribe("docs").await.unwrap();

        let pending = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.recv().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        consumer.disconnect().await.unwrap();

        assert!(pending.await.unwrap());
        assert!(consumer.heartbeat().await.is_err());
        assert_eq!(broker.stats().consumer_disconnects, 1);
    }

    #[tokio::test]
    async fn auto_commit_moves_group_offset_on_receive() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer(options("g1", true));
        consumer.connect().await.unwrap();
        consumer.subscribe("docs").await.unwrap();
        produce(&broker, "docs", &["a"]).await;

        let message = consumer.recv().await.unwrap().unwrap();
        assert_eq!(message.payload.as_deref(), Some(&b"a"[..]));
        assert_eq!(broker.committed_offset("g1", "docs"), Some(1));
    }
}
