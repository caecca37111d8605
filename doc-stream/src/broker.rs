//! The narrow interface this crate drives a broker through.
//!
//! Producer sessions are short lived: one per send. Consumer sessions are
//! shared between the consumer registry (which disconnects them on shutdown)
//! and the loop pulling from them, so every consumer operation takes `&self`.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// Messages fetched together, in delivery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub messages: Vec<InboundMessage>,
}

impl Batch {
    pub fn new(messages: Vec<InboundMessage>) -> Self {
        Self { messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub group_id: String,
    pub session_timeout: Duration,
    /// When true, the broker commits offsets as messages are received.
    /// When false, offsets only move through `resolve_batch`.
    pub auto_commit: bool,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Longest gap between fetches before the broker evicts the member.
    /// A whole batch has to be handled within it.
    pub max_poll_interval: Duration,
}

#[async_trait]
pub trait ProducerSession: Send {
    async fn connect(&mut self) -> Result<(), BrokerError>;
    async fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
    async fn send_batch(&mut self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<(), BrokerError>;
    async fn disconnect(&mut self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait ConsumerSession: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Subscribe starting from the tail of the topic, or from the group's
    /// committed offset when it already has one. History is never replayed.
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    /// Wait for the next message. `None` once the session is disconnected.
    async fn recv(&self) -> Option<Result<InboundMessage, BrokerError>>;

    /// Wait for the next batch. `None` once the session is disconnected.
    async fn next_batch(&self) -> Option<Result<Batch, BrokerError>>;

    /// Signal liveness to the group coordinator during a long batch.
    async fn heartbeat(&self) -> Result<(), BrokerError>;

    /// Mark every message of the batch as consumed for the group.
    async fn resolve_batch(&self, batch: &Batch) -> Result<(), BrokerError>;

    /// Move the read position back so `unprocessed` is delivered again by
    /// the next fetch. Offsets past it in the same partition are re-read too.
    async fn rewind(&self, unprocessed: &[InboundMessage]) -> Result<(), BrokerError>;

    /// Leave the group and wake any pending `recv`/`next_batch` with `None`.
    async fn disconnect(&self) -> Result<(), BrokerError>;
}

pub trait BrokerClient: Send + Sync {
    fn producer(&self) -> Box<dyn ProducerSession>;
    fn consumer(&self, options: ConsumerOptions) -> Arc<dyn ConsumerSession>;
}
