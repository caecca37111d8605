use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// The only error a caller of `subscribe` or `subscribe_batch` can observe.
/// Everything past argument checking degrades to a log line and a failure report.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors raised by a broker session, whatever the backend.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to connect to broker: {0}")]
    Connection(String),
    #[error("session is not connected")]
    NotConnected,
    #[error("session has been closed")]
    Closed,
    #[error("broker rejected the request: {0}")]
    Rejected(String),
    #[error("delivery was canceled before the broker acknowledged it")]
    DeliveryCanceled,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to serialize document: {0}")]
    Encode(serde_json::Error),
    #[error("failed to deserialize document: {0}")]
    Decode(serde_json::Error),
    #[error("received empty payload")]
    EmptyPayload,
}

/// Why a send or send_batch did not reach the broker.
#[derive(Error, Debug)]
pub enum ProduceError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// A single message (or the remainder of a batch) could not be processed.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
    #[error(transparent)]
    Decode(#[from] CodecError),
    #[error("handler did not complete within {0:?}")]
    Timeout(Duration),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// The registry has been drained for shutdown and accepts no new consumers.
#[derive(Error, Debug)]
#[error("consumer registry is shut down")]
pub struct RegistryClosed;
