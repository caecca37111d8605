pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod kafka;
pub mod lifecycle;
pub mod memory;
pub mod producer;
pub mod progress;
pub mod registry;
pub mod report;

pub use consumer::{handler_fn, DocumentHandler, GroupContext, Subscriber};
pub use lifecycle::{wait_for_shutdown_signal, DocStream};
pub use producer::{DeliveryOutcome, ProducerChannel};
