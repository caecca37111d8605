use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message, Offset};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::broker::{
    Batch, BrokerClient, ConsumerOptions, ConsumerSession, InboundMessage, ProducerSession,
};
use crate::config::KafkaConfig;
use crate::error::BrokerError;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("doc_stream_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("doc_stream_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("doc_stream_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("doc_stream_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("doc_stream_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                "doc_stream_kafka_broker_requests_pending",
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            counter!(
                "doc_stream_kafka_broker_tx_errors_total",
                "broker" => id_string
            )
            .absolute(stats.txerrs);
        }
    }
}

fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };
    client_config
}

fn consumer_client_config(config: &KafkaConfig, options: &ConsumerOptions) -> ClientConfig {
    let session_timeout_ms = options.session_timeout.as_millis();
    // librdkafka refuses a poll interval below the session timeout.
    let max_poll_interval_ms = options.max_poll_interval.as_millis().max(session_timeout_ms);

    let mut client_config = base_client_config(config);
    client_config
        .set("group.id", &options.group_id)
        .set("session.timeout.ms", session_timeout_ms.to_string())
        .set("heartbeat.interval.ms", (session_timeout_ms / 3).to_string())
        .set("max.poll.interval.ms", max_poll_interval_ms.to_string())
        .set("auto.offset.reset", "latest")
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", options.auto_commit.to_string());
    client_config
}

fn connection_error(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

/// Kafka-backed sessions. Creating a session is free; `connect` is where
/// clients are built and the cluster is pinged.
#[derive(Clone)]
pub struct KafkaBroker {
    config: KafkaConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

impl BrokerClient for KafkaBroker {
    fn producer(&self) -> Box<dyn ProducerSession> {
        Box::new(KafkaProducerSession {
            config: self.config.clone(),
            producer: None,
        })
    }

    fn consumer(&self, options: ConsumerOptions) -> Arc<dyn ConsumerSession> {
        let (closed, _) = watch::channel(false);
        Arc::new(KafkaConsumerSession {
            config: self.config.clone(),
            options,
            consumer: OnceLock::new(),
            closed,
        })
    }
}

struct KafkaProducerSession {
    config: KafkaConfig,
    producer: Option<FutureProducer<KafkaContext>>,
}

impl KafkaProducerSession {
    fn producer(&self) -> Result<&FutureProducer<KafkaContext>, BrokerError> {
        self.producer.as_ref().ok_or(BrokerError::NotConnected)
    }

    fn enqueue(&self, topic: &str, payload: &[u8]) -> Result<DeliveryFuture, BrokerError> {
        self.producer()?
            .send_result(FutureRecord::<(), [u8]>::to(topic).payload(payload))
            .map_err(|(e, _)| BrokerError::Kafka(e))
    }
}

async fn await_delivery(delivery: DeliveryFuture) -> Result<(), BrokerError> {
    match delivery.await {
        Err(_) => Err(BrokerError::DeliveryCanceled),
        Ok(Err((e, _))) => Err(BrokerError::Kafka(e)),
        Ok(Ok(_)) => Ok(()),
    }
}

#[async_trait]
impl ProducerSession for KafkaProducerSession {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        if self.producer.is_some() {
            return Ok(());
        }

        let mut client_config = base_client_config(&self.config);
        client_config
            .set("linger.ms", self.config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &self.config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (self.config.kafka_producer_queue_mib * 1024).to_string(),
            );

        // Building the client and pinging the cluster both block.
        let producer = tokio::task::spawn_blocking(move || {
            let producer: FutureProducer<KafkaContext> =
                client_config.create_with_context(KafkaContext)?;
            drop(
                producer
                    .client()
                    .fetch_metadata(Some("__consumer_offsets"), Timeout::After(METADATA_TIMEOUT))?,
            );
            Ok::<_, KafkaError>(producer)
        })
        .await
        .map_err(connection_error)?
        .map_err(connection_error)?;

        self.producer = Some(producer);
        Ok(())
    }

    async fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let delivery = self.enqueue(topic, &payload)?;
        await_delivery(delivery).await
    }

    async fn send_batch(&mut self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<(), BrokerError> {
        let deliveries = payloads
            .iter()
            .map(|payload| self.enqueue(topic, payload))
            .collect::<Result<Vec<_>, _>>()?;

        let mut first_error = None;
        for delivery in deliveries {
            if let Err(e) = await_delivery(delivery).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        let Some(producer) = self.producer.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT))
            .await
            .map_err(connection_error)??;
        Ok(())
    }
}

struct KafkaConsumerSession {
    config: KafkaConfig,
    options: ConsumerOptions,
    consumer: OnceLock<StreamConsumer>,
    closed: watch::Sender<bool>,
}

fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    InboundMessage {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

impl KafkaConsumerSession {
    fn consumer(&self) -> Result<&StreamConsumer, BrokerError> {
        self.consumer.get().ok_or(BrokerError::NotConnected)
    }

    /// Receive one message, or `None` once the session is closed.
    async fn recv_or_closed(
        &self,
        consumer: &StreamConsumer,
    ) -> Option<Result<InboundMessage, BrokerError>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }
        tokio::select! {
            _ = closed.changed() => None,
            received = consumer.recv() => Some(
                received
                    .map(|message| to_inbound(&message))
                    .map_err(BrokerError::from),
            ),
        }
    }
}

#[async_trait]
impl ConsumerSession for KafkaConsumerSession {
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.consumer.get().is_some() {
            return Ok(());
        }

        let client_config = consumer_client_config(&self.config, &self.options);
        let consumer = tokio::task::spawn_blocking(move || {
            let consumer: StreamConsumer = client_config.create()?;
            drop(consumer.fetch_metadata(None, Timeout::After(METADATA_TIMEOUT))?);
            Ok::<_, KafkaError>(consumer)
        })
        .await
        .map_err(connection_error)?
        .map_err(connection_error)?;

        if self.consumer.set(consumer).is_err() {
            debug!(group_id = self.options.group_id, "consumer connected concurrently");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.consumer()?.subscribe(&[topic])?;
        info!(
            topic = topic,
            group_id = self.options.group_id,
            "subscribed to kafka topic"
        );
        Ok(())
    }

    async fn recv(&self) -> Option<Result<InboundMessage, BrokerError>> {
        let consumer = match self.consumer() {
            Ok(consumer) => consumer,
            Err(e) => return Some(Err(e)),
        };
        self.recv_or_closed(consumer).await
    }

    async fn next_batch(&self) -> Option<Result<Batch, BrokerError>> {
        let consumer = match self.consumer() {
            Ok(consumer) => consumer,
            Err(e) => return Some(Err(e)),
        };

        // Block for the first message, then collect until full or the deadline passes.
        let first = match self.recv_or_closed(consumer).await? {
            Ok(message) => message,
            Err(e) => return Some(Err(e)),
        };
        let mut messages = vec![first];
        let deadline = Instant::now() + self.options.batch_timeout;

        while messages.len() < self.options.batch_size {
            match timeout_at(deadline, self.recv_or_closed(consumer)).await {
                Ok(Some(Ok(message))) => messages.push(message),
                Ok(Some(Err(e))) => {
                    debug!("stopping batch collection early: {}", e);
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }

        Some(Ok(Batch::new(messages)))
    }

    // librdkafka heartbeats from its own thread, so this only notices a closed
    // session. What evicts a slow batch is max.poll.interval.ms: the gap
    // between fetches, i.e. the whole batch, has to stay under it.
    async fn heartbeat(&self) -> Result<(), BrokerError> {
        if *self.closed.borrow() {
            return Err(BrokerError::Closed);
        }
        self.consumer()?;
        counter!("doc_stream_kafka_heartbeats_total").increment(1);
        Ok(())
    }

    async fn resolve_batch(&self, batch: &Batch) -> Result<(), BrokerError> {
        let consumer = self.consumer()?;
        // The stored offset is the next one to read, as with any Kafka commit.
        for message in &batch.messages {
            consumer.store_offset(&message.topic, message.partition, message.offset + 1)?;
        }
        consumer.commit_consumer_state(CommitMode::Async)?;
        Ok(())
    }

    async fn rewind(&self, unprocessed: &[InboundMessage]) -> Result<(), BrokerError> {
        let consumer = self.consumer()?;

        let mut earliest: BTreeMap<(&str, i32), i64> = BTreeMap::new();
        for message in unprocessed {
            earliest
                .entry((message.topic.as_str(), message.partition))
                .and_modify(|offset| *offset = (*offset).min(message.offset))
                .or_insert(message.offset);
        }

        for ((topic, partition), offset) in earliest {
            consumer.seek(topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)?;
            debug!(
                topic = topic,
                partition = partition,
                offset = offset,
                "rewound partition for redelivery"
            );
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.closed.send_replace(true);
        let consumer = self.consumer()?;
        consumer.unsubscribe();
        info!(group_id = self.options.group_id, "kafka consumer disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConsumerOptions {
        ConsumerOptions {
            group_id: "g1".to_string(),
            session_timeout: Duration::from_secs(60),
            auto_commit: false,
            batch_size: 10,
            batch_timeout: Duration::from_millis(10),
            max_poll_interval: Duration::from_secs(300),
        }
    }

    fn config() -> KafkaConfig {
        KafkaConfig {
            kafka_hosts: "localhost:9092".to_string(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 5000,
            kafka_compression_codec: "none".to_string(),
        }
    }

    #[test]
    fn consumer_poll_interval_never_undercuts_the_session() {
        let client_config = consumer_client_config(&config(), &options());
        assert_eq!(client_config.get("max.poll.interval.ms"), Some("300000"));
        assert_eq!(client_config.get("session.timeout.ms"), Some("60000"));
        assert_eq!(client_config.get("heartbeat.interval.ms"), Some("20000"));
        assert_eq!(client_config.get("enable.auto.offset.store"), Some("false"));

        let short_poll = ConsumerOptions {
            max_poll_interval: Duration::from_secs(10),
            ..options()
        };
        let client_config = consumer_client_config(&config(), &short_poll);
        assert_eq!(client_config.get("max.poll.interval.ms"), Some("60000"));
    }

    #[tokio::test]
    async fn unconnected_sessions_refuse_work() {
        let broker = KafkaBroker::new(config());

        let mut producer = broker.producer();
        assert!(matches!(
            producer.send("docs", b"{}".to_vec()).await,
            Err(BrokerError::NotConnected)
        ));
        producer.disconnect().await.unwrap();

        let consumer = broker.consumer(options());
        assert!(matches!(
            consumer.subscribe("docs").await,
            Err(BrokerError::NotConnected)
        ));
        assert!(matches!(consumer.recv().await, Some(Err(BrokerError::NotConnected))));
        assert!(matches!(
            consumer.resolve_batch(&Batch::default()).await,
            Err(BrokerError::NotConnected)
        ));
        assert!(matches!(
            consumer.rewind(&[]).await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn heartbeat_after_close_is_an_error() {
        let broker = KafkaBroker::new(config());
        let consumer = broker.consumer(options());

        // Disconnecting a never-connected session still closes it.
        assert!(consumer.disconnect().await.is_err());
        assert!(matches!(consumer.heartbeat().await, Err(BrokerError::Closed)));
    }
}
