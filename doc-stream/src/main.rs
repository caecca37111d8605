use std::sync::Arc;

use doc_stream::broker::BrokerClient;
use doc_stream::config::{BrokerKind, Config};
use doc_stream::kafka::KafkaBroker;
use doc_stream::memory::MemoryBroker;
use doc_stream::{handler_fn, wait_for_shutdown_signal, DocStream, GroupContext};
use envconfig::Envconfig;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("Starting doc-stream...");

    let config = Config::init_from_env()?;
    info!(
        broker = ?config.broker,
        topic = config.topic,
        group_id = config.group_id,
        batch_size = config.consumer.batch_size,
        commit_policy = ?config.consumer.commit_policy,
        "Configuration loaded"
    );

    let broker: Arc<dyn BrokerClient> = match config.broker {
        BrokerKind::Kafka => Arc::new(KafkaBroker::new(config.kafka.clone())),
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
    };
    let stream = DocStream::builder(broker)
        .consumer_config(config.consumer.clone())
        .build();

    let handler = handler_fn(|documents: Vec<serde_json::Value>, topic: String| async move {
        for document in documents {
            info!(topic = topic, "received document: {}", document);
        }
        anyhow::Ok(())
    });
    let context = GroupContext::new(&config.group_id).with_session_timeout(config.session_timeout.0);
    match stream
        .subscribe_batch(&config.topic, handler, &context)
        .await?
    {
        Some(consumer_id) => info!(consumer_id = consumer_id, "Consuming documents"),
        None => warn!("Could not subscribe, waiting for shutdown anyway"),
    }

    wait_for_shutdown_signal().await?;
    stream.shutdown().await;
    info!("Shut down cleanly");

    Ok(())
}
