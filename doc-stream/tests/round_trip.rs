use std::sync::Arc;
use std::time::Duration;

use doc_stream::memory::MemoryBroker;
use doc_stream::progress::NoopProgress;
use doc_stream::report::FailureReporter;
use doc_stream::{handler_fn, DeliveryOutcome, DocStream, GroupContext};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct IndexDocument {
    id: u32,
    body: String,
}

fn document(id: u32) -> IndexDocument {
    IndexDocument {
        id,
        body: format!("document {id}"),
    }
}

fn stream(broker: &MemoryBroker) -> DocStream {
    DocStream::builder(Arc::new(broker.clone()))
        .progress(Arc::new(NoopProgress))
        .build()
}

#[tokio::test]
async fn documents_flow_from_producer_to_batch_consumer() {
    let broker = MemoryBroker::new();
    let stream = stream(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = handler_fn(move |docs: Vec<IndexDocument>, topic: String| {
        let tx = tx.clone();
        async move {
            for doc in docs {
                tx.send((topic.clone(), doc))?;
            }
            anyhow::Ok(())
        }
    });
    let consumer_id = stream
        .subscribe_batch("index", handler, &GroupContext::new("indexers"))
        .await
        .unwrap()
        .expect("memory broker always connects");
    assert!(consumer_id.starts_with("index-"));

    let docs: Vec<IndexDocument> = (1..=4).map(document).collect();
    assert_eq!(
        stream.send_batch("index", &docs).await,
        DeliveryOutcome::Delivered { messages: 4 }
    );
    assert_eq!(
        stream.send("index", &document(5)).await,
        DeliveryOutcome::Delivered { messages: 1 }
    );

    let mut received = Vec::new();
    while received.len() < 5 {
        let (topic, doc) = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for documents")
            .unwrap();
        assert_eq!(topic, "index");
        received.push(doc);
    }
    assert_eq!(received, (1..=5).map(document).collect::<Vec<_>>());

    assert_eq!(stream.shutdown().await, 1);
}

#[tokio::test]
async fn concurrent_sends_all_reach_a_single_message_consumer() {
    let broker = MemoryBroker::new();
    let stream = stream(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = handler_fn(move |docs: Vec<IndexDocument>, _topic: String| {
        let tx = tx.clone();
        async move {
            for doc in docs {
                tx.send(doc.id)?;
            }
            anyhow::Ok(())
        }
    });
    stream
        .subscribe("index", handler, &GroupContext::new("indexers"))
        .await
        .unwrap();

    let docs: Vec<IndexDocument> = (1..=20).map(document).collect();
    let outcomes = join_all(docs.iter().map(|doc| stream.send("index", doc))).await;
    assert!(outcomes
        .iter()
        .all(|outcome| *outcome == DeliveryOutcome::Delivered { messages: 1 }));
    assert_eq!(broker.stats().network_sends, 20);

    let mut ids = Vec::new();
    while ids.len() < 20 {
        ids.push(
            timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for documents")
                .unwrap(),
        );
    }
    ids.sort();
    assert_eq!(ids, (1..=20).collect::<Vec<_>>());

    assert_eq!(stream.shutdown().await, 1);
}

#[tokio::test]
async fn broker_outage_is_reported_but_never_raised() {
    let broker = MemoryBroker::new();
    let (failures, mut reports) = FailureReporter::channel();
    let stream = DocStream::builder(Arc::new(broker.clone()))
        .progress(Arc::new(NoopProgress))
        .failure_reporter(failures)
        .build();
    broker.fail_connects(true);

    assert_eq!(stream.send("index", &document(1)).await, DeliveryOutcome::Failed);
    let handler = handler_fn(|_docs: Vec<IndexDocument>, _topic: String| async {
        anyhow::Ok(())
    });
    let subscribed = stream
        .subscribe_batch("index", handler, &GroupContext::new("indexers"))
        .await
        .unwrap();
    assert_eq!(subscribed, None);

    let contexts = vec![
        reports.recv().await.unwrap().context,
        reports.recv().await.unwrap().context,
    ];
    assert_eq!(contexts, vec!["send", "subscribe"]);
    assert_eq!(stream.shutdown().await, 0);
}

#[tokio::test]
async fn consumers_stop_after_shutdown() {
    let broker = MemoryBroker::new();
    let stream = stream(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = handler_fn(move |docs: Vec<IndexDocument>, _topic: String| {
        let tx = tx.clone();
        async move {
            for doc in docs {
                tx.send(doc.id)?;
            }
            anyhow::Ok(())
        }
    });
    stream
        .subscribe("index", handler, &GroupContext::new("indexers"))
        .await
        .unwrap();
    assert_eq!(stream.shutdown().await, 1);

    stream.send("index", &document(1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}
