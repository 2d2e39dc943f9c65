use super::*;
use crate::connection::MemoryBroker;
use crate::stage;
use crate::types::{MessageProperties, OutgoingMessage, RawDocument};
use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn json_message(value: Value) -> OutgoingMessage {
    OutgoingMessage {
        body: Bytes::from(value.to_string()),
        properties: MessageProperties::new(Some("application/json"), None),
    }
}

fn consumer(broker: &MemoryBroker, options: &[(&str, &str)]) -> ConsumerStage {
    let options = StageOptions::new(options.iter().copied());
    ConsumerStage::from_options(&options)
        .unwrap()
        .with_connector(Arc::new(broker.clone()))
}

fn map(value: Value) -> Item {
    Item::from_value(value).unwrap()
}

async fn collect(stream: ItemStream) -> Vec<Result<Item>> {
    stream.collect().await
}

#[test]
fn test_to_item() {
    assert_eq!(to_item(Payload::Value(json!({"id": 1})), None).unwrap(), map(json!({"id": 1})));
    assert_eq!(
        to_item(Payload::Value(json!([1, 2])), Some("rows")).unwrap(),
        map(json!({"rows": [1, 2]}))
    );
    assert!(matches!(
        to_item(Payload::Value(json!("text")), None),
        Err(StageError::TypeMismatch { expected: "map", found: "string" })
    ));

    let document = RawDocument::new().with_header("Subject", "hi").with_body("body");
    assert_eq!(
        to_item(Payload::Document(document.clone()), None).unwrap(),
        Item::Document(document.clone())
    );
    assert_eq!(
        to_item(Payload::Document(document), Some("mail")).unwrap(),
        map(json!({"mail": "Subject: hi\n\nbody"}))
    );

    let archive = Bytes::from_static(b"ustar");
    assert_eq!(to_item(Payload::Archive(archive.clone()), None).unwrap(), Item::Archive(archive.clone()));
    assert!(matches!(
        to_item(Payload::Archive(archive), Some("tar")),
        Err(StageError::TypeMismatch { .. })
    ));
}

#[tokio::test]
async fn test_upstream_items_come_first() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.enqueue("orders", json_message(json!({"id": 1})));

    let upstream = stage::items(vec![map(json!({"from": "upstream"}))]);
    let mut stream = consumer(&broker, &[("queue", "orders")]).run(upstream);

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, map(json!({"from": "upstream"})));
    assert_eq!(broker.connections_opened(), 0);

    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second, map(json!({"id": 1})));
    assert_eq!(broker.connections_opened(), 1);

    assert!(stream.next().await.is_none());
    assert_eq!(broker.acked("orders"), 1);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_acknowledges_when_downstream_resumes() {
    let broker = MemoryBroker::new();
    broker.enqueue("orders", json_message(json!({"id": 1})));
    broker.enqueue("orders", json_message(json!({"id": 2})));

    let mut stream = consumer(&broker, &[("queue", "orders")]).run(stage::empty());

    stream.next().await.unwrap().unwrap();
    assert_eq!(broker.acked("orders"), 0);
    assert_eq!(broker.unacked("orders"), 1);

    stream.next().await.unwrap().unwrap();
    assert_eq!(broker.acked("orders"), 1);

    assert!(stream.next().await.is_none());
    assert_eq!(broker.acked("orders"), 2);
    assert_eq!(broker.depth("orders"), 0);
}

#[tokio::test]
async fn test_limit_is_a_snapshot() {
    let broker = MemoryBroker::new();
    broker.enqueue("orders", json_message(json!({"id": 1})));
    broker.enqueue("orders", json_message(json!({"id": 2})));

    let mut stream = consumer(&broker, &[("queue", "orders")]).run(stage::empty());
    stream.next().await.unwrap().unwrap();

    broker.enqueue("orders", json_message(json!({"id": 3})));
    let rest = collect(stream).await;

    assert_eq!(rest.len(), 1);
    assert_eq!(broker.depth("orders"), 1);
}

#[tokio::test]
async fn test_explicit_limit_overrides_depth() {
    let broker = MemoryBroker::new();
    for id in 1..=5 {
        broker.enqueue("orders", json_message(json!({ "id": id })));
    }

    let items = collect(consumer(&broker, &[("queue", "orders"), ("limit", "3")]).run(stage::empty())).await;

    let ids: Vec<Value> = items.into_iter().map(|item| item.unwrap().get("id").cloned().unwrap()).collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(broker.depth("orders"), 2);
}

#[tokio::test]
async fn test_key_wraps_each_item() {
    let broker = MemoryBroker::new();
    broker.enqueue("orders", json_message(json!({"id": 1})));

    let items = collect(consumer(&broker, &[("queue", "orders"), ("key", "order")]).run(stage::empty())).await;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap(), &map(json!({"order": {"id": 1}})));
}

#[tokio::test]
async fn test_without_ack_messages_settle_on_delivery() {
    let broker = MemoryBroker::new();
    broker.enqueue("orders", json_message(json!({"id": 1})));
    broker.enqueue("orders", json_message(json!({"id": 2})));

    let mut stream = consumer(&broker, &[("queue", "orders"), ("ack", "off")]).run(stage::empty());
    stream.next().await.unwrap().unwrap();

    assert_eq!(broker.unacked("orders"), 0);
    assert_eq!(broker.acked("orders"), 1);
    assert_eq!(collect(stream).await.len(), 1);
}

#[tokio::test]
async fn test_unsupported_format_is_fatal() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.enqueue(
        "orders",
        OutgoingMessage {
            body: Bytes::from_static(b"id=1"),
            properties: MessageProperties::new(Some("text/plain"), None),
        },
    );
    broker.enqueue("orders", json_message(json!({"id": 2})));

    let items = collect(consumer(&broker, &[("queue", "orders")]).run(stage::empty())).await;

    assert_eq!(items.len(), 1);
    let error = items.into_iter().next().unwrap().unwrap_err();
    assert_eq!(error.category(), "unsupported_format");
    assert!(error.to_string().starts_with("consumer failed (decoding message 1"));
    assert!(matches!(
        error.root(),
        StageError::UnsupportedFormat { content_type: Some(t), content_encoding: None } if t == "text/plain"
    ));

    // The failed message stays on the queue
    assert_eq!(broker.depth("orders"), 2);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_connection_failure_is_fatal() {
    let broker = MemoryBroker::new();
    broker.set_unavailable(Some("connection refused"));

    let items = collect(consumer(&broker, &[("queue", "orders")]).run(stage::items(vec![map(json!({}))]))).await;

    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    let error = items[1].as_ref().unwrap_err();
    assert_eq!(error.category(), "connection");
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn test_declaration_failure_is_fatal() {
    let broker = MemoryBroker::new();

    let options = [
        ("queue", "orders"),
        ("exchange", "amq.topic"),
        ("exchange_auto_declare", "yes"),
        ("exchange_type", "fanout"),
    ];
    let items = collect(consumer(&broker, &options).run(stage::empty())).await;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap_err().category(), "declaration");
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_cancellation_stops_cleanly() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.declare_queue("orders");
    let cancel = CancellationToken::new();

    let stream = consumer(&broker, &[("queue", "orders")])
        .with_cancellation(cancel.clone())
        .run(stage::empty());

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let items = tokio::time::timeout(Duration::from_secs(5), collect(stream)).await.unwrap();
    assert!(items.is_empty());
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_dropped_stage_returns_unacked_message() {
    let broker = MemoryBroker::new();
    broker.enqueue("orders", json_message(json!({"id": 1})));
    broker.enqueue("orders", json_message(json!({"id": 2})));

    let mut stream = consumer(&broker, &[("queue", "orders")]).run(stage::empty());
    stream.next().await.unwrap().unwrap();
    drop(stream);

    for _ in 0..10 {
        if broker.open_connections() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.depth("orders"), 2);
    assert_eq!(broker.acked("orders"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_idle_termination() {
    let broker = MemoryBroker::new();
    broker.enqueue("orders", json_message(json!({"id": 1})));

    let publisher = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        publisher.inject("", "orders", json_message(json!({"id": 2}))).unwrap();
    });

    let started = Instant::now();
    let items = collect(consumer(&broker, &[("queue", "orders"), ("idle_timeout", "30")]).run(stage::empty())).await;
    let elapsed = started.elapsed();

    assert_eq!(items.len(), 2);
    assert!(elapsed >= Duration::from_secs(40), "stopped after {:?}", elapsed);
    assert!(elapsed <= Duration::from_secs(41), "stopped after {:?}", elapsed);
    assert_eq!(broker.acked("orders"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shadow_idle_termination() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.enqueue("orders", json_message(json!({"id": 1})));
    broker.enqueue("orders", json_message(json!({"id": 2})));

    let publisher = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(12_500)).await;
        publisher.inject("", "orders", json_message(json!({"id": 3}))).unwrap();
    });

    let shadow = consumer(
        &broker,
        &[("queue", "orders"), ("idle_timeout", "on"), ("idle_monitor", "shadow")],
    );
    let mut stream = shadow.run(stage::empty());

    let started = Instant::now();
    let mut ids = Vec::new();
    while let Some(item) = stream.next().await {
        ids.push(item.unwrap().get("id").cloned().unwrap());
        if ids.len() == 1 {
            assert_eq!(broker.open_connections(), 2);
        }
    }
    let elapsed = started.elapsed();

    assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    // Third message is noticed on the 13 s probe; the stage then idles for 30 s
    assert!(elapsed >= Duration::from_secs(43), "stopped after {:?}", elapsed);
    assert!(elapsed <= Duration::from_secs(44), "stopped after {:?}", elapsed);
    assert_eq!(broker.acked("orders"), 3);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_upstream_error_ends_the_stage() {
    let broker = MemoryBroker::new();
    broker.enqueue("orders", json_message(json!({"id": 1})));

    let upstream = futures::stream::iter(vec![
        Err(StageError::Broker("upstream blew up".to_string())),
        Ok(map(json!({"after": "error"}))),
    ])
    .boxed();
    let items = collect(consumer(&broker, &[("queue", "orders")]).run(upstream)).await;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap_err().category(), "broker");
    assert_eq!(broker.connections_opened(), 0);
    assert_eq!(broker.acked("orders"), 0);
    assert_eq!(broker.depth("orders"), 1);
}

#[tokio::test]
async fn test_broker_cancelled_consumer_is_fatal() {
    let broker = MemoryBroker::new();
    broker.enqueue("orders", json_message(json!({"id": 1})));
    broker.enqueue("orders", json_message(json!({"id": 2})));

    let mut stream = consumer(&broker, &[("queue", "orders"), ("ack", "no")]).run(stage::empty());
    assert_eq!(stream.next().await.unwrap().unwrap(), map(json!({"id": 1})));

    assert!(broker.delete_queue("orders"));
    let error = stream.next().await.unwrap().unwrap_err();
    assert_eq!(error.category(), "broker");
    assert!(error.to_string().starts_with("consumer failed (waiting for message 2)"));

    assert!(stream.next().await.is_none());
    assert_eq!(broker.open_connections(), 0);
}
