//! Purger behavior against the in-memory broker.

use broker_transport::{
    BrokerTransport, InMemoryBroker, ReceiveMode, ReceiveTarget,
};
use chrono::{TimeZone, Utc};
use event_relay::{BatchedSender, EventEnvelope, MessageConverter, Purger, SenderConfig};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

async fn seed(broker: &InMemoryBroker, destination: &str, count: usize) -> Vec<EventEnvelope> {
    let sender = BatchedSender::new(
        Arc::new(broker.clone()),
        Arc::new(MessageConverter::new()),
        SenderConfig::new(destination),
    );
    let events: Vec<EventEnvelope> = (0..count)
        .map(|i| {
            let mut env = EventEnvelope::new(json!({"seq": i}));
            env.occurred_at = Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).unwrap();
            env
        })
        .collect();
    sender.send(&events).await.unwrap();
    events
}

#[tokio::test]
async fn test_purge_drains_queue_and_reports_count() {
    let broker = InMemoryBroker::new();
    seed(&broker, "orders.events", 7).await;
    let target = ReceiveTarget::queue("orders.events");
    assert_eq!(broker.queue_len(&target), 7);

    let purger = Purger::new(Arc::new(broker.clone())).with_batch_size(3);
    let purged = purger.purge("orders.events", None, false, None).await.unwrap();

    assert_eq!(purged, 7);
    assert_eq!(broker.queue_len(&target), 0);
}

#[tokio::test]
async fn test_purge_invokes_callback_per_message_in_receive_order() {
    let broker = InMemoryBroker::new();
    let events = seed(&broker, "orders.events", 5).await;

    let mut seen = Vec::new();
    let purger = Purger::new(Arc::new(broker.clone())).with_batch_size(2);
    let mut callback = |message: &broker_transport::ReceivedMessage| {
        seen.push(message.message_id.clone());
    };
    let purged = purger
        .purge("orders.events", None, false, Some(&mut callback))
        .await
        .unwrap();

    assert_eq!(purged, 5);
    let expected: Vec<String> = events.iter().map(|e| e.id.to_string()).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_purge_empty_queue_terminates_immediately() {
    let broker = InMemoryBroker::new();

    let purger = Purger::new(Arc::new(broker.clone()));
    let purged = purger.purge("nothing.here", None, false, None).await.unwrap();

    assert_eq!(purged, 0);
}

#[tokio::test]
async fn test_purge_dead_letter_sub_queue_only() {
    let broker = InMemoryBroker::new();
    seed(&broker, "orders.events", 2).await;
    let target = ReceiveTarget::queue("orders.events");

    // Move one message to the dead-letter sub-queue
    let mut deliveries = broker
        .receive(&target, 1, Duration::ZERO, ReceiveMode::PeekLock)
        .await
        .unwrap();
    deliveries
        .remove(0)
        .lock
        .dead_letter(BTreeMap::new(), "poison", "unprocessable")
        .await
        .unwrap();

    let purger = Purger::new(Arc::new(broker.clone()));
    let purged = purger.purge("orders.events", None, true, None).await.unwrap();

    assert_eq!(purged, 1);
    // The main queue still holds the remaining message
    assert_eq!(broker.queue_len(&target), 1);
    assert_eq!(broker.queue_len(&target.clone().dead_letter()), 0);
}

#[tokio::test]
async fn test_purge_subscription_target() {
    let broker = InMemoryBroker::new();
    broker.create_subscription("orders.events", "audit");
    broker.create_subscription("orders.events", "billing");
    seed(&broker, "orders.events", 3).await;

    let purger = Purger::new(Arc::new(broker.clone()));
    let purged = purger
        .purge("orders.events", Some("audit"), false, None)
        .await
        .unwrap();

    assert_eq!(purged, 3);
    // The sibling subscription keeps its copies
    let billing = ReceiveTarget::subscription("orders.events", "billing");
    assert_eq!(broker.queue_len(&billing), 3);
}
