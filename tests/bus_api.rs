// Each file in the tests directory is treated as its own separate crate.
// Tests touching a live broker are ignored by default; run them with
// `cargo test -- --ignored` against a local RabbitMQ instance.

use bunnybus::{
    bus::{error_queue_name, queue_channel_name},
    handler_fn, BunnyBus, BusConfig, BusError, BusEvent, Handlers, PublishOptions,
    SubscribeRequest, SubscriptionOptions,
};
use serde_json::json;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

#[tokio::test]
async fn subscribe_preconditions_surface_to_the_caller() {
    let bus = BunnyBus::default();

    bus.block("orders");
    let blocked = bus
        .subscribe_with(SubscribeRequest {
            queue: "orders".to_owned(),
            handlers: Handlers::new(),
            options: SubscriptionOptions::default(),
        })
        .await;
    assert_eq!(
        blocked.unwrap_err(),
        BusError::SubscriptionBlocked("orders".to_owned())
    );
    bus.unblock("orders");

    bus.subscriptions()
        .create("orders", Handlers::new(), SubscriptionOptions::default());
    bus.subscriptions().tag("orders", "tag-1");
    let exists = bus.subscribe("orders", Handlers::new()).await;
    assert_eq!(
        exists.unwrap_err(),
        BusError::SubscriptionExist("orders".to_owned())
    );
}

#[tokio::test]
async fn lifecycle_events_reach_facade_listeners() {
    let bus = BunnyBus::default();
    let mut listener = bus.events().subscribe();

    bus.block("orders");
    bus.unblock("orders");

    assert_eq!(
        listener.recv().await.unwrap(),
        BusEvent::SubscriptionBlocked { queue: "orders".to_owned() }
    );
    assert_eq!(
        listener.recv().await.unwrap(),
        BusEvent::SubscriptionUnblocked { queue: "orders".to_owned() }
    );
}

#[tokio::test]
async fn configured_selectors_drive_the_facade_dispatcher() {
    let bus = BunnyBus::new(BusConfig {
        partition_key_selectors: vec!["{message.serialNumber}".to_owned()],
        ..BusConfig::default()
    });

    let counter = Arc::new(AtomicUsize::new(0));
    let out_of_order = Arc::new(AtomicUsize::new(0));
    let payload = json!({"serialNumber": "sn-1"});

    for expected in 0..10usize {
        let counter = counter.clone();
        let out_of_order = out_of_order.clone();
        bus.dispatcher().push(
            "orders",
            Some(&payload),
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if counter.fetch_add(1, Ordering::SeqCst) != expected {
                    out_of_order.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }),
        );
    }

    assert!(bus.dispatcher().drained(Duration::from_secs(5)).await);
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert_eq!(out_of_order.load(Ordering::SeqCst), 0);
    assert_eq!(bus.dispatcher().queue_count(), 0);
}

#[tokio::test]
async fn well_known_names_are_derived_from_the_queue() {
    assert_eq!(queue_channel_name("orders"), "subscribe:orders");
    assert_eq!(error_queue_name("orders"), "orders_error");
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ instance"]
async fn requeue_round_trip_preserves_identity() {
    let bus = BunnyBus::default();
    let queue = "bunnybus-it-requeue";

    bus.create_queue(&bunnybus::queue::QueueDefinition::new(queue).durable())
        .await
        .unwrap();
    bus.purge_queue(queue).await.unwrap();

    bus.send(
        &json!({"name": "bunnybus", "event": "a"}),
        queue,
        Some(PublishOptions {
            source: Some("test".to_owned()),
            ..PublishOptions::default()
        }),
    )
    .await
    .unwrap();

    let first = bus.get(queue).await.unwrap().expect("message should be waiting");
    assert_eq!(first.headers.retry_count, 0);
    assert_eq!(first.headers.route_key, "a");
    assert_eq!(first.headers.source.as_deref(), Some("test"));

    bus.requeue_message(queue, &first.payload, &first.headers, Some(first.delivery_tag))
        .await
        .unwrap();

    let second = bus
        .get(queue)
        .await
        .unwrap()
        .expect("requeued message should be waiting");
    assert_eq!(second.headers.transaction_id, first.headers.transaction_id);
    assert_eq!(second.headers.created_at, first.headers.created_at);
    assert_eq!(second.headers.retry_count, 1);
    assert!(second.headers.requeued_at.is_some());
    assert_eq!(second.headers.route_key, "a");

    bus.ack_message(second.delivery_tag).await.unwrap();
    bus.delete_queue(queue, false, false).await.unwrap();
    bus.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ instance"]
async fn published_messages_reach_wildcard_subscriptions() {
    let bus = BunnyBus::default();
    let queue = "bunnybus-it-pubsub";
    let (delivered_tx, mut delivered_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut handlers = Handlers::new();
    handlers.insert(
        "abc.*.xyz".to_owned(),
        handler_fn(move |message, ops| {
            let delivered_tx = delivered_tx.clone();
            Box::pin(async move {
                let _ = delivered_tx.send(message.payload.clone());
                ops.ack().await
            })
        }),
    );

    bus.subscribe(queue, handlers).await.unwrap();
    bus.publish(&json!({"event": "abc.helloworld.xyz", "name": "bunnybus"}), None)
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), delivered_rx.recv())
        .await
        .expect("handler should receive the message")
        .unwrap();
    assert_eq!(received["name"], "bunnybus");
    assert_eq!(received["event"], "abc.helloworld.xyz");

    bus.unsubscribe(queue).await.unwrap();
    bus.delete_queue(queue, false, false).await.unwrap();
    bus.delete_queue(&error_queue_name(queue), false, false)
        .await
        .unwrap();
    bus.stop().await.unwrap();
}
