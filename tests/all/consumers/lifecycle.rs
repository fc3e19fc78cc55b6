use crate::consumers::{json_properties, services_with, Greet, Tally};
use crate::helpers::{eventually, BrokerCall, InMemoryBroker};
use carrot_courier::consumers::{ConfigurationError, Consumer, ProcessingError};
use carrot_courier::services::ServiceCollection;
use fake::faker::lorem::en::Word;
use fake::Fake;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn consumer(broker: &InMemoryBroker, tally: &Tally) -> Consumer {
    Consumer::builder(broker.transport(), services_with(tally))
        .queue_name("greetings")
        .consumer_tag("greeter")
        .handler(|tally: Arc<Tally>, _greet: Greet| async move {
            tally.hit();
            Ok::<_, anyhow::Error>(())
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn starting_subscribes_to_the_queue() {
    let broker = InMemoryBroker::new();
    let queue_name: String = Word().fake();
    let consumer = Consumer::builder(broker.transport(), ServiceCollection::new().build())
        .queue_name(queue_name.clone())
        .prefetch_count(7)
        .handler(|_tally: Arc<Tally>, _greet: Greet| async move { Ok::<_, anyhow::Error>(()) })
        .build()
        .unwrap();

    consumer.start().await.unwrap();

    assert_eq!(
        broker.calls(),
        vec![BrokerCall::Subscribe {
            queue_name,
            prefetch_count: 7,
            consumer_tag: consumer.consumer_tag().to_owned(),
        }]
    );
    assert!(!consumer.consumer_tag().is_empty());
}

#[tokio::test]
async fn starting_twice_does_not_subscribe_twice() {
    let broker = InMemoryBroker::new();
    let consumer = consumer(&broker, &Tally::default());

    consumer.start().await.unwrap();
    consumer.start().await.unwrap();

    assert_eq!(broker.channels_opened(), 1);
    assert_eq!(
        broker.count(|call| matches!(call, BrokerCall::Subscribe { .. })),
        1
    );
}

#[tokio::test]
async fn invalid_parameters_are_refused_when_building() {
    let broker = InMemoryBroker::new();
    let handler = |_tally: Arc<Tally>, _greet: Greet| async move { Ok::<_, anyhow::Error>(()) };

    let unnamed = Consumer::builder(broker.transport(), ServiceCollection::new().build())
        .queue_name("  ")
        .handler(handler)
        .build();
    let no_prefetch = Consumer::builder(broker.transport(), ServiceCollection::new().build())
        .queue_name("greetings")
        .prefetch_count(0)
        .handler(handler)
        .build();

    assert!(matches!(unnamed, Err(ConfigurationError::EmptyQueueName)));
    assert!(matches!(
        no_prefetch,
        Err(ConfigurationError::ZeroPrefetchCount)
    ));
}

#[tokio::test]
async fn subscription_failures_surface_from_start() {
    let broker = InMemoryBroker::new().failing_subscriptions();
    let consumer = consumer(&broker, &Tally::default());

    let outcome = consumer.start().await;

    assert!(matches!(outcome, Err(ConfigurationError::Transport { .. })));
    assert_eq!(broker.calls(), vec![BrokerCall::Close]);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_deliveries_before_cancelling() {
    let broker = InMemoryBroker::new();
    let started = Arc::new(AtomicBool::new(false));
    let services = ServiceCollection::new()
        .add_singleton(Arc::clone(&started))
        .build();
    let consumer = Consumer::builder(broker.transport(), services)
        .queue_name("greetings")
        .consumer_tag("slow")
        .handler(|started: Arc<Arc<AtomicBool>>, _greet: Greet| async move {
            started.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, anyhow::Error>(())
        })
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    let delivery_tag = broker.deliver(json_properties(), r#"{"name":"Alice"}"#);
    eventually(|| started.load(Ordering::SeqCst)).await;
    consumer.shutdown().await;

    assert_eq!(
        broker.calls()[1..],
        [
            BrokerCall::Ack(delivery_tag),
            BrokerCall::Cancel("slow".into()),
            BrokerCall::Close,
        ]
    );
}

#[tokio::test]
async fn shutting_down_twice_cancels_the_subscription_once() {
    let broker = InMemoryBroker::new();
    let consumer = consumer(&broker, &Tally::default());
    consumer.start().await.unwrap();

    consumer.shutdown().await;
    consumer.shutdown().await;

    assert_eq!(
        broker.count(|call| matches!(call, BrokerCall::Cancel(_))),
        1
    );
}

#[tokio::test]
async fn deliveries_received_after_shutdown_are_not_processed() {
    let broker = InMemoryBroker::new();
    let tally = Tally::default();
    let consumer = consumer(&broker, &tally);
    consumer.start().await.unwrap();
    consumer.shutdown().await;

    let outcome = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":"Alice"}"#))
        .await;

    assert!(outcome.acknowledgement().is_none());
    assert!(matches!(outcome.result(), Err(ProcessingError::NotRunning)));
    assert!(broker.settlements().is_empty());
    assert_eq!(tally.calls(), 0);
}

#[tokio::test]
async fn deliveries_received_before_start_are_not_processed() {
    let broker = InMemoryBroker::new();
    let tally = Tally::default();
    let consumer = consumer(&broker, &tally);

    let outcome = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":"Alice"}"#))
        .await;

    assert!(outcome.acknowledgement().is_none());
    assert_eq!(tally.calls(), 0);
}

#[tokio::test]
async fn a_stopped_consumer_cannot_be_restarted() {
    let broker = InMemoryBroker::new();
    let consumer = consumer(&broker, &Tally::default());
    consumer.start().await.unwrap();
    consumer.shutdown().await;

    consumer.start().await.unwrap();

    assert_eq!(broker.channels_opened(), 1);
}

#[tokio::test]
async fn the_consumer_terminates_when_the_broker_closes_the_subscription() {
    let broker = InMemoryBroker::new();
    let consumer = consumer(&broker, &Tally::default());
    consumer.start().await.unwrap();

    broker.close_subscription();

    tokio::time::timeout(Duration::from_secs(5), consumer.terminated())
        .await
        .expect("The consumer did not terminate");
}

/// Holds back the deliveries it is asked to until released.
#[derive(Clone, Default)]
struct Gate(Arc<tokio::sync::Notify>);

#[tokio::test]
async fn a_stuck_delivery_does_not_hold_back_the_next_ones() {
    let broker = InMemoryBroker::new();
    let gate = Gate::default();
    let consumer = Consumer::builder(
        broker.transport(),
        ServiceCollection::new().add_singleton(gate.clone()).build(),
    )
    .queue_name("greetings")
    .handler(|gate: Arc<Gate>, greet: Greet| async move {
        if greet.name == "slow" {
            gate.0.notified().await;
        }
        Ok::<_, anyhow::Error>(())
    })
    .build()
    .unwrap();
    consumer.start().await.unwrap();

    let slow = broker.deliver(json_properties(), r#"{"name":"slow"}"#);
    let fast = broker.deliver(json_properties(), r#"{"name":"fast"}"#);

    let settlements = broker.wait_for_settlements(1).await;
    assert_eq!(settlements, vec![BrokerCall::Ack(fast)]);

    gate.0.notify_one();
    let settlements = broker.wait_for_settlements(2).await;
    assert_eq!(
        settlements,
        vec![BrokerCall::Ack(fast), BrokerCall::Ack(slow)]
    );
}
