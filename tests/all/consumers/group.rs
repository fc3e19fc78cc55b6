use crate::consumers::{json_properties, services_with, Greet, Tally};
use crate::helpers::{BrokerCall, InMemoryBroker};
use carrot_courier::consumers::{ConfigurationError, Consumer, ConsumerGroup};
use std::sync::Arc;
use std::time::Duration;

fn consumer(broker: &InMemoryBroker, tally: &Tally, queue_name: &str) -> Consumer {
    Consumer::builder(broker.transport(), services_with(tally))
        .queue_name(queue_name)
        .handler(|tally: Arc<Tally>, _greet: Greet| async move {
            tally.hit();
            Ok::<_, anyhow::Error>(())
        })
        .build()
        .unwrap()
}

fn cancels(broker: &InMemoryBroker) -> usize {
    broker.count(|call| matches!(call, BrokerCall::Cancel(_)))
}

#[tokio::test]
async fn the_group_runs_every_consumer_until_shutdown() {
    let (orders, refunds) = (InMemoryBroker::new(), InMemoryBroker::new());
    let tally = Tally::default();
    let group = ConsumerGroup::new()
        .with_consumer(consumer(&orders, &tally, "orders"))
        .with_consumer(consumer(&refunds, &tally, "refunds"));
    let (shutdown, shutdown_requested) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(group.run_until_shutdown(async {
        let _ = shutdown_requested.await;
    }));

    crate::helpers::eventually(|| {
        !orders.calls().is_empty() && !refunds.calls().is_empty()
    })
    .await;
    orders.deliver(json_properties(), r#"{"name":"Alice"}"#);
    refunds.deliver(json_properties(), r#"{"name":"Bob"}"#);
    orders.wait_for_settlements(1).await;
    refunds.wait_for_settlements(1).await;
    shutdown.send(()).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(tally.calls(), 2);
    assert_eq!((cancels(&orders), cancels(&refunds)), (1, 1));
}

#[tokio::test]
async fn the_group_fails_fast_if_a_consumer_cannot_start() {
    let healthy = InMemoryBroker::new();
    let broken = InMemoryBroker::new().failing_subscriptions();
    let tally = Tally::default();
    let group = ConsumerGroup::new()
        .with_consumer(consumer(&healthy, &tally, "orders"))
        .with_consumer(consumer(&broken, &tally, "missing"));

    let outcome = group.run_until_shutdown(std::future::pending()).await;

    assert!(matches!(outcome, Err(ConfigurationError::Transport { .. })));
    assert_eq!(cancels(&healthy), 1);
}

#[tokio::test]
async fn the_group_stops_when_a_consumer_terminates() {
    let (orders, refunds) = (InMemoryBroker::new(), InMemoryBroker::new());
    let tally = Tally::default();
    let group = ConsumerGroup::new()
        .with_consumer(consumer(&orders, &tally, "orders"))
        .with_consumer(consumer(&refunds, &tally, "refunds"));
    let run = tokio::spawn(group.run_until_shutdown(std::future::pending()));

    crate::helpers::eventually(|| {
        !orders.calls().is_empty() && !refunds.calls().is_empty()
    })
    .await;
    orders.close_subscription();

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("The group did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(cancels(&refunds), 1);
}
