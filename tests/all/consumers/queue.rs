use crate::consumers::{json_properties, services_with, Empty, Greet, Tally};
use crate::helpers::{eventually, BrokerCall, CountingServices, InMemoryBroker};
use carrot_courier::consumers::{
    Acknowledgement, Adapter, ApplicationError, Consumer, DispatchError, DispatchScope,
    ProcessingError, ResultAction,
};
use carrot_courier::services::{ServiceCollection, ServiceResolutionError};
use std::sync::Arc;
use std::time::Duration;

async fn started(consumer: Consumer) -> Consumer {
    consumer.start().await.unwrap();
    consumer
}

#[tokio::test]
async fn an_empty_json_object_is_acked_once() {
    let broker = InMemoryBroker::new();
    let tally = Tally::default();
    let consumer = Consumer::builder(broker.transport(), services_with(&tally))
        .queue_name("pings")
        .handler(|tally: Arc<Tally>, _ping: Empty| async move {
            tally.hit();
            Ok::<_, anyhow::Error>(())
        })
        .build()
        .unwrap();
    let _consumer = started(consumer).await;

    let delivery_tag = broker.deliver(json_properties(), "{}");

    let settlements = broker.wait_for_settlements(1).await;
    assert_eq!(settlements, vec![BrokerCall::Ack(delivery_tag)]);
    assert_eq!(tally.calls(), 1);
}

#[tokio::test]
async fn malformed_payloads_are_rejected_without_invoking_the_handler() {
    let broker = InMemoryBroker::new();
    let tally = Tally::default();
    let consumer = Consumer::builder(broker.transport(), services_with(&tally))
        .queue_name("greetings")
        .requeue_on_crash(true)
        .handler(|tally: Arc<Tally>, _greet: Greet| async move {
            tally.hit();
            Ok::<_, anyhow::Error>(())
        })
        .build()
        .unwrap();
    let consumer = started(consumer).await;

    let outcome = consumer
        .receive(broker.delivery(json_properties(), "not json"))
        .await;

    assert_eq!(
        outcome.acknowledgement(),
        Some(Acknowledgement::Reject { requeue: false })
    );
    assert!(matches!(
        outcome.result(),
        Err(ProcessingError::Deserialization(_))
    ));
    assert_eq!(tally.calls(), 0);
    assert_eq!(broker.settlements().len(), 1);
}

#[tokio::test]
async fn an_empty_body_is_rejected() {
    let broker = InMemoryBroker::new();
    let tally = Tally::default();
    let consumer = Consumer::builder(broker.transport(), services_with(&tally))
        .queue_name("greetings")
        .handler(|tally: Arc<Tally>, _greet: Greet| async move {
            tally.hit();
            Ok::<_, anyhow::Error>(())
        })
        .build()
        .unwrap();
    let _consumer = started(consumer).await;

    let delivery_tag = broker.deliver(json_properties(), "  ");

    let settlements = broker.wait_for_settlements(1).await;
    assert_eq!(
        settlements,
        vec![BrokerCall::Reject {
            delivery_tag,
            requeue: false
        }]
    );
    assert_eq!(tally.calls(), 0);
}

#[tokio::test]
async fn handler_failures_are_requeued_when_requested() {
    let broker = InMemoryBroker::new();
    let tally = Tally::default();
    let consumer = Consumer::builder(broker.transport(), services_with(&tally))
        .queue_name("greetings")
        .requeue_on_crash(true)
        .handler(|_tally: Arc<Tally>, greet: Greet| async move {
            Err::<(), _>(anyhow::anyhow!("{} is not welcome here", greet.name))
        })
        .build()
        .unwrap();
    let _consumer = started(consumer).await;

    let delivery_tag = broker.deliver(json_properties(), r#"{"name":"Mallory"}"#);

    let settlements = broker.wait_for_settlements(1).await;
    assert_eq!(
        settlements,
        vec![BrokerCall::Nack {
            delivery_tag,
            requeue: true
        }]
    );
}

#[tokio::test]
async fn handler_failures_are_never_requeued_by_default() {
    let broker = InMemoryBroker::new();
    let tally = Tally::default();
    let consumer = Consumer::builder(broker.transport(), services_with(&tally))
        .queue_name("greetings")
        .handler(|_tally: Arc<Tally>, _greet: Greet| async move {
            Err::<(), _>(anyhow::anyhow!("Boom"))
        })
        .build()
        .unwrap();
    let consumer = started(consumer).await;

    for _ in 0..3 {
        let outcome = consumer
            .receive(broker.delivery(json_properties(), r#"{"name":"Bob"}"#))
            .await;
        assert!(!outcome.was_requeued());
        assert!(matches!(
            outcome.result(),
            Err(ProcessingError::Dispatch(DispatchError::Application(_)))
        ));
    }

    assert_eq!(
        broker.count(|call| matches!(
            call,
            BrokerCall::Nack { requeue: true, .. } | BrokerCall::Reject { requeue: true, .. }
        )),
        0
    );
    assert_eq!(broker.settlements().len(), 3);
}

#[tokio::test]
async fn handlers_can_pick_the_result_action() {
    let broker = InMemoryBroker::new();
    let tally = Tally::default();
    let consumer = Consumer::builder(broker.transport(), services_with(&tally))
        .queue_name("greetings")
        .handler(|_tally: Arc<Tally>, greet: Greet| async move {
            let action = if greet.name.is_empty() {
                ResultAction::Reject { requeue: false }
            } else {
                ResultAction::Nack { requeue: true }
            };
            Ok::<_, anyhow::Error>(action)
        })
        .build()
        .unwrap();
    let consumer = started(consumer).await;

    let nameless = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":""}"#))
        .await;
    let named = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":"Alice"}"#))
        .await;

    assert_eq!(
        nameless.acknowledgement(),
        Some(Acknowledgement::Reject { requeue: false })
    );
    assert!(nameless.result().is_ok());
    assert!(named.was_requeued());
}

#[tokio::test]
async fn result_actions_without_exactly_one_acknowledgement_are_handler_failures() {
    let broker = InMemoryBroker::new();
    let tally = Tally::default();
    let consumer = Consumer::builder(broker.transport(), services_with(&tally))
        .queue_name("greetings")
        .handler(|_tally: Arc<Tally>, _greet: Greet| async move {
            Ok::<_, anyhow::Error>(ResultAction::Ack.then(ResultAction::Ack))
        })
        .build()
        .unwrap();
    let consumer = started(consumer).await;

    let outcome = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":"Alice"}"#))
        .await;

    assert_eq!(
        outcome.acknowledgement(),
        Some(Acknowledgement::Nack { requeue: false })
    );
    assert_eq!(broker.settlements().len(), 1);
}

#[tokio::test]
async fn a_missing_service_is_a_dispatch_failure_in_both_scopes() {
    for dispatch_scope in [DispatchScope::RootScope, DispatchScope::ChildScope] {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::builder(broker.transport(), ServiceCollection::new().build())
            .queue_name("greetings")
            .dispatch_scope(dispatch_scope)
            .handler(|tally: Arc<Tally>, _greet: Greet| async move {
                tally.hit();
                Ok::<_, anyhow::Error>(())
            })
            .build()
            .unwrap();
        let consumer = started(consumer).await;

        let outcome = consumer
            .receive(broker.delivery(json_properties(), r#"{"name":"Alice"}"#))
            .await;

        assert!(
            matches!(
                outcome.result(),
                Err(ProcessingError::Dispatch(DispatchError::Resolution(
                    ServiceResolutionError::NotRegistered(_)
                )))
            ),
            "{dispatch_scope:?}: {:?}",
            outcome.result()
        );
        assert_eq!(
            outcome.acknowledgement(),
            Some(Acknowledgement::Nack { requeue: false })
        );
    }
}

#[tokio::test]
async fn scoped_services_are_not_available_from_the_root_scope() {
    let broker = InMemoryBroker::new();
    let services = ServiceCollection::new().add_scoped(Tally::default).build();
    let consumer = Consumer::builder(broker.transport(), services)
        .queue_name("greetings")
        .dispatch_scope(DispatchScope::RootScope)
        .handler(|tally: Arc<Tally>, _greet: Greet| async move {
            tally.hit();
            Ok::<_, anyhow::Error>(())
        })
        .build()
        .unwrap();
    let consumer = started(consumer).await;

    let outcome = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":"Alice"}"#))
        .await;

    assert!(matches!(
        outcome.result(),
        Err(ProcessingError::Dispatch(DispatchError::Resolution(
            ServiceResolutionError::ScopedFromRoot(_)
        )))
    ));
}

#[tokio::test]
async fn child_scopes_are_disposed_of_exactly_once_whatever_the_outcome() {
    let broker = InMemoryBroker::new();
    let services = CountingServices::new(ServiceCollection::new().add_scoped(Tally::default).build());
    let consumer = Consumer::builder(broker.transport(), services.clone())
        .queue_name("greetings")
        .dispatch_in_child_scope()
        .handler(|tally: Arc<Tally>, greet: Greet| async move {
            tally.hit();
            match greet.name.as_str() {
                "panic" => panic!("The handler blew up"),
                "fail" => Err(anyhow::anyhow!("The handler failed")),
                _ => Ok(()),
            }
        })
        .build()
        .unwrap();
    let consumer = started(consumer).await;

    let succeeded = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":"Alice"}"#))
        .await;
    assert!(succeeded.result().is_ok());
    assert_eq!((services.created(), services.disposed()), (1, 1));

    let failed = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":"fail"}"#))
        .await;
    assert!(failed.result().is_err());
    assert_eq!((services.created(), services.disposed()), (2, 2));

    let panicked = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":"panic"}"#))
        .await;
    assert_eq!(
        panicked.acknowledgement(),
        Some(Acknowledgement::Nack { requeue: false })
    );
    assert_eq!((services.created(), services.disposed()), (3, 3));
}

#[tokio::test]
async fn child_scopes_are_disposed_of_when_processing_is_abandoned() {
    let broker = InMemoryBroker::new();
    let services = CountingServices::new(ServiceCollection::new().add_scoped(Tally::default).build());
    let consumer = Consumer::builder(broker.transport(), services.clone())
        .queue_name("greetings")
        .dispatch_in_child_scope()
        .handler(|tally: Arc<Tally>, _greet: Greet| async move {
            tally.hit();
            std::future::pending::<()>().await;
            Ok::<_, anyhow::Error>(())
        })
        .build()
        .unwrap();
    let consumer = started(consumer).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        consumer.receive(broker.delivery(json_properties(), r#"{"name":"Alice"}"#)),
    )
    .await;

    assert!(abandoned.is_err());
    assert_eq!(services.created(), 1);
    eventually(|| services.disposed() == 1).await;
}

#[tokio::test]
async fn keyed_services_are_resolved_by_key() {
    let broker = InMemoryBroker::new();
    let primary = Tally::default();
    let secondary = Tally::default();
    let services = ServiceCollection::new()
        .add_keyed_singleton("primary", primary.clone())
        .add_keyed_singleton("secondary", secondary.clone())
        .build();
    let consumer = Consumer::builder(broker.transport(), services)
        .queue_name("greetings")
        .handler(|tally: Arc<Tally>, _greet: Greet| async move {
            tally.hit();
            Ok::<_, anyhow::Error>(())
        })
        .service_key("secondary")
        .build()
        .unwrap();
    let consumer = started(consumer).await;

    let outcome = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":"Alice"}"#))
        .await;

    assert!(outcome.result().is_ok());
    assert_eq!((primary.calls(), secondary.calls()), (0, 1));
}

#[tokio::test]
async fn struct_adapters_can_be_bound() {
    struct Greeter;

    #[async_trait::async_trait]
    impl Adapter<Tally, Greet> for Greeter {
        type Output = ();

        async fn invoke(&self, tally: Arc<Tally>, greet: Greet) -> Result<(), ApplicationError> {
            if greet.name.is_empty() {
                return Err(ApplicationError::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "Who are you?",
                )));
            }
            tally.hit();
            Ok(())
        }
    }

    let broker = InMemoryBroker::new();
    let tally = Tally::default();
    let consumer = Consumer::builder(broker.transport(), services_with(&tally))
        .queue_name("greetings")
        .adapter(Greeter)
        .build()
        .unwrap();
    let consumer = started(consumer).await;

    let greeted = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":"Alice"}"#))
        .await;
    let anonymous = consumer
        .receive(broker.delivery(json_properties(), r#"{"name":""}"#))
        .await;

    assert!(greeted.result().is_ok());
    let Err(ProcessingError::Dispatch(DispatchError::Application(e))) = anonymous.result() else {
        panic!("Expected an application failure, got {:?}", anonymous.result());
    };
    assert!(e.type_name().starts_with("std::io::"), "{}", e.type_name());
    assert_eq!(tally.calls(), 1);
}
