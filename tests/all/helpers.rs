use carrot_courier::amqp::types::DeliveryTag;
use carrot_courier::amqp::BasicProperties;
use carrot_courier::consumers::Delivery;
use carrot_courier::services::{
    ServiceContainer, ServiceInstance, ServiceKey, ServiceProvider, ServiceResolutionError,
    ServiceScope,
};
use carrot_courier::transport::{Channel, Subscription, Transport, TransportError};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything a consumer or a publisher asked the broker to do.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    Subscribe {
        queue_name: String,
        prefetch_count: u16,
        consumer_tag: String,
    },
    Ack(DeliveryTag),
    Nack {
        delivery_tag: DeliveryTag,
        requeue: bool,
    },
    Reject {
        delivery_tag: DeliveryTag,
        requeue: bool,
    },
    Publish(Published),
    Cancel(String),
    Close,
}

impl BrokerCall {
    fn settles_a_delivery(&self) -> bool {
        matches!(
            self,
            BrokerCall::Ack(_) | BrokerCall::Nack { .. } | BrokerCall::Reject { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, TransportError>>;

#[derive(Default)]
struct BrokerState {
    calls: Mutex<Vec<BrokerCall>>,
    subscription: Mutex<Option<DeliverySender>>,
    next_delivery_tag: AtomicU64,
    channels_opened: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
}

/// A transport recording every call, with deliveries pushed by the test.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub fn failing_subscriptions(self) -> Self {
        self.state.fail_subscribe.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_publications(self) -> Self {
        self.state.fail_publish.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }

    /// Calls that settle a delivery: acks, nacks and rejects.
    pub fn settlements(&self) -> Vec<BrokerCall> {
        self.calls()
            .into_iter()
            .filter(BrokerCall::settles_a_delivery)
            .collect()
    }

    pub fn published(&self) -> Vec<Published> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BrokerCall::Publish(published) => Some(published),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&BrokerCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    /// Push a message to the active subscription, returning its delivery tag.
    pub fn deliver(&self, properties: BasicProperties, body: impl Into<Vec<u8>>) -> DeliveryTag {
        let delivery = self.delivery(properties, body);
        let delivery_tag = delivery.delivery_tag;
        let subscription = self.state.subscription.lock().unwrap();
        subscription
            .as_ref()
            .expect("No active subscription")
            .send(Ok(delivery))
            .expect("The subscription stream was dropped");
        delivery_tag
    }

    /// Build a delivery without pushing it.
    pub fn delivery(&self, properties: BasicProperties, body: impl Into<Vec<u8>>) -> Delivery {
        Delivery {
            delivery_tag: self.state.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1,
            exchange: "".into(),
            routing_key: "".into(),
            consumer_tag: "".into(),
            redelivered: false,
            properties,
            data: body.into(),
        }
    }

    /// End the subscription from the broker side.
    pub fn close_subscription(&self) {
        self.state.subscription.lock().unwrap().take();
    }

    /// Wait until `count` deliveries have been settled.
    pub async fn wait_for_settlements(&self, count: usize) -> Vec<BrokerCall> {
        eventually(|| self.settlements().len() >= count).await;
        self.settlements()
    }

    fn record(&self, call: BrokerCall) {
        self.state.calls.lock().unwrap().push(call);
    }
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let polling = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), polling)
        .await
        .expect("The condition did not hold in time");
}

#[async_trait::async_trait]
impl Transport for InMemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        self.state.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait::async_trait]
impl Channel for InMemoryBroker {
    async fn subscribe(
        &self,
        queue_name: &str,
        prefetch_count: u16,
        consumer_tag: &str,
    ) -> Result<Subscription, TransportError> {
        if self.state.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::msg(format!("Queue `{queue_name}` not found")));
        }
        self.record(BrokerCall::Subscribe {
            queue_name: queue_name.to_owned(),
            prefetch_count,
            consumer_tag: consumer_tag.to_owned(),
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.state.subscription.lock().unwrap() = Some(sender);
        let deliveries = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        });
        Ok(Subscription {
            consumer_tag: consumer_tag.to_owned(),
            deliveries: deliveries.boxed(),
        })
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), TransportError> {
        self.record(BrokerCall::Ack(delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.record(BrokerCall::Nack {
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.record(BrokerCall::Reject {
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), TransportError> {
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::msg("The broker is unreachable"));
        }
        self.record(BrokerCall::Publish(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            body: body.to_vec(),
        }));
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.record(BrokerCall::Cancel(consumer_tag.to_owned()));
        self.close_subscription();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(BrokerCall::Close);
        Ok(())
    }
}

/// A provider counting the scopes it opens and disposes of.
pub struct CountingServices {
    inner: Arc<ServiceContainer>,
    pub created: Arc<AtomicUsize>,
    pub disposed: Arc<AtomicUsize>,
}

impl CountingServices {
    pub fn new(inner: Arc<ServiceContainer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            created: Arc::default(),
            disposed: Arc::default(),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ServiceProvider for CountingServices {
    async fn resolve(&self, key: &ServiceKey) -> Result<ServiceInstance, ServiceResolutionError> {
        self.inner.resolve(key).await
    }

    async fn create_scope(&self) -> Result<Box<dyn ServiceScope>, ServiceResolutionError> {
        let inner = self.inner.create_scope().await?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingScope {
            inner,
            disposed: Arc::clone(&self.disposed),
        }))
    }
}

struct CountingScope {
    inner: Box<dyn ServiceScope>,
    disposed: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ServiceScope for CountingScope {
    async fn resolve(&self, key: &ServiceKey) -> Result<ServiceInstance, ServiceResolutionError> {
        self.inner.resolve(key).await
    }

    async fn dispose(self: Box<Self>) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        self.inner.dispose().await;
    }
}
