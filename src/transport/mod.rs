//! The broker capabilities consumers and publishers are built on.
//!
//! Consumers never talk to `lapin` directly: they open a [`Channel`] through a [`Transport`]
//! and use it to subscribe, acknowledge and publish.
//! [`LapinTransport`] is the RabbitMq implementation; tests plug in their own.
use crate::amqp::types::DeliveryTag;
use crate::amqp::BasicProperties;
use crate::consumers::Delivery;
use futures_util::stream::BoxStream;
use std::sync::Arc;

mod rabbit_mq;

pub use rabbit_mq::{LapinChannel, LapinTransport};

/// Failure reported by the transport while talking to the broker.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct TransportError(#[from] anyhow::Error);

impl TransportError {
    /// Build a transport error out of a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Self(anyhow::Error::msg(message))
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}

impl From<crate::pool::Error> for TransportError {
    fn from(err: crate::pool::Error) -> Self {
        Self(err.into())
    }
}

/// The stream of deliveries pushed by the broker for a subscription.
///
/// The stream ends when the subscription is cancelled or the channel is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// An active subscription on a queue.
pub struct Subscription {
    /// The tag identifying the subscription with the broker, required to cancel it.
    pub consumer_tag: String,
    /// Messages delivered by the broker.
    pub deliveries: DeliveryStream,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

/// Something that can open channels to a broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;
}

/// An open channel.
///
/// A channel is shared by all the deliveries a consumer is processing concurrently:
/// implementations must support concurrent acknowledgements and publishes.
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Start consuming `queue_name`, allowing at most `prefetch_count` unacknowledged
    /// deliveries in flight.
    async fn subscribe(
        &self,
        queue_name: &str,
        prefetch_count: u16,
        consumer_tag: &str,
    ) -> Result<Subscription, TransportError>;

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool)
        -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), TransportError>;

    /// Stop the broker from pushing new deliveries for `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// Release the channel.
    async fn close(&self) -> Result<(), TransportError>;
}
