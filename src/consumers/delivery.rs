use crate::amqp::types::{DeliveryTag, ShortString};
use crate::amqp::BasicProperties;

/// A message pushed by the broker to one of our subscriptions.
///
/// A `Delivery` is handed to the consumer pipeline exactly once and never mutated:
/// acknowledging it is the job of the framework, based on the outcome of processing
/// (see [`ResultAction`](crate::consumers::ResultAction)).
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Identifies the delivery on the channel it was received on.
    pub delivery_tag: DeliveryTag,

    /// The exchange the message was published to.
    /// Empty if the default exchange was used.
    pub exchange: ShortString,

    /// The routing key of the message. May be empty.
    pub routing_key: ShortString,

    /// The tag of the subscription that received the message.
    pub consumer_tag: ShortString,

    /// Whether this message was redelivered.
    pub redelivered: bool,

    /// The properties and headers of the message: message id, correlation id,
    /// reply-to address, trace context, etc.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl Delivery {
    pub(crate) fn from_lapin(delivery: lapin::message::Delivery, consumer_tag: ShortString) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            consumer_tag,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }

    /// The message id, if the publisher set one.
    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(ShortString::as_str)
    }

    /// The correlation id, if the publisher set one.
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties
            .correlation_id()
            .as_ref()
            .map(ShortString::as_str)
    }

    /// Where the publisher expects a reply, if anywhere.
    ///
    /// An empty reply-to is treated as missing: there would be nowhere to route the reply to.
    pub fn reply_to(&self) -> Option<&str> {
        self.properties
            .reply_to()
            .as_ref()
            .map(ShortString::as_str)
            .filter(|reply_to| !reply_to.is_empty())
    }
}
