use amq_protocol_types::{FieldTable, ShortShortUInt, ShortString, Timestamp};
use crate::amqp::BasicProperties;

/// A message ready to be published: an encoded body plus its routing and properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageEnvelope {
    // The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    // The name of the exchange we are publishing the message to.
    // Empty for the default exchange, which routes on queue names.
    pub exchange_name: String,
    // The routing key used by the exchange to route the message.
    pub routing_key: String,
    // AMQP properties and headers attached to the message.
    pub properties: BasicProperties,
}

impl MessageEnvelope {
    /// A message addressed straight to `queue_name` through the default exchange.
    pub fn to_queue(queue_name: impl Into<String>) -> Self {
        Self {
            routing_key: queue_name.into(),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, value: Vec<u8>) -> Self {
        self.payload = value;
        self
    }

    pub fn with_exchange_name(mut self, value: String) -> Self {
        self.exchange_name = value;
        self
    }

    pub fn with_routing_key(mut self, value: String) -> Self {
        self.routing_key = value;
        self
    }

    pub fn with_properties(mut self, value: BasicProperties) -> Self {
        self.properties = value;
        self
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    pub fn with_delivery_mode(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_delivery_mode(value))
    }

    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    pub fn with_reply_to(self, value: ShortString) -> Self {
        self.props(|p| p.with_reply_to(value))
    }

    pub fn with_expiration(self, value: ShortString) -> Self {
        self.props(|p| p.with_expiration(value))
    }

    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }

    pub fn with_timestamp(self, value: Timestamp) -> Self {
        self.props(|p| p.with_timestamp(value))
    }
}
