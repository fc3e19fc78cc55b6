use crate::amqp::BasicProperties;
use crate::publishers::MessageEnvelope;
use crate::serialization::{JsonSerializer, SerializationError, Serializer};
use crate::telemetry::{Telemetry, TraceContext};
use crate::transport::{Transport, TransportError};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// AMQP delivery mode of messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// A high-level interface to publish messages.
///
/// Every message is stamped with a message id and a timestamp (unless already set), marked
/// as persistent and carries the trace context of the current span.
///
/// # How do I build a `Publisher`?
///
/// `Publisher` provides a fluent API to add configuration step-by-step, known as
/// "builder pattern" in Rust.
/// The starting point is [`Publisher::builder`].
pub struct Publisher<Ser = JsonSerializer> {
    transport: Arc<dyn Transport>,
    serializer: Ser,
    telemetry: Arc<Telemetry>,
    /// Timeout on publishing.
    timeout: Duration,
}

impl Publisher {
    /// Start building a [`Publisher`].
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use carrot_courier::amqp::configuration::RabbitMqSettings;
    /// use carrot_courier::amqp::ConnectionFactory;
    /// use carrot_courier::publishers::Publisher;
    /// use carrot_courier::transport::LapinTransport;
    /// use std::sync::Arc;
    ///
    /// pub fn get_publisher() -> Result<Publisher, anyhow::Error> {
    ///     let settings = RabbitMqSettings::default();
    ///     let connection_factory = ConnectionFactory::new_from_config(&settings)?;
    ///     let transport = LapinTransport::from_factory(connection_factory)?;
    ///
    ///     Ok(Publisher::builder(Arc::new(transport))
    ///         .publish_timeout(std::time::Duration::from_secs(3))
    ///         .build())
    /// }
    /// ```
    pub fn builder(transport: Arc<dyn Transport>) -> PublisherBuilder {
        PublisherBuilder::new(transport)
    }
}

impl<Ser: Serializer> Publisher<Ser> {
    /// Serialize `message` and publish it to `exchange` with `routing_key`.
    ///
    /// Use the empty exchange name to send the message straight to the queue named by
    /// `routing_key`.
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), PublisherError>
    where
        T: Serialize + ?Sized,
    {
        let (properties, payload) = self
            .serializer
            .serialize(BasicProperties::default(), message)?;
        let envelope = MessageEnvelope::default()
            .with_exchange_name(exchange.to_owned())
            .with_routing_key(routing_key.to_owned())
            .with_properties(properties)
            .with_payload(payload);
        self.publish_envelope(envelope).await
    }

    /// Publish a message whose body has already been encoded.
    #[tracing::instrument(
        name = "publish_message",
        skip_all,
        fields(exchange = %envelope.exchange_name, routing_key = %envelope.routing_key),
        level = tracing::Level::DEBUG
    )]
    pub async fn publish_envelope(&self, envelope: MessageEnvelope) -> Result<(), PublisherError> {
        let mut envelope = inject_amqp_properties(envelope);
        envelope.properties = self.telemetry.inject(
            &TraceContext::from(opentelemetry::Context::current()),
            envelope.properties,
        );

        let MessageEnvelope {
            exchange_name,
            routing_key,
            properties,
            payload,
        } = envelope;
        let publish = async {
            let channel = self.transport.open_channel().await?;
            channel
                .publish(&exchange_name, &routing_key, properties, &payload)
                .await
        };
        match tokio::time::timeout(self.timeout, publish).await {
            Ok(outcome) => outcome.map_err(PublisherError::Transport),
            Err(_) => Err(PublisherError::Timeout),
        }
    }
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("The message could not be serialized")]
    Serialization(#[from] SerializationError),
    #[error("Error encountered when interacting with the RabbitMq broker")]
    Transport(#[source] TransportError),
    #[error("The timeout threshold was reached while trying to publish the message")]
    Timeout,
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder<Ser = JsonSerializer> {
    transport: Arc<dyn Transport>,
    serializer: Ser,
    telemetry: Option<Arc<Telemetry>>,
    timeout: Duration,
}

impl PublisherBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            serializer: JsonSerializer,
            telemetry: None,
            timeout: Duration::from_secs(3),
        }
    }
}

impl<Ser: Serializer> PublisherBuilder<Ser> {
    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Defaults to [`JsonSerializer`].
    #[must_use]
    pub fn serializer<S2: Serializer>(self, serializer: S2) -> PublisherBuilder<S2> {
        PublisherBuilder {
            transport: self.transport,
            serializer,
            telemetry: self.telemetry,
            timeout: self.timeout,
        }
    }

    /// Defaults to [`Telemetry::default`].
    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    pub fn build(self) -> Publisher<Ser> {
        Publisher {
            transport: self.transport,
            serializer: self.serializer,
            telemetry: self.telemetry.unwrap_or_default(),
            timeout: self.timeout,
        }
    }
}

fn inject_amqp_properties(mut envelope: MessageEnvelope) -> MessageEnvelope {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = envelope.properties;
    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    envelope.properties = props
        .with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()))
        .with_delivery_mode(PERSISTENT);

    envelope
}
