use crate::amqp::types::{DeliveryTag, FieldTable};
use crate::amqp::{BasicProperties, ConnectionFactory};
use crate::consumers::Delivery;
use crate::pool::{channel_pool, ChannelManager, ChannelPool};
use crate::transport::{Channel, Subscription, Transport, TransportError};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
};
use lapin::publisher_confirm::Confirmation;
use std::sync::Arc;

/// Reply code for a normal channel shutdown.
const REPLY_SUCCESS: u16 = 200;
/// Reply code for a message that could not be routed to any queue.
/// See <https://www.rabbitmq.com/amqp-0-9-1-reference.html>.
const NO_ROUTE: u16 = 312;

/// A [`Transport`] handing out `lapin` channels taken from a [`ChannelPool`].
#[derive(Clone)]
pub struct LapinTransport {
    channel_pool: ChannelPool,
}

impl LapinTransport {
    pub fn new(channel_pool: ChannelPool) -> Self {
        Self { channel_pool }
    }

    /// A transport with a small dedicated pool: 2 connections shared by up to 16 channels,
    /// publisher confirmations enabled.
    pub fn from_factory(connection_factory: ConnectionFactory) -> Result<Self, anyhow::Error> {
        Ok(Self::new(channel_pool(connection_factory, 2, 16, true)?))
    }
}

#[async_trait::async_trait]
impl Transport for LapinTransport {
    #[tracing::instrument(name = "rabbitmq_open_channel", skip(self))]
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = self
            .channel_pool
            .get()
            .await
            .map_err(crate::pool::Error::from)?;
        Ok(Arc::new(LapinChannel {
            channel,
            publisher_confirms: self.channel_pool.manager().publisher_confirms,
        }))
    }
}

/// A pooled `lapin` channel. It goes back to the pool when dropped, unless it was closed.
pub struct LapinChannel {
    channel: deadpool::managed::Object<ChannelManager>,
    publisher_confirms: bool,
}

#[async_trait::async_trait]
impl Channel for LapinChannel {
    async fn subscribe(
        &self,
        queue_name: &str,
        prefetch_count: u16,
        consumer_tag: &str,
    ) -> Result<Subscription, TransportError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let tag = consumer.tag();
        let consumer_tag = tag.as_str().to_owned();
        let deliveries = consumer
            .map(move |event| {
                event
                    .map(|delivery| Delivery::from_lapin(delivery, tag.clone()))
                    .map_err(TransportError::from)
            })
            .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    /// Publish a payload, waiting for the broker confirmation if the channel has publisher
    /// confirms enabled.
    ///
    /// With confirms enabled the message is published as mandatory: an unroutable message
    /// is returned by the broker and surfaced as an error instead of being silently dropped.
    #[tracing::instrument(level = "debug", skip(self, properties, body))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), TransportError> {
        let options = BasicPublishOptions {
            mandatory: self.publisher_confirms,
            // `immediate` is not supported since RabbitMq 3.0.
            immediate: false,
        };
        let confirmation = self
            .channel
            .basic_publish(exchange, routing_key, options, body, properties)
            .await?
            .await?;

        match confirmation {
            Confirmation::Ack(Some(returned)) if returned.reply_code == NO_ROUTE => Err(
                TransportError::msg(format!("The message could not be routed: {returned:?}")),
            ),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(returned) => Err(TransportError::msg(format!(
                "The RabbitMq broker nacked the publishing of the message: {returned:?}"
            ))),
        }
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel.close(REPLY_SUCCESS, "consumer shutdown").await?;
        Ok(())
    }
}
