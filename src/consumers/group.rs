use crate::consumers::{ConfigurationError, Consumer};
use futures_util::future::join_all;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::future::Future;

/// A set of consumers started and stopped together.
///
/// Each consumer subscribes to its own queue on its own channel: `ConsumerGroup` only takes
/// care of their lifecycle.
///
/// ```rust,no_run
/// use carrot_courier::consumers::{Consumer, ConsumerGroup};
///
/// # async fn run(orders: Consumer, refunds: Consumer) -> Result<(), anyhow::Error> {
/// ConsumerGroup::new()
///     .with_consumer(orders)
///     .with_consumer(refunds)
///     .run_until_ctrl_c()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ConsumerGroup {
    consumers: Vec<Consumer>,
}

impl ConsumerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_consumer(mut self, consumer: Consumer) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    /// Start every consumer and keep consuming until Ctrl-C.
    pub async fn run_until_ctrl_c(self) -> Result<(), ConfigurationError> {
        self.run_until_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for the Ctrl-C signal");
            }
        })
        .await
    }

    /// Start every consumer and keep consuming until `shutdown` resolves.
    ///
    /// `run_until_shutdown` returns control to the caller only if:
    /// - one of the consumers fails to start: the ones already started are shut down and
    ///   the error is returned;
    /// - one of the consumers stops on its own (e.g. the broker closed its subscription);
    /// - `shutdown` resolves.
    ///
    /// Every consumer is then shut down gracefully: deliveries in flight are acknowledged
    /// before returning.
    #[tracing::instrument(skip_all, name = "consumer_group_run", fields(consumers = self.consumers.len()))]
    pub async fn run_until_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ConfigurationError> {
        for (started, consumer) in self.consumers.iter().enumerate() {
            if let Err(e) = consumer.start().await {
                tracing::error!(
                    error = ?e,
                    queue_name = consumer.queue_name(),
                    "Failed to start a consumer, shutting down the group"
                );
                join_all(self.consumers[..started].iter().map(Consumer::shutdown)).await;
                return Err(e);
            }
        }

        let mut terminated = self
            .consumers
            .iter()
            .map(|consumer| async move {
                consumer.terminated().await;
                consumer
            })
            .collect::<FuturesUnordered<_>>();

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown requested, stopping the consumer group");
            }
            Some(consumer) = terminated.next() => {
                tracing::warn!(
                    queue_name = consumer.queue_name(),
                    "A consumer stopped unexpectedly, stopping the consumer group"
                );
            }
        }
        drop(terminated);

        join_all(self.consumers.iter().map(Consumer::shutdown)).await;
        tracing::info!("Consumer group stopped");
        Ok(())
    }
}
