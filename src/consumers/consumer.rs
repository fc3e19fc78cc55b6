use crate::consumers::pipeline::{DeliveryPipeline, Processed};
use crate::consumers::{Acknowledgement, ConfigurationError, Delivery, ProcessingError};
use crate::transport::{Channel, DeliveryStream, Transport};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A consumer attached (or about to be attached) to a single queue.
///
/// Build one with [`Consumer::builder`], then drive its lifecycle:
/// - [`Consumer::start`] subscribes to the queue and starts pulling deliveries;
/// - every delivery goes through [`Consumer::receive`], concurrently, up to the prefetch count;
/// - [`Consumer::shutdown`] stops pulling deliveries, waits for the ones in flight to be
///   acknowledged and then cancels the subscription.
///
/// `Consumer` is a cheap handle: clones drive the same consumer.
/// [`ConsumerGroup`](super::ConsumerGroup) takes care of the lifecycle of a set of consumers
/// for you.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    transport: Arc<dyn Transport>,
    /// Deserialize, dispatch, pick the result action.
    pipeline: Arc<dyn DeliveryPipeline>,
    queue_name: String,
    prefetch_count: u16,
    consumer_tag: String,
    state: Mutex<State>,
    /// The channel deliveries are settled on, while the consumer is running.
    channel: RwLock<Option<Arc<dyn Channel>>>,
    /// Cancelled when shutdown is requested.
    shutdown: CancellationToken,
    /// Cancelled when the event loop exits, for whatever reason.
    terminated: CancellationToken,
    /// Deliveries being processed.
    in_flight: TaskTracker,
}

enum State {
    Idle,
    Running {
        channel: Arc<dyn Channel>,
        consumer_tag: String,
        event_loop: JoinHandle<()>,
    },
    Stopped,
}

impl Consumer {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        pipeline: Arc<dyn DeliveryPipeline>,
        queue_name: String,
        prefetch_count: u16,
        consumer_tag: String,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                transport,
                pipeline,
                queue_name,
                prefetch_count,
                consumer_tag,
                state: Mutex::new(State::Idle),
                channel: RwLock::new(None),
                shutdown: CancellationToken::new(),
                terminated: CancellationToken::new(),
                in_flight: TaskTracker::new(),
            }),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.inner.consumer_tag
    }

    /// Subscribe to the queue and start processing deliveries in the background.
    ///
    /// Parameters are validated when the consumer is built: `start` only fails if the
    /// transport can't open a channel or subscribe.
    /// Starting a consumer that has already been started is a no-op.
    #[tracing::instrument(skip_all, name = "consumer_start", fields(queue_name = %self.inner.queue_name))]
    pub async fn start(&self) -> Result<(), ConfigurationError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        match &*state {
            State::Idle => {}
            State::Running { .. } => {
                tracing::warn!("The consumer is already running, ignoring the request to start it");
                return Ok(());
            }
            State::Stopped => {
                tracing::warn!("The consumer has been shut down, it can't be started again");
                return Ok(());
            }
        }

        let transport_error = |source| ConfigurationError::Transport {
            queue_name: inner.queue_name.clone(),
            source,
        };
        let channel = inner.transport.open_channel().await.map_err(transport_error)?;
        let subscription = match channel
            .subscribe(&inner.queue_name, inner.prefetch_count, &inner.consumer_tag)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(e) = channel.close().await {
                    tracing::warn!(error = %e, "Failed to close the channel");
                }
                return Err(transport_error(e));
            }
        };

        *inner.channel.write() = Some(Arc::clone(&channel));
        let event_loop = tokio::spawn(Arc::clone(inner).event_loop(
            Arc::clone(&channel),
            subscription.deliveries,
        ));
        *state = State::Running {
            channel,
            consumer_tag: subscription.consumer_tag,
            event_loop,
        };
        tracing::info!(
            prefetch_count = inner.prefetch_count,
            consumer_tag = %inner.consumer_tag,
            "Consumer started"
        );
        Ok(())
    }

    /// Process a single delivery: deserialize it, dispatch it, settle it with the broker.
    ///
    /// Failures never escape: they are folded into the acknowledgement sent to the broker and
    /// reported in the returned [`ProcessingOutcome`].
    /// Deliveries received once shutdown has been requested (or before the consumer is
    /// started) are neither processed nor acknowledged.
    pub async fn receive(&self, delivery: Delivery) -> ProcessingOutcome {
        let inner = &self.inner;
        // Shutdown waits for this token: take it before checking for shutdown.
        let _in_flight = inner.in_flight.token();
        if inner.shutdown.is_cancelled() {
            tracing::debug!(
                queue_name = %inner.queue_name,
                delivery_tag = delivery.delivery_tag,
                "Shutdown requested, the delivery won't be processed"
            );
            return ProcessingOutcome::not_processed();
        }
        let channel = inner.channel.read().clone();
        let Some(channel) = channel else {
            tracing::warn!(
                queue_name = %inner.queue_name,
                delivery_tag = delivery.delivery_tag,
                "The consumer is not running, the delivery won't be processed"
            );
            return ProcessingOutcome::not_processed();
        };
        inner.process(channel.as_ref(), &delivery).await
    }

    /// Stop consuming.
    ///
    /// No new delivery is pulled from the subscription; the ones already being processed run
    /// to completion and get acknowledged. Then the subscription is cancelled and the channel
    /// closed.
    /// Shutting down a consumer more than once is a no-op.
    #[tracing::instrument(skip_all, name = "consumer_shutdown", fields(queue_name = %self.inner.queue_name))]
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let previous = std::mem::replace(&mut *state, State::Stopped);
        inner.shutdown.cancel();
        let State::Running {
            channel,
            consumer_tag,
            event_loop,
        } = previous
        else {
            tracing::debug!("The consumer is not running, nothing to shut down");
            return;
        };

        if let Err(e) = event_loop.await {
            tracing::error!(error = %e, "The consumer event loop panicked");
        }
        inner.in_flight.close();
        inner.in_flight.wait().await;

        if let Err(e) = channel.cancel(&consumer_tag).await {
            tracing::warn!(error = ?e, "Failed to cancel the subscription");
        }
        *inner.channel.write() = None;
        if let Err(e) = channel.close().await {
            tracing::warn!(error = ?e, "Failed to close the channel");
        }
        tracing::info!("Consumer shut down");
    }

    /// Resolves once the consumer stops pulling deliveries: after a shutdown or because the
    /// subscription was closed by the broker.
    pub async fn terminated(&self) {
        self.inner.terminated.cancelled().await
    }
}

impl ConsumerInner {
    async fn event_loop(self: Arc<Self>, channel: Arc<dyn Channel>, mut deliveries: DeliveryStream) {
        loop {
            tokio::select! {
                // Prefer handling shutdown over pulling more deliveries.
                biased;

                _ = self.shutdown.cancelled() => {
                    tracing::info!(queue_name = %self.queue_name, "Consumer received the shutdown signal");
                    break;
                }

                event = deliveries.next() => match event {
                    None => {
                        tracing::warn!(queue_name = %self.queue_name, "The subscription was closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!(
                            error = ?e,
                            queue_name = %self.queue_name,
                            "Consumer error"
                        );
                        break;
                    }
                    Some(Ok(delivery)) => {
                        // One task per delivery: deliveries are processed concurrently, up to
                        // the prefetch count, and a panic only takes down its own task.
                        let inner = Arc::clone(&self);
                        let channel = Arc::clone(&channel);
                        self.in_flight.spawn(async move {
                            inner.process(channel.as_ref(), &delivery).await;
                        });
                    }
                }
            }
        }
        self.terminated.cancel();
    }

    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(
            queue_name = %self.queue_name,
            delivery_tag = delivery.delivery_tag,
            message_id = delivery.message_id(),
        ),
        level = tracing::Level::DEBUG
    )]
    async fn process(&self, channel: &dyn Channel, delivery: &Delivery) -> ProcessingOutcome {
        let Processed { action, failure } = self.pipeline.process(delivery).await;
        let acknowledgement = action.acknowledgement();
        let result = match action.execute(channel, delivery.delivery_tag).await {
            Ok(_) => failure.map_or(Ok(()), Err),
            Err(e) => {
                tracing::error!(
                    error = ?e,
                    queue_name = %self.queue_name,
                    delivery_tag = delivery.delivery_tag,
                    "Failed to settle the message with the broker"
                );
                Err(e.into())
            }
        };
        ProcessingOutcome {
            acknowledgement,
            result,
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("queue_name", &self.inner.queue_name)
            .field("prefetch_count", &self.inner.prefetch_count)
            .field("consumer_tag", &self.inner.consumer_tag)
            .finish_non_exhaustive()
    }
}

/// The outcome of processing a delivery:
/// - deserialization;
/// - dispatch to the application;
/// - ack/nack/reject against the broker.
///
/// You can convert into a `Result` using [`ProcessingOutcome::result`].
#[derive(Debug)]
pub struct ProcessingOutcome {
    acknowledgement: Option<Acknowledgement>,
    result: Result<(), ProcessingError>,
}

impl ProcessingOutcome {
    fn not_processed() -> Self {
        Self {
            acknowledgement: None,
            result: Err(ProcessingError::NotRunning),
        }
    }

    pub fn result(&self) -> &Result<(), ProcessingError> {
        &self.result
    }

    /// What we asked the broker to do with the message.
    ///
    /// It is set even if we experienced an issue when dispatching the instruction to the
    /// broker (e.g. network timeout). `None` if the delivery was not processed.
    pub fn acknowledgement(&self) -> Option<Acknowledgement> {
        self.acknowledgement
    }

    /// Returns `true` if we instructed the broker to requeue the message.
    pub fn was_requeued(&self) -> bool {
        self.acknowledgement
            .map_or(false, |acknowledgement| acknowledgement.requeues())
    }
}
