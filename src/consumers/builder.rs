use crate::consumers::pipeline::QueuePipeline;
use crate::consumers::rpc::RpcPipeline;
use crate::consumers::{
    Adapter, ApplicationError, ClosureAdapter, ConfigurationError, Consumer, ConsumerParameters,
    DispatchScope, IntoResultAction,
};
use crate::serialization::{JsonSerializer, Serializer};
use crate::services::{FromServices, ServiceProvider};
use crate::telemetry::Telemetry;
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

/// The prefetch count used when none is specified.
pub const DEFAULT_PREFETCH_COUNT: u16 = 50;

impl Consumer {
    /// Start building a [`Consumer`].
    ///
    /// You will need a transport, to talk to the broker, and the service provider the
    /// message handler resolves its service from.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use carrot_courier::consumers::{Consumer, DispatchScope};
    /// use carrot_courier::services::ServiceCollection;
    /// use carrot_courier::transport::Transport;
    /// use std::sync::Arc;
    ///
    /// #[derive(serde::Deserialize)]
    /// struct OrderPlaced {
    ///     order_id: String,
    /// }
    ///
    /// struct Warehouse;
    ///
    /// impl Warehouse {
    ///     async fn ship(&self, _order_id: &str) -> Result<(), anyhow::Error> {
    ///         Ok(())
    ///     }
    /// }
    ///
    /// # async fn run(transport: Arc<dyn Transport>) -> Result<(), anyhow::Error> {
    /// let services = ServiceCollection::new().add_singleton(Warehouse).build();
    ///
    /// let consumer = Consumer::builder(transport, services)
    ///     .queue_name("orders")
    ///     .prefetch_count(10)
    ///     .dispatch_scope(DispatchScope::ChildScope)
    ///     .handler(|warehouse: Arc<Warehouse>, event: OrderPlaced| async move {
    ///         warehouse.ship(&event.order_id).await
    ///     })
    ///     .build()?;
    ///
    /// consumer.start().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder(
        transport: Arc<dyn Transport>,
        services: Arc<dyn ServiceProvider>,
    ) -> ConsumerBuilder {
        ConsumerBuilder::new(transport, services)
    }
}

/// Consumer-level configuration.
///
/// Use [`Consumer::builder`] as entrypoint and finish with [`ConsumerBuilder::handler`] (or
/// [`ConsumerBuilder::adapter`]) to bind the application logic.
pub struct ConsumerBuilder<Ser = JsonSerializer> {
    transport: Arc<dyn Transport>,
    services: Arc<dyn ServiceProvider>,
    queue_name: String,
    prefetch_count: u16,
    dispatch_scope: DispatchScope,
    requeue_on_crash: bool,
    serializer: Arc<Ser>,
    telemetry: Option<Arc<Telemetry>>,
    consumer_tag: Option<String>,
}

impl ConsumerBuilder {
    fn new(transport: Arc<dyn Transport>, services: Arc<dyn ServiceProvider>) -> Self {
        Self {
            transport,
            services,
            queue_name: String::new(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            dispatch_scope: DispatchScope::default(),
            requeue_on_crash: false,
            serializer: Arc::new(JsonSerializer),
            telemetry: None,
            consumer_tag: None,
        }
    }
}

impl<Ser: Serializer> ConsumerBuilder<Ser> {
    /// The queue to consume messages from.
    #[must_use]
    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// The maximum number of unacknowledged deliveries the broker pushes to this consumer.
    /// It caps the number of messages processed concurrently.
    ///
    /// Defaults to [`DEFAULT_PREFETCH_COUNT`].
    #[must_use]
    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Defaults to [`DispatchScope::RootScope`].
    #[must_use]
    pub fn dispatch_scope(mut self, dispatch_scope: DispatchScope) -> Self {
        self.dispatch_scope = dispatch_scope;
        self
    }

    /// Shorthand for `dispatch_scope(DispatchScope::ChildScope)`.
    #[must_use]
    pub fn dispatch_in_child_scope(self) -> Self {
        self.dispatch_scope(DispatchScope::ChildScope)
    }

    /// Put messages back on the queue when the application fails to process them.
    ///
    /// Defaults to `false`: failed messages are nacked without requeueing, which sends them to
    /// the dead letter exchange of the queue, if one is configured on the broker.
    /// Messages that can't be deserialized are never requeued.
    #[must_use]
    pub fn requeue_on_crash(mut self, requeue_on_crash: bool) -> Self {
        self.requeue_on_crash = requeue_on_crash;
        self
    }

    /// Defaults to [`JsonSerializer`].
    #[must_use]
    pub fn serializer<S2: Serializer>(self, serializer: S2) -> ConsumerBuilder<S2> {
        ConsumerBuilder {
            transport: self.transport,
            services: self.services,
            queue_name: self.queue_name,
            prefetch_count: self.prefetch_count,
            dispatch_scope: self.dispatch_scope,
            requeue_on_crash: self.requeue_on_crash,
            serializer: Arc::new(serializer),
            telemetry: self.telemetry,
            consumer_tag: self.consumer_tag,
        }
    }

    /// Defaults to [`Telemetry::default`].
    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// The tag identifying the subscription with the broker.
    ///
    /// Defaults to a random UUID.
    #[must_use]
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Bind an async closure taking the service and the request.
    ///
    /// For queue consumers, the closure returns `()` or an explicit
    /// [`ResultAction`](crate::consumers::ResultAction); for RPC consumers, the response.
    #[must_use]
    pub fn handler<S, Req, F, Fut, O, E>(
        self,
        handler: F,
    ) -> AdapterBuilder<S, Req, ClosureAdapter<F>, Ser>
    where
        S: Send + Sync + 'static,
        Req: Send + 'static,
        F: Fn(Arc<S>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        O: Send + 'static,
        E: Into<ApplicationError> + 'static,
    {
        self.adapter(ClosureAdapter(handler))
    }

    /// Bind an [`Adapter`].
    #[must_use]
    pub fn adapter<S, Req, A>(self, adapter: A) -> AdapterBuilder<S, Req, A, Ser>
    where
        S: Send + Sync + 'static,
        Req: Send + 'static,
        A: Adapter<S, Req>,
    {
        AdapterBuilder {
            consumer: self,
            adapter,
            binder: FromServices::new(),
            _request: PhantomData,
        }
    }
}

/// The last step of building a [`Consumer`], once the application logic is bound.
pub struct AdapterBuilder<S, Req, A, Ser> {
    consumer: ConsumerBuilder<Ser>,
    adapter: A,
    binder: FromServices<S>,
    _request: PhantomData<fn(Req)>,
}

impl<S, Req, A, Ser> AdapterBuilder<S, Req, A, Ser>
where
    S: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    A: Adapter<S, Req>,
    Ser: Serializer,
{
    /// Resolve the service registered under `key` rather than the unkeyed one.
    #[must_use]
    pub fn service_key(mut self, key: impl Into<Cow<'static, str>>) -> Self {
        self.binder = FromServices::keyed(key);
        self
    }

    /// Build a queue consumer: messages are acknowledged once processed, no reply is sent.
    pub fn build(self) -> Result<Consumer, ConfigurationError>
    where
        A::Output: IntoResultAction,
    {
        let transport = Arc::clone(&self.consumer.transport);
        let parameters = self.into_parameters()?;
        let (queue_name, prefetch_count, consumer_tag) = subscription_of(&parameters);
        Ok(Consumer::new(
            transport,
            Arc::new(QueuePipeline { parameters }),
            queue_name,
            prefetch_count,
            consumer_tag,
        ))
    }

    /// Build an RPC consumer: the output of the adapter is sent back to the `reply_to`
    /// address of every request.
    pub fn build_rpc(self) -> Result<Consumer, ConfigurationError>
    where
        A::Output: Serialize,
    {
        let transport = Arc::clone(&self.consumer.transport);
        let parameters = self.into_parameters()?;
        let (queue_name, prefetch_count, consumer_tag) = subscription_of(&parameters);
        Ok(Consumer::new(
            transport,
            Arc::new(RpcPipeline { parameters }),
            queue_name,
            prefetch_count,
            consumer_tag,
        ))
    }

    fn into_parameters(self) -> Result<ConsumerParameters<S, Req, A, Ser>, ConfigurationError> {
        let Self {
            consumer,
            adapter,
            binder,
            ..
        } = self;
        let parameters = ConsumerParameters {
            queue_name: consumer.queue_name,
            prefetch_count: consumer.prefetch_count,
            dispatch_scope: consumer.dispatch_scope,
            requeue_on_crash: consumer.requeue_on_crash,
            consumer_tag: consumer
                .consumer_tag
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            binder,
            adapter: Arc::new(adapter),
            serializer: consumer.serializer,
            services: consumer.services,
            telemetry: consumer.telemetry.unwrap_or_default(),
            _request: PhantomData,
        };
        parameters.validate()?;
        Ok(parameters)
    }
}

fn subscription_of<S, Req, A, Ser>(
    parameters: &ConsumerParameters<S, Req, A, Ser>,
) -> (String, u16, String)
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    A: Adapter<S, Req>,
    Ser: Serializer,
{
    (
        parameters.queue_name().to_owned(),
        parameters.prefetch_count(),
        parameters.consumer_tag().to_owned(),
    )
}
