use crate::consumers::{
    Adapter, ApplicationError, ConsumerParameters, Delivery, DispatchError, IntoResultAction,
    ProcessingError, ResultAction,
};
use crate::serialization::{DeserializationError, Serializer};
use crate::telemetry::TraceContext;
use opentelemetry::trace::SpanKind;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;

/// The result of running a delivery through a pipeline: the action to execute and, if
/// processing did not succeed, why.
#[derive(Debug)]
pub(crate) struct Processed {
    pub(crate) action: ResultAction,
    pub(crate) failure: Option<ProcessingError>,
}

impl Processed {
    pub(crate) fn succeeded(action: ResultAction) -> Self {
        Self {
            action,
            failure: None,
        }
    }

    pub(crate) fn failed(action: ResultAction, failure: impl Into<ProcessingError>) -> Self {
        Self {
            action,
            failure: Some(failure.into()),
        }
    }
}

/// The type-erased entry point of a consumer: from a delivery to the [`ResultAction`] that
/// settles it.
///
/// Implementations never fail: every error is folded into the returned action.
#[async_trait::async_trait]
pub(crate) trait DeliveryPipeline: Send + Sync + 'static {
    async fn process(&self, delivery: &Delivery) -> Processed;
}

/// Queue consumers: deserialize, dispatch, ack.
pub(crate) struct QueuePipeline<S, Req, A, Ser> {
    pub(crate) parameters: ConsumerParameters<S, Req, A, Ser>,
}

#[async_trait::async_trait]
impl<S, Req, A, Ser> DeliveryPipeline for QueuePipeline<S, Req, A, Ser>
where
    S: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    A: Adapter<S, Req>,
    A::Output: IntoResultAction,
    Ser: Serializer,
{
    async fn process(&self, delivery: &Delivery) -> Processed {
        let parameters = &self.parameters;
        let context = receive_span(parameters, delivery);

        let processed = match deserialize_request(parameters, delivery) {
            Err(e) => Processed::failed(ResultAction::Reject { requeue: false }, e),
            Ok(request) => {
                let dispatch = dispatch_span(parameters, &context);
                let outcome = parameters.dispatch(request).await.and_then(|output| {
                    let action = output.into_result_action();
                    match action.validate() {
                        Ok(()) => Ok(action),
                        Err(e) => Err(DispatchError::Application(ApplicationError::new(e))),
                    }
                });
                let processed = match outcome {
                    Ok(action) => Processed::succeeded(action),
                    Err(e) => {
                        log_dispatch_failure(parameters.queue_name(), delivery, &e);
                        dispatch.record_error(&e);
                        let requeue = parameters.requeue_on_crash();
                        Processed::failed(ResultAction::Nack { requeue }, e)
                    }
                };
                dispatch.end();
                processed
            }
        };

        if let Some(failure) = &processed.failure {
            context.record_error(failure);
        }
        context.end();
        processed
    }
}

/// Open the consumer span of a delivery, as a child of the trace context it carries.
pub(super) fn receive_span<S, Req, A, Ser>(
    parameters: &ConsumerParameters<S, Req, A, Ser>,
    delivery: &Delivery,
) -> TraceContext
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    A: Adapter<S, Req>,
    Ser: Serializer,
{
    let telemetry = parameters.telemetry();
    let parent = telemetry.extract(delivery.properties.headers().as_ref());
    let mut attributes = vec![
        KeyValue::new("messaging.system", "rabbitmq"),
        KeyValue::new("messaging.operation", "receive"),
        KeyValue::new(
            "messaging.destination.name",
            parameters.queue_name().to_owned(),
        ),
        KeyValue::new(
            "messaging.rabbitmq.destination.routing_key",
            delivery.routing_key.as_str().to_owned(),
        ),
    ];
    if let Some(message_id) = delivery.message_id() {
        attributes.push(KeyValue::new("messaging.message.id", message_id.to_owned()));
    }
    telemetry.start_span(
        format!("{} receive", parameters.queue_name()),
        SpanKind::Consumer,
        &parent,
        attributes,
    )
}

/// Open the internal span wrapping the invocation of the application.
pub(super) fn dispatch_span<S, Req, A, Ser>(
    parameters: &ConsumerParameters<S, Req, A, Ser>,
    parent: &TraceContext,
) -> TraceContext
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    A: Adapter<S, Req>,
    Ser: Serializer,
{
    parameters.telemetry().start_span(
        format!("{} dispatch", parameters.queue_name()),
        SpanKind::Internal,
        parent,
        vec![],
    )
}

/// Decode the request carried by `delivery`: a body carrying no value at all is as bad as
/// a malformed one.
pub(super) fn deserialize_request<S, Req, A, Ser>(
    parameters: &ConsumerParameters<S, Req, A, Ser>,
    delivery: &Delivery,
) -> Result<Req, DeserializationError>
where
    S: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    A: Adapter<S, Req>,
    Ser: Serializer,
{
    let outcome = parameters
        .serializer()
        .deserialize::<Req>(&delivery.properties, &delivery.data)
        .and_then(|request| request.ok_or(DeserializationError::Empty));
    if let Err(e) = &outcome {
        tracing::warn!(
            error = ?e,
            queue_name = %parameters.queue_name(),
            delivery_tag = delivery.delivery_tag,
            message_id = delivery.message_id(),
            "Rejecting a message that can't be deserialized"
        );
    }
    outcome
}

pub(super) fn log_dispatch_failure(queue_name: &str, delivery: &Delivery, error: &DispatchError) {
    match error {
        DispatchError::Resolution(_) => tracing::error!(
            error = ?error,
            queue_name,
            delivery_tag = delivery.delivery_tag,
            message_id = delivery.message_id(),
            "The service bound to the message handler could not be resolved"
        ),
        DispatchError::Application(_) => tracing::warn!(
            error = ?error,
            queue_name,
            delivery_tag = delivery.delivery_tag,
            message_id = delivery.message_id(),
            "Failed to process a message"
        ),
    }
}
