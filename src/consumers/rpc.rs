//! Request/reply: every request is answered on the queue named by its `reply_to`.
use crate::amqp::convenience::set_header_str;
use crate::amqp::BasicProperties;
use crate::consumers::error::{
    EXCEPTION_MESSAGE_HEADER, EXCEPTION_STACKTRACE_HEADER, EXCEPTION_TYPE_HEADER,
};
use crate::consumers::pipeline::{
    deserialize_request, dispatch_span, log_dispatch_failure, receive_span, DeliveryPipeline,
    Processed,
};
use crate::consumers::{
    Adapter, ConsumerParameters, Delivery, ProcessingError, RemoteError, ReplyPublishError,
    ResultAction,
};
use crate::publishers::MessageEnvelope;
use crate::serialization::Serializer;
use crate::telemetry::TraceContext;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// RPC consumers: deserialize, dispatch, reply, ack.
pub(crate) struct RpcPipeline<S, Req, A, Ser> {
    pub(crate) parameters: ConsumerParameters<S, Req, A, Ser>,
}

#[async_trait::async_trait]
impl<S, Req, A, Ser> DeliveryPipeline for RpcPipeline<S, Req, A, Ser>
where
    S: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    A: Adapter<S, Req>,
    A::Output: Serialize,
    Ser: Serializer,
{
    async fn process(&self, delivery: &Delivery) -> Processed {
        let context = receive_span(&self.parameters, delivery);
        let processed = self.handle(delivery, &context).await;
        if let Some(failure) = &processed.failure {
            context.record_error(failure);
        }
        context.end();
        processed
    }
}

impl<S, Req, A, Ser> RpcPipeline<S, Req, A, Ser>
where
    S: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    A: Adapter<S, Req>,
    A::Output: Serialize,
    Ser: Serializer,
{
    async fn handle(&self, delivery: &Delivery, context: &TraceContext) -> Processed {
        let parameters = &self.parameters;
        let request = match deserialize_request(parameters, delivery) {
            Ok(request) => request,
            Err(e) => return Processed::failed(ResultAction::Reject { requeue: false }, e),
        };

        let Some(reply_to) = delivery.reply_to() else {
            tracing::error!(
                queue_name = %parameters.queue_name(),
                delivery_tag = delivery.delivery_tag,
                message_id = delivery.message_id(),
                "Message cannot be processed in an RPC flow: it has no reply-to address"
            );
            return Processed::failed(
                ResultAction::Reject { requeue: false },
                ProcessingError::MissingReplyTo,
            );
        };

        let dispatch = dispatch_span(parameters, context);
        let outcome = parameters.dispatch(request).await;
        let processed = match outcome {
            Ok(response) => match self.reply(delivery, reply_to, &response, &dispatch) {
                Ok(reply) => Processed::succeeded(ResultAction::Publish(reply).then(ResultAction::Ack)),
                Err(e) => {
                    tracing::error!(
                        error = ?e,
                        queue_name = %parameters.queue_name(),
                        reply_to,
                        message_id = delivery.message_id(),
                        "Failed to build the reply, the caller gets a failure reply instead"
                    );
                    dispatch.record_error(&e);
                    let remote = RemoteError::from_reply(&e);
                    let reply = self.failure_reply(delivery, reply_to, &remote, &dispatch);
                    Processed::failed(ResultAction::Publish(reply).then(ResultAction::Ack), e)
                }
            },
            Err(e) => {
                log_dispatch_failure(parameters.queue_name(), delivery, &e);
                dispatch.record_error(&e);
                let remote = RemoteError::from_dispatch(&e);
                let reply = self.failure_reply(delivery, reply_to, &remote, &dispatch);
                let requeue = parameters.requeue_on_crash();
                Processed::failed(
                    ResultAction::Publish(reply).then(ResultAction::Nack { requeue }),
                    e,
                )
            }
        };
        dispatch.end();
        processed
    }

    /// The reply to a successfully processed request.
    fn reply(
        &self,
        delivery: &Delivery,
        reply_to: &str,
        response: &A::Output,
        context: &TraceContext,
    ) -> Result<MessageEnvelope, ReplyPublishError> {
        let properties = self.reply_properties(delivery, context);
        let (properties, payload) = self
            .parameters
            .serializer()
            .serialize(properties, response)
            .map_err(ReplyPublishError::Serialization)?;
        Ok(MessageEnvelope::to_queue(reply_to)
            .with_properties(properties)
            .with_payload(payload))
    }

    /// The empty-bodied reply telling the caller why its request failed.
    fn failure_reply(
        &self,
        delivery: &Delivery,
        reply_to: &str,
        error: &RemoteError,
        context: &TraceContext,
    ) -> MessageEnvelope {
        let properties = self.reply_properties(delivery, context);
        let properties = set_header_str(properties, EXCEPTION_TYPE_HEADER, &error.type_name);
        let properties = set_header_str(properties, EXCEPTION_MESSAGE_HEADER, &error.message);
        let properties = match &error.stack_trace {
            Some(stack_trace) => {
                set_header_str(properties, EXCEPTION_STACKTRACE_HEADER, stack_trace)
            }
            None => properties,
        };
        MessageEnvelope::to_queue(reply_to).with_properties(properties)
    }

    /// A fresh message id, the request's message id as correlation id and the trace context.
    fn reply_properties(&self, delivery: &Delivery, context: &TraceContext) -> BasicProperties {
        let properties =
            BasicProperties::default().with_message_id(Uuid::new_v4().to_string().into());
        let properties = match delivery.message_id() {
            Some(message_id) => properties.with_correlation_id(message_id.into()),
            None => {
                tracing::warn!(
                    queue_name = %self.parameters.queue_name(),
                    delivery_tag = delivery.delivery_tag,
                    "The request has no message id, the reply can't be correlated to it"
                );
                properties
            }
        };
        self.parameters.telemetry().inject(context, properties)
    }
}
