//! Consume messages from RabbitMq queues and dispatch them to your application logic.
//!
//! [`Consumer::builder`] is the starting point: you bind a queue to an [`Adapter`] (usually an
//! async closure) which receives the deserialized request together with a service resolved
//! from your [`ServiceProvider`](crate::services::ServiceProvider).
//!
//! Two flavours of consumers are available:
//! - queue consumers ([`AdapterBuilder::build`]): the message is acknowledged once processed;
//! - RPC consumers ([`AdapterBuilder::build_rpc`]): the output of the adapter is sent back to
//!   the `reply_to` address of the request, correlated via its message id.
//!
//! What happens to a message once processed is described by a [`ResultAction`]:
//!
//! | Outcome                        | Queue consumer            | RPC consumer                                   |
//! |--------------------------------|---------------------------|------------------------------------------------|
//! | Success                        | `Ack`                     | reply, then `Ack`                              |
//! | Payload can't be deserialized  | `Reject(false)`           | `Reject(false)`                                |
//! | No `reply_to`                  | -                         | `Reject(false)`                                |
//! | Service resolution or app error| `Nack(requeue_on_crash)`  | failure reply, then `Nack(requeue_on_crash)`   |
mod adapter;
mod builder;
mod consumer;
mod delivery;
mod error;
mod group;
mod parameters;
mod pipeline;
mod result_action;
mod rpc;

pub use adapter::{Adapter, ClosureAdapter, IntoResultAction};
pub use builder::{AdapterBuilder, ConsumerBuilder, DEFAULT_PREFETCH_COUNT};
pub use consumer::{Consumer, ProcessingOutcome};
pub use delivery::Delivery;
pub use error::{
    ApplicationError, ConfigurationError, DispatchError, ProcessingError, RemoteError,
    ReplyPublishError, EXCEPTION_MESSAGE_HEADER, EXCEPTION_STACKTRACE_HEADER,
    EXCEPTION_TYPE_HEADER,
};
pub use group::ConsumerGroup;
pub use parameters::{ConsumerParameters, DispatchScope};
pub use result_action::{Acknowledgement, ExecutionError, InvalidResultAction, ResultAction};
