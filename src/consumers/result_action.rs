use crate::amqp::types::DeliveryTag;
use crate::consumers::ReplyPublishError;
use crate::publishers::MessageEnvelope;
use crate::transport::{Channel, TransportError};
use std::fmt;

/// What to tell the broker once a delivery has been processed.
///
/// `Ack`, `Nack` and `Reject` are *terminal*: they settle the delivery with the broker.
/// `Publish` is a side effect (e.g. an RPC reply) and `Composite` sequences actions, so
/// that a side effect can be ordered before or after the terminal action.
///
/// Exactly one terminal action must be reached for every delivery: [`ResultAction::validate`]
/// checks it and the executor refuses anything else.
///
/// ```rust
/// use carrot_courier::consumers::ResultAction;
/// use carrot_courier::publishers::MessageEnvelope;
///
/// let reply = MessageEnvelope::to_queue("replies");
/// let action = ResultAction::Publish(reply).then(ResultAction::Ack);
/// assert!(action.validate().is_ok());
///
/// let twice = ResultAction::Ack.then(ResultAction::Ack);
/// assert!(twice.validate().is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ResultAction {
    /// Positive acknowledgement: the message is removed from the queue.
    Ack,
    /// Negative acknowledgement: the message is requeued if `requeue` is set, dead-lettered
    /// (or discarded) otherwise.
    Nack { requeue: bool },
    /// Rejection: the message is requeued if `requeue` is set, dead-lettered
    /// (or discarded) otherwise.
    Reject { requeue: bool },
    /// Publish a message.
    Publish(MessageEnvelope),
    /// Execute the actions in order.
    Composite(Vec<ResultAction>),
}

impl ResultAction {
    /// Run `next` after `self`.
    #[must_use]
    pub fn then(self, next: ResultAction) -> Self {
        let mut actions = self.into_steps();
        actions.extend(next.into_steps());
        Self::Composite(actions)
    }

    /// Run `previous` before `self`.
    #[must_use]
    pub fn preceded_by(self, previous: ResultAction) -> Self {
        previous.then(self)
    }

    /// The number of terminal actions.
    pub fn terminal_count(&self) -> usize {
        match self {
            Self::Ack | Self::Nack { .. } | Self::Reject { .. } => 1,
            Self::Publish(_) => 0,
            Self::Composite(actions) => actions.iter().map(Self::terminal_count).sum(),
        }
    }

    /// The terminal action, if there is exactly one.
    pub fn acknowledgement(&self) -> Option<Acknowledgement> {
        if self.terminal_count() != 1 {
            return None;
        }
        self.steps().into_iter().find_map(|step| match step {
            Self::Ack => Some(Acknowledgement::Ack),
            Self::Nack { requeue } => Some(Acknowledgement::Nack { requeue: *requeue }),
            Self::Reject { requeue } => Some(Acknowledgement::Reject { requeue: *requeue }),
            _ => None,
        })
    }

    /// Check that exactly one terminal action is reached.
    pub fn validate(&self) -> Result<(), InvalidResultAction> {
        match self.terminal_count() {
            1 => Ok(()),
            terminals => Err(InvalidResultAction { terminals }),
        }
    }

    /// The leaf actions, nested composites flattened, in execution order.
    fn steps(&self) -> Vec<&ResultAction> {
        match self {
            Self::Composite(actions) => actions.iter().flat_map(Self::steps).collect(),
            leaf => vec![leaf],
        }
    }

    fn into_steps(self) -> Vec<ResultAction> {
        match self {
            Self::Composite(actions) => actions.into_iter().flat_map(Self::into_steps).collect(),
            leaf => vec![leaf],
        }
    }

    /// Execute the action against the channel the delivery was received on.
    ///
    /// Side effects are best-effort: a failed publish is logged and execution moves on.
    /// Nothing at all is sent to the broker if the action does not contain exactly one
    /// terminal action.
    pub(crate) async fn execute(
        &self,
        channel: &dyn Channel,
        delivery_tag: DeliveryTag,
    ) -> Result<Acknowledgement, ExecutionError> {
        self.validate()?;

        let mut settled = None;
        for step in self.steps() {
            match step {
                Self::Publish(envelope) => {
                    if let Err(e) = channel
                        .publish(
                            &envelope.exchange_name,
                            &envelope.routing_key,
                            envelope.properties.clone(),
                            &envelope.payload,
                        )
                        .await
                    {
                        let e = ReplyPublishError::Transport(e);
                        tracing::error!(
                            error = ?e,
                            exchange = %envelope.exchange_name,
                            routing_key = %envelope.routing_key,
                            "Failed to publish a message while settling a delivery"
                        );
                    }
                }
                Self::Ack => {
                    settled = Some(acknowledge(channel, delivery_tag, Acknowledgement::Ack).await);
                }
                Self::Nack { requeue } => {
                    let nack = Acknowledgement::Nack { requeue: *requeue };
                    settled = Some(acknowledge(channel, delivery_tag, nack).await);
                }
                Self::Reject { requeue } => {
                    let reject = Acknowledgement::Reject { requeue: *requeue };
                    settled = Some(acknowledge(channel, delivery_tag, reject).await);
                }
                // `steps` never yields composites.
                Self::Composite(_) => {}
            }
        }

        match settled {
            Some(result) => result,
            None => Err(InvalidResultAction { terminals: 0 }.into()),
        }
    }
}

async fn acknowledge(
    channel: &dyn Channel,
    delivery_tag: DeliveryTag,
    acknowledgement: Acknowledgement,
) -> Result<Acknowledgement, ExecutionError> {
    let outcome = match acknowledgement {
        Acknowledgement::Ack => channel.ack(delivery_tag).await,
        Acknowledgement::Nack { requeue } => channel.nack(delivery_tag, requeue).await,
        Acknowledgement::Reject { requeue } => channel.reject(delivery_tag, requeue).await,
    };
    outcome
        .map(|_| acknowledgement)
        .map_err(|source| ExecutionError::Acknowledgement {
            acknowledgement,
            source,
        })
}

/// The terminal action sent to the broker for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

impl Acknowledgement {
    /// Whether the broker was asked to put the message back on the queue.
    pub fn requeues(&self) -> bool {
        match self {
            Self::Ack => false,
            Self::Nack { requeue } | Self::Reject { requeue } => *requeue,
        }
    }
}

impl fmt::Display for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::Nack { requeue } => write!(f, "nack (requeue: {requeue})"),
            Self::Reject { requeue } => write!(f, "reject (requeue: {requeue})"),
        }
    }
}

/// A [`ResultAction`] that does not settle the delivery exactly once.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("A result action must contain exactly one ack, nack or reject, found {terminals}")]
pub struct InvalidResultAction {
    pub terminals: usize,
}

/// A [`ResultAction`] could not be executed.
#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    InvalidAction(#[from] InvalidResultAction),
    #[error("Failed to {acknowledgement} the message")]
    Acknowledgement {
        acknowledgement: Acknowledgement,
        #[source]
        source: TransportError,
    },
}
