use crate::amqp::{BasicProperties, BasicPropertiesExt};
use crate::serialization::{DeserializationError, SerializationError};
use crate::services::ServiceResolutionError;
use crate::transport::TransportError;
use std::any::Any;
use std::borrow::Cow;
use std::fmt;

/// Header carrying the type of the error that made an RPC request fail.
pub const EXCEPTION_TYPE_HEADER: &str = "exception.type";
/// Header carrying the message of the error that made an RPC request fail.
pub const EXCEPTION_MESSAGE_HEADER: &str = "exception.message";
/// Header carrying the full error report (causes included) of a failed RPC request.
pub const EXCEPTION_STACKTRACE_HEADER: &str = "exception.stacktrace";

/// A consumer could not be configured or started.
///
/// These errors are fatal: they surface from [`Consumer::start`](super::Consumer::start)
/// and the builders, never from the processing of a message.
#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    #[error("The queue name must not be empty")]
    EmptyQueueName,
    #[error("The prefetch count must be greater than zero")]
    ZeroPrefetchCount,
    #[error("Failed to subscribe to queue `{queue_name}`")]
    Transport {
        queue_name: String,
        #[source]
        source: TransportError,
    },
}

/// The application logic failed to process a request.
///
/// It remembers the type of the original error: RPC consumers send it back to the caller.
#[derive(Debug)]
pub struct ApplicationError {
    type_name: Cow<'static, str>,
    error: anyhow::Error,
}

impl ApplicationError {
    /// Wrap an error returned by the application.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            type_name: Cow::Borrowed(std::any::type_name::<E>()),
            error: error.into(),
        }
    }

    /// Wrap a panic caught while invoking the application.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "Box<dyn Any>".to_owned()
        };
        Self {
            type_name: Cow::Borrowed("panic"),
            error: anyhow::anyhow!("The message handler panicked: {message}"),
        }
    }

    /// The name of the type of the original error.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }

    /// A full report of the error, its chain of causes included.
    pub fn stack_trace(&self) -> String {
        format!("{:?}", self.error)
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.error
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for ApplicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl From<anyhow::Error> for ApplicationError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            type_name: Cow::Borrowed("anyhow::Error"),
            error,
        }
    }
}

/// Dispatching a request to the application failed.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    /// The service the handler is bound to could not be resolved.
    ///
    /// This is a configuration defect: every message on the queue will hit it.
    #[error("Failed to resolve the service the message handler is bound to")]
    Resolution(#[from] ServiceResolutionError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl DispatchError {
    pub(crate) fn type_name(&self) -> &str {
        match self {
            Self::Resolution(_) => std::any::type_name::<ServiceResolutionError>(),
            Self::Application(e) => e.type_name(),
        }
    }

    pub(crate) fn stack_trace(&self) -> String {
        match self {
            Self::Resolution(e) => report(e),
            Self::Application(e) => e.stack_trace(),
        }
    }
}

/// Render `error` and its chain of causes.
fn report(error: &(dyn std::error::Error + 'static)) -> String {
    let mut report = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        report.push_str("\n\nCaused by:\n    ");
        report.push_str(&cause.to_string());
        source = cause.source();
    }
    report
}

/// The reply to an RPC request could not be built or published.
///
/// The request is still acknowledged. If the response can't be serialized, the caller
/// gets a failure reply instead.
#[derive(thiserror::Error, Debug)]
pub enum ReplyPublishError {
    #[error("Failed to serialize the reply")]
    Serialization(#[source] SerializationError),
    #[error("Failed to publish the reply")]
    Transport(#[source] TransportError),
}

/// Why the processing of a delivery did not succeed.
#[derive(thiserror::Error, Debug)]
pub enum ProcessingError {
    #[error("The message could not be deserialized")]
    Deserialization(#[from] DeserializationError),
    #[error("The message handler failed")]
    Dispatch(#[from] DispatchError),
    #[error("The message has no reply-to address, there is nowhere to send a reply to")]
    MissingReplyTo,
    #[error("The reply could not be published")]
    Reply(#[from] ReplyPublishError),
    #[error("Failed to acknowledge the message")]
    Execution(#[from] super::ExecutionError),
    #[error("The consumer is not running, the message was not processed")]
    NotRunning,
}

/// A failure reported by the remote end of an RPC exchange.
///
/// Failed requests are answered with an empty reply carrying the `exception.*` headers:
/// [`RemoteError::from_properties`] turns them back into an error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{type_name}: {message}")]
pub struct RemoteError {
    pub type_name: String,
    pub message: String,
    pub stack_trace: Option<String>,
}

impl RemoteError {
    /// `None` if the reply does not describe a failure.
    pub fn from_properties(properties: &BasicProperties) -> Option<Self> {
        let type_name = properties.get_header_str(EXCEPTION_TYPE_HEADER)?;
        Some(Self {
            type_name: type_name.into_owned(),
            message: properties
                .get_header_str(EXCEPTION_MESSAGE_HEADER)
                .map(Cow::into_owned)
                .unwrap_or_default(),
            stack_trace: properties
                .get_header_str(EXCEPTION_STACKTRACE_HEADER)
                .map(Cow::into_owned),
        })
    }

    pub(crate) fn from_dispatch(error: &DispatchError) -> Self {
        Self {
            type_name: error.type_name().to_owned(),
            message: error.to_string(),
            stack_trace: Some(error.stack_trace()),
        }
    }

    pub(crate) fn from_reply(error: &ReplyPublishError) -> Self {
        let type_name = match error {
            ReplyPublishError::Serialization(_) => std::any::type_name::<SerializationError>(),
            ReplyPublishError::Transport(_) => std::any::type_name::<TransportError>(),
        };
        Self {
            type_name: type_name.to_owned(),
            message: error.to_string(),
            stack_trace: Some(report(error)),
        }
    }
}
