//! The `Adapter` trait binds a service type and a request type to the application logic.
use crate::consumers::{ApplicationError, ResultAction};
use std::future::Future;
use std::sync::Arc;

/// Implementers of the `Adapter` trait are invoked by consumers for every request they
/// manage to deserialize.
///
/// # Scope
///
/// `invoke` gets the resolved service and the request, nothing else: it does not get access
/// to the channel nor to the delivery.
/// The framework takes care of acking/nacking the message according to the outcome.
///
/// # Implementors
///
/// You can implement `Adapter` for a struct, but most of the time you will be passing an
/// async closure to [`ConsumerBuilder::handler`], which wraps it in a [`ClosureAdapter`]:
/// `Fn(Arc<Service>, Request) -> Fut`.
///
/// [`ConsumerBuilder::handler`]: crate::consumers::ConsumerBuilder::handler
#[async_trait::async_trait]
pub trait Adapter<S, Req>: Send + Sync + 'static
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
{
    type Output: Send + 'static;

    async fn invoke(&self, service: Arc<S>, request: Req) -> Result<Self::Output, ApplicationError>;
}

/// Wrapper type to turn an async closure into an [`Adapter`].
pub struct ClosureAdapter<F>(pub F);

/// We do not require closures to return an [`ApplicationError`] directly - it is enough for
/// them to return an error type that can be converted into one (e.g. `anyhow::Error`).
#[async_trait::async_trait]
impl<S, Req, F, Fut, O, E> Adapter<S, Req> for ClosureAdapter<F>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    F: Fn(Arc<S>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    O: Send + 'static,
    E: Into<ApplicationError> + 'static,
{
    type Output = O;

    async fn invoke(&self, service: Arc<S>, request: Req) -> Result<O, ApplicationError> {
        (self.0)(service, request).await.map_err(Into::into)
    }
}

/// What a queue consumer turns the output of its adapter into.
///
/// `()` acknowledges the message; a [`ResultAction`] is executed as it is.
pub trait IntoResultAction: Send + 'static {
    fn into_result_action(self) -> ResultAction;
}

impl IntoResultAction for () {
    fn into_result_action(self) -> ResultAction {
        ResultAction::Ack
    }
}

impl IntoResultAction for ResultAction {
    fn into_result_action(self) -> ResultAction {
        self
    }
}
