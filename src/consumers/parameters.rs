use crate::consumers::{Adapter, ApplicationError, ConfigurationError, DispatchError};
use crate::serialization::Serializer;
use crate::services::{DispatchContext, FromServices, ServiceProvider, ServiceScope};
use crate::telemetry::Telemetry;
use futures_util::FutureExt;
use std::fmt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Where the service a message is dispatched to gets resolved from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchScope {
    /// Resolve straight from the root provider.
    #[default]
    RootScope,
    /// Open a new scope for every message, disposed of as soon as the message has been
    /// dispatched - whatever the outcome.
    ChildScope,
}

/// Everything a consumer needs to know to process messages, fixed at registration time.
///
/// `ConsumerParameters` is built (and validated) by [`ConsumerBuilder`]: once built it
/// can't be modified.
///
/// [`ConsumerBuilder`]: crate::consumers::ConsumerBuilder
pub struct ConsumerParameters<S, Req, A, Ser> {
    pub(super) queue_name: String,
    pub(super) prefetch_count: u16,
    pub(super) dispatch_scope: DispatchScope,
    pub(super) requeue_on_crash: bool,
    pub(super) consumer_tag: String,
    pub(super) binder: FromServices<S>,
    pub(super) adapter: Arc<A>,
    pub(super) serializer: Arc<Ser>,
    pub(super) services: Arc<dyn ServiceProvider>,
    pub(super) telemetry: Arc<Telemetry>,
    pub(super) _request: PhantomData<fn(Req)>,
}

impl<S, Req, A, Ser> ConsumerParameters<S, Req, A, Ser>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    A: Adapter<S, Req>,
    Ser: Serializer,
{
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    pub fn dispatch_scope(&self) -> DispatchScope {
        self.dispatch_scope
    }

    /// Whether messages whose processing failed are put back on the queue.
    pub fn requeue_on_crash(&self) -> bool {
        self.requeue_on_crash
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn serializer(&self) -> &Ser {
        &self.serializer
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub(super) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.queue_name.trim().is_empty() {
            return Err(ConfigurationError::EmptyQueueName);
        }
        if self.prefetch_count == 0 {
            return Err(ConfigurationError::ZeroPrefetchCount);
        }
        Ok(())
    }

    /// Resolve the service and invoke the adapter on `request`.
    ///
    /// In [`DispatchScope::ChildScope`] the scope is disposed of before returning, on every
    /// path: success, failure and panic. If the returned future is dropped before completing,
    /// disposal is handed over to the runtime instead.
    pub async fn dispatch(&self, request: Req) -> Result<A::Output, DispatchError> {
        match self.dispatch_scope {
            DispatchScope::RootScope => {
                self.guarded(DispatchContext::Root(&*self.services), request)
                    .await
            }
            DispatchScope::ChildScope => {
                let mut guard = ScopeGuard(None);
                let scope = guard.0.insert(self.services.create_scope().await?);
                let outcome = self
                    .guarded(DispatchContext::Scoped(&**scope), request)
                    .await;
                if let Some(scope) = guard.0.take() {
                    scope.dispose().await;
                }
                outcome
            }
        }
    }

    /// A panicking adapter (or service factory) is turned into an application failure.
    async fn guarded(
        &self,
        context: DispatchContext<'_>,
        request: Req,
    ) -> Result<A::Output, DispatchError> {
        AssertUnwindSafe(self.resolve_and_invoke(context, request))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ApplicationError::from_panic(panic).into()))
    }

    async fn resolve_and_invoke(
        &self,
        context: DispatchContext<'_>,
        request: Req,
    ) -> Result<A::Output, DispatchError> {
        let service = self.binder.resolve(context).await?;
        Ok(self.adapter.invoke(service, request).await?)
    }
}

/// Disposes of a child scope that was not released by the dispatch that opened it.
struct ScopeGuard(Option<Box<dyn ServiceScope>>);

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(scope) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(scope.dispose());
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "A dispatch was abandoned outside of a runtime, its scope can't be disposed of"
                );
            }
        }
    }
}

impl<S, Req, A, Ser> fmt::Debug for ConsumerParameters<S, Req, A, Ser> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerParameters")
            .field("queue_name", &self.queue_name)
            .field("prefetch_count", &self.prefetch_count)
            .field("dispatch_scope", &self.dispatch_scope)
            .field("requeue_on_crash", &self.requeue_on_crash)
            .field("consumer_tag", &self.consumer_tag)
            .field("binder", &self.binder)
            .finish_non_exhaustive()
    }
}
