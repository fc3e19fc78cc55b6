use super::{ServiceKey, ServiceProvider, ServiceResolutionError, ServiceScope};
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Where services are resolved from while dispatching a message.
#[derive(Clone, Copy)]
pub enum DispatchContext<'a> {
    /// Straight from the process-wide provider.
    Root(&'a dyn ServiceProvider),
    /// From a scope opened for the current message.
    Scoped(&'a dyn ServiceScope),
}

impl fmt::Debug for DispatchContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root(_) => f.write_str("DispatchContext::Root"),
            Self::Scoped(_) => f.write_str("DispatchContext::Scoped"),
        }
    }
}

/// Binds a handler argument of type `S` to a registered service.
///
/// A missing registration is a hard failure: the binder never hands out a default.
pub struct FromServices<S> {
    key: ServiceKey,
    _service: PhantomData<fn() -> S>,
}

impl<S: Any + Send + Sync> FromServices<S> {
    /// Bind to the unkeyed registration of `S`.
    pub fn new() -> Self {
        Self {
            key: ServiceKey::of::<S>(),
            _service: PhantomData,
        }
    }

    /// Bind to the registration of `S` under `key`.
    pub fn keyed(key: impl Into<Cow<'static, str>>) -> Self {
        Self {
            key: ServiceKey::keyed::<S>(key),
            _service: PhantomData,
        }
    }

    pub fn service_key(&self) -> &ServiceKey {
        &self.key
    }

    /// Resolve the service from `context`.
    pub async fn resolve(
        &self,
        context: DispatchContext<'_>,
    ) -> Result<Arc<S>, ServiceResolutionError> {
        let instance = match context {
            DispatchContext::Root(provider) => provider.resolve(&self.key).await?,
            DispatchContext::Scoped(scope) => scope.resolve(&self.key).await?,
        };
        instance
            .downcast::<S>()
            .map_err(|_| ServiceResolutionError::TypeMismatch(self.key.clone()))
    }
}

impl<S: Any + Send + Sync> Default for FromServices<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Clone for FromServices<S> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _service: PhantomData,
        }
    }
}

impl<S> fmt::Debug for FromServices<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FromServices").field("key", &self.key).finish()
    }
}
