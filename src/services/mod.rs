//! Resolving the application services message handlers are invoked on.
//!
//! Consumers do not own the services they dispatch to: they resolve them, for every
//! message, from a [`ServiceProvider`] - either straight from the root provider or from a
//! short-lived [`ServiceScope`], depending on the configured
//! [`DispatchScope`](crate::consumers::DispatchScope).
//!
//! [`ServiceCollection`] is a ready-to-use provider; any other container can be plugged in
//! by implementing [`ServiceProvider`] and [`ServiceScope`].
use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

mod binder;
mod container;

pub use binder::{DispatchContext, FromServices};
pub use container::{ServiceCollection, ServiceContainer};

/// A resolved service, type-erased.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// Identifies a registration: a service type, optionally qualified by a key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    type_id: TypeId,
    type_name: &'static str,
    key: Option<Cow<'static, str>>,
}

impl ServiceKey {
    /// The unkeyed registration of `T`.
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            key: None,
        }
    }

    /// The registration of `T` under `key`.
    pub fn keyed<T: Any>(key: impl Into<Cow<'static, str>>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::of::<T>()
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "`{}` (key `{}`)", self.type_name, key),
            None => write!(f, "`{}`", self.type_name),
        }
    }
}

/// A service could not be resolved.
///
/// This points at a configuration defect (a missing registration, a scoped service used
/// outside of a scope) rather than at something wrong with the message being processed.
#[derive(thiserror::Error, Debug)]
pub enum ServiceResolutionError {
    #[error("No service registered for {0}")]
    NotRegistered(ServiceKey),
    #[error("{0} is scoped and can only be resolved from a service scope")]
    ScopedFromRoot(ServiceKey),
    #[error("The instance registered for {0} has a different type")]
    TypeMismatch(ServiceKey),
    #[error("The service scope has already been disposed")]
    ScopeDisposed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The process-wide provider of application services.
#[async_trait::async_trait]
pub trait ServiceProvider: Send + Sync + 'static {
    /// Resolve the service registered under `key`.
    ///
    /// It must fail if nothing is registered: consumers never proceed without a service.
    async fn resolve(&self, key: &ServiceKey) -> Result<ServiceInstance, ServiceResolutionError>;

    /// Open a nested scope.
    async fn create_scope(&self) -> Result<Box<dyn ServiceScope>, ServiceResolutionError>;
}

/// A nested, disposable resolution scope.
#[async_trait::async_trait]
pub trait ServiceScope: Send + Sync {
    async fn resolve(&self, key: &ServiceKey) -> Result<ServiceInstance, ServiceResolutionError>;

    /// Release everything the scope resolved.
    async fn dispose(self: Box<Self>);
}
