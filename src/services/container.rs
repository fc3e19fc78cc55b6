use super::{
    ServiceInstance, ServiceKey, ServiceProvider, ServiceResolutionError, ServiceScope,
};
use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

type Factory = Arc<dyn Fn() -> ServiceInstance + Send + Sync>;

enum Registration {
    /// One instance for the whole process.
    Singleton(ServiceInstance),
    /// One instance per scope, created on first use.
    Scoped(Factory),
    /// A new instance every time it is resolved.
    Transient(Factory),
}

/// Registrations for a [`ServiceContainer`].
///
/// ```rust
/// use carrot_courier::services::ServiceCollection;
///
/// struct Clock;
/// struct UnitOfWork;
///
/// let services = ServiceCollection::new()
///     .add_singleton(Clock)
///     .add_scoped(|| UnitOfWork)
///     .build();
/// # drop(services);
/// ```
#[derive(Default)]
pub struct ServiceCollection {
    registrations: HashMap<ServiceKey, Registration>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single shared instance of `T`.
    #[must_use]
    pub fn add_singleton<T: Any + Send + Sync>(self, service: T) -> Self {
        self.register(ServiceKey::of::<T>(), Registration::Singleton(Arc::new(service)))
    }

    /// Register a single shared instance of `T` under `key`.
    #[must_use]
    pub fn add_keyed_singleton<T: Any + Send + Sync>(
        self,
        key: impl Into<Cow<'static, str>>,
        service: T,
    ) -> Self {
        self.register(
            ServiceKey::keyed::<T>(key),
            Registration::Singleton(Arc::new(service)),
        )
    }

    /// Register a factory producing one instance of `T` per scope.
    ///
    /// Scoped services can't be resolved from the root provider.
    #[must_use]
    pub fn add_scoped<T, F>(self, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.register(ServiceKey::of::<T>(), Registration::Scoped(erase(factory)))
    }

    /// Register a factory producing one instance of `T` per scope, under `key`.
    #[must_use]
    pub fn add_keyed_scoped<T, F>(self, key: impl Into<Cow<'static, str>>, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.register(ServiceKey::keyed::<T>(key), Registration::Scoped(erase(factory)))
    }

    /// Register a factory invoked every time `T` is resolved.
    #[must_use]
    pub fn add_transient<T, F>(self, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.register(ServiceKey::of::<T>(), Registration::Transient(erase(factory)))
    }

    /// Freeze the registrations. Later registrations of the same key win.
    pub fn build(self) -> Arc<ServiceContainer> {
        Arc::new(ServiceContainer {
            registrations: Arc::new(self.registrations),
        })
    }

    fn register(mut self, key: ServiceKey, registration: Registration) -> Self {
        self.registrations.insert(key, registration);
        self
    }
}

fn erase<T, F>(factory: F) -> Factory
where
    T: Any + Send + Sync,
    F: Fn() -> T + Send + Sync + 'static,
{
    Arc::new(move || Arc::new(factory()) as ServiceInstance)
}

/// The root provider built by [`ServiceCollection::build`].
pub struct ServiceContainer {
    registrations: Arc<HashMap<ServiceKey, Registration>>,
}

#[async_trait::async_trait]
impl ServiceProvider for ServiceContainer {
    async fn resolve(&self, key: &ServiceKey) -> Result<ServiceInstance, ServiceResolutionError> {
        match self.registrations.get(key) {
            Some(Registration::Singleton(instance)) => Ok(Arc::clone(instance)),
            Some(Registration::Transient(factory)) => Ok(factory()),
            Some(Registration::Scoped(_)) => {
                Err(ServiceResolutionError::ScopedFromRoot(key.clone()))
            }
            None => Err(ServiceResolutionError::NotRegistered(key.clone())),
        }
    }

    async fn create_scope(&self) -> Result<Box<dyn ServiceScope>, ServiceResolutionError> {
        Ok(Box::new(ContainerScope {
            registrations: Arc::clone(&self.registrations),
            instances: Mutex::new(Some(HashMap::new())),
        }))
    }
}

/// A scope opened on a [`ServiceContainer`].
struct ContainerScope {
    registrations: Arc<HashMap<ServiceKey, Registration>>,
    /// Scoped instances resolved so far; `None` once disposed.
    instances: Mutex<Option<HashMap<ServiceKey, ServiceInstance>>>,
}

#[async_trait::async_trait]
impl ServiceScope for ContainerScope {
    async fn resolve(&self, key: &ServiceKey) -> Result<ServiceInstance, ServiceResolutionError> {
        let mut guard = self.instances.lock();
        let instances = guard
            .as_mut()
            .ok_or(ServiceResolutionError::ScopeDisposed)?;
        match self.registrations.get(key) {
            Some(Registration::Singleton(instance)) => Ok(Arc::clone(instance)),
            Some(Registration::Transient(factory)) => Ok(factory()),
            Some(Registration::Scoped(factory)) => Ok(Arc::clone(
                instances.entry(key.clone()).or_insert_with(|| factory()),
            )),
            None => Err(ServiceResolutionError::NotRegistered(key.clone())),
        }
    }

    async fn dispose(self: Box<Self>) {
        let released = self.instances.lock().take().map_or(0, |i| i.len());
        tracing::trace!(released, "Disposed service scope");
    }
}
