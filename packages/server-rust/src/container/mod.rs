//! Dependency container capability set and its concrete engine.
//!
//! The tenancy runtime is written against the object-safe [`Container`]
//! trait (`register`, `resolve`, `create_child_scope`, `dispose`).
//! [`ServiceContainer`] is the engine used by default: one `Root` per
//! tenant, one `Scoped` child per request.
//!
//! - [`events`]: Host callbacks fired when tenant and request containers are created
//! - [`service_container`]: `TypeId`-keyed registrations with parent fallback

pub mod events;
pub mod service_container;

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::ContainerError;

pub use events::{ContainerCallback, ContainerEvents};
pub use service_container::ServiceContainer;

// ---------------------------------------------------------------------------
// Identity and roles
// ---------------------------------------------------------------------------

/// Unique identifier of a container instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerId(pub Uuid);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Role of a container in the tenant hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    /// One per tenant, lives as long as the tenant's shell.
    Root,
    /// One per request, child of exactly one root.
    Scoped,
}

impl ContainerRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Scoped => "scoped",
        }
    }
}

/// Instance caching behavior of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLifetime {
    /// One instance per owning container, created on first resolution.
    Singleton,
    /// One instance per scope that resolves it.
    Scoped,
    /// A new instance on every resolution.
    Transient,
}

// ---------------------------------------------------------------------------
// ServiceKey / descriptors
// ---------------------------------------------------------------------------

/// Registration key: the service's `TypeId`, with its name kept for errors.
///
/// Works for unsized interface types such as `dyn MyService`.
#[derive(Clone, Copy)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Type-erased service instance. The concrete value is always an `Arc<T>`
/// for the registered `T`, so unsized services can be stored.
pub type AnyService = Arc<dyn Any + Send + Sync>;

/// Type-erased factory. Receives the container the resolution started from.
pub type ServiceFactory =
    Arc<dyn Fn(&dyn Container) -> anyhow::Result<AnyService> + Send + Sync>;

/// How a registration produces its instance.
#[derive(Clone)]
pub enum Activator {
    Instance(AnyService),
    Factory(ServiceFactory),
}

/// A registration: lifetime plus activator.
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub lifetime: ServiceLifetime,
    pub activator: Activator,
}

impl ServiceDescriptor {
    /// Pre-built instance, shared by every resolution.
    #[must_use]
    pub fn instance(instance: AnyService) -> Self {
        Self {
            lifetime: ServiceLifetime::Singleton,
            activator: Activator::Instance(instance),
        }
    }

    #[must_use]
    pub fn factory(lifetime: ServiceLifetime, factory: ServiceFactory) -> Self {
        Self {
            lifetime,
            activator: Activator::Factory(factory),
        }
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let activator = match self.activator {
            Activator::Instance(_) => "instance",
            Activator::Factory(_) => "factory",
        };
        f.debug_struct("ServiceDescriptor")
            .field("lifetime", &self.lifetime)
            .field("activator", &activator)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Container trait
// ---------------------------------------------------------------------------

/// Capability set of a dependency container.
///
/// The tenancy runtime only relies on these operations and is agnostic to
/// the engine behind them.
pub trait Container: Send + Sync + 'static {
    fn id(&self) -> ContainerId;

    fn name(&self) -> &str;

    fn role(&self) -> ContainerRole;

    /// Add or replace a registration in this container only.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Disposed` after disposal.
    fn register(&self, key: ServiceKey, descriptor: ServiceDescriptor)
        -> Result<(), ContainerError>;

    /// Resolve a service, consulting this container first and then its
    /// ancestors. `Ok(None)` means the key is registered nowhere.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Disposed` if this container or an ancestor
    /// is disposed, or `ContainerError::Activation` if a factory fails.
    fn resolve(&self, key: ServiceKey) -> Result<Option<AnyService>, ContainerError>;

    /// Create a child container whose parent is this container.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Disposed` after disposal.
    fn create_child_scope(&self, name: &str) -> Result<Arc<dyn Container>, ContainerError>;

    /// Register a callback that runs once when this container is disposed.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Disposed` after disposal.
    fn on_dispose(&self, callback: Box<dyn FnOnce() + Send>) -> Result<(), ContainerError>;

    /// Dispose the container. Idempotent.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

// ---------------------------------------------------------------------------
// ContainerExt
// ---------------------------------------------------------------------------

/// Typed registration and resolution helpers for every [`Container`].
pub trait ContainerExt: Container {
    /// Register a pre-built instance.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Disposed` after disposal.
    fn add_instance<T>(&self, instance: Arc<T>) -> Result<(), ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.register(
            ServiceKey::of::<T>(),
            ServiceDescriptor::instance(Arc::new(instance)),
        )
    }

    /// Register a lazily-created singleton.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Disposed` after disposal.
    fn add_singleton<T, F>(&self, factory: F) -> Result<(), ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&dyn Container) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.register(
            ServiceKey::of::<T>(),
            ServiceDescriptor::factory(ServiceLifetime::Singleton, erase(factory)),
        )
    }

    /// Register a service created once per scope.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Disposed` after disposal.
    fn add_scoped<T, F>(&self, factory: F) -> Result<(), ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&dyn Container) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.register(
            ServiceKey::of::<T>(),
            ServiceDescriptor::factory(ServiceLifetime::Scoped, erase(factory)),
        )
    }

    /// Register a service created on every resolution.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Disposed` after disposal.
    fn add_transient<T, F>(&self, factory: F) -> Result<(), ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&dyn Container) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.register(
            ServiceKey::of::<T>(),
            ServiceDescriptor::factory(ServiceLifetime::Transient, erase(factory)),
        )
    }

    /// Resolve `T`, returning `Ok(None)` when it is not registered.
    ///
    /// # Errors
    ///
    /// Lifecycle and activation errors from [`Container::resolve`].
    fn get_service<T>(&self) -> Result<Option<Arc<T>>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = ServiceKey::of::<T>();
        match self.resolve(key)? {
            Some(any) => any
                .downcast_ref::<Arc<T>>()
                .cloned()
                .map(Some)
                .ok_or(ContainerError::TypeMismatch {
                    type_name: key.type_name(),
                }),
            None => Ok(None),
        }
    }

    /// Resolve `T`, failing when it is not registered.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Unregistered` when `T` is registered in
    /// neither this container nor its ancestors.
    fn get_required_service<T>(&self) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get_service::<T>()?
            .ok_or(ContainerError::Unregistered {
                type_name: type_name::<T>(),
            })
    }
}

impl<C: Container + ?Sized> ContainerExt for C {}

fn erase<T, F>(factory: F) -> ServiceFactory
where
    T: ?Sized + Send + Sync + 'static,
    F: Fn(&dyn Container) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
{
    Arc::new(move |container: &dyn Container| {
        let instance = factory(container)?;
        Ok(Arc::new(instance) as AnyService)
    })
}
