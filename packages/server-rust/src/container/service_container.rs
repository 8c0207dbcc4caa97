use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::debug;
use uuid::Uuid;

use super::{
    Activator, AnyService, Container, ContainerId, ContainerRole, ServiceDescriptor,
    ServiceFactory, ServiceKey, ServiceLifetime,
};
use crate::error::ContainerError;

type DisposeCallback = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// ServiceContainer
// ---------------------------------------------------------------------------

/// Default container engine.
///
/// Registrations are keyed by `TypeId` (see [`ServiceKey`]). A scoped child
/// consults its own registrations first and then walks up to its root, so
/// request overrides shadow tenant registrations without touching them.
///
/// Instance caching:
/// - **Singleton**: cached in the container that owns the registration and
///   activated with that container as resolver.
/// - **Scoped**: cached in the container the resolution started from, so a
///   scoped registration inherited from a root is never cached in the root.
/// - **Transient**: never cached.
pub struct ServiceContainer {
    id: ContainerId,
    name: String,
    role: ContainerRole,
    parent: Option<Arc<ServiceContainer>>,
    this: Weak<ServiceContainer>,
    registrations: DashMap<ServiceKey, ServiceDescriptor>,
    instances: DashMap<ServiceKey, AnyService>,
    /// Serializes activation of cached instances. Reentrant because a factory
    /// may resolve further services from the same container.
    activation: ReentrantMutex<()>,
    disposers: Mutex<Vec<DisposeCallback>>,
    disposed: AtomicBool,
}

impl ServiceContainer {
    /// Creates an empty root container.
    #[must_use]
    pub fn new_root(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), ContainerRole::Root, None)
    }

    fn build(name: String, role: ContainerRole, parent: Option<Arc<Self>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: ContainerId(Uuid::new_v4()),
            name,
            role,
            parent,
            this: this.clone(),
            registrations: DashMap::new(),
            instances: DashMap::new(),
            activation: ReentrantMutex::new(()),
            disposers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// The container this one was created from, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<ServiceContainer>> {
        self.parent.as_ref()
    }

    /// Number of registrations owned by this container (ancestors excluded).
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    fn ensure_live(&self) -> Result<(), ContainerError> {
        let mut current = Some(self);
        while let Some(container) = current {
            if container.disposed.load(Ordering::Acquire) {
                return Err(ContainerError::Disposed {
                    container: container.name.clone(),
                });
            }
            current = container.parent.as_deref();
        }
        Ok(())
    }

    /// Find the nearest registration for `key`, with the container owning it.
    fn find(&self, key: ServiceKey) -> Option<(&ServiceContainer, ServiceDescriptor)> {
        let mut current = Some(self);
        while let Some(container) = current {
            if let Some(descriptor) = container.registrations.get(&key) {
                return Some((container, descriptor.value().clone()));
            }
            current = container.parent.as_deref();
        }
        None
    }

    fn cached_or_activate(
        &self,
        key: ServiceKey,
        factory: &ServiceFactory,
        resolver: &dyn Container,
    ) -> Result<AnyService, ContainerError> {
        if let Some(existing) = self.instances.get(&key) {
            return Ok(existing.value().clone());
        }
        let _guard = self.activation.lock();
        if let Some(existing) = self.instances.get(&key) {
            return Ok(existing.value().clone());
        }
        let created = activate(key, factory, resolver)?;
        self.instances.insert(key, created.clone());
        Ok(created)
    }
}

fn activate(
    key: ServiceKey,
    factory: &ServiceFactory,
    resolver: &dyn Container,
) -> Result<AnyService, ContainerError> {
    factory(resolver).map_err(|err| ContainerError::Activation {
        type_name: key.type_name(),
        message: format!("{err:#}"),
    })
}

impl Container for ServiceContainer {
    fn id(&self) -> ContainerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> ContainerRole {
        self.role
    }

    fn register(
        &self,
        key: ServiceKey,
        descriptor: ServiceDescriptor,
    ) -> Result<(), ContainerError> {
        self.ensure_live()?;
        // A re-registration must not keep serving the previous cached instance.
        self.instances.remove(&key);
        self.registrations.insert(key, descriptor);
        Ok(())
    }

    fn resolve(&self, key: ServiceKey) -> Result<Option<AnyService>, ContainerError> {
        self.ensure_live()?;
        let Some((owner, descriptor)) = self.find(key) else {
            return Ok(None);
        };
        let instance = match descriptor.activator {
            Activator::Instance(instance) => instance,
            Activator::Factory(factory) => match descriptor.lifetime {
                ServiceLifetime::Singleton => owner.cached_or_activate(key, &factory, owner)?,
                ServiceLifetime::Scoped => self.cached_or_activate(key, &factory, self)?,
                ServiceLifetime::Transient => activate(key, &factory, self)?,
            },
        };
        Ok(Some(instance))
    }

    fn create_child_scope(&self, name: &str) -> Result<Arc<dyn Container>, ContainerError> {
        self.ensure_live()?;
        let parent = self.this.upgrade().ok_or_else(|| ContainerError::Disposed {
            container: self.name.clone(),
        })?;
        let child = Self::build(name.to_string(), ContainerRole::Scoped, Some(parent));
        Ok(child)
    }

    fn on_dispose(&self, callback: Box<dyn FnOnce() + Send>) -> Result<(), ContainerError> {
        let mut disposers = self.disposers.lock();
        // Checked under the lock so a callback cannot slip in after disposal ran.
        if self.disposed.load(Ordering::Acquire) {
            return Err(ContainerError::Disposed {
                container: self.name.clone(),
            });
        }
        disposers.push(callback);
        Ok(())
    }

    fn dispose(&self) {
        let callbacks = {
            let mut disposers = self.disposers.lock();
            if self.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *disposers)
        };
        for callback in callbacks.into_iter().rev() {
            callback();
        }
        self.instances.clear();
        self.registrations.clear();
        debug!(
            container = %self.name,
            container_id = %self.id,
            role = self.role.as_str(),
            "container disposed"
        );
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("registrations", &self.registrations.len())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::container::ContainerExt;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    /// Counts how many instances were constructed.
    struct Counted {
        serial: u32,
    }

    fn counting_factory(
        counter: Arc<AtomicU32>,
    ) -> impl Fn(&dyn Container) -> anyhow::Result<Arc<Counted>> + Send + Sync + 'static {
        move |_| {
            let serial = counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Counted { serial }))
        }
    }

    #[test]
    fn register_and_resolve_instance() {
        let root = ServiceContainer::new_root("tenant:foo");
        root.add_instance(Arc::new(String::from("foo"))).unwrap();

        let value = root.get_required_service::<String>().unwrap();
        assert_eq!(value.as_str(), "foo");
    }

    #[test]
    fn unregistered_service_is_absent_or_error() {
        let root = ServiceContainer::new_root("tenant:foo");
        assert!(root.get_service::<String>().unwrap().is_none());
        assert!(matches!(
            root.get_required_service::<String>(),
            Err(ContainerError::Unregistered { .. })
        ));
    }

    #[test]
    fn resolves_unsized_interface() {
        let root = ServiceContainer::new_root("tenant:foo");
        root.add_instance::<dyn Greeter>(Arc::new(English)).unwrap();

        let greeter = root.get_required_service::<dyn Greeter>().unwrap();
        assert_eq!(greeter.greet(), "hello");
    }

    #[test]
    fn singleton_is_created_once_across_scopes() {
        let counter = Arc::new(AtomicU32::new(0));
        let root = ServiceContainer::new_root("tenant:foo");
        root.add_singleton(counting_factory(counter.clone())).unwrap();

        let a = root.create_child_scope("r1").unwrap();
        let b = root.create_child_scope("r2").unwrap();
        let first = a.get_required_service::<Counted>().unwrap();
        let second = b.get_required_service::<Counted>().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scoped_is_per_scope_and_not_cached_in_root() {
        let counter = Arc::new(AtomicU32::new(0));
        let root = ServiceContainer::new_root("tenant:foo");
        root.add_scoped(counting_factory(counter.clone())).unwrap();

        let scope_a = root.create_child_scope("r1").unwrap();
        let scope_b = root.create_child_scope("r2").unwrap();
        let a1 = scope_a.get_required_service::<Counted>().unwrap();
        let a2 = scope_a.get_required_service::<Counted>().unwrap();
        let b1 = scope_b.get_required_service::<Counted>().unwrap();

        assert!(Arc::ptr_eq(&a1, &a2));
        assert_ne!(a1.serial, b1.serial);
        assert!(root.instances.is_empty(), "root must not cache scoped instances");
    }

    #[test]
    fn transient_is_new_every_time() {
        let counter = Arc::new(AtomicU32::new(0));
        let root = ServiceContainer::new_root("tenant:foo");
        root.add_transient(counting_factory(counter.clone())).unwrap();

        let first = root.get_required_service::<Counted>().unwrap();
        let second = root.get_required_service::<Counted>().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn child_overrides_do_not_leak_into_root() {
        let root = ServiceContainer::new_root("tenant:foo");
        root.add_instance(Arc::new(String::from("tenant"))).unwrap();

        let child = root.create_child_scope("request").unwrap();
        child.add_instance(Arc::new(String::from("request"))).unwrap();
        child.add_instance(Arc::new(42_u32)).unwrap();

        assert_eq!(child.get_required_service::<String>().unwrap().as_str(), "request");
        assert_eq!(root.get_required_service::<String>().unwrap().as_str(), "tenant");
        assert!(root.get_service::<u32>().unwrap().is_none());
        assert_eq!(root.registration_count(), 1);
    }

    #[test]
    fn scoped_factory_sees_request_overrides() {
        struct Greeting(String);

        let root = ServiceContainer::new_root("tenant:foo");
        root.add_instance(Arc::new(String::from("tenant"))).unwrap();
        root.add_scoped(|c: &dyn Container| {
            let who = c.get_required_service::<String>()?;
            Ok(Arc::new(Greeting(format!("hi {who}"))))
        })
        .unwrap();

        let child = root.create_child_scope("request").unwrap();
        child.add_instance(Arc::new(String::from("request"))).unwrap();
        let greeting = child.get_required_service::<Greeting>().unwrap();
        assert_eq!(greeting.0, "hi request");
    }

    #[test]
    fn factory_error_surfaces_as_activation_error() {
        let root = ServiceContainer::new_root("tenant:foo");
        root.add_singleton::<String, _>(|_| Err(anyhow::anyhow!("config missing")))
            .unwrap();

        let err = root.get_service::<String>().unwrap_err();
        assert!(matches!(
            err,
            ContainerError::Activation { ref message, .. } if message == "config missing"
        ));
    }

    #[test]
    fn disposed_scope_rejects_resolution() {
        let root = ServiceContainer::new_root("tenant:foo");
        root.add_instance(Arc::new(String::from("tenant"))).unwrap();
        let child = root.create_child_scope("request").unwrap();

        child.dispose();

        assert!(child.is_disposed());
        assert!(matches!(
            child.get_service::<String>(),
            Err(ContainerError::Disposed { .. })
        ));
        assert!(matches!(
            child.create_child_scope("nested"),
            Err(ContainerError::Disposed { .. })
        ));
        // The root is unaffected.
        assert!(root.get_service::<String>().unwrap().is_some());
    }

    #[test]
    fn disposed_root_fails_children() {
        let root = ServiceContainer::new_root("tenant:foo");
        let child = root.create_child_scope("request").unwrap();
        root.dispose();

        assert!(!child.is_disposed());
        assert!(matches!(
            child.get_service::<String>(),
            Err(ContainerError::Disposed { ref container }) if container == "tenant:foo"
        ));
    }

    #[test]
    fn dispose_runs_callbacks_once_in_reverse_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let root = ServiceContainer::new_root("tenant:foo");
        for name in ["first", "second", "third"] {
            let log = log.clone();
            root.on_dispose(Box::new(move || log.lock().push(name)))
                .unwrap();
        }

        root.dispose();
        root.dispose();

        assert_eq!(*log.lock(), vec!["third", "second", "first"]);
        assert!(root.on_dispose(Box::new(|| {})).is_err());
    }

    #[test]
    fn registration_after_dispose_fails() {
        let root = ServiceContainer::new_root("tenant:foo");
        root.dispose();
        assert!(matches!(
            root.add_instance(Arc::new(1_u8)),
            Err(ContainerError::Disposed { .. })
        ));
    }

    #[test]
    fn concurrent_singleton_resolution_activates_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let root = ServiceContainer::new_root("tenant:foo");
        root.add_singleton(counting_factory(counter.clone())).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let scope = root.create_child_scope(&format!("r{i}")).unwrap();
                    scope.get_required_service::<Counted>().unwrap().serial
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_reports_scoped_role_and_parent() {
        let root = ServiceContainer::new_root("tenant:foo");
        let child = root.create_child_scope("request").unwrap();
        assert_eq!(root.role(), ContainerRole::Root);
        assert_eq!(child.role(), ContainerRole::Scoped);
        assert_eq!(child.name(), "request");
        assert_ne!(child.id(), root.id());
    }
}
