//! Tenant construction: host factory, container configurators, and the
//! shell factory that composes them into a Ready [`TenantShell`].

use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use tenancy_core::TenantIdentity;
use tracing::debug;

use super::module::ModuleCatalog;
use super::settings::{TenantSettings, TenantSettingsStore};
use super::shell::{CurrentTenant, ShellInfo, TenantShell};
use crate::container::{Container, ContainerEvents, ContainerExt, ServiceContainer};
use crate::hosting::TenantHostingEnvironment;

/// Host-supplied construction of a tenant's data (for example a lookup in
/// a tenant registry).
#[async_trait]
pub trait TenantFactory<T>: Send + Sync + 'static {
    async fn create(&self, identity: &TenantIdentity) -> anyhow::Result<T>;
}

/// Adapts an async closure into a [`TenantFactory`].
pub struct FnTenantFactory<F>(F);

impl<F> FnTenantFactory<F> {
    #[must_use]
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<T, F, Fut> TenantFactory<T> for FnTenantFactory<F>
where
    T: Send + 'static,
    F: Fn(TenantIdentity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    async fn create(&self, identity: &TenantIdentity) -> anyhow::Result<T> {
        (self.0)(identity.clone()).await
    }
}

/// Registers a tenant's services into its root container.
///
/// Implemented for every `Fn(&CurrentTenant<T>, &dyn Container) -> anyhow::Result<()>`.
pub trait ContainerConfigurator<T>: Send + Sync + 'static {
    /// # Errors
    ///
    /// Any error fails the tenant's initialization.
    fn configure(&self, tenant: &CurrentTenant<T>, container: &dyn Container)
        -> anyhow::Result<()>;
}

impl<T, F> ContainerConfigurator<T> for F
where
    F: Fn(&CurrentTenant<T>, &dyn Container) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn configure(
        &self,
        tenant: &CurrentTenant<T>,
        container: &dyn Container,
    ) -> anyhow::Result<()> {
        self(tenant, container)
    }
}

/// Builds a tenant's shell: data, root container, default registrations,
/// configurators, modules, creation event.
///
/// Every root receives:
/// - the [`TenantIdentity`], a [`CurrentTenant<T>`] and the shell's
///   [`ShellInfo`]
/// - a [`TenantFileSystem`](crate::hosting::TenantFileSystem) when a hosting
///   environment is attached
/// - live [`TenantSettings`] (transient, so settings reloads are visible)
///   when a settings store is attached
/// - the [`LoadedModules`](super::LoadedModules) its settings enable when a
///   module catalog is attached
pub struct ShellFactory<T> {
    factory: Arc<dyn TenantFactory<T>>,
    configurators: Vec<Arc<dyn ContainerConfigurator<T>>>,
    events: ContainerEvents,
    hosting: Option<Arc<TenantHostingEnvironment>>,
    settings: Option<Arc<TenantSettingsStore>>,
    modules: Option<Arc<ModuleCatalog>>,
}

impl<T: Send + Sync + 'static> ShellFactory<T> {
    #[must_use]
    pub fn new(factory: Arc<dyn TenantFactory<T>>) -> Self {
        Self {
            factory,
            configurators: Vec::new(),
            events: ContainerEvents::default(),
            hosting: None,
            settings: None,
            modules: None,
        }
    }

    /// Adds a configurator. Configurators run in the order they were added.
    #[must_use]
    pub fn with_configurator(mut self, configurator: impl ContainerConfigurator<T>) -> Self {
        self.configurators.push(Arc::new(configurator));
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: ContainerEvents) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_hosting(mut self, hosting: Arc<TenantHostingEnvironment>) -> Self {
        self.hosting = Some(hosting);
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Arc<TenantSettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    #[must_use]
    pub fn with_modules(mut self, modules: Arc<ModuleCatalog>) -> Self {
        self.modules = Some(modules);
        self
    }

    /// Constructs the tenant's shell.
    ///
    /// # Errors
    ///
    /// Fails if the tenant factory or a configurator fails. The partially
    /// configured root container is disposed before returning.
    pub async fn build(&self, identity: &TenantIdentity) -> anyhow::Result<TenantShell<T>> {
        let tenant = self
            .factory
            .create(identity)
            .await
            .with_context(|| format!("tenant factory failed for {identity}"))?;
        let tenant = Arc::new(tenant);

        let info = ShellInfo::new(identity.clone());
        let root: Arc<dyn Container> = ServiceContainer::new_root(root_name(identity));
        if let Err(err) = self.configure(&info, &tenant, root.as_ref()) {
            root.dispose();
            return Err(err);
        }
        self.events.tenant_container_created(identity, &root);
        debug!(
            tenant = %identity,
            shell_id = %info.id,
            container = %root.id(),
            "tenant root container configured"
        );

        Ok(TenantShell::from_info(info, tenant, root))
    }

    fn configure(&self, info: &ShellInfo, tenant: &Arc<T>, root: &dyn Container) -> anyhow::Result<()> {
        let identity = &info.identity;
        let current = CurrentTenant::new(identity.clone(), Arc::clone(tenant));
        root.add_instance(Arc::new(identity.clone()))?;
        root.add_instance(Arc::new(current.clone()))?;
        root.add_instance(Arc::new(info.clone()))?;

        if let Some(hosting) = &self.hosting {
            root.add_instance(Arc::new(hosting.file_system(identity)))?;
        }
        if let Some(settings) = &self.settings {
            let settings = Arc::clone(settings);
            let tenant_id = identity.id();
            root.add_transient::<TenantSettings, _>(move |_| Ok(settings.get(tenant_id)))?;
        }

        for (index, configurator) in self.configurators.iter().enumerate() {
            configurator
                .configure(&current, root)
                .with_context(|| format!("container configurator #{index} failed for {identity}"))?;
        }

        if let Some(catalog) = &self.modules {
            let settings = self
                .settings
                .as_ref()
                .map_or_else(|| Arc::new(TenantSettings::default()), |store| store.get(identity.id()));
            let loaded = catalog.select(identity, &settings);
            loaded.configure_services(identity, root)?;
            root.add_instance(Arc::new(loaded))?;
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for ShellFactory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellFactory")
            .field("configurators", &self.configurators.len())
            .field("events", &self.events)
            .field("hosting", &self.hosting.is_some())
            .field("settings", &self.settings.is_some())
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}

fn root_name(identity: &TenantIdentity) -> String {
    if identity.is_null() {
        "tenant:null".to_string()
    } else {
        format!("tenant:{}", identity.name())
    }
}
