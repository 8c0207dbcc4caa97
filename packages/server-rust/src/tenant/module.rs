//! Tenant modules: named bundles of services and pipeline steps that are
//! loaded into a tenant's shell when its settings enable them.

use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use tenancy_core::TenantIdentity;
use tracing::{debug, warn};

use super::settings::TenantSettings;
use crate::container::Container;
use crate::pipeline::ChainBuilder;

/// A unit of optional tenant functionality.
///
/// Both hooks default to doing nothing, so a module may contribute only
/// services or only steps.
pub trait TenantModule: Send + Sync + 'static {
    /// Name tenants enable the module by, in [`TenantSettings::modules`].
    fn name(&self) -> &str;

    /// Registers the module's services in the tenant's root container.
    ///
    /// # Errors
    ///
    /// Any error fails the tenant's initialization.
    fn configure_services(
        &self,
        _tenant: &TenantIdentity,
        _services: &dyn Container,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Appends the module's steps to the tenant's pipeline.
    ///
    /// # Errors
    ///
    /// Any error fails the tenant's pipeline build.
    fn configure_pipeline(
        &self,
        _tenant: &TenantIdentity,
        _services: &dyn Container,
        chain: ChainBuilder,
    ) -> anyhow::Result<ChainBuilder> {
        Ok(chain)
    }
}

/// Every module the host offers, in load order.
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    modules: Vec<Arc<dyn TenantModule>>,
}

impl ModuleCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_module(mut self, module: impl TenantModule) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    /// The modules `settings` enables, in catalog order. Enabled names the
    /// catalog does not know are logged and skipped.
    #[must_use]
    pub fn select(&self, tenant: &TenantIdentity, settings: &TenantSettings) -> LoadedModules {
        for name in &settings.modules {
            if !self.modules.iter().any(|module| module.name() == name) {
                warn!(tenant = %tenant, module = %name, "tenant enables an unknown module");
            }
        }
        LoadedModules {
            modules: self
                .modules
                .iter()
                .filter(|module| settings.has_module(module.name()))
                .cloned()
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.modules.iter().map(|module| module.name()))
            .finish()
    }
}

/// Modules loaded into one tenant's shell.
///
/// Registered in the tenant's root container; pipeline builders apply it
/// with [`ChainBuilder::use_modules`].
#[derive(Clone, Default)]
pub struct LoadedModules {
    modules: Vec<Arc<dyn TenantModule>>,
}

impl LoadedModules {
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|module| module.name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Runs every module's service registration against the tenant's root.
    ///
    /// # Errors
    ///
    /// Returns the first module failure, naming the module.
    pub fn configure_services(
        &self,
        tenant: &TenantIdentity,
        services: &dyn Container,
    ) -> anyhow::Result<()> {
        for module in &self.modules {
            module
                .configure_services(tenant, services)
                .with_context(|| format!("module {} failed to configure {tenant}", module.name()))?;
            debug!(tenant = %tenant, module = module.name(), "tenant module loaded");
        }
        Ok(())
    }

    /// Appends every module's steps to `chain`, in load order.
    ///
    /// # Errors
    ///
    /// Returns the first module failure, naming the module.
    pub fn configure_pipeline(
        &self,
        tenant: &TenantIdentity,
        services: &dyn Container,
        chain: ChainBuilder,
    ) -> anyhow::Result<ChainBuilder> {
        self.modules.iter().try_fold(chain, |chain, module| {
            module
                .configure_pipeline(tenant, services, chain)
                .with_context(|| format!("module {} failed to extend the pipeline", module.name()))
        })
    }
}

impl fmt::Debug for LoadedModules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
