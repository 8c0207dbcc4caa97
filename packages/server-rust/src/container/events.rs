//! Host hooks fired when tenant roots and request scopes are created.

use std::fmt;
use std::sync::Arc;

use tenancy_core::TenantIdentity;

use super::Container;

/// Callback receiving the tenant and the freshly created container.
pub type ContainerCallback = Arc<dyn Fn(&TenantIdentity, &Arc<dyn Container>) + Send + Sync>;

/// Registered container-creation hooks.
///
/// `on_tenant_container_created` runs once per shell construction, after the
/// configurators, so hosts can add late registrations to a tenant root.
/// `on_nested_container_created` runs for every request scope before the
/// scope is handed to the pipeline.
#[derive(Clone, Default)]
pub struct ContainerEvents {
    tenant_created: Vec<ContainerCallback>,
    nested_created: Vec<ContainerCallback>,
}

impl ContainerEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_tenant_container_created<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TenantIdentity, &Arc<dyn Container>) + Send + Sync + 'static,
    {
        self.tenant_created.push(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_nested_container_created<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TenantIdentity, &Arc<dyn Container>) + Send + Sync + 'static,
    {
        self.nested_created.push(Arc::new(callback));
        self
    }

    pub(crate) fn tenant_container_created(
        &self,
        tenant: &TenantIdentity,
        container: &Arc<dyn Container>,
    ) {
        for callback in &self.tenant_created {
            callback(tenant, container);
        }
    }

    pub(crate) fn nested_container_created(
        &self,
        tenant: &TenantIdentity,
        container: &Arc<dyn Container>,
    ) {
        for callback in &self.nested_created {
            callback(tenant, container);
        }
    }
}

impl fmt::Debug for ContainerEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerEvents")
            .field("tenant_created", &self.tenant_created.len())
            .field("nested_created", &self.nested_created.len())
            .finish()
    }
}
