//! Request-scoped child containers.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use tenancy_core::TenantIdentity;
use tracing::debug;

use super::shell::TenantShell;
use crate::container::{Container, ContainerEvents, ContainerExt};
use crate::error::ScopeError;

/// Request details registered in every request scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub request_id: String,
    pub method: http::Method,
    pub path: String,
}

/// Opens request scopes from tenant root containers.
///
/// Opening a scope never mutates the root: the child gets its own
/// registration table, and concurrent requests for one tenant open
/// independent children.
#[derive(Debug, Clone, Default)]
pub struct TenantContainerScope {
    events: ContainerEvents,
    open: Arc<AtomicU64>,
}

impl TenantContainerScope {
    #[must_use]
    pub fn new(events: ContainerEvents) -> Self {
        Self {
            events,
            open: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a child of `shell`'s root container.
    ///
    /// The returned guard disposes the child when dropped. When `request` is
    /// given it is registered in the child as [`RequestInfo`].
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError`] if the root refuses to create a child (for
    /// example because the tenant was evicted) or rejects the registration.
    pub fn open_scope<T>(
        &self,
        shell: &TenantShell<T>,
        request: Option<RequestInfo>,
    ) -> Result<ScopedContainer, ScopeError> {
        let identity = shell.identity();
        let name = match &request {
            Some(info) => format!("request:{}", info.request_id),
            None => format!("scope:{}", shell.root().name()),
        };
        let container = shell
            .root()
            .create_child_scope(&name)
            .map_err(|err| ScopeError::new(identity.clone(), err))?;

        self.open.fetch_add(1, Ordering::AcqRel);
        let scope = ScopedContainer {
            container,
            tenant: identity.clone(),
            open: Arc::clone(&self.open),
        };

        if let Some(info) = request {
            scope
                .add_instance(Arc::new(info))
                .map_err(|err| ScopeError::new(identity.clone(), err))?;
        }
        self.events.nested_container_created(identity, &scope.container);

        counter!("tenancy_scopes_opened_total").increment(1);
        debug!(tenant = %identity, scope = %scope.container.id(), "request scope opened");
        Ok(scope)
    }

    /// Number of scopes opened through this instance and not yet disposed.
    #[must_use]
    pub fn open_count(&self) -> u64 {
        self.open.load(Ordering::Acquire)
    }
}

/// A request's child container. Disposed when dropped.
///
/// Dropping covers every exit path of the request: completion, an early
/// return on error, and cancellation (the owning future being dropped).
pub struct ScopedContainer {
    container: Arc<dyn Container>,
    tenant: TenantIdentity,
    open: Arc<AtomicU64>,
}

impl ScopedContainer {
    /// Shared handle to the child. Stays valid after the guard drops, but
    /// every resolution through it then fails with a lifecycle error.
    #[must_use]
    pub fn container(&self) -> &Arc<dyn Container> {
        &self.container
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantIdentity {
        &self.tenant
    }
}

impl Deref for ScopedContainer {
    type Target = dyn Container;

    fn deref(&self) -> &Self::Target {
        self.container.as_ref()
    }
}

impl Drop for ScopedContainer {
    fn drop(&mut self) {
        self.container.dispose();
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ScopedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedContainer")
            .field("container", &self.container.id())
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}
