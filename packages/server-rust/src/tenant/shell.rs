//! Per-tenant shell: identity, tenant data and the long-lived root container.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tenancy_core::TenantIdentity;
use uuid::Uuid;

use crate::container::Container;

/// Lifecycle state of a tenant's shell as seen through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

impl ShellState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// Identity of one shell instance, registered in its root container so
/// request code can tell which shell it runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInfo {
    pub id: Uuid,
    pub identity: TenantIdentity,
    pub created_at: Instant,
}

impl ShellInfo {
    /// Info for a new shell of `identity`, with a fresh id.
    #[must_use]
    pub fn new(identity: TenantIdentity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            created_at: Instant::now(),
        }
    }
}

/// A Ready tenant: its identity, host-defined data, and root container.
///
/// Owned by [`TenantShellStore`](super::TenantShellStore); handed out as
/// `Arc<TenantShell<T>>`.
pub struct TenantShell<T> {
    id: Uuid,
    identity: TenantIdentity,
    tenant: Arc<T>,
    root: Arc<dyn Container>,
    created_at: Instant,
}

impl<T> TenantShell<T> {
    #[must_use]
    pub fn new(identity: TenantIdentity, tenant: Arc<T>, root: Arc<dyn Container>) -> Self {
        Self::from_info(ShellInfo::new(identity), tenant, root)
    }

    /// Shell described by `info`, typically the one registered in `root`.
    #[must_use]
    pub fn from_info(info: ShellInfo, tenant: Arc<T>, root: Arc<dyn Container>) -> Self {
        Self {
            id: info.id,
            identity: info.identity,
            tenant,
            root,
            created_at: info.created_at,
        }
    }

    #[must_use]
    pub fn info(&self) -> ShellInfo {
        ShellInfo {
            id: self.id,
            identity: self.identity.clone(),
            created_at: self.created_at,
        }
    }

    /// Unique id of this shell instance. A tenant that is evicted and
    /// rebuilt gets a new shell id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn identity(&self) -> &TenantIdentity {
        &self.identity
    }

    #[must_use]
    pub fn tenant(&self) -> &Arc<T> {
        &self.tenant
    }

    #[must_use]
    pub fn root(&self) -> &Arc<dyn Container> {
        &self.root
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn dispose(&self) {
        self.root.dispose();
    }
}

impl<T> fmt::Debug for TenantShell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantShell")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("root", &self.root.id())
            .field("disposed", &self.root.is_disposed())
            .finish_non_exhaustive()
    }
}

/// The current tenant, registered in every tenant root container.
pub struct CurrentTenant<T> {
    identity: TenantIdentity,
    tenant: Arc<T>,
}

impl<T> CurrentTenant<T> {
    #[must_use]
    pub fn new(identity: TenantIdentity, tenant: Arc<T>) -> Self {
        Self { identity, tenant }
    }

    #[must_use]
    pub fn identity(&self) -> &TenantIdentity {
        &self.identity
    }

    #[must_use]
    pub fn tenant(&self) -> &Arc<T> {
        &self.tenant
    }
}

impl<T> Clone for CurrentTenant<T> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            tenant: Arc::clone(&self.tenant),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for CurrentTenant<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentTenant")
            .field("identity", &self.identity)
            .field("tenant", &self.tenant)
            .finish()
    }
}
