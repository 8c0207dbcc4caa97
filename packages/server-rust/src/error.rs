//! Error taxonomy for tenant resolution, construction, scoping, and dispatch.
//!
//! Construction-phase errors ([`InitializationError`], [`PipelineBuildError`])
//! are memoized by their caches, so they are `Clone` and share the original
//! cause behind an `Arc`. Request-phase errors ([`ScopeError`], [`StepFault`])
//! belong to a single request and are never cached.

use std::sync::Arc;

use tenancy_core::TenantIdentity;

// ---------------------------------------------------------------------------
// ContainerError
// ---------------------------------------------------------------------------

/// Errors raised while registering or resolving services in a container.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContainerError {
    /// The service is registered neither in the scope nor in any ancestor.
    #[error("service not registered: {type_name}")]
    Unregistered { type_name: &'static str },
    /// The container (or one of its ancestors) has been disposed.
    #[error("container '{container}' has been disposed")]
    Disposed { container: String },
    /// A service factory returned an error.
    #[error("failed to activate {type_name}: {message}")]
    Activation {
        type_name: &'static str,
        message: String,
    },
    /// The stored instance does not have the requested type.
    #[error("registered instance for {type_name} has an unexpected type")]
    TypeMismatch { type_name: &'static str },
}

// ---------------------------------------------------------------------------
// ResolutionError
// ---------------------------------------------------------------------------

/// Failure of the tenant resolution collaborator.
///
/// Never fatal: the dispatcher falls back to the null tenant.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("invalid tenant header {header}: {value:?}")]
    InvalidHeader { header: String, value: String },
    #[error("tenant lookup failed: {0}")]
    Lookup(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// InitializationError
// ---------------------------------------------------------------------------

/// Failure of a tenant's shell construction.
///
/// Cached by the shell store: every caller for the tenant observes the same
/// error (the same shared cause) until the tenant is explicitly reset.
#[derive(Debug, Clone, thiserror::Error)]
#[error("tenant {tenant} failed to initialize: {cause:#}")]
pub struct InitializationError {
    tenant: TenantIdentity,
    cause: Arc<anyhow::Error>,
}

impl InitializationError {
    #[must_use]
    pub fn new(tenant: TenantIdentity, cause: anyhow::Error) -> Self {
        Self {
            tenant,
            cause: Arc::new(cause),
        }
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantIdentity {
        &self.tenant
    }

    #[must_use]
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// Returns `true` when both errors come from the same construction attempt.
    #[must_use]
    pub fn is_same_failure(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cause, &other.cause)
    }
}

// ---------------------------------------------------------------------------
// ScopeError
// ---------------------------------------------------------------------------

/// Failure to open a request scope from a tenant's root container.
#[derive(Debug, thiserror::Error)]
#[error("could not open request scope for tenant {tenant}: {source}")]
pub struct ScopeError {
    tenant: TenantIdentity,
    #[source]
    source: ContainerError,
}

impl ScopeError {
    #[must_use]
    pub fn new(tenant: TenantIdentity, source: ContainerError) -> Self {
        Self { tenant, source }
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantIdentity {
        &self.tenant
    }

    #[must_use]
    pub fn container_error(&self) -> &ContainerError {
        &self.source
    }
}

// ---------------------------------------------------------------------------
// PipelineBuildError
// ---------------------------------------------------------------------------

/// Failure to build a tenant's pipeline. Cached until invalidation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineBuildError {
    #[error("pipeline build for tenant {tenant} failed: {cause:#}")]
    Failed {
        tenant: TenantIdentity,
        cause: Arc<anyhow::Error>,
    },
    #[error("pipeline build for tenant {tenant} timed out after {timeout_ms}ms")]
    TimedOut {
        tenant: TenantIdentity,
        timeout_ms: u64,
    },
    #[error("pipeline build for tenant {tenant} could not open a scope: {reason}")]
    Scope {
        tenant: TenantIdentity,
        reason: String,
    },
    #[error("pipeline build for tenant {tenant} was aborted: {reason}")]
    Aborted {
        tenant: TenantIdentity,
        reason: String,
    },
}

impl PipelineBuildError {
    #[must_use]
    pub fn tenant(&self) -> &TenantIdentity {
        match self {
            Self::Failed { tenant, .. }
            | Self::TimedOut { tenant, .. }
            | Self::Scope { tenant, .. }
            | Self::Aborted { tenant, .. } => tenant,
        }
    }
}

// ---------------------------------------------------------------------------
// StepFault
// ---------------------------------------------------------------------------

/// A pipeline step faulted while handling a request.
#[derive(Debug, thiserror::Error)]
#[error("pipeline step '{step}' faulted: {source}")]
pub struct StepFault {
    step: String,
    #[source]
    source: anyhow::Error,
}

impl StepFault {
    #[must_use]
    pub fn new(step: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            step: step.into(),
            source,
        }
    }

    /// Builds a fault from a plain message.
    #[must_use]
    pub fn msg(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(step, anyhow::anyhow!(message.into()))
    }

    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Request-fatal errors surfaced by the dispatcher to the host.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Step(#[from] StepFault),
    #[error("request for tenant {tenant} was cancelled")]
    Cancelled { tenant: TenantIdentity },
}
