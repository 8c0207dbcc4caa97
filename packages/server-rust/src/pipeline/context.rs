//! Per-request state handed to pipeline steps.

use std::sync::Arc;

use http::request::Parts;
use tenancy_core::TenantIdentity;
use tokio_util::sync::CancellationToken;

use crate::container::Container;

/// What a pipeline step sees of the request.
///
/// `services` is the request's scoped container; it becomes unusable once
/// the request ends.
pub struct RequestContext {
    parts: Parts,
    request_id: String,
    tenant: TenantIdentity,
    services: Arc<dyn Container>,
    cancellation: CancellationToken,
}

impl RequestContext {
    #[must_use]
    pub fn new(
        parts: Parts,
        request_id: String,
        tenant: TenantIdentity,
        services: Arc<dyn Container>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            parts,
            request_id,
            tenant,
            services,
            cancellation,
        }
    }

    #[must_use]
    pub fn parts(&self) -> &Parts {
        &self.parts
    }

    pub fn parts_mut(&mut self) -> &mut Parts {
        &mut self.parts
    }

    #[must_use]
    pub fn method(&self) -> &http::Method {
        &self.parts.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantIdentity {
        &self.tenant
    }

    #[must_use]
    pub fn services(&self) -> &dyn Container {
        self.services.as_ref()
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Hands the request parts back, e.g. for passthrough to the outer tier.
    #[must_use]
    pub fn into_parts(self) -> Parts {
        self.parts
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.parts.method)
            .field("uri", &self.parts.uri)
            .field("request_id", &self.request_id)
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_context(method: http::Method, path: &str) -> RequestContext {
    use crate::container::ServiceContainer;

    let parts = http::Request::builder()
        .method(method)
        .uri(path)
        .body(())
        .unwrap()
        .into_parts()
        .0;
    let services = ServiceContainer::new_root("test")
        .create_child_scope("request")
        .unwrap();
    RequestContext::new(
        parts,
        "test-request".to_string(),
        TenantIdentity::null(),
        services,
        CancellationToken::new(),
    )
}
