//! Tenant resolution from request metadata.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderName, HOST};
use http::request::Parts;
use tenancy_core::{TenantId, TenantIdentity};

use crate::error::ResolutionError;

/// Header carrying a tenant id when none is configured.
pub const DEFAULT_TENANT_HEADER: &str = "x-tenant-id";

/// Maps a request to the tenant it belongs to.
///
/// Returning the null tenant is a valid outcome, not an error.
#[async_trait]
pub trait TenantResolver: Send + Sync + 'static {
    async fn resolve(&self, parts: &Parts) -> Result<TenantIdentity, ResolutionError>;
}

// ---------------------------------------------------------------------------
// HostTenantResolver
// ---------------------------------------------------------------------------

/// Resolves by request host through a static host table.
///
/// The URI authority wins over the `Host` header. Hosts are compared
/// case-insensitively and without port.
#[derive(Debug, Clone, Default)]
pub struct HostTenantResolver {
    hosts: HashMap<String, TenantIdentity>,
}

impl HostTenantResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_host(mut self, host: &str, identity: TenantIdentity) -> Self {
        self.insert(host, identity);
        self
    }

    pub fn insert(&mut self, host: &str, identity: TenantIdentity) {
        self.hosts.insert(normalize_host(host), identity);
    }

    fn request_host(parts: &Parts) -> Option<String> {
        if let Some(authority) = parts.uri.authority() {
            return Some(normalize_host(authority.host()));
        }
        parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(normalize_host)
    }
}

#[async_trait]
impl TenantResolver for HostTenantResolver {
    async fn resolve(&self, parts: &Parts) -> Result<TenantIdentity, ResolutionError> {
        Ok(Self::request_host(parts)
            .and_then(|host| self.hosts.get(&host).cloned())
            .unwrap_or_default())
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        // Leave bracketed IPv6 literals without a port alone.
        Some((name, port)) if !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    without_port.to_ascii_lowercase()
}

// ---------------------------------------------------------------------------
// HeaderTenantResolver
// ---------------------------------------------------------------------------

/// Resolves by a tenant id carried in a request header.
///
/// Ids that are not in the known tenant table resolve to the null tenant.
/// A header value that is not a valid id is a [`ResolutionError`].
#[derive(Debug, Clone)]
pub struct HeaderTenantResolver {
    header: HeaderName,
    tenants: HashMap<TenantId, TenantIdentity>,
}

impl HeaderTenantResolver {
    #[must_use]
    pub fn new(header: HeaderName) -> Self {
        Self {
            header,
            tenants: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, identity: TenantIdentity) -> Self {
        self.tenants.insert(identity.id(), identity);
        self
    }

    #[must_use]
    pub fn header(&self) -> &HeaderName {
        &self.header
    }
}

impl Default for HeaderTenantResolver {
    fn default() -> Self {
        Self::new(HeaderName::from_static(DEFAULT_TENANT_HEADER))
    }
}

#[async_trait]
impl TenantResolver for HeaderTenantResolver {
    async fn resolve(&self, parts: &Parts) -> Result<TenantIdentity, ResolutionError> {
        let Some(value) = parts.headers.get(&self.header) else {
            return Ok(TenantIdentity::null());
        };
        let invalid = || ResolutionError::InvalidHeader {
            header: self.header.to_string(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        };
        let id: TenantId = value
            .to_str()
            .map_err(|_| invalid())?
            .parse()
            .map_err(|_| invalid())?;
        Ok(self.tenants.get(&id).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// ChainedTenantResolver
// ---------------------------------------------------------------------------

/// Tries resolvers in order; the first non-null tenant wins.
///
/// If every resolver yields the null tenant and at least one failed, the
/// first failure is returned.
#[derive(Clone, Default)]
pub struct ChainedTenantResolver {
    resolvers: Vec<Arc<dyn TenantResolver>>,
}

impl ChainedTenantResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, resolver: impl TenantResolver) -> Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

#[async_trait]
impl TenantResolver for ChainedTenantResolver {
    async fn resolve(&self, parts: &Parts) -> Result<TenantIdentity, ResolutionError> {
        let mut first_error = None;
        for resolver in &self.resolvers {
            match resolver.resolve(parts).await {
                Ok(identity) if !identity.is_null() => return Ok(identity),
                Ok(_) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or_else(|| Ok(TenantIdentity::null()), Err)
    }
}

impl std::fmt::Debug for ChainedTenantResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedTenantResolver")
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// NullTenantResolver
// ---------------------------------------------------------------------------

/// Resolves every request to the null tenant.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTenantResolver;

#[async_trait]
impl TenantResolver for NullTenantResolver {
    async fn resolve(&self, _parts: &Parts) -> Result<TenantIdentity, ResolutionError> {
        Ok(TenantIdentity::null())
    }
}
