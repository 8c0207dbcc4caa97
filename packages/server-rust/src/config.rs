//! Configuration types for the tenancy runtime.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use http::header::HeaderName;
use http::StatusCode;
use serde::Deserialize;
use tenancy_core::{TenantId, TenantIdentity, DEFAULT_PARTITION_DIR};

use crate::hosting::TenantHostingEnvironment;
use crate::tenant::{
    ChainedTenantResolver, HeaderTenantResolver, HostTenantResolver, TenantSettings,
    TenantSettingsStore, DEFAULT_TENANT_HEADER,
};

/// Top-level tenancy configuration.
///
/// Loadable from JSON; every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TenancyConfig {
    /// Static tenant table.
    pub tenants: Vec<TenantConfig>,
    /// Header carrying a tenant id. `None` disables header resolution.
    pub tenant_header: Option<String>,
    /// Base of the content-root partitions. `None` disables file hosting.
    pub content_root: Option<PathBuf>,
    /// Base of the web-root partitions. Defaults to `<content_root>/wwwroot`.
    pub web_root: Option<PathBuf>,
    /// Directory under each root holding the per-tenant partitions.
    pub partition_dir: String,
    /// Status of the response served when a tenant failed to initialize.
    pub degraded_status: u16,
    /// Upper bound on one pipeline build.
    pub pipeline_build_timeout_ms: u64,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            tenants: Vec::new(),
            tenant_header: Some(DEFAULT_TENANT_HEADER.to_string()),
            content_root: None,
            web_root: None,
            partition_dir: DEFAULT_PARTITION_DIR.to_string(),
            degraded_status: 503,
            pipeline_build_timeout_ms: 30_000,
        }
    }
}

/// One entry of the static tenant table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    pub id: TenantId,
    pub name: String,
    /// Hosts (without port) routed to this tenant.
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub settings: TenantSettings,
}

impl TenantConfig {
    #[must_use]
    pub fn identity(&self) -> TenantIdentity {
        TenantIdentity::new(self.id, self.name.clone())
    }
}

impl TenancyConfig {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed JSON, unknown fields, or an invalid
    /// tenant header name or degraded status.
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid tenancy configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values serde cannot check.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(header) = &self.tenant_header {
            HeaderName::try_from(header.as_str())
                .with_context(|| format!("invalid tenant_header {header:?}"))?;
        }
        StatusCode::from_u16(self.degraded_status)
            .with_context(|| format!("invalid degraded_status {}", self.degraded_status))?;
        Ok(())
    }

    #[must_use]
    pub fn identities(&self) -> Vec<TenantIdentity> {
        self.tenants.iter().map(TenantConfig::identity).collect()
    }

    #[must_use]
    pub fn pipeline_build_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_build_timeout_ms)
    }

    #[must_use]
    pub fn degraded_status(&self) -> StatusCode {
        StatusCode::from_u16(self.degraded_status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
    }

    /// Resolver for the static tenant table: header first (when enabled),
    /// then host.
    #[must_use]
    pub fn resolver(&self) -> ChainedTenantResolver {
        let mut hosts = HostTenantResolver::new();
        for tenant in &self.tenants {
            for host in &tenant.hosts {
                hosts.insert(host, tenant.identity());
            }
        }

        let mut chain = ChainedTenantResolver::new();
        if let Some(header) = self
            .tenant_header
            .as_deref()
            .and_then(|name| HeaderName::try_from(name).ok())
        {
            let header_resolver = self
                .tenants
                .iter()
                .fold(HeaderTenantResolver::new(header), |resolver, tenant| {
                    resolver.with_tenant(tenant.identity())
                });
            chain = chain.with(header_resolver);
        }
        chain.with(hosts)
    }

    #[must_use]
    pub fn settings_store(&self) -> TenantSettingsStore {
        TenantSettingsStore::from_settings(
            self.tenants
                .iter()
                .map(|tenant| (tenant.id, tenant.settings.clone())),
        )
    }

    /// Physical hosting environment, when a content root is configured.
    #[must_use]
    pub fn hosting_environment(&self) -> Option<TenantHostingEnvironment> {
        let content_root = self.content_root.clone()?;
        let web_root = self
            .web_root
            .clone()
            .unwrap_or_else(|| content_root.join("wwwroot"));
        Some(TenantHostingEnvironment::physical(
            content_root,
            web_root,
            &self.partition_dir,
        ))
    }
}
