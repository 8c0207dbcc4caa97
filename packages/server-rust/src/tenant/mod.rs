//! Tenant lifecycle: resolution, shell construction and storage, request scopes.
//!
//! - [`resolver`]: Request to [`TenantIdentity`](tenancy_core::TenantIdentity) mapping
//! - [`factory`]: Tenant data factory, container configurators, shell factory
//! - [`module`]: Optional per-tenant modules selected by settings
//! - [`store`]: Single-flight store of tenant shells
//! - [`scope`]: Request-scoped child containers
//! - [`settings`]: Per-tenant settings behind an atomically swappable table
//! - [`single_flight`]: Per-key memoization of async constructions

pub mod factory;
pub mod module;
pub mod resolver;
pub mod scope;
pub mod settings;
pub mod shell;
pub mod single_flight;
pub mod store;

pub use factory::{ContainerConfigurator, FnTenantFactory, ShellFactory, TenantFactory};
pub use module::{LoadedModules, ModuleCatalog, TenantModule};
pub use resolver::{
    ChainedTenantResolver, HeaderTenantResolver, HostTenantResolver, NullTenantResolver,
    TenantResolver, DEFAULT_TENANT_HEADER,
};
pub use scope::{RequestInfo, ScopedContainer, TenantContainerScope};
pub use settings::{SettingsTable, TenantSettings, TenantSettingsStore};
pub use shell::{CurrentTenant, ShellInfo, ShellState, TenantShell};
pub use single_flight::{FlightState, SingleFlight};
pub use store::TenantShellStore;
