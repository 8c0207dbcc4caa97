//! Tenancy Server: per-tenant shells, request-scoped containers, tenant
//! pipelines, and the tower layer that ties them to an HTTP host.

pub mod config;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod hosting;
pub mod pipeline;
pub mod tenant;

pub use config::{TenancyConfig, TenantConfig};
pub use container::{Container, ContainerEvents, ContainerExt, ServiceContainer, ServiceLifetime};
pub use dispatch::{
    build_http_layers, DispatchOutcome, DispatcherBuilder, RequestDispatcher, ResolvedTenant,
    TenantLayer,
};
pub use error::{
    ContainerError, DispatchError, InitializationError, PipelineBuildError, ResolutionError,
    ScopeError, StepFault,
};
pub use hosting::{TenantFileSystem, TenantHostingEnvironment};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineStep, RequestContext, StepOutcome};
pub use tenant::{
    CurrentTenant, ModuleCatalog, ShellInfo, TenantContainerScope, TenantFactory, TenantModule,
    TenantResolver, TenantSettings, TenantShell, TenantShellStore,
};
