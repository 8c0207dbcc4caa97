//! Sample multi-tenant host.
//!
//! Serves two demo tenants, `Foo` (`foo.localhost`) and `Bar`
//! (`bar.localhost`), unless a JSON tenancy config is given. `Foo` has the
//! welcome page; `Bar` loads the sample routed and shared modules. Both end
//! their pipeline with the tenant info page, which reports the shell, the
//! tenant-scoped service, and the tenant's `/Info.txt` content file. The
//! null tenant has no pipeline steps and falls through to a plain axum
//! handler.
//!
//! ```text
//! curl -H 'Host: foo.localhost' http://127.0.0.1:5000/
//! curl -H 'Host: foo.localhost' http://127.0.0.1:5000/anything
//! curl -H 'Host: bar.localhost' http://127.0.0.1:5000/routed
//! curl -H 'Host: bar.localhost' http://127.0.0.1:5000/shared
//! curl http://127.0.0.1:5000/
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{Extension, Router};
use clap::Parser;
use futures_util::future::BoxFuture;
use http::StatusCode;
use tenancy_core::TenantIdentity;
use tenancy_server::container::{Container, ContainerExt};
use tenancy_server::error::StepFault;
use tenancy_server::hosting::TenantFileSystem;
use tenancy_server::pipeline::{
    response, ChainBuilder, FnPipelineBuilder, FnStep, Pipeline, RequestContext, Response,
    StaticFileStep, StepOutcome, TerminalStep, WelcomePageStep,
};
use tenancy_server::tenant::{
    CurrentTenant, FnTenantFactory, ModuleCatalog, ShellInfo, TenantModule, TenantSettings,
};
use tenancy_server::{
    build_http_layers, DispatcherBuilder, RequestDispatcher, ResolvedTenant, TenancyConfig,
    TenantConfig, TenantLayer,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const FOO_ID: &str = "3f2c1d4e-8b6a-4c1f-9e2d-7a5b6c8d9e01";
const BAR_ID: &str = "9a8b7c6d-5e4f-4a3b-8c2d-1e0f9a8b7c6d";

#[derive(Parser)]
#[command(name = "sample-host", about = "Multi-tenant sample host")]
struct Cli {
    #[arg(long, env = "TENANCY_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "TENANCY_PORT", default_value_t = 5000)]
    port: u16,
    /// JSON tenancy configuration. Defaults to the Foo/Bar demo tenants.
    #[arg(short, long, env = "TENANCY_CONFIG")]
    config: Option<PathBuf>,
    /// Content root used when the configuration names none.
    #[arg(
        long,
        env = "TENANCY_CONTENT_ROOT",
        default_value = concat!(env!("CARGO_MANIFEST_DIR"), "/sample_content")
    )]
    content_root: PathBuf,
    /// Log as JSON lines.
    #[arg(long)]
    json_logs: bool,
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,
}

/// Host data constructed per tenant.
#[derive(Debug)]
struct SampleTenant {
    display_name: String,
}

/// Tenant-scoped service registered by the configurator: one instance per
/// tenant shell.
#[derive(Debug)]
struct SomeTenantService {
    id: Uuid,
    tenant_name: String,
    files: Option<TenantFileSystem>,
}

impl SomeTenantService {
    /// Text of a file in the tenant's content root.
    async fn content_file(&self, path: &str) -> Option<String> {
        let files = self.files.as_ref()?;
        match files.content_root.resolve(path).await {
            Ok(content) => content.and_then(|content| content.as_str().map(str::to_string)),
            Err(err) => {
                warn!(path, error = %err, "content file unreadable");
                None
            }
        }
    }
}

/// Answers `/routed` for the tenants that load it.
struct SampleRoutedModule;

impl TenantModule for SampleRoutedModule {
    fn name(&self) -> &str {
        "sample_routed"
    }

    fn configure_pipeline(
        &self,
        tenant: &TenantIdentity,
        _services: &dyn Container,
        chain: ChainBuilder,
    ) -> anyhow::Result<ChainBuilder> {
        let body = format!("routed module of tenant {}\n", tenant.name());
        Ok(chain.step(FnStep::new("sample_routed", move |ctx: &mut RequestContext| {
            if ctx.path() == "/routed" {
                Ok(StepOutcome::Handled(response(
                    StatusCode::OK,
                    "text/plain; charset=utf-8",
                    body.clone(),
                )))
            } else {
                Ok(StepOutcome::Passthrough)
            }
        })))
    }
}

/// Service shared by every request of a tenant that loads the shared module.
#[derive(Debug)]
struct SharedModuleService {
    id: Uuid,
}

/// Registers [`SharedModuleService`] and answers `/shared` with its id.
struct SampleSharedModule;

impl TenantModule for SampleSharedModule {
    fn name(&self) -> &str {
        "sample_shared"
    }

    fn configure_services(
        &self,
        _tenant: &TenantIdentity,
        services: &dyn Container,
    ) -> anyhow::Result<()> {
        services.add_instance(Arc::new(SharedModuleService { id: Uuid::new_v4() }))?;
        Ok(())
    }

    fn configure_pipeline(
        &self,
        _tenant: &TenantIdentity,
        _services: &dyn Container,
        chain: ChainBuilder,
    ) -> anyhow::Result<ChainBuilder> {
        Ok(chain.step(FnStep::new("sample_shared", |ctx: &mut RequestContext| {
            if ctx.path() != "/shared" {
                return Ok(StepOutcome::Passthrough);
            }
            let shared = ctx
                .services()
                .get_required_service::<SharedModuleService>()
                .map_err(|err| StepFault::new("sample_shared", err.into()))?;
            let body = serde_json::json!({ "SharedServiceId": shared.id.to_string() });
            Ok(StepOutcome::Handled(response(
                StatusCode::OK,
                "application/json",
                body.to_string(),
            )))
        })))
    }
}

fn modules() -> ModuleCatalog {
    ModuleCatalog::new()
        .with_module(SampleRoutedModule)
        .with_module(SampleSharedModule)
}

fn demo_config() -> anyhow::Result<TenancyConfig> {
    let foo = TenantConfig {
        id: FOO_ID.parse()?,
        name: "Foo".to_string(),
        hosts: vec!["foo.localhost".to_string()],
        settings: TenantSettings::default()
            .with_feature("welcome_page")
            .with_feature("display_info"),
    };
    let bar = TenantConfig {
        id: BAR_ID.parse()?,
        name: "Bar".to_string(),
        hosts: vec!["bar.localhost".to_string()],
        settings: TenantSettings::default()
            .with_feature("display_info")
            .with_module("sample_routed")
            .with_module("sample_shared"),
    };
    Ok(TenancyConfig {
        tenants: vec![foo, bar],
        ..TenancyConfig::default()
    })
}

fn load_config(path: Option<&PathBuf>, content_root: &Path) -> anyhow::Result<TenancyConfig> {
    let mut config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            TenancyConfig::from_json_str(&json)?
        }
        None => demo_config()?,
    };
    if config.content_root.is_none() {
        config.content_root = Some(content_root.to_path_buf());
    }
    Ok(config)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sample_host=info,tenancy_server=info,tower_http=info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn display_info(ctx: &RequestContext) -> BoxFuture<'static, Result<Response, StepFault>> {
    let services = ctx.services();
    let shell = services.get_required_service::<ShellInfo>();
    let current = services.get_required_service::<CurrentTenant<SampleTenant>>();
    let service = services.get_service::<SomeTenantService>();
    Box::pin(async move {
        let fault = |err: tenancy_server::ContainerError| StepFault::new("display_info", err.into());
        let shell = shell.map_err(fault)?;
        let current = current.map_err(fault)?;
        let service = service.map_err(fault)?;

        let tenant_name = if current.identity().is_null() {
            "{NULL TENANT}".to_string()
        } else {
            current.tenant().display_name.clone()
        };
        let content_file = match &service {
            Some(service) => service.content_file("/Info.txt").await,
            None => None,
        };
        let body = serde_json::json!({
            "TenantShellId": shell.id.to_string(),
            "TenantName": tenant_name,
            "TenantScopedServiceId": service.as_ref().map(|s| s.id.to_string()),
            "InjectedTenantName": service
                .as_ref()
                .map_or_else(|| "{NULL SERVICE}".to_string(), |s| s.tenant_name.clone()),
            "TenantContentFile": content_file,
        });
        Ok(response(StatusCode::OK, "application/json", body.to_string()))
    })
}

async fn fallback(Extension(tenant): Extension<ResolvedTenant>) -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("nothing here for tenant {}\n", tenant.0),
    )
}

fn build_dispatcher(config: TenancyConfig) -> RequestDispatcher<SampleTenant> {
    DispatcherBuilder::new(FnTenantFactory::new(|identity: TenantIdentity| async move {
        anyhow::Ok(SampleTenant {
            display_name: if identity.is_null() {
                "(none)".to_string()
            } else {
                identity.name().to_string()
            },
        })
    }))
    .configure(
        |current: &CurrentTenant<SampleTenant>, services: &dyn Container| -> anyhow::Result<()> {
            let files = services.get_service::<TenantFileSystem>()?;
            services.add_instance(Arc::new(SomeTenantService {
                id: Uuid::new_v4(),
                tenant_name: current.tenant().display_name.clone(),
                files: files.map(|files| (*files).clone()),
            }))?;
            Ok(())
        },
    )
    .modules(modules())
    .pipeline(FnPipelineBuilder::new(
        |identity: &TenantIdentity, services: &dyn Container| -> anyhow::Result<Pipeline> {
            let settings = services.get_required_service::<TenantSettings>()?;
            Ok(Pipeline::builder()
                .use_modules(identity, services)?
                .step_if(settings.has_feature("welcome_page"), WelcomePageStep::new("/"))
                .step(StaticFileStep::new())
                .step_if(
                    settings.has_feature("display_info"),
                    TerminalStep::new("display_info", display_info),
                )
                .build())
        },
    ))
    .config(config)
    .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(cli.config.as_ref(), &cli.content_root)?;
    info!(tenants = config.tenants.len(), "tenancy configuration loaded");

    let dispatcher = Arc::new(build_dispatcher(config));

    let shutdown = CancellationToken::new();
    let app = Router::new()
        .fallback(fallback)
        .layer(TenantLayer::new(Arc::clone(&dispatcher)).with_cancellation(&shutdown))
        .layer(build_http_layers(Duration::from_secs(cli.request_timeout_secs)));

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            signal.cancel();
        })
        .await?;

    let disposed = dispatcher.shutdown().await;
    info!(disposed, "tenant shells disposed");
    Ok(())
}
