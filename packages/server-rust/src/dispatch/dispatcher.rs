//! Per-request orchestration: resolve tenant, acquire shell, open scope,
//! acquire pipeline, invoke, dispose.

use std::sync::Arc;
use std::time::Instant;

use http::header::{HeaderValue, RETRY_AFTER};
use http::request::Parts;
use http::StatusCode;
use metrics::counter;
use tenancy_core::{TenantId, TenantIdentity};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::error::{DispatchError, InitializationError};
use crate::pipeline::{
    response, Pipeline, PipelineBuilder, RequestContext, Response, StepOutcome,
    TenantPipelineCache,
};
use crate::tenant::{
    RequestInfo, SettingsTable, ShellFactory, TenantContainerScope, TenantResolver,
    TenantSettingsStore, TenantShellStore,
};

/// Header a request id is taken from when present.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// What the dispatcher did with a request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A step (or the degraded path) produced the response.
    Handled(Response),
    /// No step handled the request; it continues to the outer tier.
    Passthrough {
        parts: Parts,
        tenant: TenantIdentity,
    },
}

/// Phases of one dispatched request, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchPhase {
    ResolveTenant,
    AcquireShell,
    OpenScope,
    AcquirePipeline,
    Invoke,
    Dispose,
}

impl DispatchPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::ResolveTenant => "resolve_tenant",
            Self::AcquireShell => "acquire_shell",
            Self::OpenScope => "open_scope",
            Self::AcquirePipeline => "acquire_pipeline",
            Self::Invoke => "invoke",
            Self::Dispose => "dispose",
        }
    }

    fn enter(self) {
        debug!(phase = self.as_str(), "dispatch phase");
    }
}

/// Runs requests through their tenant's pipeline.
///
/// Failure handling per phase:
/// - tenant resolution errors fall back to the null tenant
/// - a tenant that failed to initialize gets the degraded response; the
///   pipeline is not invoked
/// - a failed pipeline build falls back to the empty chain
/// - scope errors, step faults, and cancellation are returned as
///   [`DispatchError`]
///
/// The request scope is disposed on every path, including when the
/// returned future is dropped.
pub struct RequestDispatcher<T> {
    resolver: Arc<dyn TenantResolver>,
    shell_factory: Arc<ShellFactory<T>>,
    shells: Arc<TenantShellStore<T>>,
    scopes: TenantContainerScope,
    pipelines: Arc<TenantPipelineCache>,
    pipeline_builder: Arc<dyn PipelineBuilder>,
    settings: Option<Arc<TenantSettingsStore>>,
    degraded_status: StatusCode,
}

impl<T: Send + Sync + 'static> RequestDispatcher<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        resolver: Arc<dyn TenantResolver>,
        shell_factory: Arc<ShellFactory<T>>,
        shells: Arc<TenantShellStore<T>>,
        scopes: TenantContainerScope,
        pipelines: Arc<TenantPipelineCache>,
        pipeline_builder: Arc<dyn PipelineBuilder>,
        settings: Option<Arc<TenantSettingsStore>>,
        degraded_status: StatusCode,
    ) -> Self {
        Self {
            resolver,
            shell_factory,
            shells,
            scopes,
            pipelines,
            pipeline_builder,
            settings,
            degraded_status,
        }
    }

    /// Dispatches one request.
    ///
    /// `cancellation` aborts the pipeline invocation; the scope is still
    /// disposed.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] for request-fatal failures: the scope could
    /// not be opened, a step faulted, or the request was cancelled.
    pub async fn dispatch(
        &self,
        parts: Parts,
        cancellation: CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let request_id = request_id_of(&parts);
        let span = info_span!(
            "tenant_request",
            request_id = %request_id,
            method = %parts.method,
            path = parts.uri.path(),
            tenant = tracing::field::Empty,
            outcome = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        let start = Instant::now();
        let result = self
            .run(parts, request_id, cancellation)
            .instrument(span.clone())
            .await;

        let outcome = match &result {
            Ok((_, label)) => *label,
            Err(DispatchError::Cancelled { .. }) => "cancelled",
            Err(_) => "error",
        };
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        span.record("outcome", outcome);
        span.record("duration_ms", duration_ms);
        counter!("tenancy_requests_total", "outcome" => outcome).increment(1);

        result.map(|(outcome, _)| outcome)
    }

    async fn run(
        &self,
        parts: Parts,
        request_id: String,
        cancellation: CancellationToken,
    ) -> Result<(DispatchOutcome, &'static str), DispatchError> {
        DispatchPhase::ResolveTenant.enter();
        let identity = match self.resolver.resolve(&parts).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(error = %err, "tenant resolution failed, using the null tenant");
                TenantIdentity::null()
            }
        };
        Span::current().record("tenant", tracing::field::display(&identity));

        DispatchPhase::AcquireShell.enter();
        let factory = Arc::clone(&self.shell_factory);
        let shell = match self
            .shells
            .get_or_create(&identity, move |identity| async move {
                factory.build(&identity).await
            })
            .await
        {
            Ok(shell) => shell,
            Err(err) => {
                warn!(
                    error = %err,
                    cause = %format!("{:#}", err.cause()),
                    "tenant unavailable, serving degraded response"
                );
                return Ok((
                    DispatchOutcome::Handled(self.degraded_response(&err)),
                    "degraded",
                ));
            }
        };

        DispatchPhase::OpenScope.enter();
        let info = RequestInfo {
            request_id: request_id.clone(),
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
        };
        let scope = self.scopes.open_scope(&shell, Some(info))?;

        DispatchPhase::AcquirePipeline.enter();
        let pipeline = match self
            .pipelines
            .get_or_build(&shell, Arc::clone(&self.pipeline_builder))
            .await
        {
            Ok(entry) => entry.pipeline.clone(),
            Err(err) => {
                error!(error = %err, "tenant pipeline unavailable, using the empty chain");
                Pipeline::empty()
            }
        };

        DispatchPhase::Invoke.enter();
        let mut ctx = RequestContext::new(
            parts,
            request_id,
            identity.clone(),
            Arc::clone(scope.container()),
            cancellation.clone(),
        );
        let invoked = tokio::select! {
            biased;
            () = cancellation.cancelled() => None,
            result = pipeline.invoke(&mut ctx) => Some(result),
        };

        DispatchPhase::Dispose.enter();
        drop(scope);

        match invoked {
            None => {
                info!("request cancelled during pipeline invocation");
                Err(DispatchError::Cancelled { tenant: identity })
            }
            Some(Err(fault)) => {
                error!(step = fault.step(), error = %fault, "pipeline step faulted");
                Err(fault.into())
            }
            Some(Ok(StepOutcome::Handled(response))) => {
                Ok((DispatchOutcome::Handled(response), "handled"))
            }
            Some(Ok(StepOutcome::Passthrough)) => Ok((
                DispatchOutcome::Passthrough {
                    parts: ctx.into_parts(),
                    tenant: identity,
                },
                "passthrough",
            )),
        }
    }

    /// Problem response for a tenant whose initialization failed. The cause
    /// is logged, never sent to the client.
    fn degraded_response(&self, err: &InitializationError) -> Response {
        let tenant = err.tenant();
        let body = serde_json::json!({
            "error": "tenant_unavailable",
            "tenant": if tenant.is_null() { None } else { Some(tenant.name()) },
            "tenant_id": tenant.id().to_string(),
            "detail": "tenant initialization failed",
        });
        let mut response = response(self.degraded_status, "application/json", body.to_string());
        if self.degraded_status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("30"));
        }
        response
    }

    // -- admin operations ---------------------------------------------------

    /// Invalidates the tenant's pipeline and evicts its shell, disposing the
    /// root container. The next request rebuilds both.
    pub async fn evict_tenant(&self, identity: &TenantIdentity) -> bool {
        self.pipelines.invalidate(identity);
        let evicted = self.shells.evict(identity).await;
        // Builds that finished while the shell was being evicted.
        self.pipelines.invalidate(identity);
        evicted
    }

    /// Clears a cached initialization failure (or a Ready shell) so the next
    /// request re-runs the tenant factory.
    pub fn reset_tenant(&self, identity: &TenantIdentity) -> bool {
        self.pipelines.invalidate(identity);
        let reset = self.shells.reset(identity);
        self.pipelines.invalidate(identity);
        reset
    }

    pub fn invalidate_pipeline(&self, identity: &TenantIdentity) -> bool {
        self.pipelines.invalidate(identity)
    }

    /// Swaps in new tenant settings and invalidates the pipelines of the
    /// tenants whose settings changed. Returns those tenants.
    pub fn reload_settings(&self, table: SettingsTable) -> Vec<TenantId> {
        let Some(settings) = &self.settings else {
            warn!("settings reload ignored, no settings store configured");
            return Vec::new();
        };
        let changed = settings.replace(table);
        for tenant in &changed {
            self.pipelines.invalidate_tenant_id(*tenant);
        }
        info!(changed = changed.len(), "tenant settings reloaded");
        changed
    }

    /// Drops every cached pipeline and disposes every tenant root.
    /// Returns the number of shells disposed.
    pub async fn shutdown(&self) -> usize {
        self.pipelines.invalidate_all();
        self.shells.shutdown().await
    }

    #[must_use]
    pub fn shells(&self) -> &TenantShellStore<T> {
        &self.shells
    }

    #[must_use]
    pub fn pipelines(&self) -> &TenantPipelineCache {
        &self.pipelines
    }

    #[must_use]
    pub fn scopes(&self) -> &TenantContainerScope {
        &self.scopes
    }
}

impl<T> std::fmt::Debug for RequestDispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("shells", &self.shells)
            .field("pipelines", &self.pipelines)
            .field("degraded_status", &self.degraded_status)
            .finish_non_exhaustive()
    }
}

fn request_id_of(parts: &Parts) -> String {
    parts
        .headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string)
}
