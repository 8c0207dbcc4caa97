//! Tower integration: runs every request through the [`RequestDispatcher`]
//! before the wrapped service.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use tenancy_core::TenantIdentity;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};

use super::dispatcher::{DispatchOutcome, RequestDispatcher};
use crate::error::DispatchError;
use crate::pipeline::response;

/// Request extension carrying the tenant a passed-through request was
/// resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTenant(pub TenantIdentity);

// ---------------------------------------------------------------------------
// TenantLayer
// ---------------------------------------------------------------------------

/// Tower layer that dispatches requests through their tenant's pipeline.
///
/// Handled requests are answered by the pipeline. Passed-through requests
/// reach the inner service with a [`ResolvedTenant`] extension.
pub struct TenantLayer<T> {
    dispatcher: Arc<RequestDispatcher<T>>,
    cancellation: CancellationToken,
}

impl<T> TenantLayer<T> {
    #[must_use]
    pub fn new(dispatcher: Arc<RequestDispatcher<T>>) -> Self {
        Self {
            dispatcher,
            cancellation: CancellationToken::new(),
        }
    }

    /// Cancels in-flight pipeline invocations when `parent` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancellation = parent.child_token();
        self
    }
}

impl<T> Clone for TenantLayer<T> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<S, T> Layer<S> for TenantLayer<T> {
    type Service = TenantService<S, T>;

    fn layer(&self, inner: S) -> Self::Service {
        TenantService {
            inner,
            dispatcher: Arc::clone(&self.dispatcher),
            cancellation: self.cancellation.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// TenantService
// ---------------------------------------------------------------------------

/// Service produced by [`TenantLayer`].
pub struct TenantService<S, T> {
    inner: S,
    dispatcher: Arc<RequestDispatcher<T>>,
    cancellation: CancellationToken,
}

impl<S: Clone, T> Clone for TenantService<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<S, T, ReqBody, ResBody> Service<Request<ReqBody>> for TenantService<S, T>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    T: Send + Sync + 'static,
    ReqBody: Send + 'static,
    ResBody: From<Bytes> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // The ready service is the one that must handle this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let dispatcher = Arc::clone(&self.dispatcher);
        let cancellation = self.cancellation.child_token();

        Box::pin(async move {
            let (parts, body) = request.into_parts();
            match dispatcher.dispatch(parts, cancellation).await {
                Ok(DispatchOutcome::Handled(response)) => Ok(response.map(ResBody::from)),
                Ok(DispatchOutcome::Passthrough { parts, tenant }) => {
                    let mut request = Request::from_parts(parts, body);
                    request.extensions_mut().insert(ResolvedTenant(tenant));
                    inner.call(request).await
                }
                Err(err) => Ok(error_response(&err).map(ResBody::from)),
            }
        })
    }
}

fn error_response(err: &DispatchError) -> crate::pipeline::Response {
    let (status, code) = match err {
        DispatchError::Cancelled { .. } => (StatusCode::REQUEST_TIMEOUT, "request_cancelled"),
        DispatchError::Scope(_) => (StatusCode::INTERNAL_SERVER_ERROR, "scope_unavailable"),
        DispatchError::Step(_) => (StatusCode::INTERNAL_SERVER_ERROR, "pipeline_fault"),
    };
    let body = serde_json::json!({ "error": code, "detail": err.to_string() });
    response(status, "application/json", body.to_string())
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use tenancy_core::TenantId;
    use tower::ServiceExt;

    use super::*;
    use crate::container::Container;
    use crate::dispatch::DispatcherBuilder;
    use crate::error::StepFault;
    use crate::pipeline::{FnPipelineBuilder, FnStep, Pipeline, RequestContext, WelcomePageStep};
    use crate::tenant::{FnTenantFactory, HeaderTenantResolver};

    fn foo() -> TenantIdentity {
        TenantIdentity::new(TenantId::new_v4(), "Foo")
    }

    fn layer(tenant: &TenantIdentity) -> TenantLayer<()> {
        let dispatcher = DispatcherBuilder::new(FnTenantFactory::new(|_: TenantIdentity| async {
            anyhow::Ok(())
        }))
        .resolver(HeaderTenantResolver::default().with_tenant(tenant.clone()))
        .pipeline(FnPipelineBuilder::new(
            |_: &TenantIdentity, _: &dyn Container| -> anyhow::Result<Pipeline> {
                Ok(Pipeline::builder()
                    .step(WelcomePageStep::new("/"))
                    .step(FnStep::new("broken", |ctx: &mut RequestContext| {
                        if ctx.path() == "/broken" {
                            Err(StepFault::msg("broken", "handler crashed"))
                        } else {
                            Ok(crate::pipeline::StepOutcome::Passthrough)
                        }
                    }))
                    .build())
            },
        ))
        .build();
        TenantLayer::new(Arc::new(dispatcher))
    }

    /// Echoes the resolved tenant's name.
    async fn inner(request: Request<String>) -> Result<Response<Bytes>, Infallible> {
        let name = request
            .extensions()
            .get::<ResolvedTenant>()
            .map_or_else(|| "missing".to_string(), |t| t.0.name().to_string());
        Ok(Response::new(Bytes::from(name)))
    }

    fn request(tenant: &TenantIdentity, path: &str) -> Request<String> {
        Request::builder()
            .uri(path)
            .header("x-tenant-id", tenant.id().to_string())
            .body(String::new())
            .unwrap()
    }

    #[tokio::test]
    async fn handled_requests_skip_the_inner_service() {
        let foo = foo();
        let service = layer(&foo).layer(tower::service_fn(inner));

        let response = service.oneshot(request(&foo, "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(std::str::from_utf8(response.body()).unwrap().contains("Welcome"));
    }

    #[tokio::test]
    async fn passthrough_carries_resolved_tenant() {
        let foo = foo();
        let service = layer(&foo).layer(tower::service_fn(inner));

        let response = service.oneshot(request(&foo, "/api/orders")).await.unwrap();
        assert_eq!(&response.body()[..], b"Foo");
    }

    #[tokio::test]
    async fn step_fault_becomes_server_error() {
        let foo = foo();
        let service = layer(&foo).layer(tower::service_fn(inner));

        let response = service.oneshot(request(&foo, "/broken")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(json["error"], "pipeline_fault");
    }

    #[test]
    fn cancelled_requests_map_to_request_timeout() {
        let response = error_response(&DispatchError::Cancelled { tenant: foo() });
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
