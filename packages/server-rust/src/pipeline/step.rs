//! Pipeline step capability and closure adapters.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;

use super::context::RequestContext;
use crate::error::StepFault;

/// Response produced by a step that handles the request.
pub type Response = http::Response<Bytes>;

/// Result of running one step.
#[derive(Debug)]
pub enum StepOutcome {
    /// The step produced the response; later steps do not run.
    Handled(Response),
    /// The step declined; the next step runs.
    Passthrough,
}

impl StepOutcome {
    #[must_use]
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled(_))
    }
}

/// One request-handling step of a tenant pipeline.
#[async_trait]
pub trait PipelineStep: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// A [`StepFault`] aborts the pipeline and is surfaced to the host.
    async fn invoke(&self, ctx: &mut RequestContext) -> Result<StepOutcome, StepFault>;
}

/// Builds a response with a body and content type.
#[must_use]
pub fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

// ---------------------------------------------------------------------------
// FnStep
// ---------------------------------------------------------------------------

/// Adapts a synchronous closure into a step.
pub struct FnStep<F> {
    name: String,
    f: F,
}

impl<F> FnStep<F>
where
    F: Fn(&mut RequestContext) -> Result<StepOutcome, StepFault> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> PipelineStep for FnStep<F>
where
    F: Fn(&mut RequestContext) -> Result<StepOutcome, StepFault> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &mut RequestContext) -> Result<StepOutcome, StepFault> {
        (self.f)(ctx)
    }
}

// ---------------------------------------------------------------------------
// TerminalStep
// ---------------------------------------------------------------------------

/// Adapts an async handler that always produces the response.
///
/// The handler reads what it needs from the context and returns an owned
/// future.
pub struct TerminalStep<F> {
    name: String,
    handler: F,
}

impl<F> TerminalStep<F>
where
    F: Fn(&RequestContext) -> BoxFuture<'static, Result<Response, StepFault>>
        + Send
        + Sync
        + 'static,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F> PipelineStep for TerminalStep<F>
where
    F: Fn(&RequestContext) -> BoxFuture<'static, Result<Response, StepFault>>
        + Send
        + Sync
        + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &mut RequestContext) -> Result<StepOutcome, StepFault> {
        let response = (self.handler)(&*ctx).await?;
        Ok(StepOutcome::Handled(response))
    }
}
