//! Built-in steps.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH};
use http::{Method, StatusCode};

use super::context::RequestContext;
use super::step::{response, PipelineStep, StepOutcome};
use crate::container::ContainerExt;
use crate::error::StepFault;
use crate::hosting::TenantFileSystem;

// ---------------------------------------------------------------------------
// WelcomePageStep
// ---------------------------------------------------------------------------

/// Serves a fixed welcome page at one path.
#[derive(Debug, Clone)]
pub struct WelcomePageStep {
    path: String,
}

impl WelcomePageStep {
    pub const NAME: &'static str = "welcome_page";

    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    fn render(ctx: &RequestContext) -> String {
        let tenant = if ctx.tenant().is_null() {
            "no tenant"
        } else {
            ctx.tenant().name()
        };
        format!(
            "<!DOCTYPE html><html><head><title>Welcome</title></head>\
             <body><h1>Welcome</h1><p>Tenant: {}</p></body></html>",
            escape_html(tenant)
        )
    }
}

impl Default for WelcomePageStep {
    fn default() -> Self {
        Self::new("/")
    }
}

#[async_trait]
impl PipelineStep for WelcomePageStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(&self, ctx: &mut RequestContext) -> Result<StepOutcome, StepFault> {
        if !is_read(ctx.method()) || ctx.path() != self.path {
            return Ok(StepOutcome::Passthrough);
        }
        let page = Self::render(ctx);
        Ok(StepOutcome::Handled(body_for_method(
            ctx.method(),
            response(StatusCode::OK, "text/html; charset=utf-8", page),
        )))
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

// ---------------------------------------------------------------------------
// StaticFileStep
// ---------------------------------------------------------------------------

/// Serves `GET`/`HEAD` requests from the tenant's web-root partition.
///
/// Passes through when the tenant has no [`TenantFileSystem`] or the file
/// is in neither the tenant partition nor the shared root.
#[derive(Debug, Clone)]
pub struct StaticFileStep {
    default_document: String,
}

impl StaticFileStep {
    pub const NAME: &'static str = "static_files";

    #[must_use]
    pub fn new() -> Self {
        Self {
            default_document: "index.html".to_string(),
        }
    }

    #[must_use]
    pub fn with_default_document(mut self, document: impl Into<String>) -> Self {
        self.default_document = document.into();
        self
    }
}

impl Default for StaticFileStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStep for StaticFileStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(&self, ctx: &mut RequestContext) -> Result<StepOutcome, StepFault> {
        if !is_read(ctx.method()) {
            return Ok(StepOutcome::Passthrough);
        }
        let files = ctx
            .services()
            .get_service::<TenantFileSystem>()
            .map_err(|err| StepFault::new(Self::NAME, err.into()))?;
        let Some(files) = files else {
            return Ok(StepOutcome::Passthrough);
        };

        let path = if ctx.path().ends_with('/') {
            format!("{}{}", ctx.path(), self.default_document)
        } else {
            ctx.path().to_string()
        };
        let content = files
            .web_root
            .resolve(&path)
            .await
            .map_err(|err| StepFault::new(Self::NAME, err))?;
        let Some(content) = content else {
            return Ok(StepOutcome::Passthrough);
        };

        let content_type = content_type_for(&content.path);
        Ok(StepOutcome::Handled(body_for_method(
            ctx.method(),
            response(StatusCode::OK, content_type, content.data),
        )))
    }
}

fn is_read(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// Strips the body of a `HEAD` response, keeping its length.
fn body_for_method(method: &Method, mut response: super::step::Response) -> super::step::Response {
    if method == Method::HEAD {
        let len = response.body().len();
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(len));
        *response.body_mut() = Bytes::new();
    }
    response
}

fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}
