//! Tenant pipelines: step capability, immutable chains, built-in steps, and
//! the per-tenant build cache.
//!
//! - [`step`]: `PipelineStep`, `StepOutcome`, closure adapters
//! - [`chain`]: `Pipeline` and its builder
//! - [`steps`]: Welcome page and static file steps
//! - [`cache`]: `PipelineBuilder` and `TenantPipelineCache`
//! - [`context`]: `RequestContext` seen by steps

pub mod cache;
pub mod chain;
pub mod context;
pub mod step;
pub mod steps;

pub use cache::{FnPipelineBuilder, PipelineBuilder, PipelineEntry, TenantPipelineCache};
pub use chain::{ChainBuilder, Pipeline};
pub use context::RequestContext;
pub use step::{response, FnStep, PipelineStep, Response, StepOutcome, TerminalStep};
pub use steps::{StaticFileStep, WelcomePageStep};
