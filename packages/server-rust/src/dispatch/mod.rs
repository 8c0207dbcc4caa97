//! Request dispatch: the per-request state machine and its tower surface.
//!
//! - [`dispatcher`]: `RequestDispatcher` and its admin operations
//! - [`builder`]: `DispatcherBuilder`
//! - [`layer`]: `TenantLayer` / `TenantService`
//! - [`http_layers`]: Transport middleware stack

pub mod builder;
pub mod dispatcher;
pub mod http_layers;
pub mod layer;

pub use builder::DispatcherBuilder;
pub use dispatcher::{DispatchOutcome, RequestDispatcher, REQUEST_ID_HEADER};
pub use http_layers::{build_http_layers, HttpLayers};
pub use layer::{ResolvedTenant, TenantLayer, TenantService};
