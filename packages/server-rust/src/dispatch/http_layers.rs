//! Transport-level middleware wrapped around the tenant layer.
//!
//! Ordering, outermost first:
//! 1. `SetRequestId` assigns a UUID v4 `x-request-id` when the client sent none
//! 2. `Tracing` logs request and response
//! 3. `Timeout` bounds the whole request, answering 408
//! 4. `PropagateRequestId` copies `x-request-id` onto the response
//!
//! The dispatcher reads the same header, so pipeline logs and access logs
//! share the request id.

use std::time::Duration;

use http::header::HeaderName;
use http::StatusCode;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::dispatcher::REQUEST_ID_HEADER;

/// The composed layer produced by [`build_http_layers`].
pub type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            TraceLayer<
                tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
            >,
            tower::layer::util::Stack<
                SetRequestIdLayer<MakeRequestUuid>,
                tower::layer::util::Identity,
            >,
        >,
    >,
>;

#[must_use]
pub fn build_http_layers(request_timeout: Duration) -> HttpLayers {
    let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}
