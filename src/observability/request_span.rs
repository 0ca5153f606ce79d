//! Per-request tracing spans.
//!
//! Spans carry method, path and request ID. The query string is never
//! recorded: it may hold tokens or search terms.

use axum::{body::Body, http::Request};
use tower_http::trace::MakeSpan;
use tracing::Span;

use crate::http::X_REQUEST_ID;

/// `MakeSpan` that records the path without its query.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedactedSpan;

impl MakeSpan<Body> for RedactedSpan {
    fn make_span(&mut self, request: &Request<Body>) -> Span {
        let request_id = request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");

        tracing::info_span!(
            "request",
            method = %request.method(),
            path = %request.uri().path(),
            request_id = %request_id,
        )
    }
}

