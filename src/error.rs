//! Admission failures and their HTTP rendering.
//!
//! Every stage handles its own failure by turning an [`AdmissionError`] into a
//! complete response and stopping the chain. Bodies are short JSON objects and
//! never carry internal state.

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Reasons a request is refused before reaching the handler.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Throttle backlog is full.
    #[error("capacity exceeded")]
    Capacity { retry_after: Duration },

    /// Client used up its rate-limit window.
    #[error("rate limit reached")]
    RateLimited,

    /// Same idempotent request is still being processed.
    #[error("request already under way")]
    Conflict,

    /// Proof-of-work solution did not satisfy the difficulty.
    #[error("failed nollamas challenge")]
    ChallengeFailed,

    /// The admission machinery itself failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::Capacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::Conflict => StatusCode::CONFLICT,
            AdmissionError::ChallengeFailed => StatusCode::OK,
            AdmissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in the `error` field of the body.
    fn public_message(&self) -> &'static str {
        match self {
            AdmissionError::Capacity { .. } => "capacity exceeded",
            AdmissionError::RateLimited => "rate limit reached",
            AdmissionError::Conflict => "request already under way",
            AdmissionError::ChallengeFailed => "failed nollamas challenge",
            AdmissionError::Internal(_) => "internal server error",
        }
    }
}

/// Rounds a retry delay to whole seconds for the `Retry-After` header.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    retry_after.as_secs_f64().round() as u64
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        if let AdmissionError::Internal(detail) = &self {
            tracing::error!(error = %detail, "Admission control failure");
        }

        let mut response =
            (self.status(), Json(json!({ "error": self.public_message() }))).into_response();

        if let AdmissionError::Capacity { retry_after } = self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(retry_after)),
            );
        }

        response
    }
}
