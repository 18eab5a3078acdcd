//! HTTP error mapping
//!
//! Acquisition failures become JSON error bodies with a status that tells the
//! caller whether retrying can help.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced by API handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Acquisition(#[from] acquisition::Error),
}

/// HTTP status for an acquisition failure.
pub fn acquisition_status(e: &acquisition::Error) -> StatusCode {
    match e {
        acquisition::Error::Validation(_) | acquisition::Error::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        acquisition::Error::NoAvailableAccount { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Acquisition(e) => acquisition_status(e),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Acquisition(e) => e.kind_label(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        if let ApiError::Acquisition(e) = &self {
            body["error"]["class"] = serde_json::json!(e.class().as_str());
            body["error"]["attempts"] = serde_json::json!(e.attempts().len());
        }
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
