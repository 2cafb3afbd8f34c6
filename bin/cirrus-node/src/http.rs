//! Request-boundary error mapping
//!
//! Per-request errors are recovered here and reported as HTTP errors
//! with a descriptive message; they never take a worker down.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cirrus_common::Error;
use tracing::warn;

/// Wrapper turning a [`Error`] into an HTTP response
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = self.0.to_string();
        if status.is_server_error() {
            warn!(status = %status, error = %message, "request failed");
        }
        (status, message).into_response()
    }
}
