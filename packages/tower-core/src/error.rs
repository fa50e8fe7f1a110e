//! Centralized error types for the Tower core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::audio::BufferError;
use crate::encoder::EncoderError;

/// Application-wide error type for the Tower service.
#[derive(Debug, Error)]
pub enum TowerError {
    /// Encoder pipeline error (spawn guard, subprocess launch).
    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    /// Ring buffer construction or push rejected.
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Invalid configuration (zero capacities, empty schedules).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network-level error (bind failures, socket setup).
    #[error("Network error: {0}")]
    Network(String),

    /// The MP3 stream is not currently available to listeners.
    #[error("Stream unavailable: {0}")]
    StreamUnavailable(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TowerError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Encoder(_) => "encoder_error",
            Self::Buffer(_) => "buffer_error",
            Self::Configuration(_) => "configuration_error",
            Self::Network(_) => "network_error",
            Self::StreamUnavailable(_) => "stream_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::StreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type TowerResult<T> = Result<T, TowerError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for TowerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_unavailable_maps_to_503() {
        let err = TowerError::StreamUnavailable("no broadcast".into());
        assert_eq!(err.code(), "stream_unavailable");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn buffer_error_converts() {
        let err: TowerError = BufferError::ZeroCapacity.into();
        assert_eq!(err.code(), "buffer_error");
    }
}
