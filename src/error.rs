//! Unified API error handling
//!
//! Provides consistent error responses across all endpoints.

#![allow(dead_code)]

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    /// Bid quotes past their validity window. Carries the expiry timestamp so
    /// the client can show when the quotes went stale.
    #[error("Bids expired at {expired_at}")]
    Expired {
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    /// The dispatch network returned a structured failure result.
    #[error("Vendor rejected the request: {0}")]
    VendorRejected(String),

    /// Transport/timeout failure talking to the dispatch network, after any
    /// applicable retries.
    #[error("Vendor unavailable: {0}")]
    VendorUnavailable(String),

    /// A ride state machine guard refused the transition.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The operation was already performed (e.g. paying an already-paid ride).
    #[error("Duplicate operation: {0}")]
    Duplicate(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error")]
    Database(#[from] sqlx::Error),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Duplicate(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(anyhow::anyhow!(msg.into()))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Expired { .. } => StatusCode::GONE,
            Self::VendorRejected(_) => StatusCode::BAD_GATEWAY,
            Self::VendorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::Duplicate(_) => StatusCode::CONFLICT,
            Self::Internal(_) | Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Expired { .. } => "BIDS_EXPIRED",
            Self::VendorRejected(_) => "VENDOR_REJECTED",
            Self::VendorUnavailable(_) => "VENDOR_UNAVAILABLE",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::Duplicate(_) => "DUPLICATE_OPERATION",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }

    fn public_message(&self) -> String {
        match self {
            // Don't leak internal error details
            Self::Internal(_) | Self::Database(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Log internal errors
        match &self {
            Self::Internal(e) => {
                tracing::error!(error = ?e, "Internal server error");
            }
            Self::Database(e) => {
                tracing::error!(error = ?e, "Database error");
            }
            _ => {
                tracing::warn!(error = %self, "API error");
            }
        }

        let expired_at = match &self {
            Self::Expired { expired_at } => Some(*expired_at),
            _ => None,
        };

        let status = self.status_code();
        let body = ErrorResponse {
            code: self.error_code().to_string(),
            message: self.public_message(),
            expired_at,
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
