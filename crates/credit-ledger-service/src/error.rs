//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use credit_ledger_core::{IdError, LedgerError};

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The balance does not cover the requested deduction.
    #[error("insufficient credits: available={available}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        available: i64,
        /// Required amount.
        required: i64,
    },

    /// The request collides with one already in progress.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store did not answer in time. Retryable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::InsufficientCredits {
                available,
                required,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "required": required,
                    "available": available
                })),
            ),
            Self::StoreUnavailable(msg) => {
                tracing::warn!(error = %msg, "Store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_unavailable",
                    "The ledger store is temporarily unavailable".to_string(),
                    None,
                )
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidAmount { .. }
            | LedgerError::InvalidUser(_)
            | LedgerError::BalanceOverflow { .. } => {
                Self::BadRequest(err.to_string())
            }
            LedgerError::PlanNotFound { plan_id } => {
                Self::NotFound(format!("plan not found: {plan_id}"))
            }
            LedgerError::StoreUnavailable(msg) => Self::StoreUnavailable(msg),
            LedgerError::Storage(msg) | LedgerError::Configuration(msg) => Self::Internal(msg),
        }
    }
}

impl From<IdError> for ApiError {
    fn from(err: IdError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_map_to_api_errors() {
        assert!(matches!(
            ApiError::from(LedgerError::InvalidAmount { amount: 0 }),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(LedgerError::BalanceOverflow { amount: 1 }),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(LedgerError::StoreUnavailable("timeout".into())),
            ApiError::StoreUnavailable(_)
        ));
        assert!(matches!(
            ApiError::from(LedgerError::Storage("boom".into())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn insufficient_credits_is_payment_required() {
        let response = ApiError::InsufficientCredits {
            available: 0,
            required: 1,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn conflict_is_409() {
        let response = ApiError::Conflict("in flight".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn store_unavailable_is_503() {
        let response = ApiError::StoreUnavailable("timeout".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
