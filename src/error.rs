// =============================================================================
// ERROR MODULE
// =============================================================================
// Error taxonomy for the drop core and its HTTP mapping.
//
// Propagation policy:
// - State and suspension errors are terminal for the request: never
//   retried, surfaced as 409/403.
// - Payment declines carry their category so the client can decide
//   between "ask for another card" and "generic failure".
// - Concurrency (a lost ledger compare-and-set) is retried internally a
//   bounded number of times before it ever reaches the caller.
// - Settlement capture failures are NOT request errors; they live in
//   the SettlementReport.
// - 5xx bodies never leak internal details.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;
use crate::payment::DeclineReason;

#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INPUT ERRORS
    // -------------------------------------------------------------------------
    /// Bad input (negative amount, bounds outside the supplier list, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced record doesn't exist
    #[error("Not found: {0}")]
    NotFound(String),

    // -------------------------------------------------------------------------
    // STATE ERRORS (never retried)
    // -------------------------------------------------------------------------
    /// The drop state machine rejected the transition
    #[error("Invalid transition: cannot {action} a drop in state {from}")]
    InvalidTransition { from: String, action: String },

    /// Operation illegal given the current status (reserve on a closed
    /// drop, cancel after capture, ...)
    #[error("State error: {0}")]
    State(String),

    /// Item already picked up or already returned; no double-counting
    #[error("Already processed: {0}")]
    AlreadyProcessed(String),

    /// No reservable stock left for the product
    #[error("Out of stock: product {0}")]
    OutOfStock(uuid::Uuid),

    /// User blocked by the reputation ceiling
    #[error("User is suspended from new reservations")]
    Suspension,

    // -------------------------------------------------------------------------
    // PAYMENT ERRORS
    // -------------------------------------------------------------------------
    /// The processor declined the authorization
    #[error("Payment declined: {0}")]
    PaymentDeclined(DeclineReason),

    /// The processor was unreachable or timed out. A timeout is a
    /// failure, never a success.
    #[error("Payment processor unavailable: {0}")]
    PaymentUnavailable(String),

    // -------------------------------------------------------------------------
    // CONCURRENCY
    // -------------------------------------------------------------------------
    /// The ledger conditional update lost the race after all internal
    /// retries; the caller may retry the whole reserve from a fresh read
    #[error("Concurrent update conflict on drop ledger")]
    Concurrency,

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The status this error maps to; also used as a metrics label.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition { .. }
            | AppError::State(_)
            | AppError::AlreadyProcessed(_)
            | AppError::OutOfStock(_)
            | AppError::Concurrency => StatusCode::CONFLICT,
            AppError::Suspension => StatusCode::FORBIDDEN,
            AppError::PaymentDeclined(_) => StatusCode::PAYMENT_REQUIRED,
            AppError::PaymentUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Cache(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_code, message, details) = match &self {
            AppError::Validation(msg) => ("VALIDATION_ERROR", msg.clone(), None),

            AppError::NotFound(msg) => ("NOT_FOUND", msg.clone(), None),

            AppError::InvalidTransition { .. } => ("INVALID_TRANSITION", self.to_string(), None),

            AppError::State(msg) => ("STATE_ERROR", msg.clone(), None),

            AppError::AlreadyProcessed(msg) => ("ALREADY_PROCESSED", msg.clone(), None),

            AppError::OutOfStock(product_id) => (
                "OUT_OF_STOCK",
                format!("No stock left for product {}", product_id),
                None,
            ),

            AppError::Suspension => (
                "USER_SUSPENDED",
                "Account suspended from new reservations".to_string(),
                None,
            ),

            // 402 with the decline category; `prompt_new_method` tells the
            // client whether offering a different card can help
            AppError::PaymentDeclined(reason) => (
                "PAYMENT_DECLINED",
                format!("Payment declined: {}", reason),
                Some(format!(
                    "{{\"decline_reason\":\"{}\",\"prompt_new_method\":{}}}",
                    reason.as_str(),
                    reason.prompt_new_method()
                )),
            ),

            AppError::PaymentUnavailable(_) => (
                "PAYMENT_UNAVAILABLE",
                "Payment processor unavailable".to_string(),
                None,
            ),

            AppError::Concurrency => (
                "CONCURRENT_UPDATE",
                "Concurrent update conflict; retry the request".to_string(),
                None,
            ),

            // Internal details stay out of the response body
            AppError::Database(_) => ("DATABASE_ERROR", "A database error occurred".to_string(), None),

            AppError::Cache(_) => ("CACHE_ERROR", "A cache error occurred".to_string(), None),

            AppError::Internal(msg) => ("INTERNAL_ERROR", msg.clone(), None),
        };

        tracing::error!(
            error_code = error_code,
            message = %message,
            "Request failed"
        );

        let body = match details {
            Some(d) => ErrorResponse::with_details(error_code, message, d),
            None => ErrorResponse::new(error_code, message),
        };

        (status, Json(body)).into_response()
    }
}

/// Shorthand for handler and service results.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
