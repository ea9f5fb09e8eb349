use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::ledger::models::AssetCode;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Idempotency error: {0}")]
    Idempotency(#[from] IdempotencyError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Guard check failed: {0}")]
    Guard(#[from] GuardError),

    #[error("Rail adapter error: {0}")]
    Rail(#[from] RailError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External error: {0}")]
    ExternalError(String),
}

/// Ledger-related errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    #[error("No balance record for {asset:?}")]
    NoBalance { asset: AssetCode },

    #[error("Pending underflow on {asset:?}: tried to move {amount}")]
    PendingUnderflow { asset: AssetCode, amount: String },

    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(String),
}

/// Idempotency store errors
#[derive(Error, Debug)]
pub enum IdempotencyError {
    #[error("Idempotency key does not match the expected token format")]
    MalformedKey,

    #[error("Request with this idempotency key is still in progress")]
    InProgress,
}

/// Settlement state machine errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Operation not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation is terminal in state {0}")]
    AlreadyTerminal(String),

    #[error("Unsupported swap pair: {from:?} -> {to:?}")]
    UnsupportedPair { from: AssetCode, to: AssetCode },
}

/// Pre-flight guard failures. These all map to a REJECTED operation with
/// zero ledger side effects.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Authentication denied")]
    AuthenticationDenied,

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),
}

/// External rail errors. Raw provider payloads never cross this boundary.
#[derive(Error, Debug)]
pub enum RailError {
    #[error("Provider declined: [{code}] {reason}")]
    Declined { code: String, reason: String },

    #[error("Provider transient failure: {0}")]
    Transient(String),

    #[error("Provider outcome unknown: {0}")]
    Unknown(String),
}

/// Distributed mutex errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Could not acquire lease '{0}' within the wait bound")]
    AcquireTimeout(String),

    #[error("Lease '{0}' is no longer held by this owner")]
    LeaseLost(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Idempotency(IdempotencyError::MalformedKey) => (
                StatusCode::BAD_REQUEST,
                "IDEMPOTENCY_KEY_INVALID",
                self.to_string(),
                None,
            ),
            AppError::Idempotency(IdempotencyError::InProgress) => (
                StatusCode::CONFLICT,
                "REQUEST_IN_PROGRESS",
                self.to_string(),
                None,
            ),
            AppError::Ledger(LedgerError::InsufficientFunds { required, available }) => (
                StatusCode::BAD_REQUEST,
                "INSUFFICIENT_FUNDS",
                "Insufficient available balance".to_string(),
                Some(serde_json::json!({
                    "required": required,
                    "available": available,
                })),
            ),
            AppError::Guard(GuardError::Validation(msg)) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
                msg.clone(),
                None,
            ),
            AppError::Guard(GuardError::AuthenticationDenied) => (
                StatusCode::UNAUTHORIZED,
                "AUTH_DENIED",
                "Authentication factors rejected".to_string(),
                None,
            ),
            AppError::Guard(GuardError::LimitExceeded(msg)) => (
                StatusCode::TOO_MANY_REQUESTS,
                "LIMIT_EXCEEDED",
                msg.clone(),
                None,
            ),
            AppError::Settlement(SettlementError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                "OPERATION_NOT_FOUND",
                format!("Operation not found: {}", id),
                None,
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                what.clone(),
                None,
            ),
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                msg.clone(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            // Rail failures reach the caller only as the operation snapshot;
            // an error response here means the engine itself gave up.
            AppError::Rail(_) => (
                StatusCode::BAD_GATEWAY,
                "RAIL_UNAVAILABLE",
                "Settlement rail unavailable".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
