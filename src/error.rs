//! Error types for the lending server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Stable machine-readable error codes.
///
/// Numbering follows the legacy lending system: 20xxx for books, 30xxx for
/// loans, 31xxx for reservations, 4xx/500 for generic failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    BadValue = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    InternalError = 500,
    OutOfStock = 20003,
    BorrowLimitReached = 30002,
    HasOverdueLoans = 30003,
    RenewLimitReached = 30004,
    CannotRenewOverdue = 30005,
    AlreadyReturned = 30006,
    ReservationFailed = 30007,
    ReservationConflict = 31001,
    AlreadyReserved = 31002,
    NotCancellable = 31003,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadValue => "BAD_VALUE",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::OutOfStock => "OUT_OF_STOCK",
            ErrorCode::BorrowLimitReached => "BORROW_LIMIT_REACHED",
            ErrorCode::HasOverdueLoans => "HAS_OVERDUE_LOANS",
            ErrorCode::RenewLimitReached => "RENEW_LIMIT_REACHED",
            ErrorCode::CannotRenewOverdue => "CANNOT_RENEW_OVERDUE",
            ErrorCode::AlreadyReturned => "ALREADY_RETURNED",
            ErrorCode::ReservationFailed => "RESERVATION_FAILED",
            ErrorCode::ReservationConflict => "RESERVATION_CONFLICT",
            ErrorCode::AlreadyReserved => "ALREADY_RESERVED",
            ErrorCode::NotCancellable => "NOT_CANCELLABLE",
        }
    }
}

/// Transport-independent classification of every failure the core can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CapacityExceeded,
    EligibilityBlocked,
    StateConflict,
    NotFound,
    Unauthorized,
    Invalid,
    Internal,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Book is out of stock")]
    OutOfStock,

    #[error("Borrow limit reached ({current}/{limit})")]
    BorrowLimitReached { current: i32, limit: i32 },

    #[error("User has {0} overdue loan(s) that must be returned first")]
    HasOverdueLoans(i32),

    #[error("Book is reserved by another user")]
    ReservationConflict,

    #[error("Loan already returned")]
    AlreadyReturned,

    #[error("Maximum renewals reached ({0})")]
    RenewLimitReached(i32),

    #[error("Overdue loans cannot be renewed")]
    CannotRenewOverdue,

    #[error("Book already reserved by this user")]
    AlreadyReserved,

    #[error("Book has available copies and cannot be reserved")]
    ReservationFailed,

    #[error("Reservation cannot be cancelled in status {0}")]
    NotCancellable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::OutOfStock | AppError::BorrowLimitReached { .. } => ErrorKind::CapacityExceeded,
            AppError::HasOverdueLoans(_) | AppError::ReservationConflict => {
                ErrorKind::EligibilityBlocked
            }
            AppError::AlreadyReturned
            | AppError::RenewLimitReached(_)
            | AppError::CannotRenewOverdue
            | AppError::AlreadyReserved
            | AppError::ReservationFailed
            | AppError::NotCancellable(_) => ErrorKind::StateConflict,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Authentication(_) | AppError::Authorization(_) => ErrorKind::Unauthorized,
            AppError::Validation(_) => ErrorKind::Invalid,
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::OutOfStock => ErrorCode::OutOfStock,
            AppError::BorrowLimitReached { .. } => ErrorCode::BorrowLimitReached,
            AppError::HasOverdueLoans(_) => ErrorCode::HasOverdueLoans,
            AppError::ReservationConflict => ErrorCode::ReservationConflict,
            AppError::AlreadyReturned => ErrorCode::AlreadyReturned,
            AppError::RenewLimitReached(_) => ErrorCode::RenewLimitReached,
            AppError::CannotRenewOverdue => ErrorCode::CannotRenewOverdue,
            AppError::AlreadyReserved => ErrorCode::AlreadyReserved,
            AppError::ReservationFailed => ErrorCode::ReservationFailed,
            AppError::NotCancellable(_) => ErrorCode::NotCancellable,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::Validation(_) => ErrorCode::BadValue,
            AppError::Authentication(_) => ErrorCode::Unauthorized,
            AppError::Authorization(_) => ErrorCode::Forbidden,
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Error response body
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::CapacityExceeded | ErrorKind::EligibilityBlocked => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorKind::StateConflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => match &self {
                AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
                _ => StatusCode::FORBIDDEN,
            },
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let code = self.code();
        let message = match self.kind() {
            ErrorKind::Internal => {
                tracing::error!(error = ?self, "Internal error");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            code: code as u32,
            error: code.as_str().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
