use http::StatusCode;
use rust_decimal::Decimal;
use sea_orm::error::{DbErr, RuntimeErr, SqlErr};
use sea_orm::sqlx;
use sea_orm::TransactionError;
use serde::{Deserialize, Serialize};

/// Serializable error body handed to whatever transport fronts the core.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable description, always naming the offending id or balance
    pub detail: String,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Demand document {0} not found")]
    DemandDocumentNotFound(i32),

    #[error("Reservation {0} not found")]
    ReservationNotFound(i32),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid fiscal year {0}: must be 2000 or later")]
    InvalidFiscalYear(i32),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(
        "Insufficient balance for contract item {contract_item_id}: requested {requested}, available {available}"
    )]
    InsufficientBalance {
        contract_item_id: i32,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Demand document {demand_document_id} is already linked to technical study {technical_study_id}")]
    AlreadyLinked {
        demand_document_id: i32,
        technical_study_id: i32,
    },

    #[error("Budget line {ledger_number} already exists for fiscal year {fiscal_year} and unit {unit_id}")]
    DuplicateBudgetLine {
        fiscal_year: i32,
        unit_id: i32,
        ledger_number: String,
    },

    #[error("Could not resolve {kind} '{natural_key}' after {attempts} attempt(s)")]
    ResolutionFailed {
        kind: String,
        natural_key: String,
        attempts: u32,
    },

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<TransactionError<ServiceError>> for ServiceError {
    fn from(err: TransactionError<ServiceError>) -> Self {
        match err {
            TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
            TransactionError::Transaction(service_err) => service_err,
        }
    }
}

impl ServiceError {
    pub fn db_error(error: DbErr) -> Self {
        ServiceError::DatabaseError(error)
    }

    /// Lock contention, serialization failures and lost connections; the same unit of work
    /// may succeed when run again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DatabaseError(DbErr::ConnectionAcquire(_)) => true,
            Self::DatabaseError(DbErr::Conn(RuntimeErr::Internal(_))) => true,
            Self::DatabaseError(
                DbErr::Conn(RuntimeErr::SqlxError(err))
                | DbErr::Exec(RuntimeErr::SqlxError(err))
                | DbErr::Query(RuntimeErr::SqlxError(err)),
            ) => is_transient_sqlx(err),
            _ => false,
        }
    }

    /// Returns the HTTP-equivalent status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::DemandDocumentNotFound(_) | Self::ReservationNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::ValidationError(_)
            | Self::InvalidFiscalYear(_)
            | Self::InsufficientBalance { .. }
            | Self::AlreadyLinked { .. } => StatusCode::BAD_REQUEST,
            Self::Conflict(_) | Self::DuplicateBudgetLine { .. } => StatusCode::CONFLICT,
            Self::ResolutionFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(err) if is_unique_violation(err) => StatusCode::CONFLICT,
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the message suitable for callers.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(err) if is_unique_violation(err) => {
                "Conflicting record already exists".to_string()
            }
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let status = self.status_code();
        ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            detail: self.response_message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

/// SQLite busy/locked (primary and extended codes) and Postgres serialization/deadlock codes.
const TRANSIENT_SQL_CODES: &[&str] = &["5", "6", "261", "262", "517", "40001", "40P01"];

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map_or(false, |code| TRANSIENT_SQL_CODES.contains(&&*code)),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        _ => false,
    }
}
