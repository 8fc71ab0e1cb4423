use thiserror::Error;
use uuid::Uuid;

use crate::exchange::GatewayError;
use crate::models::LogLevel;

/// Execution error taxonomy. Terminal variants are business-rule
/// rejections that must never be retried; everything else is an
/// infrastructure fault eligible for the retry loop.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("user {0} not found")]
    UserNotFound(Uuid),

    #[error("already have open position for {0}")]
    DuplicatePosition(String),

    #[error("no open position for {0}")]
    NoPosition(String),

    #[error("no API credentials configured for exchange {0}")]
    CredentialsMissing(String),

    #[error("price is required for paper trading")]
    InvalidPaperPrice,

    #[error("order size must be positive, got {0}")]
    InvalidSize(f64),

    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("{0}")]
    Internal(String),
}

impl From<sqlx::Error> for ExecError {
    fn from(e: sqlx::Error) -> Self {
        ExecError::Database(e)
    }
}

impl ExecError {
    /// Whether the retry loop should re-attempt after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecError::Gateway(_) | ExecError::Database(_) | ExecError::Internal(_)
        )
    }

    /// Severity for the per-user log trail: rejections log as warnings,
    /// infrastructure failures as errors.
    pub fn log_level(&self) -> LogLevel {
        if self.is_transient() {
            LogLevel::Error
        } else {
            LogLevel::Warning
        }
    }
}

/// Map a sqlx error from a position insert to the ledger-level meaning:
/// a unique violation on the one-open-position index is a concurrent
/// duplicate buy, not an infrastructure fault.
pub(crate) fn map_position_insert_err(e: sqlx::Error, symbol: &str) -> ExecError {
    if let sqlx::Error::Database(ref db) = e {
        if db.code().as_deref() == Some("23505") {
            return ExecError::DuplicatePosition(symbol.to_string());
        }
    }
    ExecError::Database(e)
}
