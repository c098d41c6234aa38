use subtrack_core::RenewalError;
use thiserror::Error;

/// Errors that can occur during subscription store operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The requested subscription does not exist.
    #[error("subscription not found: {0}")]
    NotFound(String),

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Input rejected by a field rule.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Renewal arithmetic failed (unsupported frequency or date overflow).
    #[error(transparent)]
    Renewal(#[from] RenewalError),

    /// A stored row could not be mapped back to a subscription.
    #[error("invalid stored subscription {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    /// The operation is not allowed in the subscription's current state.
    #[error("{0}")]
    Conflict(String),
}

impl SubscriptionError {
    pub fn code(&self) -> &'static str {
        match self {
            SubscriptionError::NotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            SubscriptionError::Database(_) => "DATABASE_ERROR",
            SubscriptionError::Validation(_) => "VALIDATION_ERROR",
            SubscriptionError::Renewal(RenewalError::UnsupportedFrequency(_)) => {
                "UNSUPPORTED_FREQUENCY"
            }
            SubscriptionError::Renewal(RenewalError::OutOfRange { .. }) => "DATE_OUT_OF_RANGE",
            SubscriptionError::InvalidRecord { .. } => "INVALID_RECORD",
            SubscriptionError::Conflict(_) => "CONFLICT",
        }
    }

    /// Database busy/locked are the only store failures worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SubscriptionError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SubscriptionError>;
