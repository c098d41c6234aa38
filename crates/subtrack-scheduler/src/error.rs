use subtrack_core::RenewalError;
use subtrack_subscriptions::SubscriptionError;
use subtrack_users::UserError;
use thiserror::Error;

use crate::notifier::NotifyError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    User(#[from] UserError),

    /// Renewal arithmetic failed. Never retried.
    #[error(transparent)]
    Renewal(#[from] RenewalError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// A journaled step output could not be encoded or decoded.
    #[error("Journal error: {0}")]
    Journal(#[from] serde_json::Error),

    /// No workflow instance with the given handle exists.
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Owner not found: {0}")]
    OwnerNotFound(String),

    /// The operation is not allowed in the current state (e.g. resuming a
    /// subscription that is not cancelled).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Lost the handle compare-and-swap more times than allowed.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl SchedulerError {
    /// Whether a step that hit this error may be attempted again.
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            SchedulerError::Subscription(e) => e.is_transient(),
            SchedulerError::Notify(e) => e.is_transient(),
            _ => false,
        }
    }

    /// HTTP-style classification for callers that report errors to clients.
    pub fn status(&self) -> u16 {
        match self {
            SchedulerError::Subscription(SubscriptionError::Validation(_))
            | SchedulerError::Subscription(SubscriptionError::Renewal(_))
            | SchedulerError::Renewal(_)
            | SchedulerError::User(
                UserError::InvalidName(_) | UserError::InvalidEmail(_) | UserError::WeakPassword { .. },
            ) => 400,
            SchedulerError::User(UserError::InvalidCredentials) => 401,
            SchedulerError::InstanceNotFound(_)
            | SchedulerError::SubscriptionNotFound(_)
            | SchedulerError::OwnerNotFound(_)
            | SchedulerError::Subscription(SubscriptionError::NotFound(_))
            | SchedulerError::User(UserError::NotFound(_)) => 404,
            SchedulerError::InvalidState(_)
            | SchedulerError::Conflict(_)
            | SchedulerError::Subscription(SubscriptionError::Conflict(_))
            | SchedulerError::User(UserError::AlreadyExists(_)) => 409,
            SchedulerError::Notify(_) => 502,
            _ => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Subscription(e) => e.code(),
            SchedulerError::User(e) => e.code(),
            SchedulerError::Renewal(RenewalError::UnsupportedFrequency(_)) => "UNSUPPORTED_FREQUENCY",
            SchedulerError::Renewal(RenewalError::OutOfRange { .. }) => "DATE_OUT_OF_RANGE",
            SchedulerError::Notify(_) => "NOTIFICATION_FAILED",
            SchedulerError::Journal(_) => "JOURNAL_ERROR",
            SchedulerError::InstanceNotFound(_) => "WORKFLOW_NOT_FOUND",
            SchedulerError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            SchedulerError::OwnerNotFound(_) => "USER_NOT_FOUND",
            SchedulerError::InvalidState(_) => "INVALID_STATE",
            SchedulerError::Conflict(_) => "CONFLICT",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let unsupported = SchedulerError::from(RenewalError::UnsupportedFrequency("hourly".into()));
        assert_eq!(unsupported.status(), 400);
        assert!(!unsupported.is_transient());

        let transport = SchedulerError::from(NotifyError::Transport("connection reset".into()));
        assert_eq!(transport.status(), 502);
        assert!(transport.is_transient());

        let rejected = SchedulerError::from(NotifyError::Rejected {
            status: 422,
            body: "bad payload".into(),
        });
        assert!(!rejected.is_transient());

        assert_eq!(SchedulerError::InvalidState("not cancelled".into()).status(), 409);
        assert_eq!(SchedulerError::InstanceNotFound("wfr_x".into()).status(), 404);
    }
}
