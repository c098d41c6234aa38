use thiserror::Error;

/// All user-layer errors. Kept separate from SubtrackError so callers can map
/// them to their own response codes.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("User not found: {0}")]
    NotFound(String),

    #[error("User already exists: {0}")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid email: {0}")]
    InvalidEmail(String),

    #[error("Password must be at least {min} characters")]
    WeakPassword { min: usize },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Password hashing failed: {0}")]
    Hashing(String),
}

impl UserError {
    pub fn code(&self) -> &'static str {
        match self {
            UserError::NotFound(_) => "USER_NOT_FOUND",
            UserError::AlreadyExists(_) => "USER_EXISTS",
            UserError::DatabaseError(_) => "DATABASE_ERROR",
            UserError::InvalidName(_) | UserError::InvalidEmail(_) | UserError::WeakPassword { .. } => {
                "VALIDATION_ERROR"
            }
            UserError::InvalidCredentials => "AUTH_FAILED",
            UserError::Hashing(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, UserError>;
