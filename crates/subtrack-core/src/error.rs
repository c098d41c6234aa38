use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubtrackError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SubtrackError {
    /// Short error code string sent to clients in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            SubtrackError::Config(_) => "CONFIG_ERROR",
            SubtrackError::AuthFailed(_) => "AUTH_FAILED",
            SubtrackError::Validation(_) => "VALIDATION_ERROR",
            SubtrackError::NotFound(_) => "NOT_FOUND",
            SubtrackError::Database(_) => "DATABASE_ERROR",
            SubtrackError::Serialization(_) => "SERIALIZATION_ERROR",
            SubtrackError::Io(_) => "IO_ERROR",
            SubtrackError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SubtrackError>;
