use thiserror::Error;

/// Errors returned by the control API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Pending record not found: {id}")]
    NotFound { id: String },

    #[error("Action not allowed: {reason}")]
    NotAllowed { reason: String },
}

impl EngineError {
    /// Short error code string for the control surface.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "INVALID_INPUT",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::NotAllowed { .. } => "NOT_ALLOWED",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
