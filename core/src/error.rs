use thiserror::Error;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("External service '{service}' unavailable: {reason}")]
    ExternalServiceUnavailable { service: &'static str, reason: String },

    #[error("Invocation {key} timed out after {elapsed_ms}ms during {phase}")]
    Timeout {
        key: String,
        phase: &'static str,
        elapsed_ms: u128,
    },

    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BillingError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        BillingError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
