//! Error types for the Gantry controller.

use thiserror::Error;

/// Application-level errors for the controller.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Graph compilation error (unresolved variable, cycle, duplicate name)
    #[error("Compile error: {0}")]
    Compile(String),

    /// Illegal structural or parameter change against persisted state
    #[error("Sync error: {0}")]
    Sync(String),

    /// Controller startup or loop error
    #[error("Controller error: {0}")]
    Controller(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Template rendering error
    #[error("Template error: {0}")]
    Template(String),

    /// Parse error (YAML, JSON, etc.)
    #[error("Parse error: {0}")]
    Parse(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("workflow etl-nightly".to_string());
        assert_eq!(err.to_string(), "Resource not found: workflow etl-nightly");
    }

    #[test]
    fn test_compile_error() {
        let err = AppError::Compile("unresolved variable $(region)".to_string());
        assert_eq!(err.to_string(), "Compile error: unresolved variable $(region)");
    }

    #[test]
    fn test_sync_error() {
        let err = AppError::Sync("step changed while RUNNING".to_string());
        assert_eq!(err.to_string(), "Sync error: step changed while RUNNING");
    }
}
