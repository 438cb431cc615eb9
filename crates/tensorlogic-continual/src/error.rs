//! Error types for continual-learning orchestration.

use thiserror::Error;

/// Errors that can occur while preparing or running a continual-learning task.
#[derive(Error, Debug)]
pub enum ContinualError {
    /// Invalid or incomplete configuration for the requested training type.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Dataset structure could not be reconciled.
    #[error("Dataset reconciliation error: {0}")]
    DatasetError(String),

    /// Freeze stage identifiers that do not resolve to a parameter group.
    #[error("Invalid freeze stages {invalid:?}; available parameter groups: {available}")]
    SchedulerValidation {
        /// Stage identifiers that did not resolve.
        invalid: Vec<String>,
        /// A sample of resolvable group names.
        available: String,
    },

    /// Error raised by the external training engine.
    #[error("Engine error: {0}")]
    EngineError(String),

    /// Error in stage or model checkpoint save/load.
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// Error in loss composition.
    #[error("Loss computation error: {0}")]
    LossError(String),

    /// Error in model operations.
    #[error("Model error: {0}")]
    ModelError(String),

    /// Error with invalid parameter.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error while encoding or decoding a persisted document.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl ContinualError {
    /// Whether this error is a fatal pre-run configuration problem.
    ///
    /// Configuration problems abort a task before the engine is ever invoked.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ContinualError::ConfigError(_)
                | ContinualError::DatasetError(_)
                | ContinualError::SchedulerValidation { .. }
        )
    }
}

/// Result type for continual-learning operations.
pub type ContinualResult<T> = Result<T, ContinualError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(ContinualError::ConfigError("x".into()).is_configuration());
        assert!(ContinualError::SchedulerValidation {
            invalid: vec!["model.99".into()],
            available: "model.0".into(),
        }
        .is_configuration());
        assert!(!ContinualError::EngineError("boom".into()).is_configuration());
    }

    #[test]
    fn test_display_includes_invalid_stages() {
        let err = ContinualError::SchedulerValidation {
            invalid: vec!["model.42".into()],
            available: "model.0\nmodel.1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("model.42"));
        assert!(msg.contains("model.0"));
    }
}
