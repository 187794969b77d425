use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecError>;

#[derive(Debug, Error)]
pub enum RecError {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),

    #[error("Numerical divergence at epoch {epoch}: {detail} (learning rate too high?)")]
    NumericalDivergence { epoch: usize, detail: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown {kind} index {index} (catalog size {size})")]
    UnknownEntity {
        kind: &'static str,
        index: usize,
        size: usize,
    },

    #[error("Model has not been fitted")]
    NotFitted,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl RecError {
    pub fn dimension(message: impl Into<String>) -> Self {
        RecError::DimensionMismatch(message.into())
    }

    pub fn hyperparameter(message: impl Into<String>) -> Self {
        RecError::InvalidHyperparameter(message.into())
    }
}
