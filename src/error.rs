use thiserror::Error;

/// Errors raised while building or running the model.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<i64>, got: Vec<i64> },
    #[error("Backend error: {0}")]
    Backend(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ModelError::Configuration(msg.into())
    }
}
