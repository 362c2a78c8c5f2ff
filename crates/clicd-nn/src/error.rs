use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Core(#[from] clicd_core::Error),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("non-finite loss in {context}")]
    NonFiniteLoss { context: String },

    #[error("{0} is not supported by this model")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
