use thiserror::Error;

/// Errors raised while training, evaluating or checkpointing.
#[derive(Debug, Error)]
pub enum Error {
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Model(#[from] clicd_nn::Error),

    #[error(transparent)]
    Core(#[from] clicd_core::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("training loss is nan (epoch {epoch}, batch {batch})")]
    NonFiniteLoss { epoch: usize, batch: usize },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
