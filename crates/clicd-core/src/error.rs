use thiserror::Error;

/// Errors raised by graph, batch and dataset operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("node {node} out of range for graph with {num_nodes} nodes")]
    UnknownNode { node: u32, num_nodes: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(feature = "binary")]
impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
