use thiserror::Error;

#[derive(Debug, Error)]
pub enum CostError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid benchmark entry #{index}: {reason}")]
    InvalidBenchmark { index: usize, reason: String },
    #[error("Invalid price table: {0}")]
    InvalidPriceTable(String),
    #[error("Unknown processor family '{0}'")]
    UnknownProcessor(String),
}

impl From<serde_json::Error> for CostError {
    fn from(e: serde_json::Error) -> Self {
        Self::DeserializationError(e.to_string())
    }
}
