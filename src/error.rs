use thiserror::Error;

/// Error type for segment build and merge operations.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot merge columns of type [{left}] and [{right}]")]
    IncompatibleColumnTypes { left: String, right: String },

    #[error("Unknown complex type [{0}]")]
    UnknownComplexType(String),

    #[error("Filling row number conversions is supported only with merging and row-combining iterators")]
    UnsupportedIteratorForConversion,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corruption detected: {details}")]
    Corruption { details: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for MergeError {
    fn from(err: serde_json::Error) -> Self {
        MergeError::Serialization(err.to_string())
    }
}
