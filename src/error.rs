use thiserror::Error;

/// Status codes carried by every failed MX operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    CorruptDataStructure,
    NotFound,
    IllegalArgument,
    Unsupported,
    NotYetImplemented,
    WouldExceedLimit,
    Timeout,
    Callback,
    Serialization,
    Configuration,
}

#[derive(Error, Debug)]
pub enum MxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Hardware I/O error on '{record}': {message}")]
    Hardware { record: String, message: String },
    #[error("Corrupt data structure: {0}")]
    CorruptDataStructure(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Not yet implemented: {0}")]
    NotYetImplemented(String),
    #[error("Would exceed limit: {0}")]
    WouldExceedLimit(String),
    #[error("Operation timed out")]
    Timeout,
    #[error("Callback error: {0}")]
    Callback(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl MxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MxError::Io(_) | MxError::Hardware { .. } => ErrorKind::Io,
            MxError::CorruptDataStructure(_) => ErrorKind::CorruptDataStructure,
            MxError::NotFound(_) => ErrorKind::NotFound,
            MxError::IllegalArgument(_) => ErrorKind::IllegalArgument,
            MxError::Unsupported(_) => ErrorKind::Unsupported,
            MxError::NotYetImplemented(_) => ErrorKind::NotYetImplemented,
            MxError::WouldExceedLimit(_) => ErrorKind::WouldExceedLimit,
            MxError::Timeout => ErrorKind::Timeout,
            MxError::Callback(_) => ErrorKind::Callback,
            MxError::Json(_) => ErrorKind::Serialization,
            MxError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Corrupt-data errors are fatal to the call and must never be retried
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::CorruptDataStructure
    }
}
