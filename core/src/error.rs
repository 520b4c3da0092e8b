use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No {protocol} leader tone found in {samples} samples")]
    ProtocolMismatch {
        protocol: &'static str,
        samples: u64,
    },

    #[error("Unsupported record at byte {index}: {reason}")]
    UnsupportedRecord { index: usize, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation interrupted")]
    Interrupted,
}

impl CodecError {
    pub(crate) fn unsupported(index: usize, reason: impl Into<String>) -> Self {
        CodecError::UnsupportedRecord {
            index,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
