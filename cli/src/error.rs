use tapecodec_core::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Report error: {0}")]
    Report(#[from] serde_json::Error),

    #[error("Malformed input: {0}")]
    Malformed(String),
}

impl CliError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, CliError::Codec(CodecError::Interrupted))
    }
}

pub type Result<T> = std::result::Result<T, CliError>;
