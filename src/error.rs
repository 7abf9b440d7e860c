use thiserror::Error;

/// All errors produced by loqui-core.
#[derive(Debug, Error)]
pub enum LoquiError {
    #[error("models are not loaded — call warm_up() first")]
    NotInitialized,

    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("session is busy — a call is already in flight")]
    Busy,

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LoquiError>;
