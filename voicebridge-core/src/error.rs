use thiserror::Error;

use crate::codec::FormatTag;

/// All errors produced by voicebridge-core.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("ring buffer is full, audio dropped upstream")]
    BufferFull,

    #[error("encoder format {0:?} is already registered")]
    DuplicateFormat(FormatTag),

    #[error("no encoder registered for format {0:?}")]
    EncoderNotFound(FormatTag),

    #[error("encoder init failed: {0}")]
    EncoderInitFailed(String),

    #[error("encoder failed: {0}")]
    EncoderEncodeFailed(String),

    #[error("transport session start failed: {0}")]
    TransportStartFailed(String),

    #[error("transport send failed: {0}")]
    TransportSendFailed(String),

    #[error("audio sink error: {0}")]
    SinkError(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("voice event queue is full")]
    EventQueueFull,

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("pipeline is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoiceError {
    /// True for failures the health monitor classifies as network trouble.
    pub fn is_net_error(&self) -> bool {
        matches!(
            self,
            VoiceError::TransportStartFailed(_) | VoiceError::TransportSendFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
