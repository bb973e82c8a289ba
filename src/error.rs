use thiserror::Error;

use crate::audio_codec::CodecError;
use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::playback::PlaybackError;
use crate::session::SessionError;
use crate::tools::ToolError;
use crate::transcript::history::HistoryError;

pub type Result<T> = std::result::Result<T, LiveError>;

#[derive(Error, Debug)]
pub enum LiveError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Audio decode error: {0}")]
    Decode(#[from] CodecError),

    #[error("Tool execution error: {0}")]
    ToolExecution(#[from] ToolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] HistoryError),
}

impl LiveError {
    /// Message suitable for the banner shown to the learner.
    pub fn user_message(&self) -> String {
        match self {
            LiveError::PermissionDenied(_) => {
                "I can't hear you! Please allow microphone access and press the mic button again."
                    .to_string()
            }
            LiveError::Device(_) => {
                "Something is wrong with the microphone or speakers. Please try again.".to_string()
            }
            LiveError::ConnectionFailure(_) => {
                "I lost my connection. Press the mic button to talk again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<CaptureError> for LiveError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(msg) => LiveError::PermissionDenied(msg),
            other => LiveError::Device(other.to_string()),
        }
    }
}

impl From<PlaybackError> for LiveError {
    fn from(err: PlaybackError) -> Self {
        LiveError::Device(err.to_string())
    }
}

impl From<SessionError> for LiveError {
    fn from(err: SessionError) -> Self {
        LiveError::ConnectionFailure(err.to_string())
    }
}
