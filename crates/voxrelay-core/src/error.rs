use thiserror::Error;

use crate::frame::FrameError;

#[derive(Debug, Error)]
pub enum VoxRelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Admission error: {0}")]
    Admission(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxRelayError {
    /// Short machine-readable code sent to clients in `error` control messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Frame(_) => "frame_error",
            Self::Protocol(_) => "protocol_violation",
            Self::Session(_) => "session_error",
            Self::Auth(_) => "auth_failed",
            Self::Admission(_) => "session_limit",
            Self::Inference(_) => "inference_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "parse_error",
            Self::Other(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, VoxRelayError>;
