use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Function error: {0}")]
    Function(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Coarse category used when the error is surfaced as a session event.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) | Self::Json(_) => ErrorKind::Protocol,
            Self::Device(_) => ErrorKind::Device,
            Self::Function(_) => ErrorKind::Function,
            Self::Config(_) => ErrorKind::Config,
            Self::Session(_) | Self::Io(_) | Self::Other(_) => ErrorKind::Session,
        }
    }
}

/// Error categories reported to session observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Transport,
    Protocol,
    /// An `error` event sent by the remote service.
    Remote,
    Device,
    Function,
    Session,
}

pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            ParleyError::Transport("closed".into()).kind(),
            ErrorKind::Transport
        );
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(ParleyError::from(json_err).kind(), ErrorKind::Protocol);
        assert_eq!(
            ParleyError::Device("no input".into()).to_string(),
            "Device error: no input"
        );
    }
}
