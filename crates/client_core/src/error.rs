use shared::error::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The persistent socket is not open; the caller decides whether to
    /// surface or retry.
    #[error("not connected to the server")]
    NotConnected,
    #[error("request failed with status {status}: {message}")]
    Request { status: u16, message: String },
    #[error("request transport failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed payload: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid server url '{url}': {reason}")]
    InvalidServerUrl { url: String, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Text suitable for a user-facing status notice.
    pub fn notice_text(&self) -> String {
        match self {
            ClientError::NotConnected => "cannot reach the server".to_string(),
            ClientError::Request { message, status } if message.trim().is_empty() => {
                format!("request failed with status {status}")
            }
            ClientError::Request { message, .. } => message.trim().to_string(),
            other => other.to_string(),
        }
    }
}
