//! Control-channel errors

use thiserror::Error;

/// Failure of a single node control call
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Client construction failed
    #[error("initialization error: {0}")]
    Init(String),

    /// Connection refused, reset, DNS failure and similar
    #[error("transport error: {0}")]
    Transport(String),

    /// The per-call timeout elapsed
    #[error("request timed out")]
    Timeout,

    /// Node answered with a non-success status
    #[error("HTTP error ({status}): {body}")]
    Status { status: u16, body: String },

    /// Response body could not be decoded
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// 5xx and 429 are transient; other non-success codes are permanent
    pub fn status_is_retryable(status: u16) -> bool {
        status == 429 || (500..600).contains(&status)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Status { status, .. } => Self::status_is_retryable(*status),
            Self::Init(_) | Self::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}
