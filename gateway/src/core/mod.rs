//! Upstream client abstractions
//!
//! The speech and language services behind the gateway are black boxes with
//! streaming contracts. Each concern gets a trait (`stt`, `tts`, `llm`) whose
//! outputs are explicit bounded channels rather than callbacks, and every
//! handle is leased from the shared [`pool::ClientPool`].

pub mod llm;
pub mod pool;
pub mod stt;
pub mod tts;

use thiserror::Error;

use crate::errors::ErrorKind;

/// Errors produced by upstream client handles.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Map a client failure onto the gateway taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::ConnectionFailed(_)
            | ClientError::ProviderError(_)
            | ClientError::NetworkError(_) => ErrorKind::Upstream,
            ClientError::AuthenticationFailed(_) | ClientError::ConfigurationError(_) => {
                ErrorKind::Config
            }
            ClientError::InvalidAudio(_) => ErrorKind::Protocol,
            ClientError::Cancelled => ErrorKind::Cancelled,
        }
    }
}
