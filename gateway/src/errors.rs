//! Gateway error taxonomy
//!
//! Every failure inside a session resolves to one of the kinds below, and the
//! kind alone decides what the caller experiences: `Upstream` and `Timeout`
//! abort the turn and play the fallback phrase, `Protocol` closes the
//! transport with code 1002, `Cancelled` is not an error at all, and
//! `Internal` ends the session without ever taking the process down.

use thiserror::Error;

/// Classification of a gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller's connection is gone or malformed.
    Transport,
    /// An external service (STT/TTS/LLM/telephony provider) failed.
    Upstream,
    /// A wall-clock cap was hit.
    Timeout,
    /// Barge-in or shutdown cancellation. Logged at debug, never surfaced.
    Cancelled,
    /// The remote violated the expected message shape.
    Protocol,
    /// Misconfiguration detected at startup or on first use.
    Config,
    /// Invariant violation. The session is terminated, the process survives.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

/// Gateway-level error carrying its kind and a human-readable message.
#[derive(Debug, Error)]
#[error("{kind} error: {message}")]
pub struct BridgeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BridgeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Whether the turn should be aborted with the fallback phrase and the
    /// session returned to Listening (rather than ended).
    pub fn is_turn_recoverable(&self) -> bool {
        matches!(self.kind, ErrorKind::Upstream | ErrorKind::Timeout)
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::Upstream.to_string(), "upstream");
        assert_eq!(ErrorKind::Protocol.to_string(), "protocol");
    }

    #[test]
    fn test_turn_recoverable() {
        assert!(BridgeError::upstream("stt died").is_turn_recoverable());
        assert!(BridgeError::timeout("turn cap").is_turn_recoverable());
        assert!(!BridgeError::protocol("bad frame").is_turn_recoverable());
        assert!(!BridgeError::internal("bug").is_turn_recoverable());
    }
}
