//! Error types shared across the race pipeline.
//!
//! Transport errors bubble to the supervisor, model errors are swallowed at the
//! source, and only `SessionFatal` terminates a session.

use std::fmt;

/// Failure of a single round-trip to the automation backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No response with the matching action within the fixed deadline
    Timeout { action: &'static str },
    /// Connection is gone (closed by peer or never established)
    Closed,
    /// Could not hand the frame to the socket writer
    Send(String),
    /// Connecting or re-connecting failed
    Connect(String),
    /// Response could not be decoded or lacked a required field
    Malformed(String),
    /// Backend answered with `status: "error"`
    Remote { action: String, message: String },
}

impl TransportError {
    /// Remote errors mean the backend is alive but the UI step failed
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { action } => write!(f, "timeout waiting for '{}' response", action),
            Self::Closed => write!(f, "transport connection closed"),
            Self::Send(e) => write!(f, "send failed: {}", e),
            Self::Connect(e) => write!(f, "connect failed: {}", e),
            Self::Malformed(e) => write!(f, "malformed response: {}", e),
            Self::Remote { action, message } => write!(f, "'{}' failed: {}", action, message),
        }
    }
}

impl std::error::Error for TransportError {}

/// Persistence failures of the timing model
#[derive(Debug)]
pub enum ModelError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "model file i/o: {}", e),
            Self::Parse(e) => write!(f, "model file parse: {}", e),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for ModelError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

/// Errors that end a supervisor session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFatal {
    RetriesExhausted { attempts: u32, last_error: String },
}

impl fmt::Display for SessionFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "gave up after {} consecutive failed recoveries (last: {})",
                attempts, last_error
            ),
        }
    }
}

impl std::error::Error for SessionFatal {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = TransportError::Timeout { action: "sleep" };
        assert_eq!(e.to_string(), "timeout waiting for 'sleep' response");

        let e = TransportError::Remote {
            action: "click".into(),
            message: "Element not found".into(),
        };
        assert!(e.is_remote());
        assert_eq!(e.to_string(), "'click' failed: Element not found");

        let fatal = SessionFatal::RetriesExhausted {
            attempts: 3,
            last_error: "transport connection closed".into(),
        };
        assert!(fatal.to_string().contains("3 consecutive"));
    }
}
