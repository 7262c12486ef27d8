//! Error types for the protocol engine

use std::fmt;
use std::io;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Close status codes defined by RFC 6455 section 7.4.1
pub mod close_code {
    /// Normal closure
    pub const NORMAL_CLOSURE: u16 = 1000;
    /// Endpoint is going away (e.g. server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Received data the endpoint cannot accept
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// No status code was present (never sent on the wire)
    pub const NO_STATUS_RECEIVED: u16 = 1005;
    /// Connection dropped without a close frame (never sent on the wire)
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    /// Payload inconsistent with the message type
    pub const INVALID_FRAME_PAYLOAD_DATA: u16 = 1007;
    /// Message violates endpoint policy
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too big to process
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Client expected an extension the server did not negotiate
    pub const MANDATORY_EXTENSION: u16 = 1010;
    /// Server encountered an unexpected condition
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// A protocol-level close condition: status code plus optional reason text.
///
/// Delivered to [`Handler::on_close`](crate::Handler::on_close) when the
/// connection ends for a reason other than a clean normal closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseError {
    /// Close status code
    pub code: u16,
    /// Reason text (valid UTF-8, possibly empty)
    pub reason: String,
}

impl CloseError {
    /// Create a new close condition
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn message_too_large() -> Self {
        Self::new(close_code::MESSAGE_TOO_BIG, "message too large")
    }

    /// Check whether a close code received from the peer is valid per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "close code {}", self.code)
        } else {
            write!(f, "close code {}: {}", self.code, self.reason)
        }
    }
}

/// Engine error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying byte stream
    Io(io::Error),
    /// Write attempted after the connection closed
    ConnClosed,
    /// Outbound payload exceeds the configured write limit
    MessageTooLarge,
    /// Protocol violation by the peer
    Protocol(&'static str),
    /// Connection closed (or closing) with the given status
    Close(CloseError),
    /// Compression or decompression failure
    Compression(String),
}

impl Error {
    /// The close code to send to the peer when this error terminates a connection.
    ///
    /// [`close_code::ABNORMAL_CLOSURE`] means the transport is already beyond
    /// use and no close frame should be attempted.
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Io(_) | Error::ConnClosed => close_code::ABNORMAL_CLOSURE,
            Error::MessageTooLarge => close_code::MESSAGE_TOO_BIG,
            Error::Protocol(_) => close_code::PROTOCOL_ERROR,
            Error::Close(c) => c.code,
            Error::Compression(_) => close_code::INTERNAL_ERROR,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::ConnClosed => write!(f, "connection closed"),
            Error::MessageTooLarge => write!(f, "message too large"),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Close(c) => write!(f, "{}", c),
            Error::Compression(msg) => write!(f, "compression error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_close_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 4999] {
            assert!(CloseError::is_valid_code(code), "{code} should be valid");
        }
        for code in [0, 999, 1004, 1005, 1006, 1012, 2999, 5000] {
            assert!(!CloseError::is_valid_code(code), "{code} should be invalid");
        }
    }

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(
            Error::Protocol("bad frame").close_code(),
            close_code::PROTOCOL_ERROR
        );
        assert_eq!(
            Error::Close(CloseError::message_too_large()).close_code(),
            close_code::MESSAGE_TOO_BIG
        );
        assert_eq!(
            Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).close_code(),
            close_code::ABNORMAL_CLOSURE
        );
        assert_eq!(
            Error::Compression("truncated state".into()).close_code(),
            close_code::INTERNAL_ERROR
        );
    }
}
