//! Error types for the upgrade handshake and frame envelope

use std::fmt;
use std::io;

/// Result type alias for handshake and framing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Handshake and framing error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport while sending
    Io(io::Error),
    /// Frame buffer does not hold a well-formed frame
    InvalidFrame(&'static str),
    /// No terminator observed before the deadline
    Timeout,
    /// Peer sent a well-formed message that is not an upgrade
    Rejected,
    /// Transport closed before the terminator was found
    ConnectionClosed,
    /// Header buffer filled up without a terminator
    SizeLimitExceeded,
    /// Settings header present but undecodable or unparsable
    MalformedSettings(&'static str),
    /// Required pseudo-header missing at construction
    MissingPseudoHeader(&'static str),
    /// Pseudo-header that cannot be placed on the wire
    InvalidPseudoHeader(String),
    /// Unexpected failure inside the background reader
    Internal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            Error::Timeout => write!(f, "Handshake timed out"),
            Error::Rejected => write!(f, "Peer rejected the upgrade"),
            Error::ConnectionClosed => write!(f, "Connection closed during handshake"),
            Error::SizeLimitExceeded => write!(f, "Handshake size limit exceeded"),
            Error::MalformedSettings(msg) => write!(f, "Malformed settings: {}", msg),
            Error::MissingPseudoHeader(name) => write!(f, "Missing pseudo-header {}", name),
            Error::InvalidPseudoHeader(name) => write!(f, "Invalid pseudo-header {}", name),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
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
        match e.kind() {
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            io::ErrorKind::ConnectionReset => Error::ConnectionClosed,
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}
