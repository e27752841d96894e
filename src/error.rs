//! Error types shared by both services.
//!
//! Protocol errors are reported back to the peer (as `UNDEFINED_ERROR` on the
//! lease protocol, or `error Invalid command` on the session protocol) and are
//! never fatal to a server. Configuration errors stop the process at startup.

use thiserror::Error;

/// Malformed or unrecognized wire data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid number in {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message is not valid UTF-8")]
    InvalidUtf8,

    #[error("Message too large: {size} bytes exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Line exceeds maximum length of {0} bytes")]
    LineTooLong(usize),

    #[error("Connection closed with {0} unprocessed bytes")]
    TrailingBytes(usize),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error came from the underlying transport rather than the
    /// bytes it carried.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}

/// Invalid startup configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Ending client port {end} is lower than starting client port {start}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("Invalid address {0:?}: expected <host>:<port>")]
    InvalidAddress(String),
}
