//! Error types for mongolink
//!
//! Provides a unified error type hierarchy for the driver core. Transport
//! faults (`Frame`, `ConnectionClosed`, `Network`, `Io`) are fatal to the
//! connection they occurred on; everything else leaves the connection usable.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using mongolink's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mongolink
#[derive(Error, Debug)]
pub enum Error {
    // Malformed or untrusted bytes on the wire
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("No servers available: {0}")]
    NoServersAvailable(String),

    // Well-formed reply whose status says the command failed
    #[error("Server reported error: {0}")]
    ServerReported(#[from] CommandError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for faults that invalidate the connection and warrant a re-probe
    /// of the server it points at.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            Error::Frame(_) | Error::ConnectionClosed | Error::Network(_) | Error::Io(_)
        )
    }

    /// True for errors a caller may reasonably retry at a higher level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NoServersAvailable(_) | Error::Timeout(_)) || self.is_network_error()
    }
}

/// Wire framing errors. Any of these closes the connection that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("declared length {declared} does not match actual length {actual}")]
    InvalidLength { declared: i64, actual: usize },

    #[error("unterminated C string")]
    InvalidCString,

    #[error("checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("unknown opcode {0}")]
    UnknownOpCode(i32),

    #[error("invalid section kind {0}")]
    InvalidSectionKind(u8),

    #[error("truncated frame: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("message of {length} bytes exceeds maximum of {max}")]
    MessageTooLarge { length: usize, max: usize },

    #[error("unsupported required flag bits {0:#x}")]
    UnsupportedFlags(u32),
}

/// Network-related errors raised while establishing a transport
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Address resolution failed: {0}")]
    AddressResolution(String),
}

/// Authentication errors. The connection that produced one is discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("server nonce does not extend the client nonce")]
    InvalidNonce,

    #[error("server signature did not verify")]
    ServerSignatureInvalid,

    #[error("server rejected credentials ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("malformed SCRAM message: {0}")]
    MalformedMessage(String),

    #[error("unsupported mechanism: {0}")]
    UnsupportedMechanism(String),

    #[error("invalid SCRAM state: {0}")]
    InvalidState(&'static str),
}

/// Command failure reported by the server inside an otherwise valid reply
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code}{})", code_name_suffix(.code_name))]
pub struct CommandError {
    pub code: i32,
    pub code_name: Option<String>,
    pub message: String,
}

fn code_name_suffix(code_name: &Option<String>) -> String {
    code_name.as_deref().map(|n| format!(", {n}")).unwrap_or_default()
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
