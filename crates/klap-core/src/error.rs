//! Error types for klap-core.
//!
//! This module defines the error types returned by the library.

use thiserror::Error;

/// Error type for klap-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A handshake step failed (transport error or non-success status).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No credential set produced the hash the device returned.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Response could not be decrypted (bad padding or truncated body).
    #[error("decrypt failed: {0}")]
    Decrypt(String),

    /// Device answered a request with a non-success HTTP status.
    #[error("request failed with status {0}")]
    Request(u16),

    /// Device accepted the envelope but reported an application error code.
    #[error("device returned error code {0}")]
    DeviceCommand(i32),

    /// Session expired again after the single re-handshake.
    #[error("session expired after re-handshake")]
    SessionExpired,

    /// Connection to the device failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Protocol error (unexpected response format, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to parse a device response.
    #[error("parse error: {0}")]
    Parse(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(String),

    /// The injected device repository failed to load or save.
    #[error("repository error: {0}")]
    Repository(String),

    /// Caller supplied a value that cannot be sent to a device.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Returns `true` if a cached session should be discarded after this error.
    ///
    /// Application-level failures leave the encrypted channel intact, so the
    /// session stays usable; anything touching the channel itself does not.
    pub fn invalidates_session(&self) -> bool {
        !matches!(
            self,
            Error::DeviceCommand(_) | Error::InvalidArgument(_) | Error::Parse(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
