//! Error types for pgwire-client.
//!
//! All errors in this crate are represented by [`PgError`], which covers:
//! - I/O errors (stream closed or broken mid-operation)
//! - Framing errors (malformed length, truncated frame)
//! - Protocol ordering errors (message tag invalid for the current state)
//! - Authentication errors (unsupported mechanism, malformed SASL data,
//!   server signature mismatch)
//! - Server errors (PostgreSQL `ErrorResponse` payloads)

use thiserror::Error;

/// Error type for all pgwire-client operations.
#[derive(Debug, Error, Clone)]
pub enum PgError {
    /// I/O error - the stream closed or broke mid-operation.
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("io error: {0}")]
    Io(String),

    /// Framing error - malformed length field or truncated frame.
    ///
    /// A corrupted byte stream cannot be resynchronized; the connection
    /// must be abandoned.
    #[error("framing error: {0}")]
    Framing(String),

    /// Protocol ordering error - a backend message arrived in a phase
    /// where it is not valid.
    #[error("protocol ordering error: {0}")]
    ProtocolOrder(String),

    /// Authentication error - unsupported mechanism, malformed SASL
    /// attributes, or server signature mismatch.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Server error - PostgreSQL returned an `ErrorResponse`.
    ///
    /// The message typically includes the SQLSTATE code.
    #[error("server error: {0}")]
    Server(String),
}

impl PgError {
    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, PgError::Io(_))
    }

    /// Returns `true` if this is a framing error.
    #[inline]
    pub fn is_framing(&self) -> bool {
        matches!(self, PgError::Framing(_))
    }

    /// Returns `true` if this is a protocol ordering error.
    #[inline]
    pub fn is_protocol_order(&self) -> bool {
        matches!(self, PgError::ProtocolOrder(_))
    }

    /// Returns `true` if this is an authentication error.
    #[inline]
    pub fn is_auth(&self) -> bool {
        matches!(self, PgError::Auth(_))
    }

    /// Returns `true` if this is a server error.
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, PgError::Server(_))
    }

    /// Returns `true` if this error invalidates the connection.
    ///
    /// A server error during query execution leaves the stream aligned (the
    /// executor drains to ReadyForQuery), so the connection stays usable.
    /// Everything else means the stream can no longer be trusted.
    pub fn faults_connection(&self) -> bool {
        !matches!(self, PgError::Server(_))
    }
}

// Manual From impl since io::Error isn't Clone
impl From<std::io::Error> for PgError {
    fn from(err: std::io::Error) -> Self {
        PgError::Io(err.to_string())
    }
}

/// Result type alias for pgwire-client operations.
pub type Result<T> = std::result::Result<T, PgError>;
