//! FTP/FTPS session error types

use crate::reply::Reply;
use thiserror::Error;

/// Errors produced by the control-connection engine.
#[derive(Error, Debug)]
pub enum FtpError {
    /// Underlying socket read/write failure.
    #[error("transport broken: {0}")]
    TransportBroken(#[from] std::io::Error),

    /// A control or data operation did not complete within its configured
    /// timeout.
    #[error("read timed out")]
    ReadTimeout,

    /// The connect attempt did not complete within its configured timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// DNS resolution produced no candidate matching the configured IP
    /// preference, or every resolved candidate address failed to connect.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The server refused `AUTH TLS`.
    #[error("TLS unavailable: {0}")]
    TlsUnavailable(String),

    /// No certificate validation subscriber accepted the server's
    /// certificate.
    #[error("TLS certificate rejected: {0}")]
    TlsValidationRejected(String),

    /// The USER/PASS sequence failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(Reply),

    /// A non-success reply the core was not prepared to recover from.
    #[error("command failed: {0}")]
    CommandFailed(Reply),

    /// The control connection was closed (EOF) while a reply was expected.
    #[error("unexpected disconnect")]
    UnexpectedDisconnect,

    /// An operation was attempted on a disposed session.
    #[error("session already disposed")]
    AlreadyDisposed,

    /// An operation that requires a live control connection was attempted
    /// while disconnected.
    #[error("not connected")]
    NotConnected,

    /// The session configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A reply line, PASV/EPSV grammar, or FEAT body could not be parsed.
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// Result type alias using [`FtpError`].
pub type Result<T> = std::result::Result<T, FtpError>;
