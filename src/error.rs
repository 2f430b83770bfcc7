//! Error handling for the session manager.
//!
//! Every failure is classified by an [`ErrorKind`] and carries the underlying
//! error as details. The classification drives recovery:
//!
//! * Transient kinds ([`ErrorKind::is_transient`]) are recovered inside the
//!   session loop through the reconnect policy and only ever surface as the
//!   `connection_error` field of the playback state.
//! * Terminal kinds (configuration, URL, local validation) are returned to the
//!   caller that triggered them.
//!
//! # Example
//!
//! ```rust
//! use sendspin_session::error::{Error, ErrorKind, Result};
//!
//! fn check(url: &str) -> Result<()> {
//!     if url.is_empty() {
//!         return Err(Error::invalid_url("server url is empty"));
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories of the session manager.
///
/// The first group mirrors the failure taxonomy of the control session; the
/// second group covers local plumbing.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// The configuration source is unreachable or returned garbage.
    #[error("configuration unavailable")]
    ConfigUnavailable,

    /// The server URL cannot be normalized into an absolute URL.
    #[error("invalid server url")]
    InvalidUrl,

    /// A connect attempt or handshake exceeded its deadline.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The peer violated the protocol or stopped answering heartbeats.
    #[error("protocol error")]
    Protocol,

    /// The transport was closed by the peer or the network.
    #[error("connection closed")]
    Closed,

    /// The server refused the connection or could not be reached.
    #[error("server unavailable")]
    Unavailable,

    /// A command failed local validation and was never sent.
    #[error("command rejected")]
    CommandRejected,

    /// Malformed local input.
    #[error("invalid argument specified")]
    InvalidArgument,

    /// Durable storage could not be read or written.
    #[error("storage error")]
    Storage,

    /// The operation was cancelled by a disconnect or shutdown.
    #[error("operation was cancelled")]
    Cancelled,

    /// An invariant inside the crate was violated.
    #[error("internal error")]
    Internal,
}

impl ErrorKind {
    /// Whether the session loop recovers from this kind by backing off and
    /// reconnecting.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout | Self::Protocol | Self::Closed | Self::Unavailable
        )
    }
}

impl Error {
    /// Creates a new error with specified kind and details.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::new(ErrorKind::Closed, "peer went away");
    /// assert_eq!(err.kind, ErrorKind::Closed);
    /// ```
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Shorthand for [`ErrorKind::is_transient`] on this error's kind.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn config_unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::ConfigUnavailable, error)
    }

    pub fn invalid_url<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidUrl, error)
    }

    pub fn connect_timeout<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::ConnectTimeout, error)
    }

    pub fn protocol<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Protocol, error)
    }

    pub fn closed<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Closed, error)
    }

    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }

    pub fn command_rejected<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::CommandRejected, error)
    }

    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    pub fn storage<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Storage, error)
    }

    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Cancelled, error)
    }

    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted | UnexpectedEof => Self::closed(err),
            TimedOut => Self::connect_timeout(err),
            Interrupted => Self::cancelled(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            _ => Self::storage(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_argument(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_argument(err)
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::internal(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::invalid_url(err)
    }
}

// `reqwest` is only used to fetch configuration, so every failure of it means
// the configuration could not be obtained.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::config_unavailable(err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        match err {
            ConnectionClosed | AlreadyClosed => Self::closed(err),
            // Resolver and socket failures carry uncategorized io errors.
            Io(err) => match Self::from(err) {
                err if err.kind == ErrorKind::Storage => Self::unavailable(err.error),
                err => err,
            },
            Http(_) => Self::unavailable(err),
            Tls(err) => Self::unavailable(err),
            Url(err) => Self::invalid_url(err),
            Protocol(err) => Self::protocol(err),
            _ => Self::protocol(err),
        }
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::connect_timeout(e.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(e: uuid::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<rodio::StreamError> for Error {
    fn from(e: rodio::StreamError) -> Self {
        Self::unavailable(e)
    }
}

impl From<rodio::PlayError> for Error {
    fn from(e: rodio::PlayError) -> Self {
        Self::unavailable(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(Error::from(refused).kind, ErrorKind::Unavailable);

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(Error::from(reset).kind, ErrorKind::Closed);

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(Error::from(denied).kind, ErrorKind::Storage);
    }

    #[test]
    fn only_connection_failures_are_transient() {
        assert!(Error::connect_timeout("slow").is_transient());
        assert!(Error::closed("bye").is_transient());
        assert!(!Error::invalid_url("nope").is_transient());
        assert!(!Error::config_unavailable("404").is_transient());
        assert!(!Error::command_rejected("unsupported").is_transient());
    }

    #[test]
    fn display_prefixes_kind() {
        let err = Error::protocol("heartbeat timed out");
        assert_eq!(err.to_string(), "protocol error: heartbeat timed out");
    }
}
