//! Error taxonomy and the transport-to-public translation table
//!
//! Transport failures form a closed set (`TransportError`); the public
//! `Error` enum is what callers match on. Translation happens once, at the
//! dispatch boundary, through the exhaustive `From<TransportError>` impl
//! below — adding a transport kind without a mapping is a compile error.

use thiserror::Error;

/// Result type for facade operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds a transport implementation may raise
///
/// Each variant carries the raw diagnostic message. The `Display` impl is
/// the message itself, so translation preserves it verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection-level failure (reset, closed, I/O error)
    #[error("{0}")]
    Connection(String),

    /// Server rejected the command semantically
    #[error("{0}")]
    Command(String),

    /// Read exceeded the configured deadline
    #[error("{0}")]
    ReadTimeout(String),

    /// Could not establish a connection
    #[error("{0}")]
    CannotConnect(String),

    /// Server rejected the authentication handshake
    #[error("{0}")]
    Authentication(String),

    /// Server denied the operation
    #[error("{0}")]
    Permission(String),

    /// Key holds a value of an incompatible type
    #[error("{0}")]
    WrongType(String),

    /// Reply framing could not be parsed
    #[error("{0}")]
    UnknownReply(String),
}

impl TransportError {
    /// Classify a server `-ERR`-style reply line into a transport kind
    ///
    /// Redis prefixes error replies with an upper-case code; everything
    /// without a recognized code is a plain command error.
    pub fn from_error_reply(message: String) -> Self {
        if message.starts_with("WRONGTYPE") {
            Self::WrongType(message)
        } else if message.starts_with("NOPERM") {
            Self::Permission(message)
        } else if message.starts_with("NOAUTH")
            || message.starts_with("WRONGPASS")
            || message.starts_with("ERR AUTH")
        {
            Self::Authentication(message)
        } else {
            Self::Command(message)
        }
    }
}

/// Public error kinds raised by every facade operation
///
/// Transport-originated variants keep the originating [`TransportError`] as
/// payload; `Display` passes its message through unchanged, so catch-by-kind
/// logic downstream is portable across transport implementations.
#[derive(Error, Debug)]
pub enum Error {
    /// Generic transport failure
    #[error("{0}")]
    Connection(#[source] TransportError),

    /// Server rejected the command semantically
    #[error("{0}")]
    Command(#[source] TransportError),

    /// Read exceeded the deadline
    #[error("{0}")]
    Timeout(#[source] TransportError),

    /// Could not establish or authenticate a connection
    #[error("{0}")]
    CannotConnect(#[source] TransportError),

    /// Server denied the operation
    #[error("{0}")]
    Permission(#[source] TransportError),

    /// Key holds a value of an incompatible type
    #[error("{0}")]
    WrongType(#[source] TransportError),

    /// Reply framing could not be parsed
    #[error("{0}")]
    Protocol(#[source] TransportError),

    /// Connection reused across a process fork without explicit permission
    #[error("{0}")]
    Inherited(String),

    /// A removed or renamed API surface was invoked
    #[error("{0}")]
    Deprecated(String),

    /// Invalid configuration, reported at construction time only
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A reply could not be converted to the requested shape
    #[error("type error: {0}")]
    Type(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            e @ TransportError::Connection(_) => Self::Connection(e),
            e @ TransportError::Command(_) => Self::Command(e),
            e @ TransportError::ReadTimeout(_) => Self::Timeout(e),
            e @ TransportError::CannotConnect(_) => Self::CannotConnect(e),
            e @ TransportError::Authentication(_) => Self::CannotConnect(e),
            e @ TransportError::Permission(_) => Self::Permission(e),
            e @ TransportError::WrongType(_) => Self::WrongType(e),
            e @ TransportError::UnknownReply(_) => Self::Protocol(e),
        }
    }
}

impl Error {
    /// Stable kind name, used in logs and assertions
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Command(_) => "command",
            Self::Timeout(_) => "timeout",
            Self::CannotConnect(_) => "cannot-connect",
            Self::Permission(_) => "permission",
            Self::WrongType(_) => "wrong-type",
            Self::Protocol(_) => "protocol",
            Self::Inherited(_) => "inherited",
            Self::Deprecated(_) => "deprecated",
            Self::Config(_) => "config",
            Self::Type(_) => "type",
        }
    }
}
