//! Error type shared by the parser, multiplexer and connection.

use std::io;
use std::sync::Arc;

/// All errors this crate can produce.
///
/// Parser errors are terminal for [`Connection::run`](crate::Connection::run).
/// Server replies of the error kinds are delivered to the owning
/// [`exec`](crate::Connection::exec) call only and leave the connection
/// healthy.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The server sent a frame starting with an unknown type byte.
    #[error("invalid RESP3 data type")]
    InvalidDataType,

    /// A length or integer field contained non-numeric characters.
    #[error("field is not a number")]
    NotANumber,

    /// A field that requires a payload was empty.
    #[error("expected field value is empty")]
    EmptyField,

    /// A boolean frame carried something other than `t` or `f`.
    #[error("unexpected boolean value")]
    UnexpectedBoolValue,

    /// Aggregate nesting went past the supported depth.
    #[error("exceeds the maximum number of nested responses")]
    ExceedsMaxNestedDepth,

    /// Name resolution did not finish within `resolve_timeout`.
    #[error("resolve timeout")]
    ResolveTimeout,

    /// The transport connect did not finish within `connect_timeout`.
    #[error("connect timeout")]
    ConnectTimeout,

    /// The TLS handshake did not finish within `ssl_handshake_timeout`.
    #[error("SSL handshake timeout")]
    SslHandshakeTimeout,

    /// The server did not answer a health-check PING in time.
    #[error("pong timeout")]
    PongTimeout,

    /// `exec` was called with `cancel_if_not_connected` while disconnected.
    #[error("not connected")]
    NotConnected,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The server replied with a RESP3 simple error.
    #[error("server error: {0}")]
    Resp3SimpleError(String),

    /// The server replied with a RESP3 blob error.
    #[error("server blob error: {0}")]
    Resp3BlobError(String),

    /// A null node was routed into a slot that cannot represent null.
    #[error("expects a non-null RESP3 value")]
    ExpectsResp3NonNull,

    /// The response shape does not match the expected number of elements.
    #[error("incompatible size")]
    IncompatibleSize,

    /// An aggregate was found where only flat data is supported.
    #[error("nested aggregate not supported")]
    NestedAggregateNotSupported,

    /// A node arrived at a depth the consumer cannot accept.
    #[error("incompatible node depth")]
    IncompatibleNodeDepth,

    /// No queried sentinel knows the configured master name.
    #[error("sentinel does not know this master")]
    SentinelUnknownMaster,

    /// Growing the read buffer would exceed `max_read_buffer`.
    #[error("exceeds maximum read buffer size")]
    ExceedsMaximumReadBufferSize,

    /// Transport-level failure.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // Arc so the same failure can be reported to both the owning exec
        // and the run exit without cloning the inner error.
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Whether the supervisor may retry after this error.
    ///
    /// Cancellation and handshake-level server errors are configuration or
    /// user decisions, retrying them cannot help.
    pub(crate) fn is_reconnectable(&self) -> bool {
        !matches!(
            self,
            Error::Cancelled | Error::Resp3SimpleError(_) | Error::Resp3BlobError(_)
        )
    }
}

/// `Result` alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
