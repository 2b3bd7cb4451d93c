//! Error types.

use std::sync::Arc;

use thiserror::Error;

/// Every user-visible failure in the crate.
///
/// The enum is `Clone` so the cause recorded at session shutdown can be
/// handed to each blocked caller; transport failures are wrapped in an `Arc`
/// for that reason.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The session has been closed.
    #[error("session shutdown")]
    SessionShutdown,

    /// The remote side is refusing new streams.
    #[error("remote end is not accepting connections")]
    RemoteGoAway,

    /// The 32-bit stream id space is depleted.
    #[error("streams exhausted")]
    StreamsExhausted,

    /// The peer reused the id of a live stream.
    #[error("duplicate stream id {0}")]
    DuplicateStream(u32),

    /// A frame referenced a stream id that is not in the table.
    #[error("missing stream id {0}")]
    MissingStream(u32),

    /// A frame with an id the peer is not allowed to originate.
    #[error("invalid stream id {0}")]
    InvalidStreamId(u32),

    /// The header carried an unsupported protocol version.
    #[error("invalid protocol version {0}")]
    InvalidVersion(u8),

    /// The header carried an unknown message type.
    #[error("invalid message type {0}")]
    InvalidMsgType(u8),

    /// The peer sent more data than the advertised receive window permits.
    #[error("receive window exceeded on stream {0}")]
    RecvWindowExceeded(u32),

    /// The stream was reset.
    #[error("stream reset")]
    ConnectionReset,

    /// The stream was already closed locally.
    #[error("stream closed")]
    StreamClosed,

    /// The peer terminated the session reporting a protocol error.
    #[error("remote reported a protocol error")]
    RemoteProtocolError,

    /// The peer terminated the session reporting an internal error.
    #[error("remote reported an internal error")]
    RemoteInternalError,

    /// The peer sent a go-away frame with an unknown reason code.
    #[error("unexpected go-away code {0}")]
    InvalidGoAwayCode(u32),

    /// The session configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(Arc::new(err))
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            Error::ConnectionReset => ErrorKind::ConnectionReset,
            Error::SessionShutdown | Error::StreamClosed => ErrorKind::BrokenPipe,
            Error::Transport(inner) => inner.kind(),
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
