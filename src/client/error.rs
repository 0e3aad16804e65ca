// ABOUTME: Client error taxonomy covering codec, connection, routing and caller-side failures
// ABOUTME: Errors are plain values propagated with Result; nothing is swallowed or panicked

use crate::codec::CodecError;
use crate::frame::TypeMismatch;
use std::io;
use thiserror::Error;

/// Every failure a caller can observe from this crate.
///
/// The fatality contract per variant: `Protocol` always breaks its
/// connection; `Server` and `TypeMismatch` leave the connection healthy;
/// `ConnectionLost` is what pending requests receive when a connection
/// breaks underneath them, `ConnectionClosed` what later submissions get.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame, truncated transport, or a codec limit exceeded.
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// A well-formed error reply; the server's text is carried verbatim.
    #[error("server error: {0}")]
    Server(String),

    /// A scalar shape was requested that the frame cannot provide.
    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatch),

    /// The connection broke while this request was pending.
    #[error("connection lost before the reply arrived")]
    ConnectionLost,

    /// Submission attempted on a connection that already broke or closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The caller gave up waiting on a completion handle. The submission
    /// itself may still complete on the wire; its reply is discarded.
    #[error("operation timed out")]
    Timeout,

    /// The cluster redirected this call more times than allowed.
    #[error("redirection ceiling reached after {0} redirects")]
    RedirectionLoop(u32),

    /// A multi-key call whose keys hash to different slots.
    #[error("keys hash to different cluster slots")]
    CrossSlot,

    /// Every seed endpoint was unreachable during topology discovery.
    #[error("no seed endpoint reachable for cluster discovery")]
    TopologyUnavailable,

    /// The topology introspection reply could not be parsed.
    #[error("invalid topology description: {0}")]
    InvalidTopology(String),

    /// Slot lookup before any successful discovery.
    #[error("no known owner for slot {0}")]
    NoNodeForSlot(u16),

    /// Transport establishment or socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Unusable option values (bad endpoint string, empty seed list, ...).
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Specialized result for client operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when retrying on a fresh connection could help (used by the
    /// cluster router's refresh-and-retry step).
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost | Error::ConnectionClosed | Error::Io(_)
        )
    }
}
