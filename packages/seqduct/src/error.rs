// error types for fan-ins and the socket transport.

use std::io;
use thiserror::Error;


// ==== base error types ====


/// Error for an operation with limited blocking not completing by its deadline
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("operation did not complete by its deadline")]
pub struct WouldBlockError;

/// Error for trying to open a second live iterator on an [`UncachedFanIn`][1]
///
/// [1]: crate::UncachedFanIn
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("uncached fan-in already has a live iterator")]
pub struct InUseError;

/// Error for a connection being torn down by the peer mid-operation
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("connection lost")]
pub struct ConnectionLostError;

/// Failure raised by a registered source while being pulled
#[derive(Error, Debug)]
#[error("source failed: {cause}")]
pub struct SourceError {
    /// What the source reported
    pub cause: anyhow::Error,
}

impl From<anyhow::Error> for SourceError {
    fn from(cause: anyhow::Error) -> Self {
        SourceError { cause }
    }
}

/// Violation of the wire protocol by the remote side
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ProtocolError {
    /// The first frame of the data direction was not a valid Version frame
    #[error("bad or missing version frame: {0}")]
    BadVersion(String),
    /// A byte that is not a known frame tag
    #[error("invalid frame tag byte: {0}")]
    InvalidTag(u8),
    /// A known frame arrived where it is not allowed
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
    /// An element frame declared a payload longer than the configured maximum
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u64, max: usize },
    /// The connection ended in the middle of a frame
    #[error("connection ended mid-frame")]
    Truncated,
}


// ==== compound error types ====


macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Error for pulling the next element out of a fan-in
#[derive(Error, Debug)]
pub enum FanInError {
    /// A source failed and the fan-in is configured to propagate source failures
    #[error(transparent)]
    Source(SourceError),
    /// No source delivered an element before the configured request timeout
    #[error("timed out waiting for a source to deliver")]
    Timeout(WouldBlockError),
}

compound_from!(FanInError {
    Source(SourceError),
    Timeout(WouldBlockError),
});

/// Error for sending a sequence or an element onto a socket
#[derive(Error, Debug)]
pub enum SendError {
    /// Reading credit or writing frames failed
    #[error("socket error while sending: {0}")]
    Io(io::Error),
    /// The peer did not grant credit or accept data before the configured timeout
    #[error("timed out waiting on the peer")]
    Timeout(WouldBlockError),
    /// The codec could not encode an element
    #[error("failed to encode element: {0}")]
    Encode(anyhow::Error),
    /// The sequence being sent failed
    #[error(transparent)]
    Source(SourceError),
    /// The peer reset or closed the connection while an element was being written
    #[error(transparent)]
    ConnectionLost(ConnectionLostError),
}

compound_from!(SendError {
    Timeout(WouldBlockError),
    Source(SourceError),
    ConnectionLost(ConnectionLostError),
});

impl From<io::Error> for SendError {
    fn from(e: io::Error) -> Self {
        if is_timeout(&e) {
            SendError::Timeout(WouldBlockError)
        } else if is_connection_lost(&e) {
            SendError::ConnectionLost(ConnectionLostError)
        } else {
            SendError::Io(e)
        }
    }
}

/// Error for receiving a sequence from a socket
///
/// Receive errors are fatal for the sequence they occur on.
#[derive(Error, Debug)]
pub enum RecvError {
    /// Writing credit or reading frames failed
    #[error("socket error while receiving: {0}")]
    Io(io::Error),
    /// The peer sent nothing before the configured read timeout
    #[error("timed out waiting for an element")]
    Timeout(WouldBlockError),
    /// The codec could not decode an element
    #[error("failed to decode element: {0}")]
    Decode(anyhow::Error),
    /// The peer violated the wire protocol
    #[error("protocol violation: {0}")]
    Protocol(ProtocolError),
}

compound_from!(RecvError {
    Timeout(WouldBlockError),
    Protocol(ProtocolError),
});

impl From<io::Error> for RecvError {
    fn from(e: io::Error) -> Self {
        if is_timeout(&e) {
            RecvError::Timeout(WouldBlockError)
        } else if e.kind() == io::ErrorKind::UnexpectedEof {
            RecvError::Protocol(ProtocolError::Truncated)
        } else {
            RecvError::Io(e)
        }
    }
}

// socket read/write timeouts surface as either of these kinds depending on platform.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

pub(crate) fn is_connection_lost(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted,
    )
}
