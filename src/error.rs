//! Error types for the multiplexing engine

use h2::Reason;
use thiserror::Error;

use crate::frame::StreamId;

/// Result type alias for multiplexer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to virtual channels and callers of the multiplexer
///
/// `Clone` because one causal error may fail many completion handles at
/// once (a failed handshake fails every buffered write).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed extended CONNECT exchange, rejected or unsupported subprotocol
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Per-stream protocol violation (padded DATA, DATA before handshake)
    #[error("stream protocol error: {0}")]
    StreamProtocol(&'static str),

    /// Peer sent RST_STREAM
    #[error("stream reset by peer: {0:?}")]
    StreamReset(Reason),

    /// Peer sent GOAWAY and did not process this stream
    #[error("connection going away: {0:?}")]
    GoAway(Reason),

    /// Parent HTTP/2 connection is no longer active
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation on a channel that is closed or outbound-closed
    #[error("channel closed")]
    ChannelClosed,

    /// The HTTP/2 encoder rejected or failed a write
    #[error("write failed: {0}")]
    Write(#[from] EncoderError),

    /// sec-websocket-extensions negotiation failure
    #[error("extension negotiation failed: {0}")]
    Extension(String),

    /// Priority weight outside 1..=256
    #[error("invalid priority weight: {0}")]
    InvalidPriority(u16),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Rejected configuration
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    /// True for errors that close every channel on the connection
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::GoAway(_))
    }
}

/// Failures reported by the HTTP/2 connection encoder
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncoderError {
    /// The stream is already closed at the HTTP/2 layer
    #[error("stream {0} already closed")]
    StreamClosed(StreamId),

    /// The connection is closed or closing
    #[error("connection closed")]
    ConnectionClosed,

    /// No more locally-initiated stream ids are available
    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    /// Any other encoder failure
    #[error("{0}")]
    Other(String),
}
