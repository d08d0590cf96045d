//! Events delivered upward from virtual channels

use bytes::Bytes;
use h2::Reason;

use crate::error::Error;
use crate::frame::{Priority, StreamId};

/// Local identity of a virtual channel
///
/// Assigned at creation and stable for the channel's lifetime, unlike the
/// HTTP/2 stream id which a client channel only receives once its
/// handshake is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// How the peer ended a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteClose {
    /// RST_STREAM received
    Reset(Reason),
    /// DATA or trailers with END_STREAM received
    EndOfStream,
    /// The parent connection went inactive
    ConnectionClosed,
}

/// User-level events a channel emits besides data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    RemoteClosed(RemoteClose),
    GoAway {
        last_stream_id: StreamId,
        reason: Reason,
    },
    /// A locally requested priority weight was written
    PriorityApplied(u16),
    /// The peer sent PRIORITY for this stream
    PeerPriority(Priority),
    /// Client handshake completed; carries what the server selected
    HandshakeCompleted {
        subprotocol: Option<String>,
        extensions: Option<String>,
    },
}

/// Everything the multiplexer reports to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Server side: an inbound extended CONNECT was accepted
    Opened {
        channel: ChannelId,
        stream_id: StreamId,
        path: String,
        subprotocol: Option<String>,
    },
    /// Inbound WebSocket bytes
    Read { channel: ChannelId, data: Bytes },
    /// The current read finished
    ReadComplete { channel: ChannelId },
    WritabilityChanged { channel: ChannelId, writable: bool },
    User { channel: ChannelId, event: StreamEvent },
    Exception { channel: ChannelId, error: Error },
    Inactive { channel: ChannelId },
    Unregistered { channel: ChannelId },
}

impl ChannelEvent {
    /// Channel the event belongs to
    pub fn channel(&self) -> ChannelId {
        match self {
            ChannelEvent::Opened { channel, .. }
            | ChannelEvent::Read { channel, .. }
            | ChannelEvent::ReadComplete { channel }
            | ChannelEvent::WritabilityChanged { channel, .. }
            | ChannelEvent::User { channel, .. }
            | ChannelEvent::Exception { channel, .. }
            | ChannelEvent::Inactive { channel }
            | ChannelEvent::Unregistered { channel } => *channel,
        }
    }
}
