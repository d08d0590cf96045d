//! HTTP/2 frames crossing the connection-layer seam
//!
//! The HTTP/2 codec itself lives in the connection layer. This module only
//! models the frames it hands to the multiplexer and the two traits the
//! multiplexer consumes from it:
//!
//! - [`FrameEncoder`]: stream-id parameterized writes plus connection signals
//! - [`FrameListener`]: the next listener in the chain, receiving every frame
//!   that does not belong to a WebSocket stream

use bytes::Bytes;
use h2::Reason;
use http::{HeaderMap, Method, StatusCode};

use crate::error::EncoderError;

/// HTTP/2 stream identifier (0 is the connection itself)
pub type StreamId = u32;

/// Connection-level stream id
pub const CONNECTION_STREAM_ID: StreamId = 0;

/// Default HTTP/2 stream weight (RFC 7540 §5.3.5)
pub const DEFAULT_PRIORITY_WEIGHT: u16 = 16;

/// Identifies one DATA write so its completion can be matched later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteId(pub u64);

/// Pseudo-header fields of a HEADERS frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PseudoHeaders {
    pub method: Option<Method>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    /// `:protocol` (RFC 8441 extended CONNECT)
    pub protocol: Option<String>,
    pub status: Option<StatusCode>,
}

/// A decoded header block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    pub pseudo: PseudoHeaders,
    pub fields: HeaderMap,
}

impl Headers {
    /// Header block carrying only a `:status`
    pub fn response(status: StatusCode) -> Self {
        Self {
            pseudo: PseudoHeaders {
                status: Some(status),
                ..Default::default()
            },
            fields: HeaderMap::new(),
        }
    }

    /// Get a regular header as `&str`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Stream dependency carried by PRIORITY (and prioritized HEADERS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub dependency: StreamId,
    /// Weight in 1..=256
    pub weight: u16,
    pub exclusive: bool,
}

impl Priority {
    /// Priority with the default dependency on the connection
    pub fn with_weight(weight: u16) -> Self {
        Self {
            dependency: CONNECTION_STREAM_ID,
            weight,
            exclusive: false,
        }
    }
}

/// The subset of peer SETTINGS the multiplexer cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_MAX_CONCURRENT_STREAMS
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_ENABLE_CONNECT_PROTOCOL (RFC 8441 §3)
    pub enable_connect_protocol: Option<bool>,
}

/// An inbound HTTP/2 frame, already decoded by the connection layer
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream_id: StreamId,
        payload: Bytes,
        /// Pad length; padded DATA is never valid on a WebSocket stream
        padding: u8,
        end_stream: bool,
    },
    Headers {
        stream_id: StreamId,
        headers: Headers,
        end_stream: bool,
    },
    RstStream {
        stream_id: StreamId,
        reason: Reason,
    },
    Priority {
        stream_id: StreamId,
        priority: Priority,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    Settings(Settings),
    GoAway {
        last_stream_id: StreamId,
        reason: Reason,
        debug_data: Bytes,
    },
    Unknown {
        stream_id: StreamId,
        frame_type: u8,
        flags: u8,
        payload: Bytes,
    },
}

impl Frame {
    /// Stream id the frame is addressed to (0 for connection frames)
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings(_) | Frame::GoAway { .. } => CONNECTION_STREAM_ID,
        }
    }

    /// Payload bytes held by the frame (what is released when it is dropped)
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Data { payload, .. } | Frame::Unknown { payload, .. } => payload.len(),
            Frame::GoAway { debug_data, .. } => debug_data.len(),
            _ => 0,
        }
    }

    /// Short frame type name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Data { .. } => "DATA",
            Frame::Headers { .. } => "HEADERS",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Priority { .. } => "PRIORITY",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Settings(_) => "SETTINGS",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::Unknown { .. } => "UNKNOWN",
        }
    }
}

/// Write side of the shared HTTP/2 connection
///
/// Writes are queued by the encoder and go out on `flush`. DATA writes carry
/// a [`WriteId`]; the connection layer reports their outcome back through
/// `Multiplexer::on_write_complete`. A synchronous `Err` means the write was
/// never queued.
pub trait FrameEncoder {
    /// Allocate the next locally-initiated stream id
    fn reserve_stream_id(&mut self) -> Result<StreamId, EncoderError>;

    fn write_headers(
        &mut self,
        stream_id: StreamId,
        headers: Headers,
        end_stream: bool,
    ) -> Result<(), EncoderError>;

    fn write_data(
        &mut self,
        write_id: WriteId,
        stream_id: StreamId,
        payload: Bytes,
        end_stream: bool,
    ) -> Result<(), EncoderError>;

    fn write_rst_stream(&mut self, stream_id: StreamId, reason: Reason)
        -> Result<(), EncoderError>;

    fn write_priority(&mut self, stream_id: StreamId, priority: Priority)
        -> Result<(), EncoderError>;

    fn flush(&mut self);

    /// Connection is open and can carry frames
    fn is_active(&self) -> bool;

    /// Connection-level writability (its own outbound buffer below watermark)
    fn is_writable(&self) -> bool;

    /// Inbound DATA bytes handed to the application; lets the connection
    /// layer replenish the stream receive window.
    fn consume_bytes(&mut self, _stream_id: StreamId, _bytes: usize) {}
}

/// Receiver of frames the multiplexer does not own
pub trait FrameListener {
    fn on_frame(&mut self, frame: Frame);

    fn on_connection_inactive(&mut self) {}
}

/// Terminal listener: drops (releases) every frame it is given
impl FrameListener for () {
    fn on_frame(&mut self, _frame: Frame) {}
}

impl<L: FrameListener + ?Sized> FrameListener for Box<L> {
    fn on_frame(&mut self, frame: Frame) {
        (**self).on_frame(frame)
    }

    fn on_connection_inactive(&mut self) {
        (**self).on_connection_inactive()
    }
}
