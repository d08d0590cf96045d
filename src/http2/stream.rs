//! Virtual stream channel: one WebSocket conversation on one HTTP/2 stream
//!
//! This module holds the per-channel state and its local transitions: the
//! read-demand state machine, outbound watermark accounting and the close
//! bookkeeping. Anything that has to touch the connection (writing frames,
//! emitting events, the registry) is driven by the multiplexer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::completion::Promise;
use crate::error::Error;
use crate::event::ChannelId;
use crate::frame::StreamId;
use crate::http2::handshake::{HandshakeState, PreHandshakeBuffer};
use crate::protocol::{Role, WebSocketConfig};

#[cfg(feature = "permessage-deflate")]
use crate::extension::DeflateConfig;

/// Read-demand state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDemand {
    /// No read requested; inbound data is queued
    Idle,
    /// A read is running; inbound data is delivered
    InProgress,
    /// A further read was requested while one was running
    Requested,
}

/// Which side closed the stream first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    Local,
    Remote,
}

/// Shared, lock-free writability bit
///
/// Cloned handles observe the same bit. Transitions go through
/// compare-and-swap so each edge is reported to exactly one caller even if
/// a completion callback races with the connection executor.
#[derive(Debug, Clone)]
pub struct WritabilityHandle {
    writable: Arc<AtomicBool>,
}

impl WritabilityHandle {
    fn new() -> Self {
        Self {
            writable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Flip to `writable`; true if this call performed the transition
    fn transition(&self, writable: bool) -> bool {
        self.writable
            .compare_exchange(!writable, writable, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// An inbound item parked until there is read demand
#[derive(Debug)]
pub(crate) enum Inbound {
    Data { data: Bytes, end_stream: bool },
    /// Trailing HEADERS with END_STREAM: end of stream, nothing to deliver
    Trailers,
}

impl Inbound {
    pub fn len(&self) -> usize {
        match self {
            Inbound::Data { data, .. } => data.len(),
            Inbound::Trailers => 0,
        }
    }
}

/// An accepted DATA write waiting for its completion
#[derive(Debug)]
pub(crate) struct InflightWrite {
    pub channel: ChannelId,
    pub size: usize,
    pub promise: Option<Promise>,
}

/// Per-channel state
#[derive(Debug)]
pub struct StreamChannel {
    pub(crate) id: ChannelId,
    /// 0 until assigned, then immutable
    pub(crate) stream_id: StreamId,
    pub(crate) path: String,
    pub(crate) subprotocol: Option<String>,
    pub(crate) role: Role,
    pub(crate) websocket: WebSocketConfig,
    #[cfg(feature = "permessage-deflate")]
    pub(crate) compression: Option<DeflateConfig>,

    // read side
    pub(crate) demand: ReadDemand,
    pub(crate) inbound: VecDeque<Inbound>,
    pub(crate) read_budget: usize,
    pub(crate) delivered_in_read: usize,
    pub(crate) read_complete_pending: bool,
    pub(crate) auto_read: bool,
    pub(crate) inbound_closed: bool,
    pub(crate) remote_close_reported: bool,

    // write side
    pub(crate) pending_outbound_bytes: usize,
    pub(crate) writability: WritabilityHandle,
    pub(crate) flush_pending: bool,
    pub(crate) outbound_closed: bool,

    // lifecycle
    pub(crate) closed: bool,
    pub(crate) close_initiator: Option<CloseInitiator>,
    pub(crate) remote_reset: bool,
    pub(crate) pending_weight: Option<u16>,

    // client handshake
    pub(crate) handshake: HandshakeState,
    pub(crate) pre_handshake: PreHandshakeBuffer,
    pub(crate) requested_subprotocol: Option<String>,
}

impl StreamChannel {
    pub(crate) fn new(
        id: ChannelId,
        role: Role,
        path: String,
        websocket: WebSocketConfig,
        auto_read: bool,
    ) -> Self {
        let handshake = match role {
            Role::Client => HandshakeState::AwaitingSettings,
            Role::Server => HandshakeState::Complete,
        };
        Self {
            id,
            stream_id: 0,
            path,
            subprotocol: None,
            role,
            websocket,
            #[cfg(feature = "permessage-deflate")]
            compression: None,
            demand: ReadDemand::Idle,
            inbound: VecDeque::new(),
            read_budget: 0,
            delivered_in_read: 0,
            read_complete_pending: false,
            auto_read,
            inbound_closed: false,
            remote_close_reported: false,
            pending_outbound_bytes: 0,
            writability: WritabilityHandle::new(),
            flush_pending: false,
            outbound_closed: false,
            closed: false,
            close_initiator: None,
            remote_reset: false,
            pending_weight: None,
            handshake,
            pre_handshake: PreHandshakeBuffer::new(),
            requested_subprotocol: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// HTTP/2 stream id, 0 until assigned
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn is_writable(&self) -> bool {
        self.writability.is_writable()
    }

    pub fn pending_outbound_bytes(&self) -> usize {
        self.pending_outbound_bytes
    }

    pub fn read_demand(&self) -> ReadDemand {
        self.demand
    }

    pub fn close_initiator(&self) -> Option<CloseInitiator> {
        self.close_initiator
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake
    }

    /// Frames parked waiting for read demand
    pub fn queued_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Stream is closed in both directions
    pub(crate) fn is_stream_closed(&self) -> bool {
        self.remote_reset || (self.inbound_closed && self.outbound_closed)
    }

    /// `begin_read` transition; true if a drain should start
    pub(crate) fn request_read(&mut self, budget: usize) -> bool {
        match self.demand {
            ReadDemand::Idle => {
                self.demand = ReadDemand::InProgress;
                self.read_budget = budget;
                self.delivered_in_read = 0;
                true
            }
            ReadDemand::InProgress => {
                self.demand = ReadDemand::Requested;
                false
            }
            ReadDemand::Requested => false,
        }
    }

    /// Account one delivered frame; true when the budget is spent
    pub(crate) fn consume_budget(&mut self) -> bool {
        self.read_budget = self.read_budget.saturating_sub(1);
        self.delivered_in_read += 1;
        self.read_budget == 0
    }

    /// Transition after read complete fired
    pub(crate) fn finish_read(&mut self, budget: usize) {
        self.read_complete_pending = false;
        self.delivered_in_read = 0;
        self.demand = match self.demand {
            ReadDemand::Requested => ReadDemand::InProgress,
            ReadDemand::InProgress if self.auto_read => ReadDemand::InProgress,
            _ => ReadDemand::Idle,
        };
        self.read_budget = if self.demand == ReadDemand::Idle {
            0
        } else {
            budget
        };
    }

    /// Record the side that closed first; later calls are ignored
    pub(crate) fn set_close_initiator(&mut self, initiator: CloseInitiator) {
        if self.close_initiator.is_none() {
            self.close_initiator = Some(initiator);
        }
    }

    /// Add outbound bytes; true if the channel just became unwritable
    pub(crate) fn increment_pending(&mut self, size: usize, high_watermark: usize) -> bool {
        let old = self.pending_outbound_bytes;
        let new = old.saturating_add(size);
        self.pending_outbound_bytes = new;
        if old <= high_watermark && new > high_watermark {
            return self.writability.transition(false);
        }
        false
    }

    /// Remove outbound bytes; true if the channel just became writable
    pub(crate) fn decrement_pending(
        &mut self,
        size: usize,
        low_watermark: usize,
        parent_writable: bool,
    ) -> bool {
        let old = self.pending_outbound_bytes;
        let new = old.saturating_sub(size);
        self.pending_outbound_bytes = new;
        if old >= low_watermark && new < low_watermark && parent_writable {
            return self.writability.transition(true);
        }
        false
    }

    /// Parent turned writable: recover a channel already below the low mark
    pub(crate) fn parent_writable(&mut self, low_watermark: usize) -> bool {
        if self.pending_outbound_bytes < low_watermark && !self.is_writable() {
            return self.writability.transition(true);
        }
        false
    }

    /// Fail writes buffered before the handshake and stop counting them
    /// as pending; `None` if the buffer was already settled
    pub(crate) fn fail_pre_handshake(&mut self, cause: &Error) -> Option<usize> {
        self.pending_outbound_bytes = self
            .pending_outbound_bytes
            .saturating_sub(self.pre_handshake.buffered_bytes());
        if self.handshake.is_pending() {
            self.handshake = HandshakeState::Failed;
        }
        self.pre_handshake.fail(cause)
    }

    /// Drop every queued inbound frame; returns (frames, bytes) released
    pub(crate) fn release_inbound(&mut self) -> (usize, usize) {
        let frames = self.inbound.len();
        let bytes = self.inbound.iter().map(Inbound::len).sum();
        self.inbound.clear();
        (frames, bytes)
    }
}
