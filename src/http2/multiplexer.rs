//! Connection-scope frame dispatcher and virtual channel driver
//!
//! One [`Multiplexer`] sits on one HTTP/2 connection. Every inbound frame
//! passes through [`Multiplexer::on_frame`]: frames for a registered
//! WebSocket stream are handled by its channel, frames for a recently closed
//! stream are absorbed, everything else goes to the next listener.
//!
//! All state is owned here and mutated through `&mut self`, so whoever owns
//! the multiplexer is the connection executor. Work that must not run inside
//! the current call (teardown notifications, writability edges raised by a
//! write) is queued and runs on [`Multiplexer::run_pending_tasks`]. Timers
//! are deadlines: [`Multiplexer::poll_timeout`] reports the next one and
//! [`Multiplexer::handle_timeout`] fires everything due.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::Bytes;
use h2::Reason;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::completion::{Completion, Promise};
use crate::error::{EncoderError, Error, Result};
use crate::event::{ChannelEvent, ChannelId, RemoteClose, StreamEvent};
use crate::frame::{
    Frame, FrameEncoder, FrameListener, Headers, Priority, Settings, StreamId, WriteId,
};
use crate::http2::batch::{Enqueue, ReadCompleteBatcher};
use crate::http2::handshake::HandshakeState;
use crate::http2::registry::{Slot, StreamRegistry};
use crate::http2::stream::{
    CloseInitiator, Inbound, InflightWrite, ReadDemand, StreamChannel, WritabilityHandle,
};
use crate::protocol::{Role, WebSocketConfig};
use crate::Config;

#[cfg(feature = "permessage-deflate")]
use crate::extension::DeflateConfig;

/// Connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Frames released without being delivered to a channel
    pub discarded_frames: u64,
    /// Payload bytes of those frames
    pub discarded_bytes: u64,
    /// Frames handed to the next listener
    pub forwarded_frames: u64,
    /// Client channels opened
    pub opened: u64,
    /// Server channels accepted
    pub accepted: u64,
    pub closed: u64,
}

/// Work deferred to the next executor turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    FireWritability { channel: ChannelId, writable: bool },
    Teardown(ChannelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum Timer {
    /// Drop the closed-stream sentinel for this id
    RegistryRemoval(StreamId),
    HandshakeTimeout(ChannelId),
}

/// How a channel is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CloseKind {
    /// Local abort: RST_STREAM(CANCEL)
    Reset,
    /// Local end of stream: empty DATA with END_STREAM
    Graceful,
    /// The peer or the connection ended the stream; nothing is written
    Remote,
}

/// Frame that ends our side of a closing stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseFrame {
    /// Empty DATA with END_STREAM
    EndStream,
    /// RST_STREAM(CANCEL)
    Reset,
}

/// What the peer has told us in SETTINGS
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct PeerSettings {
    pub received: bool,
    pub connect_protocol: bool,
    pub max_concurrent_streams: Option<u32>,
}

/// WebSocket-over-HTTP/2 multiplexer for one connection
pub struct Multiplexer<E: FrameEncoder, L: FrameListener = Box<dyn FrameListener>> {
    pub(super) config: Config,
    pub(super) encoder: E,
    next: L,
    pub(super) registry: StreamRegistry<ChannelId>,
    pub(super) channels: HashMap<ChannelId, StreamChannel>,
    next_channel_id: u64,
    batcher: ReadCompleteBatcher,
    /// Inside the connection's read cycle (between a frame and read complete)
    parent_reading: bool,
    pub(super) events: VecDeque<ChannelEvent>,
    tasks: VecDeque<Task>,
    timers: BTreeMap<(Instant, u64), Timer>,
    /// Deadline key of each armed timer; one per target
    timer_keys: HashMap<Timer, (Instant, u64)>,
    timer_seq: u64,
    inflight: HashMap<WriteId, InflightWrite>,
    next_write_id: u64,
    pub(super) peer: PeerSettings,
    pub(super) going_away: Option<Reason>,
    pub(super) stats: Stats,
}

impl<E: FrameEncoder, L: FrameListener> Multiplexer<E, L> {
    /// Create a multiplexer for a connection
    ///
    /// `next` receives every frame that does not belong to a WebSocket
    /// stream.
    pub fn new(config: Config, encoder: E, next: L) -> Result<Self> {
        config.validate()?;
        let batcher = ReadCompleteBatcher::new(config.read_complete_batch_capacity);
        Ok(Self {
            config,
            encoder,
            next,
            registry: StreamRegistry::new(),
            channels: HashMap::new(),
            next_channel_id: 1,
            batcher,
            parent_reading: false,
            events: VecDeque::new(),
            tasks: VecDeque::new(),
            timers: BTreeMap::new(),
            timer_keys: HashMap::new(),
            timer_seq: 0,
            inflight: HashMap::new(),
            next_write_id: 1,
            peer: PeerSettings::default(),
            going_away: None,
            stats: Stats::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }

    pub fn next_listener(&self) -> &L {
        &self.next
    }

    pub fn next_listener_mut(&mut self) -> &mut L {
        &mut self.next
    }

    pub fn registry(&self) -> &StreamRegistry<ChannelId> {
        &self.registry
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Channels that have not been torn down yet
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channel registered under an HTTP/2 stream id
    pub fn channel_for_stream(&self, stream_id: StreamId) -> Option<ChannelId> {
        self.registry.active(stream_id)
    }

    /// Handle onto one channel; `None` once it has been torn down
    pub fn channel(&mut self, id: ChannelId) -> Option<Channel<'_, E, L>> {
        if self.channels.contains_key(&id) {
            Some(Channel { mux: self, id })
        } else {
            None
        }
    }

    /// Next event for the application
    pub fn poll_event(&mut self) -> Option<ChannelEvent> {
        self.events.pop_front()
    }

    /// Drain every queued event
    pub fn drain_events(&mut self) -> Vec<ChannelEvent> {
        self.events.drain(..).collect()
    }

    /// Run deferred work: writability notifications raised inside a write,
    /// and teardown of closed channels
    pub fn run_pending_tasks(&mut self) {
        while let Some(task) = self.tasks.pop_front() {
            match task {
                Task::FireWritability { channel, writable } => {
                    if self.channels.contains_key(&channel) {
                        self.events
                            .push_back(ChannelEvent::WritabilityChanged { channel, writable });
                    }
                }
                Task::Teardown(channel) => {
                    if self.channels.remove(&channel).is_some() {
                        debug!(%channel, "channel torn down");
                        self.events.push_back(ChannelEvent::Inactive { channel });
                        self.events.push_back(ChannelEvent::Unregistered { channel });
                    }
                }
            }
        }
    }

    /// True if deferred work is waiting for [`run_pending_tasks`](Self::run_pending_tasks)
    pub fn has_pending_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Earliest timer deadline
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(at, _)| *at)
    }

    /// Fire every timer due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        loop {
            let Some((&key, &timer)) = self.timers.first_key_value() else {
                break;
            };
            if key.0 > now {
                break;
            }
            self.timers.remove(&key);
            self.timer_keys.remove(&timer);
            match timer {
                Timer::RegistryRemoval(stream_id) => {
                    if self.registry.remove_closed(stream_id) {
                        debug!(stream_id, "closed stream sentinel expired");
                    }
                }
                Timer::HandshakeTimeout(channel) => {
                    let pending = self
                        .channels
                        .get(&channel)
                        .is_some_and(|ch| !ch.closed && ch.handshake.is_pending());
                    if pending {
                        self.fail_handshake(channel, Error::Handshake("timed out".into()));
                    }
                }
            }
        }
    }

    /// Arm `timer` at `at`, replacing an earlier deadline for the same target
    pub(super) fn schedule(&mut self, at: Instant, timer: Timer) {
        self.cancel_timer(timer);
        self.timer_seq += 1;
        let key = (at, self.timer_seq);
        self.timers.insert(key, timer);
        self.timer_keys.insert(timer, key);
    }

    pub(super) fn cancel_timer(&mut self, timer: Timer) {
        if let Some(key) = self.timer_keys.remove(&timer) {
            self.timers.remove(&key);
        }
    }

    pub(super) fn allocate_channel(&mut self, role: Role, path: String) -> ChannelId {
        let id = ChannelId(self.next_channel_id);
        self.next_channel_id += 1;
        let mut channel = StreamChannel::new(
            id,
            role,
            path,
            self.config.websocket,
            self.config.auto_read,
        );
        if channel.auto_read {
            channel.request_read(self.config.max_messages_per_read);
        }
        self.channels.insert(id, channel);
        id
    }

    /// Channel ids in creation order
    pub(super) fn open_channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self
            .channels
            .values()
            .filter(|ch| !ch.closed)
            .map(|ch| ch.id)
            .collect();
        ids.sort();
        ids
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Handle one inbound frame
    ///
    /// The connection layer calls this for every decoded frame of a read
    /// cycle and then [`on_read_complete`](Self::on_read_complete).
    pub fn on_frame(&mut self, frame: Frame) {
        self.parent_reading = true;

        match frame {
            Frame::Settings(settings) => {
                self.on_settings(settings);
                self.forward(Frame::Settings(settings));
            }
            Frame::GoAway {
                last_stream_id,
                reason,
                debug_data,
            } => {
                self.on_go_away(last_stream_id, reason);
                self.forward(Frame::GoAway {
                    last_stream_id,
                    reason,
                    debug_data,
                });
            }
            frame => {
                let stream_id = frame.stream_id();
                match self.registry.get(stream_id) {
                    Some(Slot::Active(channel)) => self.on_channel_frame(channel, frame),
                    Some(Slot::Closed) => {
                        trace!(stream_id, kind = frame.kind(), "frame for closed stream released");
                        self.release(&frame);
                    }
                    None => self.on_unregistered_frame(frame),
                }
            }
        }
    }

    /// The connection finished its read cycle: complete batched reads and
    /// flush once
    pub fn on_read_complete(&mut self) {
        self.drain_batch();
        self.parent_reading = false;
    }

    fn forward(&mut self, frame: Frame) {
        self.stats.forwarded_frames += 1;
        self.next.on_frame(frame);
    }

    fn release(&mut self, frame: &Frame) {
        self.stats.discarded_frames += 1;
        self.stats.discarded_bytes += frame.payload_len() as u64;
    }

    fn on_unregistered_frame(&mut self, frame: Frame) {
        if self.config.role == Role::Server {
            if let Frame::Headers {
                stream_id,
                headers,
                end_stream,
            } = frame
            {
                match self.accept_candidate(&headers) {
                    Some(request) => self.accept_stream(stream_id, request, end_stream),
                    None => self.forward(Frame::Headers {
                        stream_id,
                        headers,
                        end_stream,
                    }),
                }
                return;
            }
        }
        trace!(stream_id = frame.stream_id(), kind = frame.kind(), "frame forwarded");
        self.forward(frame);
    }

    fn on_channel_frame(&mut self, id: ChannelId, frame: Frame) {
        match frame {
            Frame::Data {
                stream_id,
                payload,
                padding,
                end_stream,
            } => self.on_data(id, stream_id, payload, padding, end_stream),
            Frame::Headers {
                headers, end_stream, ..
            } => self.on_headers(id, headers, end_stream),
            Frame::RstStream { stream_id, reason } => {
                debug!(%id, stream_id, ?reason, "stream reset by peer");
                self.on_remote_reset(id, reason);
            }
            Frame::Priority { priority, .. } => {
                self.events.push_back(ChannelEvent::User {
                    channel: id,
                    event: StreamEvent::PeerPriority(priority),
                });
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                trace!(%id, stream_id, increment, "stream window update");
            }
            frame @ Frame::Unknown { .. } => {
                trace!(%id, stream_id = frame.stream_id(), "unknown frame released");
                self.release(&frame);
            }
            // Connection-scope frames never reach a channel
            frame @ (Frame::Settings(_) | Frame::GoAway { .. }) => self.forward(frame),
        }
    }

    fn on_data(
        &mut self,
        id: ChannelId,
        stream_id: StreamId,
        payload: Bytes,
        padding: u8,
        end_stream: bool,
    ) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };

        let violation = if padding > 0 {
            Some("padded DATA frame")
        } else if ch.handshake.is_pending() {
            Some("DATA before handshake completed")
        } else if ch.inbound_closed {
            Some("DATA after end of stream")
        } else {
            None
        };
        if let Some(reason) = violation {
            warn!(%id, stream_id, reason, "stream protocol error");
            self.stats.discarded_frames += 1;
            self.stats.discarded_bytes += payload.len() as u64;
            self.stream_exception(id, Error::StreamProtocol(reason));
            return;
        }

        trace!(%id, stream_id, bytes = payload.len(), end_stream, "data queued");
        ch.inbound.push_back(Inbound::Data {
            data: payload,
            end_stream,
        });
        if end_stream {
            ch.inbound_closed = true;
            ch.set_close_initiator(CloseInitiator::Remote);
        }
        if ch.demand != ReadDemand::Idle {
            self.drain(id);
        }
    }

    fn on_headers(&mut self, id: ChannelId, headers: Headers, end_stream: bool) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };

        if ch.handshake == HandshakeState::RequestSent {
            self.on_handshake_response(id, &headers, end_stream);
            return;
        }

        if !end_stream || ch.inbound_closed {
            warn!(%id, stream_id = ch.stream_id, "unexpected HEADERS on established stream");
            self.stream_exception(id, Error::StreamProtocol("unexpected HEADERS"));
            return;
        }

        trace!(%id, stream_id = ch.stream_id, "trailers ended stream");
        ch.inbound.push_back(Inbound::Trailers);
        ch.inbound_closed = true;
        ch.set_close_initiator(CloseInitiator::Remote);
        if ch.demand != ReadDemand::Idle {
            self.drain(id);
        }
    }

    fn on_remote_reset(&mut self, id: ChannelId, reason: Reason) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        ch.remote_reset = true;
        ch.set_close_initiator(CloseInitiator::Remote);
        ch.fail_pre_handshake(&Error::StreamReset(reason));
        self.events.push_back(ChannelEvent::User {
            channel: id,
            event: StreamEvent::RemoteClosed(RemoteClose::Reset(reason)),
        });
        self.close_channel(id, CloseKind::Remote);
    }

    fn on_settings(&mut self, settings: Settings) {
        self.peer.received = true;
        if let Some(enabled) = settings.enable_connect_protocol {
            self.peer.connect_protocol = enabled;
        }
        if let Some(max) = settings.max_concurrent_streams {
            self.peer.max_concurrent_streams = Some(max);
            let capacity = self
                .config
                .read_complete_batch_capacity
                .min(max as usize)
                .max(1);
            self.batcher.set_capacity(capacity);
        }
        trace!(
            connect_protocol = self.peer.connect_protocol,
            max_concurrent_streams = ?self.peer.max_concurrent_streams,
            "peer settings"
        );
        self.start_deferred_handshakes();
    }

    fn on_go_away(&mut self, last_stream_id: StreamId, reason: Reason) {
        debug!(last_stream_id, ?reason, "connection going away");
        self.going_away = Some(reason);

        for id in self.open_channels() {
            let Some(ch) = self.channels.get(&id) else {
                continue;
            };
            let stream_id = ch.stream_id;
            self.events.push_back(ChannelEvent::User {
                channel: id,
                event: StreamEvent::GoAway {
                    last_stream_id,
                    reason,
                },
            });
            if stream_id == 0 {
                self.fail_handshake(id, Error::GoAway(reason));
            } else if stream_id > last_stream_id {
                // Never processed by the peer
                self.events.push_back(ChannelEvent::Exception {
                    channel: id,
                    error: Error::GoAway(reason),
                });
                self.close_channel(id, CloseKind::Remote);
            }
        }
    }

    /// The parent connection closed
    pub fn on_connection_inactive(&mut self) {
        debug!(channels = self.channels.len(), "connection inactive");

        // In-flight writes carry the connection error, not ChannelClosed
        for (_, write) in self.inflight.drain() {
            if let Some(promise) = write.promise {
                promise.fail(Error::ConnectionClosed);
            }
        }

        for id in self.open_channels() {
            if let Some(ch) = self.channels.get_mut(&id) {
                ch.fail_pre_handshake(&Error::ConnectionClosed);
            }
            self.events.push_back(ChannelEvent::User {
                channel: id,
                event: StreamEvent::RemoteClosed(RemoteClose::ConnectionClosed),
            });
            self.close_channel(id, CloseKind::Remote);
        }

        self.registry.clear();
        self.timers.clear();
        self.timer_keys.clear();
        self.batcher.clear();
        self.parent_reading = false;

        self.next.on_connection_inactive();
    }

    /// Route a per-stream error to its channel
    ///
    /// Errors for streams without a live channel are handed back.
    pub fn on_stream_error(&mut self, stream_id: StreamId, error: Error) -> Result<()> {
        match self.registry.active(stream_id) {
            Some(id) => {
                warn!(%id, stream_id, %error, "stream error");
                self.stream_exception(id, error);
                Ok(())
            }
            None => Err(error),
        }
    }

    /// Connection-level writability changed
    pub fn on_connection_writability_changed(&mut self, writable: bool) {
        if !writable {
            return;
        }
        let low = self.config.write_buffer_low_watermark;
        for id in self.open_channels() {
            let recovered = self
                .channels
                .get_mut(&id)
                .is_some_and(|ch| ch.parent_writable(low));
            if recovered {
                trace!(%id, "writable after parent recovered");
                self.writability_edge(id, true);
            }
        }
    }

    /// Report a writability edge raised outside a write
    ///
    /// An edge still waiting in the task queue for the same channel must be
    /// seen first, so this one queues behind it.
    fn writability_edge(&mut self, channel: ChannelId, writable: bool) {
        let behind = self.tasks.iter().any(|task| {
            matches!(task, Task::FireWritability { channel: queued, .. } if *queued == channel)
        });
        if behind {
            self.tasks
                .push_back(Task::FireWritability { channel, writable });
        } else {
            self.events
                .push_back(ChannelEvent::WritabilityChanged { channel, writable });
        }
    }

    /// Exception on one channel, then force close
    pub(super) fn stream_exception(&mut self, id: ChannelId, error: Error) {
        self.events.push_back(ChannelEvent::Exception { channel: id, error });
        self.close_channel(id, CloseKind::Reset);
    }

    // ---------------------------------------------------------------------
    // Read demand
    // ---------------------------------------------------------------------

    fn begin_read(&mut self, id: ChannelId) {
        let budget = self.config.max_messages_per_read;
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        if ch.closed {
            return;
        }
        let start = ch.request_read(budget);
        trace!(%id, demand = ?ch.demand, "read requested");
        if start {
            self.drain(id);
        }
    }

    /// Deliver queued inbound data while there is demand
    fn drain(&mut self, id: ChannelId) {
        loop {
            let delivered = self.deliver_queued(id);
            if delivered == 0 || !self.complete_read(id) {
                return;
            }
            // Read completed in place; keep going if demand was re-armed
            let more = self
                .channels
                .get(&id)
                .is_some_and(|ch| !ch.closed && ch.demand != ReadDemand::Idle && !ch.inbound.is_empty());
            if !more {
                return;
            }
        }
    }

    /// One read: deliver until the budget is spent or the queue is empty
    fn deliver_queued(&mut self, id: ChannelId) -> usize {
        let mut delivered = 0;
        loop {
            let Some(ch) = self.channels.get_mut(&id) else {
                return delivered;
            };
            if ch.closed || ch.demand == ReadDemand::Idle {
                return delivered;
            }
            // Spent budget waits for read complete to re-arm it
            if ch.read_budget == 0 && !ch.inbound.is_empty() {
                return delivered;
            }

            let Some(item) = ch.inbound.pop_front() else {
                if ch.is_stream_closed() {
                    debug!(%id, "stream closed in both directions");
                    self.close_channel(id, CloseKind::Remote);
                } else if ch.flush_pending {
                    ch.flush_pending = false;
                    self.encoder.flush();
                }
                return delivered;
            };

            let stream_id = ch.stream_id;
            let end_stream = match item {
                Inbound::Data { data, end_stream } => {
                    let len = data.len();
                    self.events
                        .push_back(ChannelEvent::Read { channel: id, data });
                    self.encoder.consume_bytes(stream_id, len);
                    end_stream
                }
                Inbound::Trailers => true,
            };
            delivered += 1;

            let Some(ch) = self.channels.get_mut(&id) else {
                return delivered;
            };
            if end_stream && !ch.remote_close_reported {
                ch.remote_close_reported = true;
                self.events.push_back(ChannelEvent::User {
                    channel: id,
                    event: StreamEvent::RemoteClosed(RemoteClose::EndOfStream),
                });
            }
            if ch.consume_budget() {
                trace!(%id, delivered, "read budget spent");
                return delivered;
            }
        }
    }

    /// End of a read; true if read complete fired now, false if batched
    fn complete_read(&mut self, id: ChannelId) -> bool {
        let Some(ch) = self.channels.get_mut(&id) else {
            return false;
        };
        if ch.closed || ch.read_complete_pending {
            return false;
        }

        if self.parent_reading && ch.read_budget > 0 {
            let mut outcome = self.batcher.enqueue(id);
            if outcome == Enqueue::Full {
                self.drain_batch();
                outcome = self.batcher.enqueue(id);
            }
            if outcome == Enqueue::Queued {
                if let Some(ch) = self.channels.get_mut(&id) {
                    ch.read_complete_pending = true;
                }
                return false;
            }
        }

        self.fire_read_complete(id);
        true
    }

    fn fire_read_complete(&mut self, id: ChannelId) {
        let budget = self.config.max_messages_per_read;
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.finish_read(budget);
            self.events.push_back(ChannelEvent::ReadComplete { channel: id });
        }
    }

    /// Complete every batched read in FIFO order, then flush once
    fn drain_batch(&mut self) {
        let queued = self.batcher.begin_drain();
        if queued.is_empty() {
            self.batcher.finish_drain();
            return;
        }
        trace!(channels = queued.len(), "draining batched read completes");

        for id in queued {
            let resume = match self.channels.get(&id) {
                Some(ch) if !ch.closed && ch.read_complete_pending => true,
                _ => false,
            };
            if !resume {
                continue;
            }
            self.fire_read_complete(id);
            let more = self
                .channels
                .get(&id)
                .is_some_and(|ch| ch.demand != ReadDemand::Idle && !ch.inbound.is_empty());
            if more {
                self.drain(id);
            }
        }

        self.batcher.finish_drain();
        for ch in self.channels.values_mut() {
            ch.flush_pending = false;
        }
        self.encoder.flush();
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    fn write(&mut self, id: ChannelId, data: Bytes) -> Completion {
        let high = self.config.write_buffer_high_watermark;
        let Some(ch) = self.channels.get_mut(&id) else {
            return Completion::failed(Error::ChannelClosed);
        };
        if ch.closed || ch.outbound_closed {
            return Completion::failed(Error::ChannelClosed);
        }

        let (promise, completion) = Completion::pair();
        let size = data.len();
        if ch.increment_pending(size, high) {
            trace!(%id, pending = ch.pending_outbound_bytes, "unwritable");
            self.tasks.push_back(Task::FireWritability {
                channel: id,
                writable: false,
            });
        }

        if ch.handshake.is_pending() {
            trace!(%id, bytes = size, "write buffered until handshake");
            if let Err((_, promise)) = ch.pre_handshake.push(data, promise) {
                promise.fail(Error::ChannelClosed);
            }
            return completion;
        }

        let stream_id = ch.stream_id;
        self.submit_data(id, stream_id, data, promise);
        completion
    }

    /// Hand one already-accounted DATA write to the encoder
    pub(super) fn submit_data(
        &mut self,
        id: ChannelId,
        stream_id: StreamId,
        data: Bytes,
        promise: Promise,
    ) {
        let write_id = WriteId(self.next_write_id);
        self.next_write_id += 1;
        let size = data.len();
        self.inflight.insert(
            write_id,
            InflightWrite {
                channel: id,
                size,
                promise: Some(promise),
            },
        );
        match self.encoder.write_data(write_id, stream_id, data, false) {
            Ok(()) => {
                if let Some(ch) = self.channels.get_mut(&id) {
                    ch.flush_pending = true;
                }
            }
            Err(err) => self.on_write_complete(write_id, Err(err)),
        }
    }

    fn flush(&mut self, id: ChannelId) {
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.flush_pending = false;
        }
        self.encoder.flush();
    }

    /// Outcome of a DATA write reported by the connection layer
    pub fn on_write_complete(&mut self, write_id: WriteId, result: std::result::Result<(), EncoderError>) {
        let Some(write) = self.inflight.remove(&write_id) else {
            trace!(?write_id, "completion for unknown write");
            return;
        };
        let id = write.channel;
        let low = self.config.write_buffer_low_watermark;
        let parent_writable = self.encoder.is_writable();

        let became_writable = self.channels.get_mut(&id).is_some_and(|ch| {
            let edge = ch.decrement_pending(write.size, low, parent_writable);
            if edge {
                trace!(%id, pending = ch.pending_outbound_bytes, "writable");
            }
            edge
        });
        if became_writable {
            self.writability_edge(id, true);
        }

        match result {
            Ok(()) => {
                if let Some(promise) = write.promise {
                    promise.succeed();
                }
            }
            Err(err) => {
                let error = Error::Write(err);
                warn!(%id, %error, "write failed");
                if let Some(promise) = write.promise {
                    promise.fail(error);
                }
                self.on_write_failure(id);
            }
        }
    }

    fn on_write_failure(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        if ch.closed {
            return;
        }
        if self.config.close_on_write_failure {
            self.close_channel(id, CloseKind::Reset);
            return;
        }
        ch.outbound_closed = true;
        if ch.is_stream_closed() && ch.inbound.is_empty() {
            self.close_channel(id, CloseKind::Remote);
        }
    }

    fn set_priority(&mut self, id: ChannelId, weight: u16) -> Result<()> {
        if !(1..=256).contains(&weight) {
            return Err(Error::InvalidPriority(weight));
        }
        let Some(ch) = self.channels.get_mut(&id) else {
            return Err(Error::ChannelClosed);
        };
        if ch.closed {
            return Err(Error::ChannelClosed);
        }
        if ch.stream_id == 0 {
            trace!(%id, weight, "priority cached until stream id assigned");
            ch.pending_weight = Some(weight);
            return Ok(());
        }
        let stream_id = ch.stream_id;
        self.apply_priority(id, stream_id, weight)?;
        self.encoder.flush();
        Ok(())
    }

    pub(super) fn apply_priority(
        &mut self,
        id: ChannelId,
        stream_id: StreamId,
        weight: u16,
    ) -> Result<()> {
        self.encoder
            .write_priority(stream_id, Priority::with_weight(weight))?;
        self.events.push_back(ChannelEvent::User {
            channel: id,
            event: StreamEvent::PriorityApplied(weight),
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Close
    // ---------------------------------------------------------------------

    /// Close a channel; idempotent
    ///
    /// The returned completion is already resolved. Teardown
    /// (`Inactive`, `Unregistered`) follows on the next
    /// [`run_pending_tasks`](Self::run_pending_tasks).
    pub(super) fn close_channel(&mut self, id: ChannelId, kind: CloseKind) -> Completion {
        let active = self.encoder.is_active();
        let Some(ch) = self.channels.get_mut(&id) else {
            return Completion::ready(Ok(()));
        };
        if ch.closed {
            return Completion::ready(Ok(()));
        }
        ch.closed = true;
        ch.set_close_initiator(match kind {
            CloseKind::Remote => CloseInitiator::Remote,
            CloseKind::Reset | CloseKind::Graceful => CloseInitiator::Local,
        });

        let stream_id = ch.stream_id;
        let can_write = stream_id != 0 && active && !ch.remote_reset && kind != CloseKind::Remote;
        // After the peer's END_STREAM only our half is left to end; no reset
        let close_frame = match (kind, ch.inbound_closed, ch.outbound_closed) {
            _ if !can_write => None,
            (CloseKind::Graceful, _, false) | (_, true, false) => Some(CloseFrame::EndStream),
            (_, true, true) => None,
            _ => Some(CloseFrame::Reset),
        };
        ch.outbound_closed = true;

        let (frames, bytes) = ch.release_inbound();
        self.stats.discarded_frames += frames as u64;
        self.stats.discarded_bytes += bytes as u64;

        ch.fail_pre_handshake(&Error::ChannelClosed);
        ch.read_complete_pending = false;
        let initiator = ch.close_initiator;

        debug!(%id, stream_id, ?kind, ?initiator, "channel closed");

        if let Some(frame) = close_frame {
            let written = match frame {
                CloseFrame::EndStream => {
                    let write_id = WriteId(self.next_write_id);
                    self.next_write_id += 1;
                    self.encoder.write_data(write_id, stream_id, Bytes::new(), true)
                }
                CloseFrame::Reset => self.encoder.write_rst_stream(stream_id, Reason::CANCEL),
            };
            if let Err(err) = written {
                debug!(%id, stream_id, %err, "close frame not written");
            }
            self.encoder.flush();
        }

        let mut outstanding = Vec::new();
        self.inflight.retain(|_, write| {
            if write.channel != id {
                return true;
            }
            outstanding.extend(write.promise.take());
            false
        });
        for promise in outstanding {
            promise.fail(Error::ChannelClosed);
        }

        self.batcher.remove(id);
        self.cancel_timer(Timer::HandshakeTimeout(id));

        if stream_id != 0 {
            if active && initiator == Some(CloseInitiator::Local) {
                self.registry.mark_closed(stream_id);
                let at = Instant::now() + self.config.closed_stream_grace;
                self.schedule(at, Timer::RegistryRemoval(stream_id));
            } else {
                self.registry.remove(stream_id);
            }
        }

        self.stats.closed += 1;
        self.tasks.push_back(Task::Teardown(id));
        Completion::ready(Ok(()))
    }
}

/// Handle onto one virtual channel
///
/// Borrowed from [`Multiplexer::channel`]; the channel stays present for
/// the handle's lifetime since teardown needs the multiplexer itself.
pub struct Channel<'a, E: FrameEncoder, L: FrameListener = Box<dyn FrameListener>> {
    mux: &'a mut Multiplexer<E, L>,
    id: ChannelId,
}

impl<E: FrameEncoder, L: FrameListener> Channel<'_, E, L> {
    fn state(&self) -> &StreamChannel {
        &self.mux.channels[&self.id]
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Read-only view of the channel state
    pub fn stream(&self) -> &StreamChannel {
        self.state()
    }

    /// HTTP/2 stream id, 0 until assigned
    pub fn stream_id(&self) -> StreamId {
        self.state().stream_id()
    }

    pub fn path(&self) -> &str {
        self.state().path()
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.state().subprotocol()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn is_writable(&self) -> bool {
        self.state().is_writable()
    }

    /// Observable from other threads
    pub fn writability_handle(&self) -> WritabilityHandle {
        self.state().writability.clone()
    }

    /// Settings for this channel's WebSocket decoder and encoder
    pub fn decoder_config(&self) -> WebSocketConfig {
        self.state().websocket
    }

    /// Negotiated permessage-deflate parameters
    #[cfg(feature = "permessage-deflate")]
    pub fn compression(&self) -> Option<&DeflateConfig> {
        self.state().compression.as_ref()
    }

    /// Signal demand for inbound data
    pub fn begin_read(&mut self) {
        self.mux.begin_read(self.id);
    }

    /// Toggle automatic read demand after each read complete
    pub fn set_auto_read(&mut self, enabled: bool) {
        let start = {
            let budget = self.mux.config.max_messages_per_read;
            let Some(ch) = self.mux.channels.get_mut(&self.id) else {
                return;
            };
            ch.auto_read = enabled;
            enabled && ch.demand == ReadDemand::Idle && ch.request_read(budget)
        };
        if start {
            self.mux.drain(self.id);
        }
    }

    /// Queue one WebSocket payload as an HTTP/2 DATA frame
    pub fn write(&mut self, data: impl Into<Bytes>) -> Completion {
        self.mux.write(self.id, data.into())
    }

    pub fn flush(&mut self) {
        self.mux.flush(self.id);
    }

    pub fn write_and_flush(&mut self, data: impl Into<Bytes>) -> Completion {
        let completion = self.write(data);
        self.flush();
        completion
    }

    /// Abort the stream with RST_STREAM(CANCEL)
    pub fn close(&mut self) -> Completion {
        self.mux.close_channel(self.id, CloseKind::Reset)
    }

    /// End the stream with an empty END_STREAM DATA frame
    pub fn close_gracefully(&mut self) -> Completion {
        self.mux.close_channel(self.id, CloseKind::Graceful)
    }

    /// Set the HTTP/2 weight (1..=256), deferred until a stream id exists
    pub fn set_priority(&mut self, weight: u16) -> Result<()> {
        self.mux.set_priority(self.id, weight)
    }
}
