//! End-to-end behavior of the multiplexer against a recording encoder

use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use h2::Reason;
use http::StatusCode;
use sockudo_mux::extended_connect::ExtendedConnectRequest;
use sockudo_mux::frame::{Headers, Priority, Settings, WriteId};
use sockudo_mux::http2::Slot;
use sockudo_mux::{
    ChannelEvent, ChannelId, Config, EncoderError, Error, Frame, FrameEncoder, FrameListener,
    Multiplexer, RemoteClose, Role, StreamEvent, StreamId,
};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
enum Wire {
    Headers {
        stream_id: StreamId,
        status: Option<StatusCode>,
        end_stream: bool,
    },
    Data {
        write_id: WriteId,
        stream_id: StreamId,
        payload: Bytes,
        end_stream: bool,
    },
    Reset(StreamId, Reason),
    Priority(StreamId, u16),
    Flush,
}

#[derive(Debug)]
struct RecordingEncoder {
    wire: Vec<Wire>,
    next_stream_id: StreamId,
    active: bool,
    writable: bool,
}

impl Default for RecordingEncoder {
    fn default() -> Self {
        Self {
            wire: Vec::new(),
            next_stream_id: 1,
            active: true,
            writable: true,
        }
    }
}

impl RecordingEncoder {
    fn resets(&self) -> Vec<(StreamId, Reason)> {
        self.wire
            .iter()
            .filter_map(|w| match w {
                Wire::Reset(id, reason) => Some((*id, *reason)),
                _ => None,
            })
            .collect()
    }

    fn data(&self) -> Vec<(WriteId, Bytes)> {
        self.wire
            .iter()
            .filter_map(|w| match w {
                Wire::Data {
                    write_id, payload, ..
                } => Some((*write_id, payload.clone())),
                _ => None,
            })
            .collect()
    }
}

impl FrameEncoder for RecordingEncoder {
    fn reserve_stream_id(&mut self) -> Result<StreamId, EncoderError> {
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        Ok(id)
    }

    fn write_headers(
        &mut self,
        stream_id: StreamId,
        headers: Headers,
        end_stream: bool,
    ) -> Result<(), EncoderError> {
        self.wire.push(Wire::Headers {
            stream_id,
            status: headers.pseudo.status,
            end_stream,
        });
        Ok(())
    }

    fn write_data(
        &mut self,
        write_id: WriteId,
        stream_id: StreamId,
        payload: Bytes,
        end_stream: bool,
    ) -> Result<(), EncoderError> {
        self.wire.push(Wire::Data {
            write_id,
            stream_id,
            payload,
            end_stream,
        });
        Ok(())
    }

    fn write_rst_stream(&mut self, stream_id: StreamId, reason: Reason) -> Result<(), EncoderError> {
        self.wire.push(Wire::Reset(stream_id, reason));
        Ok(())
    }

    fn write_priority(&mut self, stream_id: StreamId, priority: Priority) -> Result<(), EncoderError> {
        self.wire.push(Wire::Priority(stream_id, priority.weight));
        Ok(())
    }

    fn flush(&mut self) {
        self.wire.push(Wire::Flush);
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

#[derive(Debug, Default)]
struct RecordingListener {
    frames: Vec<Frame>,
    inactive: bool,
}

impl FrameListener for RecordingListener {
    fn on_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    fn on_connection_inactive(&mut self) {
        self.inactive = true;
    }
}

type Mux = Multiplexer<RecordingEncoder, RecordingListener>;

fn server_with(builder: sockudo_mux::ConfigBuilder) -> Mux {
    Multiplexer::new(
        builder.role(Role::Server).build(),
        RecordingEncoder::default(),
        RecordingListener::default(),
    )
    .unwrap()
}

fn client_with(builder: sockudo_mux::ConfigBuilder) -> Mux {
    Multiplexer::new(
        builder.role(Role::Client).build(),
        RecordingEncoder::default(),
        RecordingListener::default(),
    )
    .unwrap()
}

/// Peer opens a WebSocket on `stream_id`; returns the accepted channel
fn open(mux: &mut Mux, stream_id: StreamId) -> ChannelId {
    let request = ExtendedConnectRequest::for_path("example.com", "/ws", None);
    mux.on_frame(Frame::Headers {
        stream_id,
        headers: request.to_headers(),
        end_stream: false,
    });
    mux.on_read_complete();
    let id = mux.channel_for_stream(stream_id).unwrap();
    assert!(matches!(
        mux.poll_event(),
        Some(ChannelEvent::Opened { channel, .. }) if channel == id
    ));
    mux.drain_events();
    mux.encoder_mut().wire.clear();
    id
}

fn data(stream_id: StreamId, payload: &'static [u8], end_stream: bool) -> Frame {
    Frame::Data {
        stream_id,
        payload: Bytes::from_static(payload),
        padding: 0,
        end_stream,
    }
}

#[test]
fn scenario_a_end_of_stream_after_data() {
    let mut mux = server_with(Config::builder());
    let id = open(&mut mux, 3);

    mux.on_frame(data(3, b"hello", false));
    mux.on_frame(data(3, b"", true));
    mux.on_read_complete();

    assert_eq!(
        mux.drain_events(),
        vec![
            ChannelEvent::Read {
                channel: id,
                data: Bytes::from_static(b"hello"),
            },
            ChannelEvent::Read {
                channel: id,
                data: Bytes::new(),
            },
            ChannelEvent::User {
                channel: id,
                event: StreamEvent::RemoteClosed(RemoteClose::EndOfStream),
            },
            ChannelEvent::ReadComplete { channel: id },
        ]
    );

    // Half-closed by the peer only: still registered until closed here
    mux.run_pending_tasks();
    assert_eq!(mux.registry().get(3), Some(Slot::Active(id)));
    assert!(mux.channel(id).unwrap().is_open());

    // The peer already ended its side: our half ends with END_STREAM, and
    // the entry goes away without a sentinel
    mux.encoder_mut().wire.clear();
    mux.channel(id).unwrap().close();
    assert!(mux.encoder().resets().is_empty());
    assert!(matches!(
        mux.encoder().wire.first(),
        Some(Wire::Data { stream_id: 3, payload, end_stream: true, .. }) if payload.is_empty()
    ));
    assert!(mux.registry().get(3).is_none());
    assert!(mux.poll_timeout().is_none());
}

#[tokio::test(start_paused = true)]
async fn scenario_b_local_close_leaves_sentinel() {
    let grace = Duration::from_secs(10);
    let mut mux = server_with(Config::builder().auto_read(false).closed_stream_grace(grace));
    let id = open(&mut mux, 1);

    mux.on_frame(data(1, b"unread", false));
    mux.on_read_complete();
    assert_eq!(mux.channel(id).unwrap().stream().queued_inbound(), 1);

    let completion = mux.channel(id).unwrap().close();
    assert_eq!(completion.await, Ok(()));

    assert_eq!(mux.encoder().resets(), vec![(1, Reason::CANCEL)]);
    assert_eq!(mux.stats().discarded_frames, 1);
    assert_eq!(mux.stats().discarded_bytes, 6);
    assert_eq!(mux.registry().get(1), Some(Slot::Closed));

    // Late frames inside the grace period are absorbed
    mux.on_frame(data(1, b"late", false));
    assert_eq!(mux.stats().discarded_frames, 2);
    assert!(mux.next_listener().frames.is_empty());

    tokio::time::advance(grace / 2).await;
    mux.handle_timeout(Instant::now());
    assert_eq!(mux.registry().get(1), Some(Slot::Closed));

    tokio::time::advance(grace / 2).await;
    mux.handle_timeout(Instant::now());
    assert!(mux.registry().get(1).is_none());
    assert!(mux.poll_timeout().is_none());
}

#[test]
fn scenario_c_registry_promotion() {
    let mut mux = server_with(Config::builder());
    assert!(mux.registry().is_empty());

    let first = open(&mut mux, 1);
    assert!(!mux.registry().is_promoted());
    assert_eq!(mux.registry().len(), 1);

    let second = open(&mut mux, 3);
    assert!(mux.registry().is_promoted());
    assert_eq!(mux.channel_for_stream(1), Some(first));
    assert_eq!(mux.channel_for_stream(3), Some(second));

    // Never demoted
    mux.on_frame(Frame::RstStream {
        stream_id: 3,
        reason: Reason::CANCEL,
    });
    assert!(mux.registry().is_promoted());
    assert_eq!(mux.channel_for_stream(1), Some(first));
}

#[test]
fn scenario_d_watermark_edges() {
    let mut mux = server_with(Config::builder().write_buffer_watermarks(8, 16));
    let id = open(&mut mux, 1);

    let mut completion = mux
        .channel(id)
        .unwrap()
        .write_and_flush(Bytes::from(vec![0u8; 17]));
    assert!(!mux.channel(id).unwrap().is_writable());
    mux.run_pending_tasks();
    assert_eq!(
        mux.drain_events(),
        vec![ChannelEvent::WritabilityChanged {
            channel: id,
            writable: false,
        }]
    );

    let (write_id, _) = mux.encoder().data()[0].clone();
    mux.on_write_complete(write_id, Ok(()));
    mux.run_pending_tasks();

    assert!(mux.channel(id).unwrap().is_writable());
    assert_eq!(
        mux.drain_events(),
        vec![ChannelEvent::WritabilityChanged {
            channel: id,
            writable: true,
        }]
    );
    assert_eq!(completion.try_result(), Some(Ok(())));
}

#[test]
fn writability_no_repeat_without_opposite_crossing() {
    let mut mux = server_with(Config::builder().write_buffer_watermarks(8, 16));
    let id = open(&mut mux, 1);
    let handle = mux.channel(id).unwrap().writability_handle();

    for _ in 0..4 {
        mux.channel(id).unwrap().write(Bytes::from(vec![0u8; 10]));
    }
    mux.run_pending_tasks();
    let unwritable = mux
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, ChannelEvent::WritabilityChanged { writable: false, .. }))
        .count();
    assert_eq!(unwritable, 1);
    assert!(!handle.is_writable());

    // 40 -> 30 -> 20 -> 10: never below 8, so no edge
    let writes = mux.encoder().data();
    for (write_id, _) in &writes[..3] {
        mux.on_write_complete(*write_id, Ok(()));
    }
    assert!(mux.drain_events().is_empty());
    assert!(!handle.is_writable());

    mux.on_write_complete(writes[3].0, Ok(()));
    assert_eq!(mux.drain_events().len(), 1);
    assert!(handle.is_writable());
}

#[test]
fn close_is_idempotent() {
    let mut mux = server_with(Config::builder());
    let id = open(&mut mux, 1);

    let mut first = mux.channel(id).unwrap().close();
    let mut second = mux.channel(id).unwrap().close();
    assert_eq!(first.try_result(), Some(Ok(())));
    assert_eq!(second.try_result(), Some(Ok(())));
    assert_eq!(mux.encoder().resets().len(), 1);

    mux.run_pending_tasks();
    let teardown: Vec<_> = mux.drain_events();
    assert_eq!(
        teardown,
        vec![
            ChannelEvent::Inactive { channel: id },
            ChannelEvent::Unregistered { channel: id },
        ]
    );
    assert!(mux.channel(id).is_none());
}

#[test]
fn unregistered_stream_frames_pass_through() {
    let mut mux = server_with(Config::builder());
    let _ = open(&mut mux, 1);

    mux.on_frame(data(7, b"plain http body", false));
    mux.on_frame(Frame::WindowUpdate {
        stream_id: 0,
        increment: 1024,
    });

    assert!(mux.drain_events().is_empty());
    assert_eq!(mux.next_listener().frames.len(), 2);
    assert_eq!(mux.stats().forwarded_frames, 2);
    assert_eq!(mux.stats().discarded_frames, 0);
}

#[test]
fn unknown_frame_on_channel_released() {
    let mut mux = server_with(Config::builder());
    let _ = open(&mut mux, 1);

    mux.on_frame(Frame::Unknown {
        stream_id: 1,
        frame_type: 0xfa,
        flags: 0,
        payload: Bytes::from_static(b"ext"),
    });
    assert!(mux.drain_events().is_empty());
    assert_eq!(mux.stats().discarded_frames, 1);
    assert_eq!(mux.stats().discarded_bytes, 3);
    assert!(mux.next_listener().frames.is_empty());
}

#[test]
fn frames_delivered_in_receipt_order() {
    let mut mux = server_with(Config::builder().max_messages_per_read(64));
    let id = open(&mut mux, 1);

    let payloads: [&'static [u8]; 5] = [b"1", b"2", b"3", b"4", b"5"];
    for payload in payloads {
        mux.on_frame(data(1, payload, false));
    }
    mux.on_read_complete();

    let delivered: Vec<_> = mux
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            ChannelEvent::Read { channel, data } if channel == id => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(delivered, payloads.to_vec());
}

#[test]
fn pre_handshake_writes_flushed_in_order() {
    let mut mux = client_with(Config::builder());
    let id = mux.open_stream("/ws", None).unwrap();

    let completions: Vec<_> = (0u8..4)
        .map(|n| mux.channel(id).unwrap().write(Bytes::from(vec![n])))
        .collect();

    mux.on_frame(Frame::Settings(Settings {
        max_concurrent_streams: None,
        enable_connect_protocol: Some(true),
    }));
    mux.on_frame(Frame::Headers {
        stream_id: 1,
        headers: Headers::response(StatusCode::OK),
        end_stream: false,
    });

    let written = mux.encoder().data();
    let payloads: Vec<_> = written.iter().map(|(_, p)| p[0]).collect();
    assert_eq!(payloads, vec![0, 1, 2, 3]);

    // Response, then one flush for the whole replay
    let flushes_after_response = mux
        .encoder()
        .wire
        .iter()
        .skip_while(|w| !matches!(w, Wire::Data { .. }))
        .filter(|w| matches!(w, Wire::Flush))
        .count();
    assert_eq!(flushes_after_response, 1);

    for (write_id, _) in written {
        mux.on_write_complete(write_id, Ok(()));
    }
    for completion in completions {
        assert_eq!(completion.now_or_never(), Some(Ok(())));
    }
}

#[test]
fn failed_handshake_writes_nothing() {
    let mut mux = client_with(Config::builder());
    let id = mux.open_stream("/ws", None).unwrap();
    let completions: Vec<_> = (0u8..3)
        .map(|n| mux.channel(id).unwrap().write(Bytes::from(vec![n])))
        .collect();

    mux.on_frame(Frame::Settings(Settings {
        max_concurrent_streams: None,
        enable_connect_protocol: Some(true),
    }));
    mux.on_frame(Frame::Headers {
        stream_id: 1,
        headers: Headers::response(StatusCode::FORBIDDEN),
        end_stream: true,
    });

    assert!(mux.encoder().data().is_empty());
    for completion in completions {
        assert!(matches!(
            completion.now_or_never(),
            Some(Err(Error::Handshake(_)))
        ));
    }
}

#[test]
fn connection_inactive_closes_everything() {
    let mut mux = server_with(Config::builder());
    let a = open(&mut mux, 1);
    let b = open(&mut mux, 3);
    let pending = mux.channel(a).unwrap().write(Bytes::from_static(b"unsent"));

    mux.encoder_mut().active = false;
    mux.on_connection_inactive();
    mux.run_pending_tasks();

    let events = mux.drain_events();
    for id in [a, b] {
        assert!(events.contains(&ChannelEvent::User {
            channel: id,
            event: StreamEvent::RemoteClosed(RemoteClose::ConnectionClosed),
        }));
        assert!(events.contains(&ChannelEvent::Unregistered { channel: id }));
    }
    assert!(mux.encoder().resets().is_empty());
    assert!(mux.registry().is_empty());
    assert_eq!(mux.channel_count(), 0);
    assert!(mux.next_listener().inactive);
    assert_eq!(pending.now_or_never(), Some(Err(Error::ConnectionClosed)));
}

#[test]
fn go_away_is_forwarded_after_broadcast() {
    let mut mux = server_with(Config::builder());
    let id = open(&mut mux, 1);

    mux.on_frame(Frame::GoAway {
        last_stream_id: 1,
        reason: Reason::NO_ERROR,
        debug_data: Bytes::from_static(b"bye"),
    });

    assert_eq!(
        mux.drain_events(),
        vec![ChannelEvent::User {
            channel: id,
            event: StreamEvent::GoAway {
                last_stream_id: 1,
                reason: Reason::NO_ERROR,
            },
        }]
    );
    assert!(matches!(
        mux.next_listener().frames.as_slice(),
        [Frame::GoAway { last_stream_id: 1, .. }]
    ));
}
