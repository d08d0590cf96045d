//! Client side of the extended CONNECT handshake
//!
//! A client channel exists before its stream does. The request HEADERS go
//! out once the peer's SETTINGS enable extended CONNECT (RFC 8441 §3); until
//! the 200 response arrives, writes are parked in the channel's
//! pre-handshake buffer and replayed in order afterwards.

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{ChannelEvent, ChannelId, StreamEvent};
use crate::extended_connect::{ExtendedConnectRequest, ExtendedConnectResponse};
use crate::frame::{FrameEncoder, FrameListener, Headers};
use crate::http2::handshake::HandshakeState;
use crate::protocol::Role;

#[cfg(feature = "permessage-deflate")]
use crate::extension::DeflateConfig;

use super::multiplexer::{Multiplexer, Timer};

impl<E: FrameEncoder, L: FrameListener> Multiplexer<E, L> {
    /// Open a WebSocket channel for `path`
    ///
    /// The channel is usable at once: writes are buffered until the server
    /// accepts the stream. Handshake failure is reported as a
    /// [`ChannelEvent::Exception`] followed by teardown.
    pub fn open_stream(&mut self, path: &str, subprotocol: Option<&str>) -> Result<ChannelId> {
        if self.config.role != Role::Client {
            return Err(Error::InvalidState("only a client opens streams"));
        }
        if let Some(reason) = self.going_away {
            return Err(Error::GoAway(reason));
        }
        if !self.encoder.is_active() {
            return Err(Error::ConnectionClosed);
        }
        if self.peer.received && !self.peer.connect_protocol {
            return Err(Error::Handshake(
                "peer does not enable extended CONNECT".into(),
            ));
        }

        let id = self.allocate_channel(Role::Client, path.to_string());
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.requested_subprotocol = subprotocol.map(String::from);
        }
        if let Some(timeout) = self.config.handshake_timeout {
            self.schedule(Instant::now() + timeout, Timer::HandshakeTimeout(id));
        }
        self.stats.opened += 1;
        debug!(%id, path, ?subprotocol, "stream opened");

        if self.peer.received {
            self.start_handshake(id);
        }
        Ok(id)
    }

    /// Peer SETTINGS arrived: send or fail every handshake waiting on them
    pub(super) fn start_deferred_handshakes(&mut self) {
        if !self.peer.received {
            return;
        }
        let waiting: Vec<_> = self
            .open_channels()
            .into_iter()
            .filter(|id| {
                self.channels
                    .get(id)
                    .is_some_and(|ch| ch.handshake == HandshakeState::AwaitingSettings)
            })
            .collect();

        for id in waiting {
            if self.peer.connect_protocol {
                self.start_handshake(id);
            } else {
                self.fail_handshake(
                    id,
                    Error::Handshake("peer does not enable extended CONNECT".into()),
                );
            }
        }
    }

    /// Reserve a stream id and write the extended CONNECT request
    fn start_handshake(&mut self, id: ChannelId) {
        let stream_id = match self.encoder.reserve_stream_id() {
            Ok(stream_id) => stream_id,
            Err(err) => {
                self.fail_handshake(id, err.into());
                return;
            }
        };

        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        ch.stream_id = stream_id;
        #[cfg(feature = "permessage-deflate")]
        let extensions = self.config.compression.as_ref().map(|offer| offer.to_offer_header());
        #[cfg(not(feature = "permessage-deflate"))]
        let extensions = None;
        let request = ExtendedConnectRequest {
            extensions,
            ..ExtendedConnectRequest::for_path(
                &self.config.authority,
                &ch.path,
                ch.requested_subprotocol.as_deref(),
            )
        };
        let pending_weight = ch.pending_weight.take();
        self.registry.insert(stream_id, id);

        if let Err(err) = self
            .encoder
            .write_headers(stream_id, request.to_headers(), false)
        {
            self.fail_handshake(id, err.into());
            return;
        }
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.handshake = HandshakeState::RequestSent;
        }

        if let Some(weight) = pending_weight {
            if let Err(err) = self.apply_priority(id, stream_id, weight) {
                warn!(%id, stream_id, weight, %err, "cached priority not written");
            }
        }
        self.encoder.flush();
        debug!(%id, stream_id, path = %request.path, "extended CONNECT sent");
    }

    /// Response HEADERS for a request this channel sent
    pub(super) fn on_handshake_response(&mut self, id: ChannelId, headers: &Headers, end_stream: bool) {
        let Some(ch) = self.channels.get(&id) else {
            return;
        };
        let requested = ch.requested_subprotocol.clone();

        let accepted = ExtendedConnectResponse::from_headers(headers, end_stream, requested.as_deref())
            .and_then(|response| {
                let compression = self.accept_extensions(response.extensions.as_deref())?;
                Ok((response, compression))
            });

        match accepted {
            Ok((response, compression)) => self.complete_handshake(id, response, compression),
            Err(error) => self.fail_handshake(id, error),
        }
    }

    #[cfg(feature = "permessage-deflate")]
    fn accept_extensions(&self, header: Option<&str>) -> Result<Option<DeflateConfig>> {
        match (header, &self.config.compression) {
            (None, _) => Ok(None),
            (Some(header), Some(offer)) => offer.accept_response(header).map(Some),
            (Some(header), None) => Err(Error::Extension(format!(
                "unrequested extensions {header:?}"
            ))),
        }
    }

    #[cfg(not(feature = "permessage-deflate"))]
    fn accept_extensions(&self, header: Option<&str>) -> Result<Option<()>> {
        match header {
            None => Ok(None),
            Some(header) => Err(Error::Extension(format!(
                "unrequested extensions {header:?}"
            ))),
        }
    }

    fn complete_handshake(
        &mut self,
        id: ChannelId,
        response: ExtendedConnectResponse,
        #[cfg(feature = "permessage-deflate")] compression: Option<DeflateConfig>,
        #[cfg(not(feature = "permessage-deflate"))] _compression: Option<()>,
    ) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        ch.handshake = HandshakeState::Complete;
        ch.subprotocol = response.protocol.clone();
        #[cfg(feature = "permessage-deflate")]
        {
            ch.compression = compression;
        }
        let stream_id = ch.stream_id;
        let buffered = ch.pre_handshake.take_for_flush().unwrap_or_default();
        self.cancel_timer(Timer::HandshakeTimeout(id));

        debug!(
            %id,
            stream_id,
            subprotocol = ?response.protocol,
            buffered = buffered.len(),
            "handshake completed"
        );

        // Replay in enqueue order; a failing write may close the channel
        for (data, promise) in buffered {
            let open = self.channels.get(&id).is_some_and(|ch| !ch.closed);
            if open {
                self.submit_data(id, stream_id, data, promise);
            } else {
                promise.fail(Error::ChannelClosed);
            }
        }
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.flush_pending = false;
        }
        self.encoder.flush();

        self.events.push_back(ChannelEvent::User {
            channel: id,
            event: StreamEvent::HandshakeCompleted {
                subprotocol: response.protocol,
                extensions: response.extensions,
            },
        });
    }

    /// Fail the handshake: fail buffered writes, report, force close
    pub(super) fn fail_handshake(&mut self, id: ChannelId, error: Error) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        if ch.closed {
            return;
        }
        let failed = ch.fail_pre_handshake(&error).unwrap_or(0);
        warn!(%id, stream_id = ch.stream_id, %error, failed_writes = failed, "handshake failed");
        self.stream_exception(id, error);
    }
}
