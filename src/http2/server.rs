//! Server side of the extended CONNECT handshake
//!
//! An inbound HEADERS on a stream nobody registered is either a WebSocket
//! bootstrap (`:method = CONNECT`, `:protocol = websocket`) or ordinary
//! HTTP/2 traffic. The first kind is accepted or rejected here; the second
//! goes to the next listener untouched.

use http::StatusCode;
use tracing::{debug, warn};

use crate::event::ChannelEvent;
use crate::extended_connect::{ExtendedConnectRequest, ExtendedConnectResponse};
use crate::frame::{FrameEncoder, FrameListener, Headers, StreamId};
use crate::protocol::Role;

use super::multiplexer::Multiplexer;

impl<E: FrameEncoder, L: FrameListener> Multiplexer<E, L> {
    /// The request, if `headers` bootstrap a WebSocket
    pub(super) fn accept_candidate(&self, headers: &Headers) -> Option<ExtendedConnectRequest> {
        ExtendedConnectRequest::from_headers(headers).filter(ExtendedConnectRequest::is_websocket)
    }

    /// Accept or reject an inbound extended CONNECT
    ///
    /// Accepted streams get a channel, a 200 response and an
    /// [`ChannelEvent::Opened`]. Rejected ones get an error status with
    /// END_STREAM and no channel.
    pub(super) fn accept_stream(
        &mut self,
        stream_id: StreamId,
        request: ExtendedConnectRequest,
        end_stream: bool,
    ) {
        let verdict = if end_stream {
            // The stream must stay open to carry WebSocket frames
            Err(StatusCode::BAD_REQUEST)
        } else {
            self.check_request(&request)
        };

        let subprotocol = match verdict {
            Ok(subprotocol) => subprotocol,
            Err(status) => {
                debug!(
                    stream_id,
                    path = %request.path,
                    status = status.as_u16(),
                    "extended CONNECT rejected"
                );
                let response = ExtendedConnectResponse::error(status);
                if let Err(err) = self
                    .encoder
                    .write_headers(stream_id, response.to_headers(), true)
                {
                    debug!(stream_id, %err, "rejection not written");
                }
                self.encoder.flush();
                return;
            }
        };

        #[cfg(feature = "permessage-deflate")]
        let compression = self
            .config
            .compression
            .as_ref()
            .zip(request.extensions.as_deref())
            .and_then(|(config, offer)| config.negotiate(offer));
        #[cfg(feature = "permessage-deflate")]
        let extensions = compression.as_ref().map(|c| c.to_response_header());
        #[cfg(not(feature = "permessage-deflate"))]
        let extensions: Option<String> = None;

        let path = request.path.clone();
        let id = self.allocate_channel(Role::Server, path.clone());
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.stream_id = stream_id;
            ch.subprotocol = subprotocol.clone();
            #[cfg(feature = "permessage-deflate")]
            {
                ch.compression = compression;
            }
        }
        self.registry.insert(stream_id, id);

        let response = ExtendedConnectResponse::ok_with_options(subprotocol.clone(), extensions);
        if let Err(err) = self
            .encoder
            .write_headers(stream_id, response.to_headers(), false)
        {
            warn!(%id, stream_id, %err, "accept response not written");
            self.registry.remove(stream_id);
            self.channels.remove(&id);
            return;
        }
        self.encoder.flush();

        self.stats.accepted += 1;
        debug!(%id, stream_id, %path, ?subprotocol, "extended CONNECT accepted");
        self.events.push_back(ChannelEvent::Opened {
            channel: id,
            stream_id,
            path,
            subprotocol,
        });
    }

    /// Acceptance policy; returns the selected subprotocol or the status to
    /// reject with
    fn check_request(&self, request: &ExtendedConnectRequest) -> Result<Option<String>, StatusCode> {
        request.validate()?;

        let path = request.path.split('?').next().unwrap_or_default();
        if !self.config.paths.is_empty() && !self.config.paths.iter().any(|p| p == path) {
            return Err(StatusCode::NOT_FOUND);
        }

        if !self.config.allowed_origins.is_empty() {
            let allowed = request.origin.as_deref().is_some_and(|origin| {
                self.config
                    .allowed_origins
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(origin))
            });
            if !allowed {
                return Err(StatusCode::FORBIDDEN);
            }
        }

        let offered = request.subprotocol_list();
        if offered.is_empty() {
            return Ok(None);
        }
        // Our preference order wins
        self.config
            .subprotocols
            .iter()
            .find(|supported| offered.iter().any(|o| o.eq_ignore_ascii_case(supported)))
            .cloned()
            .map(Some)
            .ok_or(StatusCode::BAD_REQUEST)
    }
}
