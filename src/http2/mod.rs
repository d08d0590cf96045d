//! WebSocket over HTTP/2 (RFC 8441)
//!
//! Each WebSocket conversation is one HTTP/2 stream, bootstrapped by an
//! extended CONNECT. Many of them share one connection through the
//! [`Multiplexer`]:
//!
//! - [`registry`]: stream id → channel, with closed-stream sentinels
//! - [`stream`]: per-channel read demand, backpressure and close state
//! - [`batch`]: read-complete coalescing across channels
//! - [`handshake`]: client handshake state and pre-handshake write buffer
//! - `client` / `server`: the two sides of the extended CONNECT exchange
//!
//! Key differences from the HTTP/1.1 upgrade:
//! - CONNECT with `:protocol = websocket` instead of `Upgrade`
//! - No `Sec-WebSocket-Key`/`Accept`
//! - Closing a WebSocket closes only its stream, never the connection
//!
//! # Server Example
//!
//! ```ignore
//! use sockudo_mux::{ChannelEvent, Config, Multiplexer, Role};
//!
//! let config = Config::builder().role(Role::Server).paths(["/chat"]).build();
//! let mut mux = Multiplexer::new(config, encoder, http_listener)?;
//!
//! mux.on_frame(frame);
//! mux.on_read_complete();
//! while let Some(event) = mux.poll_event() {
//!     match event {
//!         ChannelEvent::Opened { channel, path, .. } => println!("accepted {path}"),
//!         ChannelEvent::Read { channel, data } => {
//!             mux.channel(channel).unwrap().write_and_flush(data);
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! # Client Example
//!
//! ```ignore
//! let mut mux = Multiplexer::new(Config::default(), encoder, http_listener)?;
//! let id = mux.open_stream("/chat", Some("graphql-ws"))?;
//!
//! // Buffered until the server answers the extended CONNECT
//! let sent = mux.channel(id).unwrap().write(frame_bytes);
//! ```

mod client;
mod multiplexer;
mod server;

pub mod batch;
pub mod handshake;
pub mod registry;
pub mod stream;

pub use handshake::HandshakeState;
pub use multiplexer::{Channel, Multiplexer, Stats};
pub use registry::{Slot, StreamRegistry};
pub use stream::{CloseInitiator, ReadDemand, StreamChannel, WritabilityHandle};
