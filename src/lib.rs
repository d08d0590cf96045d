//! # Sockudo-Mux: WebSocket channels multiplexed over one HTTP/2 connection
//!
//! RFC 8441 lets a WebSocket conversation ride on a single HTTP/2 stream,
//! bootstrapped by an extended CONNECT (`:method = CONNECT`,
//! `:protocol = websocket`). This crate is the engine that lets many such
//! conversations share one HTTP/2 connection, each as an independent,
//! flow-controlled virtual channel.
//!
//! The engine is sans-I/O. The HTTP/2 connection layer owns the socket and
//! the frame codec; it feeds decoded frames and write completions in, and
//! the engine writes frames out through [`FrameEncoder`]:
//!
//! - **Dispatch**: inbound frames are routed by stream id to their channel,
//!   absorbed if the stream was recently closed, or passed on to the next
//!   [`FrameListener`] for ordinary HTTP/2 traffic
//! - **Read demand**: each channel delivers only while the application has
//!   asked for data, queueing the rest
//! - **Backpressure**: per-channel high/low watermarks flip a writability bit
//! - **Handshake buffering**: client writes issued before the server
//!   accepted the stream are parked and replayed in order
//! - **Read-complete batching**: one flush per connection read cycle, not
//!   one per channel
//!
//! ## Example
//!
//! ```ignore
//! use sockudo_mux::{Config, Multiplexer, ChannelEvent, Role};
//!
//! let config = Config::builder().role(Role::Server).subprotocols(["chat"]).build();
//! let mut mux = Multiplexer::new(config, encoder, next_listener)?;
//!
//! // connection layer
//! for frame in decoded_frames {
//!     mux.on_frame(frame);
//! }
//! mux.on_read_complete();
//!
//! // application
//! while let Some(event) = mux.poll_event() {
//!     if let ChannelEvent::Read { channel, data } = event {
//!         mux.channel(channel).unwrap().write_and_flush(data);
//!     }
//! }
//! mux.run_pending_tasks();
//! ```

use std::time::Duration;

pub mod completion;
pub mod error;
pub mod event;
pub mod extended_connect;
pub mod frame;
pub mod http2;
pub mod protocol;

#[cfg(feature = "permessage-deflate")]
pub mod extension;

pub use completion::Completion;
pub use error::{EncoderError, Error, Result};
pub use event::{ChannelEvent, ChannelId, RemoteClose, StreamEvent};
pub use frame::{Frame, FrameEncoder, FrameListener, StreamId};
pub use http2::{Channel, Multiplexer, Stats};
pub use protocol::{Role, WebSocketConfig};

#[cfg(feature = "permessage-deflate")]
pub use extension::DeflateConfig;

/// Default high watermark of a channel's pending outbound bytes (64KB)
pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;

/// Default low watermark of a channel's pending outbound bytes (32KB)
pub const DEFAULT_LOW_WATERMARK: usize = 32 * 1024;

/// Default lifetime of a closed-stream registry sentinel
pub const DEFAULT_CLOSED_STREAM_GRACE: Duration = Duration::from_secs(10);

/// Default client handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for one multiplexed HTTP/2 connection
///
/// # Example
///
/// ```
/// use sockudo_mux::{Config, Role};
///
/// let config = Config::builder()
///     .role(Role::Server)
///     .write_buffer_watermarks(16 * 1024, 64 * 1024)
///     .subprotocols(["graphql-ws"])
///     .build();
/// assert!(!config.websocket.mask_payload);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Side of the connection (default: Client)
    pub role: Role,
    /// Framing limits handed to every channel
    pub websocket: WebSocketConfig,
    /// Channel turns unwritable when pending bytes rise above this (default: 64KB)
    pub write_buffer_high_watermark: usize,
    /// Channel turns writable when pending bytes fall below this (default: 32KB)
    pub write_buffer_low_watermark: usize,
    /// How long late frames for a locally closed stream are absorbed (default: 10s)
    pub closed_stream_grace: Duration,
    /// Max channels queued for a batched read complete (default: 16)
    pub read_complete_batch_capacity: usize,
    /// Frames delivered per read before read complete fires (default: 16)
    pub max_messages_per_read: usize,
    /// Request the next read automatically after each read complete (default: true)
    pub auto_read: bool,
    /// Force-close a channel whose write failed, instead of only
    /// closing its outbound side (default: true)
    pub close_on_write_failure: bool,
    /// Client: fail a handshake not answered within this time (default: 15s)
    pub handshake_timeout: Option<Duration>,
    /// Client: `:authority` sent with extended CONNECT requests
    pub authority: String,
    /// Server: supported subprotocols in preference order (empty: none)
    pub subprotocols: Vec<String>,
    /// Server: accepted `:path` values (empty: any)
    pub paths: Vec<String>,
    /// Server: accepted `origin` values (empty: any)
    pub allowed_origins: Vec<String>,
    /// permessage-deflate parameters to offer (client) or accept (server)
    #[cfg(feature = "permessage-deflate")]
    pub compression: Option<DeflateConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Client,
            websocket: WebSocketConfig::for_role(Role::Client),
            write_buffer_high_watermark: DEFAULT_HIGH_WATERMARK,
            write_buffer_low_watermark: DEFAULT_LOW_WATERMARK,
            closed_stream_grace: DEFAULT_CLOSED_STREAM_GRACE,
            read_complete_batch_capacity: 16,
            max_messages_per_read: 16,
            auto_read: true,
            close_on_write_failure: true,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            authority: "localhost".to_string(),
            subprotocols: Vec::new(),
            paths: Vec::new(),
            allowed_origins: Vec::new(),
            #[cfg(feature = "permessage-deflate")]
            compression: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Check invariants the multiplexer relies on
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_high_watermark == 0 {
            return Err(Error::InvalidConfig("high watermark must be positive"));
        }
        if self.write_buffer_low_watermark > self.write_buffer_high_watermark {
            return Err(Error::InvalidConfig("low watermark above high watermark"));
        }
        if self.read_complete_batch_capacity == 0 {
            return Err(Error::InvalidConfig("read complete batch capacity must be positive"));
        }
        if self.max_messages_per_read == 0 {
            return Err(Error::InvalidConfig("max messages per read must be positive"));
        }
        Ok(())
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the role; also resets outbound masking to the role's default
    pub fn role(mut self, role: Role) -> Self {
        self.config.role = role;
        self.config.websocket.mask_payload = role.masks_outbound();
        self
    }

    /// Set maximum WebSocket frame size for channel decoders
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.websocket.max_frame_size = size;
        self
    }

    /// Enable or disable UTF-8 validation in channel decoders
    pub fn validate_utf8(mut self, enabled: bool) -> Self {
        self.config.websocket.validate_utf8 = enabled;
        self
    }

    /// Override outbound masking
    pub fn mask_payload(mut self, enabled: bool) -> Self {
        self.config.websocket.mask_payload = enabled;
        self
    }

    /// Set low and high write-buffer watermarks
    pub fn write_buffer_watermarks(mut self, low: usize, high: usize) -> Self {
        self.config.write_buffer_low_watermark = low;
        self.config.write_buffer_high_watermark = high;
        self
    }

    /// Set how long a locally closed stream id absorbs late frames
    pub fn closed_stream_grace(mut self, grace: Duration) -> Self {
        self.config.closed_stream_grace = grace;
        self
    }

    /// Set the read-complete batch capacity
    pub fn read_complete_batch_capacity(mut self, capacity: usize) -> Self {
        self.config.read_complete_batch_capacity = capacity;
        self
    }

    /// Set how many frames one read delivers
    pub fn max_messages_per_read(mut self, count: usize) -> Self {
        self.config.max_messages_per_read = count;
        self
    }

    /// Enable or disable automatic read demand
    pub fn auto_read(mut self, enabled: bool) -> Self {
        self.config.auto_read = enabled;
        self
    }

    /// Choose between force-close and outbound-close on write failure
    pub fn close_on_write_failure(mut self, enabled: bool) -> Self {
        self.config.close_on_write_failure = enabled;
        self
    }

    /// Set the client handshake timeout (`None` disables it)
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the `:authority` used for client requests
    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.config.authority = authority.into();
        self
    }

    /// Set the server's supported subprotocols, most preferred first
    pub fn subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict the paths the server accepts
    pub fn paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict the origins the server accepts
    pub fn allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Offer (client) or accept (server) permessage-deflate
    #[cfg(feature = "permessage-deflate")]
    pub fn compression(mut self, config: DeflateConfig) -> Self {
        self.config.compression = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::event::{ChannelEvent, ChannelId, RemoteClose, StreamEvent};
    pub use crate::frame::{Frame, FrameEncoder, FrameListener};
    pub use crate::http2::Multiplexer;
    pub use crate::Config;
}
