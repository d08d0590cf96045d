//! Endpoint role and the WebSocket framing limits handed to each channel
//!
//! Frame parsing happens above the multiplexer. The multiplexer only
//! carries these settings so every virtual channel can hand its framing
//! layer a decoder configured for the right side of the connection.

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

impl Role {
    /// RFC 6455 §5.3: only clients mask outbound payloads
    pub fn masks_outbound(self) -> bool {
        matches!(self, Role::Client)
    }
}

/// Decoder limits and the outbound masking flag for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Maximum accepted frame payload (default: 16MB)
    pub max_frame_size: usize,
    /// Validate UTF-8 in text messages (default: true)
    pub validate_utf8: bool,
    /// Mask outbound payloads (clients only)
    pub mask_payload: bool,
}

impl WebSocketConfig {
    /// Defaults for `role`
    pub fn for_role(role: Role) -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            validate_utf8: true,
            mask_payload: role.masks_outbound(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::for_role(Role::Client)
    }
}
