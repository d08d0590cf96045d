//! Extended CONNECT (RFC 8441) header conventions
//!
//! A WebSocket conversation is bootstrapped on an HTTP/2 stream by a
//! HEADERS frame carrying `:method = CONNECT` and `:protocol = websocket`.
//! The server answers with `:status = 200` and leaves the stream open; every
//! DATA frame after that carries WebSocket frames.
//!
//! # Example
//!
//! ```
//! use sockudo_mux::extended_connect::ExtendedConnectRequest;
//!
//! let req = ExtendedConnectRequest::for_path("example.com", "/chat", Some("graphql-ws"));
//! let headers = req.to_headers();
//! let parsed = ExtendedConnectRequest::from_headers(&headers).unwrap();
//! assert!(parsed.is_websocket());
//! assert_eq!(parsed.path, "/chat");
//! ```

use http::{HeaderValue, Method, StatusCode};

use crate::error::{Error, Result};
use crate::frame::{Headers, PseudoHeaders};

/// HTTP/2 SETTINGS_ENABLE_CONNECT_PROTOCOL parameter (RFC 8441 §3)
pub const SETTINGS_ENABLE_CONNECT_PROTOCOL: u16 = 0x08;

/// `:protocol` value for WebSocket
pub const PROTOCOL_WEBSOCKET: &str = "websocket";

/// The only WebSocket version in use (RFC 6455)
pub const WEBSOCKET_VERSION: &str = "13";

pub const SEC_WEBSOCKET_PROTOCOL: &str = "sec-websocket-protocol";
pub const SEC_WEBSOCKET_EXTENSIONS: &str = "sec-websocket-extensions";
pub const SEC_WEBSOCKET_VERSION: &str = "sec-websocket-version";
pub const ORIGIN: &str = "origin";

/// Parsed extended CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedConnectRequest {
    /// The `:path` pseudo-header (e.g., "/ws" or "/chat")
    pub path: String,
    /// The `:authority` pseudo-header (host:port)
    pub authority: String,
    /// The `:scheme` pseudo-header
    pub scheme: String,
    /// The `:protocol` pseudo-header
    pub protocol: Option<String>,
    /// The `sec-websocket-protocol` header (comma-separated list)
    pub subprotocols: Option<String>,
    /// The `sec-websocket-extensions` header
    pub extensions: Option<String>,
    /// The `origin` header
    pub origin: Option<String>,
    /// The `sec-websocket-version` header
    pub version: Option<String>,
}

impl ExtendedConnectRequest {
    /// Parse a header block into an extended CONNECT request
    ///
    /// Returns `None` unless the method is CONNECT and `:protocol` is present.
    /// A plain CONNECT (tunnel) is not an extended CONNECT.
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        let pseudo = &headers.pseudo;
        if pseudo.method.as_ref() != Some(&Method::CONNECT) {
            return None;
        }
        let protocol = pseudo.protocol.clone()?;

        Some(Self {
            path: pseudo.path.clone().unwrap_or_default(),
            authority: pseudo.authority.clone().unwrap_or_default(),
            scheme: pseudo.scheme.clone().unwrap_or_default(),
            protocol: Some(protocol),
            subprotocols: headers.get(SEC_WEBSOCKET_PROTOCOL).map(String::from),
            extensions: headers.get(SEC_WEBSOCKET_EXTENSIONS).map(String::from),
            origin: headers.get(ORIGIN).map(String::from),
            version: headers.get(SEC_WEBSOCKET_VERSION).map(String::from),
        })
    }

    /// Request for `path` on an already established connection
    pub fn for_path(authority: &str, path: &str, subprotocol: Option<&str>) -> Self {
        Self {
            path: if path.is_empty() { "/".into() } else { path.into() },
            authority: authority.to_string(),
            scheme: "https".to_string(),
            protocol: Some(PROTOCOL_WEBSOCKET.to_string()),
            subprotocols: subprotocol.map(String::from),
            extensions: None,
            origin: None,
            version: Some(WEBSOCKET_VERSION.to_string()),
        }
    }

    /// Serialize into the HEADERS block a client sends
    pub fn to_headers(&self) -> Headers {
        let mut headers = Headers {
            pseudo: PseudoHeaders {
                method: Some(Method::CONNECT),
                scheme: Some(self.scheme.clone()),
                authority: Some(self.authority.clone()),
                path: Some(self.path.clone()),
                protocol: self.protocol.clone(),
                status: None,
            },
            ..Default::default()
        };

        insert_header(&mut headers, SEC_WEBSOCKET_VERSION, self.version.as_deref());
        insert_header(&mut headers, SEC_WEBSOCKET_PROTOCOL, self.subprotocols.as_deref());
        insert_header(&mut headers, SEC_WEBSOCKET_EXTENSIONS, self.extensions.as_deref());
        insert_header(&mut headers, ORIGIN, self.origin.as_deref());
        headers
    }

    /// Check if `:protocol` is "websocket"
    pub fn is_websocket(&self) -> bool {
        self.protocol
            .as_ref()
            .is_some_and(|p| p.eq_ignore_ascii_case(PROTOCOL_WEBSOCKET))
    }

    /// Get the list of offered subprotocols
    pub fn subprotocol_list(&self) -> Vec<&str> {
        self.subprotocols
            .as_ref()
            .map(|p| {
                p.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validate according to RFC 8441 requirements
    ///
    /// Returns the status code to reject with on failure:
    /// - 501 for a `:protocol` other than websocket (RFC 9220 §3 convention)
    /// - 400 for missing `:path`/`:scheme` or a version other than 13
    pub fn validate(&self) -> std::result::Result<(), StatusCode> {
        if !self.is_websocket() {
            return Err(StatusCode::NOT_IMPLEMENTED);
        }

        if self.path.is_empty() || self.scheme.is_empty() {
            return Err(StatusCode::BAD_REQUEST);
        }

        if let Some(ref version) = self.version {
            if version != WEBSOCKET_VERSION {
                return Err(StatusCode::BAD_REQUEST);
            }
        }

        Ok(())
    }
}

/// Extended CONNECT response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedConnectResponse {
    /// HTTP status code (200 for success)
    pub status: StatusCode,
    /// Selected subprotocol (if any)
    pub protocol: Option<String>,
    /// Accepted extensions (if any)
    pub extensions: Option<String>,
}

impl ExtendedConnectResponse {
    /// Create a successful response
    pub fn ok() -> Self {
        Self {
            status: StatusCode::OK,
            protocol: None,
            extensions: None,
        }
    }

    /// Create a successful response with a selected subprotocol and extensions
    pub fn ok_with_options(protocol: Option<String>, extensions: Option<String>) -> Self {
        Self {
            status: StatusCode::OK,
            protocol,
            extensions,
        }
    }

    /// Create an error response
    pub fn error(status: StatusCode) -> Self {
        Self {
            status,
            protocol: None,
            extensions: None,
        }
    }

    /// Serialize into the HEADERS block a server sends
    pub fn to_headers(&self) -> Headers {
        let mut headers = Headers::response(self.status);
        insert_header(&mut headers, SEC_WEBSOCKET_PROTOCOL, self.protocol.as_deref());
        insert_header(&mut headers, SEC_WEBSOCKET_EXTENSIONS, self.extensions.as_deref());
        headers
    }

    /// Parse and check a response HEADERS block received by a client
    ///
    /// `end_stream` set on a 200 means the server closed the stream it just
    /// accepted, which is as fatal as a non-200 status.
    pub fn from_headers(
        headers: &Headers,
        end_stream: bool,
        requested_subprotocol: Option<&str>,
    ) -> Result<Self> {
        let status = headers
            .pseudo
            .status
            .ok_or_else(|| Error::Handshake("response missing :status".into()))?;

        if status != StatusCode::OK {
            return Err(Error::Handshake(format!(
                "unexpected response status {}",
                status.as_u16()
            )));
        }

        if end_stream {
            return Err(Error::Handshake("200 response with end of stream".into()));
        }

        let protocol = headers.get(SEC_WEBSOCKET_PROTOCOL).map(String::from);
        match (&protocol, requested_subprotocol) {
            (None, _) => {}
            (Some(selected), Some(requested))
                if requested
                    .split(',')
                    .any(|r| r.trim().eq_ignore_ascii_case(selected.trim())) => {}
            (Some(selected), _) => {
                return Err(Error::Handshake(format!(
                    "unsupported subprotocol {selected:?}"
                )));
            }
        }

        Ok(Self {
            status,
            protocol,
            extensions: headers.get(SEC_WEBSOCKET_EXTENSIONS).map(String::from),
        })
    }
}

fn insert_header(headers: &mut Headers, name: &'static str, value: Option<&str>) {
    if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.fields.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip_through_headers() {
        let req = ExtendedConnectRequest::for_path("example.com", "/ws", Some("graphql-ws"));
        let headers = req.to_headers();
        assert_eq!(headers.pseudo.method, Some(Method::CONNECT));
        assert_eq!(headers.pseudo.protocol.as_deref(), Some("websocket"));
        assert_eq!(headers.get(SEC_WEBSOCKET_VERSION), Some("13"));

        let parsed = ExtendedConnectRequest::from_headers(&headers).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_plain_connect_is_not_extended() {
        let mut headers = ExtendedConnectRequest::for_path("example.com", "/ws", None).to_headers();
        headers.pseudo.protocol = None;
        assert!(ExtendedConnectRequest::from_headers(&headers).is_none());

        headers.pseudo.method = Some(Method::GET);
        assert!(ExtendedConnectRequest::from_headers(&headers).is_none());
    }

    #[test]
    fn test_validation() {
        let mut req = ExtendedConnectRequest::for_path("example.com", "/ws", None);
        assert!(req.validate().is_ok());

        req.version = Some("8".to_string());
        assert_eq!(req.validate(), Err(StatusCode::BAD_REQUEST));

        req.version = None;
        req.protocol = Some("webtransport".to_string());
        assert_eq!(req.validate(), Err(StatusCode::NOT_IMPLEMENTED));

        req.protocol = Some("websocket".to_string());
        req.path.clear();
        assert_eq!(req.validate(), Err(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_subprotocol_list() {
        let mut req = ExtendedConnectRequest::for_path("example.com", "/ws", None);
        req.subprotocols = Some("graphql-ws, json, binary".to_string());

        assert_eq!(req.subprotocol_list(), vec!["graphql-ws", "json", "binary"]);

        req.subprotocols = Some(" , ".to_string());
        assert!(req.subprotocol_list().is_empty());
    }

    #[test]
    fn test_response_accepts_requested_subprotocol() {
        let response = ExtendedConnectResponse::ok_with_options(Some("chat".into()), None);
        let parsed =
            ExtendedConnectResponse::from_headers(&response.to_headers(), false, Some("chat, raw"))
                .unwrap();
        assert_eq!(parsed.protocol.as_deref(), Some("chat"));
    }

    #[test]
    fn test_response_rejections() {
        let ok = ExtendedConnectResponse::ok().to_headers();
        assert!(ExtendedConnectResponse::from_headers(&ok, true, None).is_err());

        let forbidden = ExtendedConnectResponse::error(StatusCode::FORBIDDEN).to_headers();
        let err = ExtendedConnectResponse::from_headers(&forbidden, false, None).unwrap_err();
        assert_eq!(err, Error::Handshake("unexpected response status 403".into()));

        let unrequested =
            ExtendedConnectResponse::ok_with_options(Some("mqtt".into()), None).to_headers();
        assert!(ExtendedConnectResponse::from_headers(&unrequested, false, Some("chat")).is_err());
        assert!(ExtendedConnectResponse::from_headers(&unrequested, false, None).is_err());

        let mut missing = ExtendedConnectResponse::ok().to_headers();
        missing.pseudo.status = None;
        assert!(ExtendedConnectResponse::from_headers(&missing, false, None).is_err());
    }
}
