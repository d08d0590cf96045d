//! `sec-websocket-extensions` codec and permessage-deflate negotiation (RFC 7692)
//!
//! Only the negotiation string is handled here. Compressing and
//! decompressing payloads is the framing layer's business; the multiplexer
//! merely records which parameters each virtual channel agreed on.

use crate::error::{Error, Result};

/// Extension token for permessage-deflate
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Minimum LZ77 window size (256 bytes = 2^8)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

/// One element of a `sec-websocket-extensions` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension<'a> {
    pub name: &'a str,
    pub params: Vec<(&'a str, Option<&'a str>)>,
}

/// Parse a comma-separated extension list
///
/// `"permessage-deflate; client_max_window_bits, x-custom"` yields two
/// entries. Quoted parameter values are unquoted.
pub fn parse_extensions(value: &str) -> Vec<Extension<'_>> {
    value
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }

            let params = parts
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|part| match part.split_once('=') {
                    Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                    None => (part, None),
                })
                .collect();

            Some(Extension { name, params })
        })
        .collect()
}

/// Serialize extensions back into a header value
pub fn format_extensions(extensions: &[Extension<'_>]) -> String {
    extensions
        .iter()
        .map(|ext| {
            let mut out = ext.name.to_string();
            for (name, value) in &ext.params {
                out.push_str("; ");
                out.push_str(name);
                if let Some(v) = value {
                    out.push('=');
                    out.push_str(v);
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// permessage-deflate parameters as written on the wire
///
/// `client_max_window_bits` may appear in an offer without a value, meaning
/// the client merely supports the parameter; that is `Some(None)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<Option<u8>>,
}

impl DeflateParams {
    /// Parse and validate extension parameters
    pub fn parse(params: &[(&str, Option<&str>)]) -> Result<Self> {
        let mut out = Self::default();

        for (name, value) in params {
            match *name {
                "server_no_context_takeover" => {
                    if value.is_some() || out.server_no_context_takeover {
                        return Err(invalid("server_no_context_takeover"));
                    }
                    out.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    if value.is_some() || out.client_no_context_takeover {
                        return Err(invalid("client_no_context_takeover"));
                    }
                    out.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    if out.server_max_window_bits.is_some() {
                        return Err(invalid("server_max_window_bits"));
                    }
                    let bits = value.ok_or_else(|| invalid("server_max_window_bits"))?;
                    out.server_max_window_bits = Some(parse_window_bits(bits)?);
                }
                "client_max_window_bits" => {
                    if out.client_max_window_bits.is_some() {
                        return Err(invalid("client_max_window_bits"));
                    }
                    out.client_max_window_bits = Some(value.map(parse_window_bits).transpose()?);
                }
                other => {
                    return Err(Error::Extension(format!(
                        "unknown permessage-deflate parameter {other:?}"
                    )));
                }
            }
        }

        Ok(out)
    }
}

fn invalid(param: &str) -> Error {
    Error::Extension(format!("invalid or duplicate {param}"))
}

fn parse_window_bits(value: &str) -> Result<u8> {
    let bits: u8 = value
        .parse()
        .map_err(|_| Error::Extension(format!("invalid window bits {value:?}")))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(Error::Extension(format!(
            "window bits {bits} out of range (8-15)"
        )));
    }
    Ok(bits)
}

/// Negotiated (or locally preferred) permessage-deflate parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Server's maximum LZ77 window bits
    pub server_max_window_bits: u8,
    /// Client's maximum LZ77 window bits
    pub client_max_window_bits: u8,
    /// If true, server must reset compression context after each message
    pub server_no_context_takeover: bool,
    /// If true, client must reset compression context after each message
    pub client_no_context_takeover: bool,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
        }
    }
}

impl DeflateConfig {
    /// Create config optimized for low memory usage
    pub fn low_memory() -> Self {
        Self {
            server_max_window_bits: 10,
            client_max_window_bits: 10,
            server_no_context_takeover: true,
            client_no_context_takeover: true,
        }
    }

    /// Parse extension parameters from handshake
    pub fn from_params(params: &[(&str, Option<&str>)]) -> Result<Self> {
        let parsed = DeflateParams::parse(params)?;
        Ok(Self {
            server_max_window_bits: parsed.server_max_window_bits.unwrap_or(DEFAULT_WINDOW_BITS),
            client_max_window_bits: parsed
                .client_max_window_bits
                .flatten()
                .unwrap_or(DEFAULT_WINDOW_BITS),
            server_no_context_takeover: parsed.server_no_context_takeover,
            client_no_context_takeover: parsed.client_no_context_takeover,
        })
    }

    /// Header value a client sends to offer permessage-deflate
    pub fn to_offer_header(&self) -> String {
        let mut parts = vec![PERMESSAGE_DEFLATE.to_string()];

        if self.server_no_context_takeover {
            parts.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            parts.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits
            ));
        } else {
            parts.push("client_max_window_bits".to_string());
        }

        parts.join("; ")
    }

    /// Generate extension response header value for server
    pub fn to_response_header(&self) -> String {
        let mut parts = vec![PERMESSAGE_DEFLATE.to_string()];

        if self.server_no_context_takeover {
            parts.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            parts.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits
            ));
        }

        parts.join("; ")
    }

    /// Server side: pick the first acceptable permessage-deflate offer
    ///
    /// Returns `Ok(None)` when the client offered no permessage-deflate;
    /// offers with invalid parameters are skipped, as RFC 7692 §5 allows
    /// the server to decline any single offer.
    pub fn negotiate(&self, offer_header: &str) -> Option<DeflateConfig> {
        parse_extensions(offer_header)
            .iter()
            .filter(|ext| ext.name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE))
            .find_map(|ext| {
                let offer = DeflateParams::parse(&ext.params).ok()?;

                let server_max_window_bits = offer
                    .server_max_window_bits
                    .map_or(self.server_max_window_bits, |bits| {
                        bits.min(self.server_max_window_bits)
                    });

                // The server may only limit the client's window if offered
                let client_max_window_bits = match offer.client_max_window_bits {
                    Some(bits) => bits
                        .unwrap_or(MAX_WINDOW_BITS)
                        .min(self.client_max_window_bits),
                    None => MAX_WINDOW_BITS,
                };

                Some(DeflateConfig {
                    server_max_window_bits,
                    client_max_window_bits,
                    server_no_context_takeover: offer.server_no_context_takeover
                        || self.server_no_context_takeover,
                    client_no_context_takeover: offer.client_no_context_takeover
                        || self.client_no_context_takeover,
                })
            })
    }

    /// Client side: validate the server's response against this offer
    pub fn accept_response(&self, response_header: &str) -> Result<DeflateConfig> {
        let extensions = parse_extensions(response_header);
        let [ext] = extensions.as_slice() else {
            return Err(Error::Extension(format!(
                "expected exactly one extension in response, got {}",
                extensions.len()
            )));
        };
        if !ext.name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE) {
            return Err(Error::Extension(format!("unrequested extension {:?}", ext.name)));
        }

        let response = DeflateParams::parse(&ext.params)?;

        let server_max_window_bits = match response.server_max_window_bits {
            Some(bits) if bits > self.server_max_window_bits => {
                return Err(Error::Extension(format!(
                    "server_max_window_bits {bits} exceeds offered {}",
                    self.server_max_window_bits
                )));
            }
            Some(bits) => bits,
            None if self.server_max_window_bits < MAX_WINDOW_BITS => {
                return Err(Error::Extension(
                    "server ignored requested server_max_window_bits".into(),
                ));
            }
            None => MAX_WINDOW_BITS,
        };

        let client_max_window_bits = match response.client_max_window_bits {
            Some(None) => {
                return Err(Error::Extension(
                    "client_max_window_bits without value in response".into(),
                ));
            }
            Some(Some(bits)) => bits,
            None => self.client_max_window_bits,
        };

        Ok(DeflateConfig {
            server_max_window_bits,
            client_max_window_bits,
            server_no_context_takeover: response.server_no_context_takeover,
            client_no_context_takeover: response.client_no_context_takeover
                || self.client_no_context_takeover,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extensions() {
        let exts = parse_extensions(
            "permessage-deflate; client_max_window_bits, permessage-deflate; server_max_window_bits=\"10\", x-webkit",
        );
        assert_eq!(exts.len(), 3);
        assert_eq!(exts[0].params, vec![("client_max_window_bits", None)]);
        assert_eq!(exts[1].params, vec![("server_max_window_bits", Some("10"))]);
        assert_eq!(exts[2].name, "x-webkit");
        assert!(exts[2].params.is_empty());

        assert!(parse_extensions("  ,  ").is_empty());
    }

    #[test]
    fn test_format_extensions() {
        let header = "permessage-deflate; server_no_context_takeover; client_max_window_bits=12, foo";
        assert_eq!(format_extensions(&parse_extensions(header)), header);
    }

    #[test]
    fn test_params_validation() {
        assert!(DeflateParams::parse(&[("server_max_window_bits", Some("7"))]).is_err());
        assert!(DeflateParams::parse(&[("server_max_window_bits", None)]).is_err());
        assert!(DeflateParams::parse(&[("server_no_context_takeover", Some("1"))]).is_err());
        assert!(DeflateParams::parse(&[("bogus", None)]).is_err());
        assert!(DeflateParams::parse(&[
            ("client_no_context_takeover", None),
            ("client_no_context_takeover", None),
        ])
        .is_err());

        let parsed = DeflateParams::parse(&[("client_max_window_bits", None)]).unwrap();
        assert_eq!(parsed.client_max_window_bits, Some(None));
    }

    #[test]
    fn test_config_from_params() {
        let params = vec![
            ("server_no_context_takeover", None),
            ("client_max_window_bits", Some("12")),
        ];

        let config = DeflateConfig::from_params(&params).unwrap();
        assert!(config.server_no_context_takeover);
        assert!(!config.client_no_context_takeover);
        assert_eq!(config.client_max_window_bits, 12);
        assert_eq!(config.server_max_window_bits, DEFAULT_WINDOW_BITS);
    }

    #[test]
    fn test_offer_header() {
        assert_eq!(
            DeflateConfig::default().to_offer_header(),
            "permessage-deflate; client_max_window_bits"
        );
        let header = DeflateConfig::low_memory().to_offer_header();
        assert!(header.contains("server_max_window_bits=10"));
        assert!(header.contains("client_max_window_bits=10"));
    }

    #[test]
    fn test_server_negotiation() {
        let server = DeflateConfig {
            server_max_window_bits: 12,
            ..Default::default()
        };

        let agreed = server
            .negotiate("x-unknown, permessage-deflate; client_max_window_bits=9; server_max_window_bits=14")
            .unwrap();
        assert_eq!(agreed.server_max_window_bits, 12);
        assert_eq!(agreed.client_max_window_bits, 9);

        let agreed = server.negotiate("permessage-deflate").unwrap();
        assert_eq!(agreed.client_max_window_bits, MAX_WINDOW_BITS);

        // First offer is invalid, second is taken
        let agreed = server
            .negotiate("permessage-deflate; server_max_window_bits=99, permessage-deflate; client_no_context_takeover")
            .unwrap();
        assert!(agreed.client_no_context_takeover);

        assert!(server.negotiate("x-webkit-deflate-frame").is_none());
    }

    #[test]
    fn test_client_accepts_server_response() {
        let offer = DeflateConfig::default();
        let server = DeflateConfig::low_memory();
        let agreed = server.negotiate(&offer.to_offer_header()).unwrap();

        let accepted = offer.accept_response(&agreed.to_response_header()).unwrap();
        assert_eq!(accepted, agreed);
    }

    #[test]
    fn test_client_rejects_bad_response() {
        let offer = DeflateConfig {
            server_max_window_bits: 10,
            ..Default::default()
        };
        assert!(offer
            .accept_response("permessage-deflate; server_max_window_bits=12")
            .is_err());
        assert!(offer.accept_response("permessage-deflate").is_err());
        assert!(offer.accept_response("x-other").is_err());
        assert!(offer
            .accept_response("permessage-deflate, permessage-deflate")
            .is_err());
        assert!(DeflateConfig::default()
            .accept_response("permessage-deflate; client_max_window_bits")
            .is_err());
    }
}
