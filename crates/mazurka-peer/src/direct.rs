//! Direct-mode URL handling.
//!
//! A localhost client may ask its peer node to fetch an origin URL on its
//! behalf. The URL is encoded into the request path as
//! `/<scheme>/<host>[_<port>]/<path>` and the accompanying bearer binds to
//! that exact URL through a 63-bit checksum in its opaque field.

use crate::message::{MessageKind, PeerMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectUrl {
    pub https: bool,
    pub host: String,
    pub port: u16,
    /// Path on the origin, always starting with `/`.
    pub path: String,
}

impl DirectUrl {
    /// Parse `/http/host/path` or `/https/host_8443/path`; `_` encodes a
    /// non-default port. Anything else is not a direct-mode URL.
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.strip_prefix('/')?;
        let (scheme, rest) = rest.split_once('/')?;
        let https = match scheme {
            "http" => false,
            "https" => true,
            _ => return None,
        };
        let (host_part, path) = match rest.split_once('/') {
            Some((h, p)) => (h, format!("/{}", p)),
            None => (rest, "/".to_string()),
        };
        if host_part.is_empty() {
            return None;
        }
        let (host, port) = match host_part.rsplit_once('_') {
            Some((h, p)) => {
                let port: u16 = p.parse().ok()?;
                (h, port)
            }
            None => (host_part, if https { 443 } else { 80 }),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self {
            https,
            host: host.to_string(),
            port,
            path,
        })
    }

    /// Whether `url` even looks like direct mode.
    pub fn is_direct(url: &str) -> bool {
        url.starts_with("/http/") || url.starts_with("/https/")
    }

    pub fn origin_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        let default = if self.https { 443 } else { 80 };
        if self.port == default {
            format!("{}://{}{}", scheme, self.host, self.path)
        } else {
            format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
        }
    }
}

/// 63-bit Castagnoli checksum: two chained crc32c passes, the second
/// seeded with the first, high bit masked off. Collision-resistant enough
/// to bind a bearer to one URL; authenticity comes from the surrounding
/// AES-GCM frame, never from this value alone.
pub fn crc63c(data: &[u8]) -> u64 {
    let low = crc32c::crc32c(data);
    let high = crc32c::crc32c_append(low, data);
    (((high as u64) << 32) | low as u64) & 0x7fff_ffff_ffff_ffff
}

/// Check a decoded direct bearer against the URL it arrived on.
pub fn bearer_matches_url(bearer: &PeerMessage, url: &str) -> bool {
    bearer.kind == MessageKind::DirectBearer && bearer.opaque == crc63c(url.as_bytes())
}
