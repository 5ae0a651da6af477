use thiserror::Error;

/// Frame decode result tag, ordered by how far the decoder got.
///
/// `BLen`/`B64`/`Bearer` only occur for bearer tokens; the rest apply to
/// any wire frame. `Ok` exists so call sites can log the full taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeTag {
    /// Bearer text too short to hold a frame.
    BLen,
    /// Bearer is not valid base64url.
    B64,
    /// Bearer decoded but carries the wrong message kind.
    Bearer,
    /// Wire frame shorter than the fixed layout.
    Len,
    /// Salted checksum mismatch (fast pre-filter).
    Crc,
    /// AES-GCM authentication failed.
    Aes,
    /// Response sequence outside the live window.
    Seq,
    /// Unknown message kind.
    Kind,
    /// Unknown hardware kind.
    Hw,
    /// Unknown hash algorithm.
    Algo,
    Ok,
}

/// Central error type for the peer cache plane.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame decode failed: {0:?}")]
    Decode(DecodeTag),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("peer returned HTTP {0}")]
    Http(u16),

    #[error("no usable network interface")]
    NoInterface,

    #[error("{0}")]
    Other(String),
}

impl From<DecodeTag> for PeerError {
    fn from(tag: DecodeTag) -> Self {
        PeerError::Decode(tag)
    }
}

pub type PeerResult<T> = Result<T, PeerError>;
