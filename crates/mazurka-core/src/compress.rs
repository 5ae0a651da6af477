//! Content-coding registry: request-body decompression and optional
//! response post-compression.
//!
//! Backed by flate2 behind the `compression` feature; without the feature
//! the registry recognizes nothing and the connection layer sends
//! identity bodies only.

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Gzip,
    Deflate,
}

impl Coding {
    pub fn token(self) -> &'static str {
        match self {
            Coding::Gzip => "gzip",
            Coding::Deflate => "deflate",
        }
    }
}

/// Registry of supported codings plus the size floor below which
/// responses are never compressed.
pub struct CompressRegistry {
    pub min_compress_size: usize,
}

impl Default for CompressRegistry {
    fn default() -> Self {
        Self {
            min_compress_size: 1024,
        }
    }
}

impl CompressRegistry {
    fn recognize(token: &str) -> Option<Coding> {
        let token = token.trim();
        if token.eq_ignore_ascii_case("gzip") || token.eq_ignore_ascii_case("x-gzip") {
            Some(Coding::Gzip)
        } else if token.eq_ignore_ascii_case("deflate") {
            Some(Coding::Deflate)
        } else {
            None
        }
    }

    /// Decompress a request body in place when its `Content-Encoding` is
    /// recognized. Returns whether a decoder ran.
    #[cfg(feature = "compression")]
    pub fn decode_body(&self, content_encoding: &str, body: &mut Vec<u8>) -> CoreResult<bool> {
        use std::io::Read;

        let Some(coding) = Self::recognize(content_encoding) else {
            return Ok(false);
        };
        let mut out = Vec::with_capacity(body.len() * 3);
        match coding {
            Coding::Gzip => {
                flate2::read::GzDecoder::new(body.as_slice()).read_to_end(&mut out)?;
            }
            Coding::Deflate => {
                flate2::read::ZlibDecoder::new(body.as_slice()).read_to_end(&mut out)?;
            }
        }
        *body = out;
        Ok(true)
    }

    #[cfg(not(feature = "compression"))]
    pub fn decode_body(&self, _content_encoding: &str, _body: &mut Vec<u8>) -> CoreResult<bool> {
        Ok(false)
    }

    /// Pick a coding for a response given the request's `Accept-Encoding`,
    /// or `None` to send identity.
    pub fn pick(&self, accept_encoding: &str, body_len: usize) -> Option<Coding> {
        if !cfg!(feature = "compression")
            || body_len < self.min_compress_size
            || accept_encoding.is_empty()
        {
            return None;
        }
        accept_encoding.split(',').find_map(Self::recognize)
    }

    #[cfg(feature = "compression")]
    pub fn encode(&self, coding: Coding, body: &[u8]) -> CoreResult<Vec<u8>> {
        use std::io::Write;

        match coding {
            Coding::Gzip => {
                let mut enc =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
                enc.write_all(body)?;
                Ok(enc.finish()?)
            }
            Coding::Deflate => {
                let mut enc =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
                enc.write_all(body)?;
                Ok(enc.finish()?)
            }
        }
    }

    #[cfg(not(feature = "compression"))]
    pub fn encode(&self, _coding: Coding, body: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(body.to_vec())
    }
}

#[cfg(all(test, feature = "compression"))]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let reg = CompressRegistry::default();
        let data = vec![b'z'; 4096];
        let packed = reg.encode(Coding::Gzip, &data).unwrap();
        assert!(packed.len() < data.len());

        let mut body = packed;
        assert!(reg.decode_body("gzip", &mut body).unwrap());
        assert_eq!(body, data);
    }

    #[test]
    fn deflate_round_trip() {
        let reg = CompressRegistry::default();
        let data = b"the quick brown fox".repeat(200);
        let packed = reg.encode(Coding::Deflate, &data).unwrap();
        let mut body = packed;
        assert!(reg.decode_body("deflate", &mut body).unwrap());
        assert_eq!(body, data);
    }

    #[test]
    fn unknown_coding_is_identity() {
        let reg = CompressRegistry::default();
        let mut body = b"abc".to_vec();
        assert!(!reg.decode_body("br", &mut body).unwrap());
        assert_eq!(body, b"abc");
    }

    #[test]
    fn pick_honors_floor_and_accept() {
        let reg = CompressRegistry::default();
        assert_eq!(reg.pick("gzip", 10), None);
        assert_eq!(reg.pick("", 4096), None);
        assert_eq!(reg.pick("gzip, deflate", 4096), Some(Coding::Gzip));
        assert_eq!(reg.pick("deflate", 4096), Some(Coding::Deflate));
        assert_eq!(reg.pick("br", 4096), None);
    }
}
