//! Minimal blocking HTTP/1.1 client for peer-to-peer transfers.
//!
//! One GET at a time over one socket, kept open so the last-peer shortcut
//! can reuse it. Only the response surface a mazurka peer produces is
//! understood: status line, `Content-Length`/`Content-Range`, identity
//! bodies.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{PeerError, PeerResult};

/// Connect timeout for reaching a sibling on the same subnet.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct PeerResponse {
    pub status: u16,
    pub body_len: u64,
}

pub struct PeerClient {
    stream: TcpStream,
    peer: SocketAddr,
    buf: Vec<u8>,
}

impl PeerClient {
    pub fn connect(peer: SocketAddr, io_timeout: Duration) -> PeerResult<Self> {
        let stream = TcpStream::connect_timeout(&peer, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        Ok(Self {
            stream,
            peer,
            buf: Vec::with_capacity(2048),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Issue one bearer-authenticated GET, streaming the body into `out`.
    ///
    /// `limit_bytes_per_sec` clamps the transfer rate when set. Returns
    /// the response status and the number of body bytes written.
    pub fn get(
        &mut self,
        url: &str,
        bearer: &str,
        range: Option<(u64, Option<u64>)>,
        out: &mut dyn Write,
        limit_bytes_per_sec: Option<u64>,
    ) -> PeerResult<PeerResponse> {
        let mut req = String::with_capacity(256 + bearer.len());
        req.push_str("GET ");
        req.push_str(url);
        req.push_str(" HTTP/1.1\r\nHost: ");
        req.push_str(&self.peer.ip().to_string());
        req.push_str("\r\nAuthorization: Bearer ");
        req.push_str(bearer);
        req.push_str("\r\n");
        if let Some((start, end)) = range {
            match end {
                Some(end) => req.push_str(&format!("Range: bytes={}-{}\r\n", start, end)),
                None => req.push_str(&format!("Range: bytes={}-\r\n", start)),
            }
        }
        req.push_str("Connection: keep-alive\r\n\r\n");
        self.stream.write_all(req.as_bytes())?;

        let head_end = self.read_head()?;
        let head = std::str::from_utf8(&self.buf[..head_end])
            .map_err(|_| PeerError::Other("peer sent non-ASCII head".into()))?;
        let (status, content_length) = parse_response_head(head)?;

        let Some(total) = content_length else {
            return Err(PeerError::Other("peer response without length".into()));
        };

        // Body bytes already buffered behind the head come first.
        let mut written = 0u64;
        let buffered = (self.buf.len() - head_end).min(total as usize);
        out.write_all(&self.buf[head_end..head_end + buffered])?;
        written += buffered as u64;
        self.buf.drain(..head_end + buffered);

        let started = Instant::now();
        let mut chunk = vec![0u8; 64 * 1024];
        while written < total {
            let want = chunk.len().min((total - written) as usize);
            let got = self.stream.read(&mut chunk[..want])?;
            if got == 0 {
                return Err(PeerError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            out.write_all(&chunk[..got])?;
            written += got as u64;

            if let Some(limit) = limit_bytes_per_sec
                && limit > 0
            {
                // Sleep off any lead over the allowed rate.
                let due = Duration::from_secs_f64(written as f64 / limit as f64);
                let elapsed = started.elapsed();
                if due > elapsed {
                    std::thread::sleep(due - elapsed);
                }
            }
        }

        debug!(peer = %self.peer, status, written, "peer transfer finished");
        Ok(PeerResponse {
            status,
            body_len: written,
        })
    }

    fn read_head(&mut self) -> PeerResult<usize> {
        // Leftovers from a previous keep-alive response were drained, so
        // anything buffered already belongs to this head.
        let mut scanned = 0usize;
        loop {
            if let Some(pos) = memchr::memmem::find(&self.buf[scanned..], b"\r\n\r\n") {
                return Ok(scanned + pos + 4);
            }
            scanned = self.buf.len().saturating_sub(3);
            if self.buf.len() > 16 * 1024 {
                return Err(PeerError::Other("peer response head too large".into()));
            }
            let mut chunk = [0u8; 2048];
            let got = self.stream.read(&mut chunk)?;
            if got == 0 {
                return Err(PeerError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            self.buf.extend_from_slice(&chunk[..got]);
        }
    }
}

/// Parse `HTTP/1.x NNN ...` plus the headers the transfer needs.
fn parse_response_head(head: &str) -> PeerResult<(u16, Option<u64>)> {
    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| PeerError::Other("empty response head".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| PeerError::Other("bad status line".into()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(PeerError::Other(format!("bad version: {version}")));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PeerError::Other("bad status code".into()))?;

    let mut content_length = None;
    for line in lines {
        if let Some((k, v)) = line.split_once(':')
            && k.trim().eq_ignore_ascii_case("content-length")
        {
            content_length = v.trim().parse().ok();
        }
    }
    Ok((status, content_length))
}
