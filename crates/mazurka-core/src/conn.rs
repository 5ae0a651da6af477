//! Per-socket HTTP/1.1 exchange driver.
//!
//! One [`Connection`] owns the socket for its whole lifetime and walks the
//! state machine `ReadingHeaders -> AuthChallenge? -> ReadingBody? ->
//! Dispatching -> SendingHeaders -> SendingBody -> Done` once per request,
//! looping for keep-alive. Body sending has the sub-states `Send`, `Wait`
//! (progressive source not long enough yet), `Done` and `Abort`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::auth::AuthOutcome;
use crate::context::Context;
use crate::http::{
    self, EXPECTED_SIZE_HEADER, Method, NO_RESPONSE, PARTIAL_ID_HEADER, STATIC_FILE,
};
use crate::parser::{self, RangeSpec};
use crate::server::ServerCore;

/// Maximum bytes of request head kept in memory.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Sleep between polls of a progressive file that is not long enough yet.
const PROGRESSIVE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadingHeaders,
    AuthChallenge,
    ReadingBody,
    Dispatching,
    SendingHeaders,
    SendingBody,
    Done,
}

/// Sub-state of `SendingBody` for streamed sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    Send,
    Wait,
    Done,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeResult {
    KeepAlive,
    Close,
}

/// Outcome of reading the next request head.
pub enum HeadStep {
    Ready,
    /// Clean EOF or unrecoverable error; the 4xx (if any) was already sent.
    Close,
}

pub struct Connection {
    core: Arc<ServerCore>,
    stream: TcpStream,
    remote: SocketAddr,
    /// Read-ahead buffer; bytes past the parsed head belong to the body or
    /// to a pipelined request.
    buf: Vec<u8>,
    pub ctx: Context,
    conn_id: u32,
    served: u32,
    pub state: ConnState,
}

impl Connection {
    pub fn new(core: Arc<ServerCore>, stream: TcpStream, remote: SocketAddr) -> Self {
        let conn_id = core.next_conn_id();
        core.metrics.inc_conn();
        Self {
            core,
            stream,
            remote,
            buf: Vec::with_capacity(2048),
            ctx: Context::new(),
            conn_id,
            served: 0,
            state: ConnState::ReadingHeaders,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Whether the parsed request asks for a long-lived worker: keep-alive
    /// connections and large uploads are promoted out of the pool.
    pub fn wants_promotion(&self) -> bool {
        let head = &self.ctx.head;
        let keep = if head.http10 {
            head.connection_keep_alive
        } else {
            !head.connection_close
        };
        keep || head.content_length.unwrap_or(0) > self.core.opts.large_body_threshold
    }

    /// Serve the connection to completion (dedicated worker / inline mode).
    pub fn run(mut self) {
        loop {
            if self.core.terminated() {
                return;
            }
            match self.read_head() {
                HeadStep::Ready => {}
                HeadStep::Close => return,
            }
            if self.serve_parsed() == ExchangeResult::Close {
                return;
            }
        }
    }

    /// Continue a connection whose first head was already parsed by a pool
    /// worker before promotion.
    pub fn run_promoted(mut self) {
        if self.serve_parsed() == ExchangeResult::Close {
            return;
        }
        self.run();
    }

    /// Read and parse the next request head into `self.ctx`.
    pub fn read_head(&mut self) -> HeadStep {
        self.state = ConnState::ReadingHeaders;
        self.ctx.reset();

        let timeout = if self.served == 0 {
            self.core.opts.header_read_timeout_secs
        } else {
            self.core.opts.keep_alive_timeout_secs
        };
        let _ = self
            .stream
            .set_read_timeout(Some(Duration::from_secs(timeout.max(1))));

        let head_end = match self.fill_until_head_end() {
            Ok(Some(end)) => end,
            Ok(None) => return HeadStep::Close,
            Err(e) if is_timeout(&e) => {
                // Idle keep-alive sockets just go away; a half-sent head is
                // treated as misbehavior.
                if !self.buf.is_empty() {
                    self.ban_on_4xx(408);
                }
                return HeadStep::Close;
            }
            Err(_) => return HeadStep::Close,
        };

        let head = match parser::parse_head(&self.buf[..head_end], &self.core.head_options) {
            Ok(head) => head,
            Err(err) => {
                // Every head defect is a protocol error to the client.
                debug!(ip = %self.remote.ip(), ?err, "rejecting malformed head");
                let _ = self.send_simple(400, b"", false);
                self.ban_on_4xx(400);
                return HeadStep::Close;
            }
        };
        self.buf.drain(..head_end);

        self.ctx.apply_head(head);
        self.ctx.connection_id = self
            .ctx
            .head
            .forwarded_conn_id
            .unwrap_or(self.conn_id);
        self.ctx.remote_ip = self
            .ctx
            .head
            .forwarded_ip
            .as_deref()
            .and_then(|s| s.parse::<IpAddr>().ok())
            .unwrap_or_else(|| self.remote.ip());
        HeadStep::Ready
    }

    /// Serve the exchange whose head is already in `self.ctx`.
    pub fn serve_parsed(&mut self) -> ExchangeResult {
        self.served += 1;
        self.core.metrics.inc_req();
        let keep_alive = self.keep_alive_requested();

        // Admission checks, each aborting with its own status.
        if let Some(len) = self.ctx.head.content_length
            && len > self.core.opts.max_body_size
        {
            let _ = self.send_simple(413, b"", false);
            self.ban_on_4xx(413);
            return ExchangeResult::Close;
        }

        let intercepted = self.core.with_hooks(|h| h.on_header_parsed(&mut self.ctx));
        if let Some(status) = intercepted {
            let _ = self.send_simple(status, b"", false);
            return ExchangeResult::Close;
        }

        if self.core.auth.enabled() {
            self.state = ConnState::AuthChallenge;
            match self.core.auth.authenticate(&mut self.ctx) {
                AuthOutcome::NotRequired | AuthOutcome::Authorized => {}
                AuthOutcome::Challenge(challenge) => {
                    let extra = format!("WWW-Authenticate: {}\r\n", challenge);
                    let _ = self.send_with_headers(401, b"", &extra, keep_alive);
                    return if keep_alive {
                        ExchangeResult::KeepAlive
                    } else {
                        ExchangeResult::Close
                    };
                }
                AuthOutcome::Denied => {
                    let _ = self.send_simple(403, b"", false);
                    return ExchangeResult::Close;
                }
            }
        }

        match self.core.with_hooks(|h| h.on_before_body(&mut self.ctx)) {
            0 | 202 => {}
            status => {
                let _ = self.send_simple(status, self.error_body(status).as_slice(), false);
                self.ban_on_4xx(status);
                return ExchangeResult::Close;
            }
        }

        if self.ctx.head.expect_continue {
            if self.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").is_err() {
                return ExchangeResult::Close;
            }
        }

        if self.read_body() == ExchangeResult::Close {
            return ExchangeResult::Close;
        }

        // Dispatch through the router, then fall through to the handler.
        self.state = ConnState::Dispatching;
        let status = self.dispatch();
        self.ctx.status = status;

        let result = match self.send_response(keep_alive) {
            Ok(BodyState::Done) => {
                if keep_alive && !self.core.terminated() {
                    ExchangeResult::KeepAlive
                } else {
                    ExchangeResult::Close
                }
            }
            Ok(_) => ExchangeResult::Close,
            Err(e) => {
                debug!(ip = %self.remote.ip(), error = %e, "response write failed");
                ExchangeResult::Close
            }
        };
        if (400..500).contains(&self.ctx.status) {
            self.ban_on_4xx(self.ctx.status);
        }
        self.state = ConnState::Done;
        result
    }

    fn keep_alive_requested(&self) -> bool {
        let head = &self.ctx.head;
        if head.http10 {
            head.connection_keep_alive && !head.connection_close
        } else {
            !head.connection_close
        }
    }

    fn dispatch(&mut self) -> u16 {
        #[cfg(feature = "catch-panic")]
        {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.dispatch_inner()
            }));
            match result {
                Ok(status) => status,
                Err(_) => {
                    warn!(url = %self.ctx.url, "handler panicked");
                    self.ctx.resp_body = generic_error_html(500);
                    self.ctx.resp_content_type = "text/html".to_string();
                    500
                }
            }
        }
        #[cfg(not(feature = "catch-panic"))]
        {
            self.dispatch_inner()
        }
    }

    fn dispatch_inner(&mut self) -> u16 {
        let routed = self.core.router.process(&mut self.ctx);
        if routed != 0 {
            return routed;
        }
        let status = self.core.with_hooks(|h| h.on_request(&mut self.ctx));
        if status == 0 { 404 } else { status }
    }

    fn read_body(&mut self) -> ExchangeResult {
        let len = self.ctx.head.content_length.unwrap_or(0) as usize;
        if !self.ctx.method.has_request_body() || len == 0 {
            // Bodyless method: any buffered bytes belong to the next
            // pipelined request.
            return ExchangeResult::KeepAlive;
        }
        self.state = ConnState::ReadingBody;

        let mut body = std::mem::take(&mut self.ctx.body);
        body.clear();
        let take = len.min(self.buf.len());
        body.extend_from_slice(&self.buf[..take]);
        self.buf.drain(..take);
        let missing = len - body.len();
        if missing > 0 {
            let start = body.len();
            body.resize(len, 0);
            if let Err(e) = self.stream.read_exact(&mut body[start..]) {
                debug!(ip = %self.remote.ip(), error = %e, "body read failed");
                return ExchangeResult::Close;
            }
        }
        self.core.metrics.add_bytes_in(body.len() as u64);

        if !self.ctx.head.content_encoding.is_empty() {
            match self
                .core
                .compress
                .decode_body(&self.ctx.head.content_encoding, &mut body)
            {
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "request body decompression failed");
                    let _ = self.send_simple(400, b"", false);
                    return ExchangeResult::Close;
                }
            }
        }
        self.ctx.body = body;
        ExchangeResult::KeepAlive
    }

    // ---- Response side ----

    fn send_response(&mut self, keep_alive: bool) -> io::Result<BodyState> {
        self.state = ConnState::SendingHeaders;

        let (custom, directives) = split_custom_headers(&self.ctx.resp_headers);

        if self.ctx.resp_content_type == STATIC_FILE {
            return self.send_static_file(keep_alive, &custom, &directives);
        }

        let mut body = std::mem::take(&mut self.ctx.resp_body);
        if self.ctx.resp_content_type == NO_RESPONSE {
            body.clear();
        } else if body.is_empty() && self.ctx.resp_content_type.is_empty() && self.ctx.status >= 400
        {
            body = generic_error_html(self.ctx.status);
            self.ctx.resp_content_type = "text/html".to_string();
        }

        // A handler-set Content-Encoding disables post-compression.
        let mut encoding_line = String::new();
        if !directives.content_encoding
            && let Some(coding) = self
                .core
                .compress
                .pick(&self.ctx.head.accept_encoding, body.len())
            && let Ok(packed) = self.core.compress.encode(coding, &body)
            && packed.len() < body.len()
        {
            body = packed;
            encoding_line = format!("Content-Encoding: {}\r\n", coding.token());
        }

        let mut head = self.compose_head(self.ctx.status, keep_alive);
        head.push_str(&custom);
        head.push_str(&encoding_line);
        if !self.ctx.resp_content_type.is_empty() && self.ctx.resp_content_type != NO_RESPONSE {
            head.push_str("Content-Type: ");
            head.push_str(&self.ctx.resp_content_type);
            head.push_str("\r\n");
        }
        push_content_length(&mut head, body.len() as u64);
        head.push_str("\r\n");

        self.state = ConnState::SendingBody;
        let send_body = self.ctx.method != Method::Head;
        let mut out = head.into_bytes();
        if send_body {
            out.extend_from_slice(&body);
        }
        self.stream.write_all(&out)?;
        self.core.metrics.add_bytes_out(out.len() as u64);
        Ok(BodyState::Done)
    }

    fn send_static_file(
        &mut self,
        keep_alive: bool,
        custom: &str,
        directives: &HeaderDirectives,
    ) -> io::Result<BodyState> {
        let filename = String::from_utf8_lossy(&self.ctx.resp_body).into_owned();
        let path = PathBuf::from(&filename);

        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                debug!(file = %filename, error = %e, "static file open failed");
                let body = self.error_body(404);
                return self.send_simple(404, &body, keep_alive).map(|_| BodyState::Done);
            }
        };
        let meta = file.metadata()?;
        let disk_size = meta.len();

        // A progressive file advertises its final size via the internal
        // expected-size header; the on-disk length lags behind it.
        let expected = directives.expected_size;
        let total = expected.unwrap_or(disk_size);

        let range = self.ctx.head.range;
        let (status, start, end) = match range {
            Some(RangeSpec { start, .. }) if start >= total => {
                let mut head = self.compose_head(416, keep_alive);
                head.push_str(&format!("Content-Range: bytes */{}\r\n", total));
                push_content_length(&mut head, 0);
                head.push_str("\r\n");
                self.stream.write_all(head.as_bytes())?;
                self.ctx.status = 416;
                return Ok(BodyState::Done);
            }
            Some(RangeSpec { start, end }) => {
                let end = end.unwrap_or(total - 1).min(total - 1);
                (206u16, start, end)
            }
            None => {
                if total == 0 {
                    (200u16, 0, 0)
                } else {
                    (200u16, 0, total - 1)
                }
            }
        };
        let content_len = if total == 0 { 0 } else { end - start + 1 };

        let mut head = self.compose_head(status, keep_alive);
        head.push_str(custom);
        if status == 206 {
            head.push_str(&format!("Content-Range: bytes {}-{}/{}\r\n", start, end, total));
        }
        head.push_str("Accept-Ranges: bytes\r\n");
        if let Ok(modified) = meta.modified() {
            head.push_str("Last-Modified: ");
            head.push_str(&httpdate::fmt_http_date(modified));
            head.push_str("\r\n");
        }
        if !directives.content_type_set {
            head.push_str("Content-Type: application/octet-stream\r\n");
        }
        push_content_length(&mut head, content_len);
        head.push_str("\r\n");
        self.stream.write_all(head.as_bytes())?;
        self.core.metrics.add_bytes_out(head.len() as u64);
        self.ctx.status = status;

        self.state = ConnState::SendingBody;
        if self.ctx.method == Method::Head || content_len == 0 {
            return Ok(BodyState::Done);
        }

        match expected {
            Some(expected) => self.stream_progressive(
                file,
                path,
                directives.partial_id,
                start,
                end,
                expected,
            ),
            None => self.stream_file(&mut file, start, end),
        }
    }

    /// Plain file streaming in `send_buffer_size` chunks.
    fn stream_file(&mut self, file: &mut File, start: u64, end: u64) -> io::Result<BodyState> {
        file.seek(SeekFrom::Start(start))?;
        let mut remaining = end - start + 1;
        let mut chunk = vec![0u8; self.core.opts.send_buffer_size.max(512)];
        while remaining > 0 {
            let want = chunk.len().min(remaining as usize);
            let got = file.read(&mut chunk[..want])?;
            if got == 0 {
                // File truncated under us; the promised length cannot be
                // met, so the connection must die.
                return Ok(BodyState::Abort);
            }
            self.stream.write_all(&chunk[..got])?;
            self.core.metrics.add_bytes_out(got as u64);
            remaining -= got as u64;
        }
        Ok(BodyState::Done)
    }

    /// Progressive streaming: send what is on disk, `Wait` for more while
    /// the producing download is still running, `Abort` when it is.
    fn stream_progressive(
        &mut self,
        mut file: File,
        mut path: PathBuf,
        partial_id: Option<u64>,
        start: u64,
        end: u64,
        expected: u64,
    ) -> io::Result<BodyState> {
        let mut sent = start;
        let mut chunk = vec![0u8; self.core.opts.send_buffer_size.max(512)];
        let deadline = Instant::now()
            + Duration::from_secs(self.core.opts.progressive_wait_max_secs.max(1));
        let mut body_state = BodyState::Send;

        while sent <= end {
            if self.core.terminated() {
                return Ok(BodyState::Abort);
            }
            // The producer may abort the download or promote the partial
            // to its final cache location mid-stream.
            if let Some(id) = partial_id {
                match self.core.partials.poll(id) {
                    Some(status) if status.aborted => return Ok(BodyState::Abort),
                    Some(status) if status.path != path => {
                        path = status.path;
                        let mut reopened = File::open(&path)?;
                        reopened.seek(SeekFrom::Start(sent))?;
                        file = reopened;
                    }
                    _ => {}
                }
            }

            let on_disk = file.metadata()?.len();
            let available_end = on_disk.min(end + 1);
            if sent < available_end {
                if body_state == BodyState::Wait {
                    body_state = BodyState::Send;
                }
                file.seek(SeekFrom::Start(sent))?;
                let want = chunk.len().min((available_end - sent) as usize);
                let got = file.read(&mut chunk[..want])?;
                if got == 0 {
                    return Ok(BodyState::Abort);
                }
                self.stream.write_all(&chunk[..got])?;
                self.core.metrics.add_bytes_out(got as u64);
                sent += got as u64;
            } else if on_disk >= expected {
                break;
            } else {
                body_state = BodyState::Wait;
                if Instant::now() >= deadline {
                    warn!(?path, "progressive source stalled, aborting response");
                    return Ok(BodyState::Abort);
                }
                std::thread::sleep(PROGRESSIVE_POLL);
            }
        }

        if let Some(id) = partial_id
            && let Some(status) = self.core.partials.poll(id)
        {
            // The response streamed the whole file; a fully written
            // partial no longer needs publishing.
            let on_disk = std::fs::metadata(&status.path).map(|m| m.len()).unwrap_or(0);
            if on_disk >= status.expected_size {
                self.core.partials.remove(id);
            }
        }
        Ok(BodyState::Done)
    }

    /// Status line plus the server-standard headers.
    fn compose_head(&self, status: u16, keep_alive: bool) -> String {
        self.core.compose_head(status, self.ctx.http10, keep_alive)
    }

    fn send_simple(&mut self, status: u16, body: &[u8], keep_alive: bool) -> io::Result<()> {
        self.send_with_headers(status, body, "", keep_alive)
    }

    fn send_with_headers(
        &mut self,
        status: u16,
        body: &[u8],
        extra: &str,
        keep_alive: bool,
    ) -> io::Result<()> {
        self.ctx.status = status;
        let mut head = self.compose_head(status, keep_alive);
        head.push_str(extra);
        if !body.is_empty() {
            head.push_str("Content-Type: text/html\r\n");
        }
        push_content_length(&mut head, body.len() as u64);
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(body);
        self.stream.write_all(&out)?;
        self.core.metrics.add_bytes_out(out.len() as u64);
        Ok(())
    }

    fn error_body(&self, status: u16) -> Vec<u8> {
        generic_error_html(status)
    }

    fn ban_on_4xx(&self, status: u16) {
        if !self.core.opts.ban_40x {
            return;
        }
        // 401/403 are part of normal authentication traffic.
        if status == 401 || status == 403 {
            return;
        }
        if (400..500).contains(&status) {
            self.core.ban.ban(self.remote.ip());
        }
    }

    /// Read from the socket until the head terminator is buffered.
    /// `Ok(None)` is a clean EOF before any byte of a new request.
    fn fill_until_head_end(&mut self) -> io::Result<Option<usize>> {
        let mut scanned = 0usize;
        loop {
            if let Some(pos) = memchr::memmem::find(&self.buf[scanned..], b"\r\n\r\n") {
                return Ok(Some(scanned + pos + 4));
            }
            scanned = self.buf.len().saturating_sub(3);
            if self.buf.len() >= MAX_HEAD_BYTES {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "head too large"));
            }
            let mut chunk = [0u8; 2048];
            let got = self.stream.read(&mut chunk)?;
            if got == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(io::ErrorKind::UnexpectedEof.into())
                };
            }
            self.core.metrics.add_bytes_in(got as u64);
            self.buf.extend_from_slice(&chunk[..got]);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.core.metrics.dec_conn();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Directives extracted from the handler's custom header block.
#[derive(Default)]
struct HeaderDirectives {
    content_encoding: bool,
    content_type_set: bool,
    expected_size: Option<u64>,
    partial_id: Option<u64>,
}

/// Normalize the handler's custom headers to CRLF lines, stripping the
/// internal progressive-transfer headers into directives.
fn split_custom_headers(raw: &str) -> (String, HeaderDirectives) {
    let mut out = String::with_capacity(raw.len());
    let mut directives = HeaderDirectives::default();
    for line in raw.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let lower_key = line.split(':').next().unwrap_or("").trim().to_ascii_lowercase();
        let value = line.split_once(':').map(|(_, v)| v.trim()).unwrap_or("");
        if lower_key == EXPECTED_SIZE_HEADER.to_ascii_lowercase() {
            directives.expected_size = value.parse().ok();
            continue;
        }
        if lower_key == PARTIAL_ID_HEADER.to_ascii_lowercase() {
            directives.partial_id = value.parse().ok();
            continue;
        }
        if lower_key == "content-encoding" {
            directives.content_encoding = true;
        }
        if lower_key == "content-type" {
            directives.content_type_set = true;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    (out, directives)
}

fn push_content_length(head: &mut String, len: u64) {
    let mut buf = itoa::Buffer::new();
    head.push_str("Content-Length: ");
    head.push_str(buf.format(len));
    head.push_str("\r\n");
}

fn generic_error_html(status: u16) -> Vec<u8> {
    format!(
        "<html><body style=\"font-family:sans-serif\"><h1>{} {}</h1><hr><p><small>mazurka</small></p></body></html>",
        status,
        http::reason_phrase(status)
    )
    .into_bytes()
}
