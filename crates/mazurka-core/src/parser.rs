//! HTTP/1.x request-head parsing.
//!
//! The head is read off the socket into a byte buffer by the connection
//! layer; everything here is pure so it can be tested without sockets.

use memchr::memchr;

use crate::http::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Not enough bytes yet for a full head.
    Incomplete,
    /// Malformed request line or header.
    InvalidFormat,
    /// Header block exceeds the configured line limit.
    TooLarge,
    /// `Transfer-Encoding` request bodies are not supported.
    UnsupportedEncoding,
}

/// A `Range: bytes=start[-end]` request. `end` is inclusive when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: Option<u64>,
}

/// Parsed request head with the recognized headers short-circuited.
#[derive(Debug, Default, PartialEq)]
pub struct RequestHead {
    pub method: Method,
    pub url: String,
    pub http10: bool,
    pub content_length: Option<u64>,
    pub content_type: String,
    pub content_encoding: String,
    pub connection_close: bool,
    pub connection_keep_alive: bool,
    pub connection_upgrade: bool,
    pub authorization: String,
    pub accept_encoding: String,
    pub host: String,
    pub user_agent: String,
    pub referer: String,
    pub expect_continue: bool,
    pub range: Option<RangeSpec>,
    pub if_none_match: String,
    /// Value of the configured proxy real-IP header, when present.
    pub forwarded_ip: Option<String>,
    /// Value of the configured connection-id header, when present.
    pub forwarded_conn_id: Option<u32>,
    /// Every header line as received, for handlers that need the rest.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Options steering head recognition.
#[derive(Debug, Default, Clone)]
pub struct HeadOptions {
    /// Header carrying the client IP when behind a trusted proxy.
    pub remote_ip_header: Option<String>,
    /// Header carrying an externally assigned connection id.
    pub conn_id_header: Option<String>,
    /// Maximum number of header lines accepted (0 = default 128).
    pub max_header_lines: usize,
}

fn is_valid_uri_byte(b: u8) -> bool {
    // Printable ASCII only; control bytes and 8-bit data are rejected.
    (0x21..=0x7e).contains(&b)
}

/// Parse the full head (request line + header lines) from `buf`, which must
/// contain everything up to and including the terminating blank line.
pub fn parse_head(buf: &[u8], opts: &HeadOptions) -> Result<RequestHead, ParseError> {
    let mut head = RequestHead::default();

    let line_end = memchr(b'\n', buf).ok_or(ParseError::Incomplete)?;
    let line = trim_cr(&buf[..line_end]);
    parse_request_line(line, &mut head)?;

    let max_lines = if opts.max_header_lines == 0 {
        128
    } else {
        opts.max_header_lines
    };

    let mut cursor = line_end + 1;
    let mut lines = 0usize;
    loop {
        let rest = &buf[cursor..];
        let end = memchr(b'\n', rest).ok_or(ParseError::Incomplete)?;
        let line = trim_cr(&rest[..end]);
        cursor += end + 1;
        if line.is_empty() {
            break;
        }
        lines += 1;
        if lines > max_lines {
            return Err(ParseError::TooLarge);
        }
        parse_header_line(line, &mut head, opts)?;
    }

    Ok(head)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn parse_request_line(line: &[u8], head: &mut RequestHead) -> Result<(), ParseError> {
    let sp1 = memchr(b' ', line).ok_or(ParseError::InvalidFormat)?;
    head.method = Method::from_bytes(&line[..sp1]);

    let rest = &line[sp1 + 1..];
    let sp2 = memchr(b' ', rest).ok_or(ParseError::InvalidFormat)?;
    let uri = &rest[..sp2];
    if uri.is_empty() || !uri.iter().all(|&b| is_valid_uri_byte(b)) {
        return Err(ParseError::InvalidFormat);
    }
    head.url = String::from_utf8(uri.to_vec()).map_err(|_| ParseError::InvalidFormat)?;

    let version = &rest[sp2 + 1..];
    if !version.starts_with(b"HTTP/") || version.len() != 8 || version[6] != b'.' {
        return Err(ParseError::InvalidFormat);
    }
    match (version[5], version[7]) {
        (b'1', b'0') => head.http10 = true,
        (b'1', b'1') => head.http10 = false,
        _ => return Err(ParseError::InvalidFormat),
    }
    Ok(())
}

fn parse_header_line(
    line: &[u8],
    head: &mut RequestHead,
    opts: &HeadOptions,
) -> Result<(), ParseError> {
    let colon = memchr(b':', line).ok_or(ParseError::InvalidFormat)?;
    if colon == 0 {
        return Err(ParseError::InvalidFormat);
    }
    let name = std::str::from_utf8(&line[..colon]).map_err(|_| ParseError::InvalidFormat)?;
    let mut value = &line[colon + 1..];
    while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
        value = &value[1..];
    }
    if value.iter().any(|&b| b < 0x20 && b != b'\t') {
        return Err(ParseError::InvalidFormat);
    }
    let value = std::str::from_utf8(value).map_err(|_| ParseError::InvalidFormat)?;

    if name.eq_ignore_ascii_case("content-length") {
        head.content_length = Some(value.parse().map_err(|_| ParseError::InvalidFormat)?);
    } else if name.eq_ignore_ascii_case("transfer-encoding") {
        return Err(ParseError::UnsupportedEncoding);
    } else if name.eq_ignore_ascii_case("content-type") {
        head.content_type = value.to_string();
    } else if name.eq_ignore_ascii_case("content-encoding") {
        head.content_encoding = value.to_ascii_lowercase();
    } else if name.eq_ignore_ascii_case("connection") {
        for token in value.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                head.connection_close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                head.connection_keep_alive = true;
            } else if token.eq_ignore_ascii_case("upgrade") {
                head.connection_upgrade = true;
            }
        }
    } else if name.eq_ignore_ascii_case("authorization") {
        head.authorization = value.to_string();
    } else if name.eq_ignore_ascii_case("accept-encoding") {
        head.accept_encoding = value.to_ascii_lowercase();
    } else if name.eq_ignore_ascii_case("host") {
        head.host = value.to_string();
    } else if name.eq_ignore_ascii_case("user-agent") {
        head.user_agent = value.to_string();
    } else if name.eq_ignore_ascii_case("referer") {
        head.referer = value.to_string();
    } else if name.eq_ignore_ascii_case("expect") {
        head.expect_continue = value.eq_ignore_ascii_case("100-continue");
    } else if name.eq_ignore_ascii_case("range") {
        head.range = parse_range(value);
    } else if name.eq_ignore_ascii_case("if-none-match") {
        head.if_none_match = value.to_string();
    } else if let Some(ip_header) = &opts.remote_ip_header
        && name.eq_ignore_ascii_case(ip_header)
    {
        head.forwarded_ip = Some(value.to_string());
    } else if let Some(id_header) = &opts.conn_id_header
        && name.eq_ignore_ascii_case(id_header)
    {
        head.forwarded_conn_id = value.parse().ok();
    }

    head.headers.push((name.to_string(), value.to_string()));
    Ok(())
}

/// Parse `bytes=start[-end]`. Multi-range requests are not supported and
/// yield `None`, which downgrades the response to a plain 200.
fn parse_range(value: &str) -> Option<RangeSpec> {
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let dash = spec.find('-')?;
    let start: u64 = spec[..dash].parse().ok()?;
    let end_str = &spec[dash + 1..];
    let end = if end_str.is_empty() {
        None
    } else {
        let e: u64 = end_str.parse().ok()?;
        if e < start {
            return None;
        }
        Some(e)
    };
    Some(RangeSpec { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> HeadOptions {
        HeadOptions::default()
    }

    #[test]
    fn parse_basic_request() {
        let buf = b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nUser-Agent: curl\r\n\r\n";
        let head = parse_head(buf, &opts()).unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.url, "/some/path?foo=bar");
        assert!(!head.http10);
        assert_eq!(head.host, "localhost");
        assert_eq!(head.user_agent, "curl");
        assert_eq!(head.headers.len(), 2);
    }

    #[test]
    fn detects_http10() {
        let head = parse_head(b"GET / HTTP/1.0\r\n\r\n", &opts()).unwrap();
        assert!(head.http10);
    }

    #[test]
    fn rejects_bad_version() {
        assert_eq!(
            parse_head(b"GET / HTTP/2.0\r\n\r\n", &opts()),
            Err(ParseError::InvalidFormat)
        );
        assert_eq!(
            parse_head(b"GET / FTP/1.1\r\n\r\n", &opts()),
            Err(ParseError::InvalidFormat)
        );
    }

    #[test]
    fn rejects_control_bytes_in_uri() {
        assert_eq!(
            parse_head(b"GET /a\x01b HTTP/1.1\r\n\r\n", &opts()),
            Err(ParseError::InvalidFormat)
        );
    }

    #[test]
    fn rejects_transfer_encoding() {
        let buf = b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(parse_head(buf, &opts()), Err(ParseError::UnsupportedEncoding));
    }

    #[test]
    fn incomplete_head() {
        assert_eq!(
            parse_head(b"GET / HTTP/1.1\r\nHost: x", &opts()),
            Err(ParseError::Incomplete)
        );
    }

    #[test]
    fn recognized_headers() {
        let buf = b"POST /u HTTP/1.1\r\nContent-Length: 12\r\nContent-Type: text/plain\r\nConnection: close\r\nExpect: 100-continue\r\nIf-None-Match: \"abc\"\r\n\r\n";
        let head = parse_head(buf, &opts()).unwrap();
        assert_eq!(head.content_length, Some(12));
        assert_eq!(head.content_type, "text/plain");
        assert!(head.connection_close);
        assert!(head.expect_continue);
        assert_eq!(head.if_none_match, "\"abc\"");
    }

    #[test]
    fn forwarded_headers() {
        let o = HeadOptions {
            remote_ip_header: Some("X-Real-IP".into()),
            conn_id_header: Some("X-Conn-Id".into()),
            max_header_lines: 0,
        };
        let buf = b"GET / HTTP/1.1\r\nX-Real-IP: 10.1.2.3\r\nX-Conn-Id: 77\r\n\r\n";
        let head = parse_head(buf, &o).unwrap();
        assert_eq!(head.forwarded_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(head.forwarded_conn_id, Some(77));
    }

    #[test]
    fn header_line_cap() {
        let mut buf = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..4 {
            buf.extend_from_slice(format!("H{}: v\r\n", i).as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        let o = HeadOptions {
            max_header_lines: 3,
            ..Default::default()
        };
        assert_eq!(parse_head(&buf, &o), Err(ParseError::TooLarge));
    }

    #[test]
    fn range_forms() {
        assert_eq!(
            parse_range("bytes=100-199"),
            Some(RangeSpec {
                start: 100,
                end: Some(199)
            })
        );
        assert_eq!(parse_range("bytes=100-"), Some(RangeSpec { start: 100, end: None }));
        assert_eq!(parse_range("bytes=100-50"), None);
        assert_eq!(parse_range("bytes=1-2,5-6"), None);
        assert_eq!(parse_range("items=0-1"), None);
    }
}
