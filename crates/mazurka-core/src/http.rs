//! HTTP vocabulary shared by the router and the connection layer.

/// The request methods the router keeps a tree for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Options,
    Head,
    Patch,
    Unknown,
}

/// Number of routable methods (everything except `Unknown`).
pub const METHOD_COUNT: usize = 7;

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"OPTIONS" => Method::Options,
            b"HEAD" => Method::Head,
            b"PATCH" => Method::Patch,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Unknown => "?",
        }
    }

    /// Slot in the per-method tree forest, `None` for unroutable methods.
    pub fn index(self) -> Option<usize> {
        match self {
            Method::Get => Some(0),
            Method::Post => Some(1),
            Method::Put => Some(2),
            Method::Delete => Some(3),
            Method::Options => Some(4),
            Method::Head => Some(5),
            Method::Patch => Some(6),
            Method::Unknown => None,
        }
    }

    /// Whether a request with this method carries a body.
    pub fn has_request_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl Default for Method {
    fn default() -> Self {
        Method::Unknown
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content-type sentinel: the handler produced no body at all.
pub const NO_RESPONSE: &str = "!NORESPONSE";

/// Content-type sentinel: the response body is a UTF-8 file name to stream.
pub const STATIC_FILE: &str = "!STATICFILE";

/// Internal response header carrying the expected full size of a
/// progressive file. Consumed and stripped by the connection layer.
pub const EXPECTED_SIZE_HEADER: &str = "X-Mazurka-Expected-Size";

/// Internal response header carrying the partial-registry id of a
/// progressive file. Consumed and stripped by the connection layer.
pub const PARTIAL_ID_HEADER: &str = "X-Mazurka-Partial-Id";

/// RFC reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        410 => "Gone",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a teapot",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
