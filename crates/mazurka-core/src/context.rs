//! Per-request mutable state handed to router callbacks and handlers.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::http::Method;
use crate::parser::RequestHead;

/// A captured route parameter: byte range into [`Context::url`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    pub offset: u32,
    pub len: u32,
}

/// Per-request context. Created once per request and recycled between
/// keep-alive exchanges via [`Context::reset`].
pub struct Context {
    pub method: Method,
    /// Request URL; a router rewrite replaces it in place.
    pub url: String,
    pub head: RequestHead,
    pub body: Vec<u8>,
    pub remote_ip: IpAddr,
    pub connection_id: u32,

    // Connection flags.
    pub tls: bool,
    pub upgrade: bool,
    pub http10: bool,
    pub authorized: bool,
    /// Set when the URL contained a `?`; routing ignored the query part.
    pub url_params_set: bool,
    /// Offset of the byte after `?` when `url_params_set` holds.
    pub query_offset: u32,

    // Response side, filled by the handler.
    pub status: u16,
    pub resp_body: Vec<u8>,
    pub resp_content_type: String,
    /// Raw custom header lines; normalized to CRLF by the connection layer.
    pub resp_headers: String,

    pub authenticated_user: String,
    pub bearer: String,
    pub error_message: String,

    pub captures: Vec<Capture>,
    /// Parameter names of the matched route, in capture order.
    pub route_names: Option<Arc<[String]>>,
    /// Opaque tag stored at route registration, surfaced to callbacks.
    pub route_tag: usize,
}

impl Context {
    pub fn new() -> Self {
        Self {
            method: Method::Unknown,
            url: String::new(),
            head: RequestHead::default(),
            body: Vec::new(),
            remote_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connection_id: 0,
            tls: false,
            upgrade: false,
            http10: false,
            authorized: false,
            url_params_set: false,
            query_offset: 0,
            status: 0,
            resp_body: Vec::new(),
            resp_content_type: String::new(),
            resp_headers: String::new(),
            authenticated_user: String::new(),
            bearer: String::new(),
            error_message: String::new(),
            captures: Vec::new(),
            route_names: None,
            route_tag: 0,
        }
    }

    /// Clear all per-request state while keeping allocated buffers, so a
    /// recycled context does not re-allocate on the next exchange.
    pub fn reset(&mut self) {
        self.method = Method::Unknown;
        self.url.clear();
        self.head = RequestHead::default();
        self.body.clear();
        self.tls = false;
        self.upgrade = false;
        self.http10 = false;
        self.authorized = false;
        self.url_params_set = false;
        self.query_offset = 0;
        self.status = 0;
        self.resp_body.clear();
        self.resp_content_type.clear();
        self.resp_headers.clear();
        self.authenticated_user.clear();
        self.bearer.clear();
        self.error_message.clear();
        self.captures.clear();
        self.route_names = None;
        self.route_tag = 0;
    }

    /// Raw bytes of capture `i`.
    pub fn param_bytes(&self, i: usize) -> Option<&str> {
        let c = self.captures.get(i)?;
        self.url.get(c.offset as usize..(c.offset + c.len) as usize)
    }

    /// Capture `i` as a string slice into the URL.
    pub fn param_str(&self, i: usize) -> Option<&str> {
        self.param_bytes(i)
    }

    /// Capture `i` parsed as an integer.
    pub fn param_int(&self, i: usize) -> Option<i64> {
        self.param_bytes(i)?.parse().ok()
    }

    /// Capture looked up by the name it carried in the route pattern.
    pub fn param(&self, name: &str) -> Option<&str> {
        let names = self.route_names.as_ref()?;
        let i = names.iter().position(|n| n == name)?;
        self.param_bytes(i)
    }

    /// The query string after `?`, when one was present.
    pub fn query(&self) -> Option<&str> {
        if self.url_params_set {
            self.url.get(self.query_offset as usize..)
        } else {
            None
        }
    }

    /// Fill the request side from a parsed head.
    pub fn apply_head(&mut self, head: RequestHead) {
        self.method = head.method;
        self.url = head.url.clone();
        self.http10 = head.http10;
        self.upgrade = head.connection_upgrade;
        self.head = head;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
