//! Prefix-compressed URI tree with typed placeholders.
//!
//! One tree exists per HTTP method (see [`crate::router`]). Nodes carry a
//! compressed literal run; parameter children capture URL spans without
//! allocating. A terminal node holds either a rewrite rule or a callback,
//! never both.
//!
//! Placeholder grammar: `<name>`, `<string:name>`, `<int:name>`,
//! `<path:name>`; a trailing `*` segment is sugar for `<path:path>`.

use std::sync::Arc;

use crate::context::{Capture, Context};
use crate::error::{CoreError, CoreResult};
use crate::http::Method;

/// Typed parameter kinds, in match-priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParamKind {
    /// Matches a non-empty span up to the next `/`.
    Str,
    /// Matches a non-empty all-digit span up to the next `/`.
    Int,
    /// Matches the remainder of the URL, slashes included.
    Path,
}

/// Callback signature: receives the context and the opaque tag stored at
/// registration, returns the response status (0 = not handled).
pub type RouteCallbackFn = fn(&mut Context, usize) -> u16;

#[derive(Clone, Copy)]
pub struct RouteCallback {
    pub func: RouteCallbackFn,
    pub tag: usize,
}

/// One piece of a pre-parsed rewrite destination: an optional literal run
/// from the template followed by an optional capture substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePart {
    pub lit_offset: u32,
    pub lit_len: u32,
    pub capture: Option<u16>,
}

/// A parsed rewrite destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    template: String,
    parts: Vec<RewritePart>,
    static_len: usize,
    to_method: Method,
    /// When set, the rule short-circuits with this status instead of
    /// rewriting.
    status: Option<u16>,
}

impl RewriteRule {
    /// Parse `destination` against the capture names of the source pattern.
    ///
    /// A bare 3-digit destination in 200..=599 produces a status rule.
    pub fn parse(destination: &str, to_method: Method, names: &[String]) -> CoreResult<Self> {
        if destination.len() == 3
            && let Ok(status) = destination.parse::<u16>()
            && (200..=599).contains(&status)
        {
            return Ok(Self {
                template: String::new(),
                parts: Vec::new(),
                static_len: 0,
                to_method,
                status: Some(status),
            });
        }

        let template = destination.to_string();
        let bytes = template.as_bytes();
        let mut parts = Vec::new();
        let mut static_len = 0usize;
        let mut lit_start = 0usize;
        let mut i = 0usize;
        while i < bytes.len() {
            if bytes[i] == b'<' {
                let close = template[i..]
                    .find('>')
                    .map(|p| i + p)
                    .ok_or_else(|| CoreError::InvalidPattern(template.clone()))?;
                let name = &template[i + 1..close];
                let capture = names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| CoreError::UnknownCapture(name.to_string()))?;
                static_len += i - lit_start;
                parts.push(RewritePart {
                    lit_offset: lit_start as u32,
                    lit_len: (i - lit_start) as u32,
                    capture: Some(capture as u16),
                });
                i = close + 1;
                lit_start = i;
            } else {
                i += 1;
            }
        }
        if lit_start < bytes.len() || parts.is_empty() {
            static_len += bytes.len() - lit_start;
            parts.push(RewritePart {
                lit_offset: lit_start as u32,
                lit_len: (bytes.len() - lit_start) as u32,
                capture: None,
            });
        }

        Ok(Self {
            template,
            parts,
            static_len,
            to_method,
            status: None,
        })
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Apply the rule to a matched context. Returns the status for a
    /// status rule, 0 after a URL/method rewrite.
    pub fn apply(&self, ctx: &mut Context) -> u16 {
        if let Some(status) = self.status {
            return status;
        }

        let mut cap_total = 0usize;
        for part in &self.parts {
            if let Some(i) = part.capture {
                cap_total += ctx.param_bytes(i as usize).map_or(0, str::len);
            }
        }
        let mut url = String::with_capacity(self.static_len + cap_total + 8);
        for part in &self.parts {
            if part.lit_len > 0 {
                let off = part.lit_offset as usize;
                url.push_str(&self.template[off..off + part.lit_len as usize]);
            }
            if let Some(i) = part.capture
                && let Some(v) = ctx.param_bytes(i as usize)
            {
                url.push_str(v);
            }
        }
        // The query part never participates in routing; carry it over.
        if let Some(q) = ctx.query()
            && !self.template.contains('?')
        {
            url.push('?');
            url.push_str(q);
        }

        if self.to_method != Method::Unknown {
            ctx.method = self.to_method;
        }
        ctx.url = url;
        ctx.captures.clear();
        ctx.route_names = None;
        ctx.url_params_set = false;
        if let Some(q) = memchr::memchr(b'?', ctx.url.as_bytes()) {
            ctx.url_params_set = true;
            ctx.query_offset = (q + 1) as u32;
        }
        0
    }
}

/// Terminal action of a node.
#[derive(Clone)]
pub enum NodePayload {
    Empty,
    Rewrite(Arc<RewriteRule>),
    Execute(RouteCallback),
}

impl NodePayload {
    fn is_empty(&self) -> bool {
        matches!(self, NodePayload::Empty)
    }

    fn same_action(&self, other: &NodePayload) -> bool {
        match (self, other) {
            (NodePayload::Rewrite(a), NodePayload::Rewrite(b)) => a == b,
            (NodePayload::Execute(a), NodePayload::Execute(b)) => {
                std::ptr::fn_addr_eq(a.func, b.func) && a.tag == b.tag
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Lit(String),
    Param(ParamKind),
}

/// Split a route pattern into literal runs and placeholders.
fn tokenize(pattern: &str) -> CoreResult<(Vec<Token>, Vec<String>)> {
    if !pattern.starts_with('/') {
        return Err(CoreError::InvalidPattern(pattern.to_string()));
    }
    let bytes = pattern.as_bytes();
    let mut tokens = Vec::new();
    let mut names: Vec<String> = Vec::new();
    let mut lit_start = 0usize;
    let mut i = 0usize;

    let mut push_param = |tokens: &mut Vec<Token>,
                          names: &mut Vec<String>,
                          kind: ParamKind,
                          name: &str|
     -> CoreResult<()> {
        if name.is_empty() || names.iter().any(|n| n == name) {
            return Err(CoreError::InvalidPattern(pattern.to_string()));
        }
        names.push(name.to_string());
        tokens.push(Token::Param(kind));
        Ok(())
    };

    while i < bytes.len() {
        match bytes[i] {
            b'<' => {
                if lit_start < i {
                    tokens.push(Token::Lit(pattern[lit_start..i].to_string()));
                }
                let close = pattern[i..]
                    .find('>')
                    .map(|p| i + p)
                    .ok_or_else(|| CoreError::InvalidPattern(pattern.to_string()))?;
                let inner = &pattern[i + 1..close];
                let (kind, name) = match inner.split_once(':') {
                    Some(("int", n)) => (ParamKind::Int, n),
                    Some(("path", n)) => (ParamKind::Path, n),
                    Some(("string", n)) => (ParamKind::Str, n),
                    Some(_) => return Err(CoreError::InvalidPattern(pattern.to_string())),
                    None => (ParamKind::Str, inner),
                };
                push_param(&mut tokens, &mut names, kind, name)?;
                i = close + 1;
                lit_start = i;
            }
            b'*' if i + 1 == bytes.len() && (i == 0 || bytes[i - 1] == b'/') => {
                if lit_start < i {
                    tokens.push(Token::Lit(pattern[lit_start..i].to_string()));
                }
                push_param(&mut tokens, &mut names, ParamKind::Path, "path")?;
                i += 1;
                lit_start = i;
            }
            _ => i += 1,
        }
    }
    if lit_start < bytes.len() {
        tokens.push(Token::Lit(pattern[lit_start..].to_string()));
    }

    // A path capture swallows the rest of the URL, nothing may follow it.
    for (pos, token) in tokens.iter().enumerate() {
        if matches!(token, Token::Param(ParamKind::Path)) && pos + 1 != tokens.len() {
            return Err(CoreError::InvalidPattern(pattern.to_string()));
        }
    }

    Ok((tokens, names))
}

/// Capture names a pattern declares, in order of appearance. Used to
/// resolve rewrite destinations before the pattern is inserted.
pub fn pattern_names(pattern: &str) -> CoreResult<Vec<String>> {
    tokenize(pattern).map(|(_, names)| names)
}

/// One node of the compressed tree.
pub struct Node {
    /// Literal run owned by this node; empty for the root and param nodes.
    text: String,
    /// Set when this node is a parameter node.
    param: Option<ParamKind>,
    /// Literal children, looked up by first byte.
    children: Vec<Node>,
    /// Parameter children, kept ordered `Str`, `Int`, `Path`.
    param_children: Vec<Node>,
    payload: NodePayload,
    /// Capture names along the path, set on terminal nodes.
    names: Option<Arc<[String]>>,
}

impl Node {
    pub fn new_root() -> Self {
        Self::new_literal(String::new())
    }

    fn new_literal(text: String) -> Self {
        Self {
            text,
            param: None,
            children: Vec::new(),
            param_children: Vec::new(),
            payload: NodePayload::Empty,
            names: None,
        }
    }

    fn new_param(kind: ParamKind) -> Self {
        Self {
            text: String::new(),
            param: Some(kind),
            children: Vec::new(),
            param_children: Vec::new(),
            payload: NodePayload::Empty,
            names: None,
        }
    }

    /// Register `pattern` with `payload`. Identical re-registration is
    /// idempotent; a different action for the same pattern is an error.
    pub fn insert(&mut self, pattern: &str, payload: NodePayload) -> CoreResult<()> {
        let (tokens, names) = tokenize(pattern)?;
        let names: Arc<[String]> = Arc::from(names.into_boxed_slice());
        self.insert_tokens(&tokens, &names, payload, pattern)
    }

    fn insert_tokens(
        &mut self,
        tokens: &[Token],
        names: &Arc<[String]>,
        payload: NodePayload,
        pattern: &str,
    ) -> CoreResult<()> {
        let Some(token) = tokens.first() else {
            if !self.payload.is_empty() {
                if self.payload.same_action(&payload) {
                    return Ok(());
                }
                return Err(CoreError::RouteConflict(pattern.to_string()));
            }
            self.payload = payload;
            self.names = Some(names.clone());
            return Ok(());
        };

        match token {
            Token::Param(kind) => {
                let child = match self
                    .param_children
                    .iter()
                    .position(|c| c.param == Some(*kind))
                {
                    Some(i) => &mut self.param_children[i],
                    None => {
                        self.param_children.push(Node::new_param(*kind));
                        self.param_children.sort_by_key(|c| c.param);
                        let i = self
                            .param_children
                            .iter()
                            .position(|c| c.param == Some(*kind))
                            .unwrap();
                        &mut self.param_children[i]
                    }
                };
                child.insert_tokens(&tokens[1..], names, payload, pattern)
            }
            Token::Lit(text) => self.insert_literal(text, &tokens[1..], names, payload, pattern),
        }
    }

    fn insert_literal(
        &mut self,
        text: &str,
        rest: &[Token],
        names: &Arc<[String]>,
        payload: NodePayload,
        pattern: &str,
    ) -> CoreResult<()> {
        let first = text.as_bytes()[0];
        let pos = self
            .children
            .iter()
            .position(|c| c.text.as_bytes()[0] == first);

        let Some(pos) = pos else {
            self.children.push(Node::new_literal(text.to_string()));
            let child = self.children.last_mut().unwrap();
            return child.insert_tokens(rest, names, payload, pattern);
        };

        let child = &mut self.children[pos];
        let common = common_prefix_len(child.text.as_bytes(), text.as_bytes());

        if common < child.text.len() {
            // Split the existing edge at the divergence point.
            let tail = child.text.split_off(common);
            let mut lower = Node::new_literal(tail);
            std::mem::swap(&mut lower.children, &mut child.children);
            std::mem::swap(&mut lower.param_children, &mut child.param_children);
            lower.payload = std::mem::replace(&mut child.payload, NodePayload::Empty);
            lower.names = child.names.take();
            child.children.push(lower);
        }

        if common == text.len() {
            child.insert_tokens(rest, names, payload, pattern)
        } else {
            child.insert_literal(&text[common..], rest, names, payload, pattern)
        }
    }

    /// Descend into `path` (the URL up to any `?`). Captures are appended
    /// to `caps`; the first terminal match wins.
    pub fn lookup<'a>(&'a self, path: &[u8], caps: &mut Vec<Capture>) -> Option<&'a Node> {
        self.descend(path, 0, caps)
    }

    fn descend<'a>(&'a self, path: &[u8], pos: usize, caps: &mut Vec<Capture>) -> Option<&'a Node> {
        if pos == path.len() {
            if !self.payload.is_empty() {
                return Some(self);
            }
            // A path capture may still match the empty remainder.
            for child in &self.param_children {
                if child.param == Some(ParamKind::Path) && !child.payload.is_empty() {
                    caps.push(Capture {
                        offset: pos as u32,
                        len: 0,
                    });
                    return Some(child);
                }
            }
            return None;
        }

        let b = path[pos];
        for child in &self.children {
            if child.text.as_bytes()[0] == b
                && path[pos..].starts_with(child.text.as_bytes())
                && let Some(hit) = child.descend(path, pos + child.text.len(), caps)
            {
                return Some(hit);
            }
        }

        for child in &self.param_children {
            let saved = caps.len();
            let end = match child.param {
                Some(ParamKind::Str) => {
                    let end = segment_end(path, pos);
                    if end == pos {
                        continue;
                    }
                    end
                }
                Some(ParamKind::Int) => {
                    let end = segment_end(path, pos);
                    if end == pos || !path[pos..end].iter().all(u8::is_ascii_digit) {
                        continue;
                    }
                    end
                }
                Some(ParamKind::Path) => path.len(),
                None => continue,
            };
            caps.push(Capture {
                offset: pos as u32,
                len: (end - pos) as u32,
            });
            if let Some(hit) = child.descend(path, end, caps) {
                return Some(hit);
            }
            caps.truncate(saved);
        }

        None
    }

    pub fn payload(&self) -> &NodePayload {
        &self.payload
    }

    pub fn names(&self) -> Option<&Arc<[String]>> {
        self.names.as_ref()
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let max = a.len().min(b.len());
    let mut i = 0;
    while i < max && a[i] == b[i] {
        i += 1;
    }
    i
}

fn segment_end(path: &[u8], pos: usize) -> usize {
    memchr::memchr(b'/', &path[pos..]).map_or(path.len(), |p| pos + p)
}
