//! Per-method URI routing: registration, rewrite and callback dispatch.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::context::Context;
use crate::error::{CoreError, CoreResult};
use crate::http::{METHOD_COUNT, Method};
use crate::uri_tree::{Node, NodePayload, RewriteRule, RouteCallback, RouteCallbackFn};

struct Forest {
    trees: [Node; METHOD_COUNT],
}

/// The URI router: one prefix-compressed tree per method.
///
/// Registration takes the writer lock and happens at setup time; lookups
/// take the reader lock and never block each other. Static lookups do not
/// allocate.
pub struct Router {
    forest: RwLock<Forest>,
    counters: [AtomicU32; METHOD_COUNT],
}

impl Router {
    pub fn new() -> Self {
        Self {
            forest: RwLock::new(Forest {
                trees: std::array::from_fn(|_| Node::new_root()),
            }),
            counters: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Register a rewrite: requests matching `pattern` on `method` are
    /// re-targeted to `to_method` + `destination` before normal dispatch.
    ///
    /// `destination` is either a URL template referencing the pattern's
    /// captures by `<name>`, or a bare 3-digit status to return as-is.
    pub fn rewrite(
        &self,
        method: Method,
        pattern: &str,
        to_method: Method,
        destination: &str,
    ) -> CoreResult<()> {
        let idx = method
            .index()
            .ok_or_else(|| CoreError::InvalidPattern(pattern.to_string()))?;
        let mut forest = self.forest.write();
        // Names are discovered by a dry tokenize inside insert; the rule is
        // parsed against them first so registration errors never reach
        // dispatch.
        let names = crate::uri_tree::pattern_names(pattern)?;
        let rule = RewriteRule::parse(destination, to_method, &names)?;
        forest.trees[idx].insert(pattern, NodePayload::Rewrite(rule.into()))?;
        self.counters[idx].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Register `callback` for `pattern` on every method in `methods`.
    /// `tag` is an opaque value surfaced to the callback via the context.
    pub fn run(
        &self,
        methods: &[Method],
        pattern: &str,
        callback: RouteCallbackFn,
        tag: usize,
    ) -> CoreResult<()> {
        let mut forest = self.forest.write();
        for &method in methods {
            let idx = method
                .index()
                .ok_or_else(|| CoreError::InvalidPattern(pattern.to_string()))?;
            forest.trees[idx].insert(
                pattern,
                NodePayload::Execute(RouteCallback {
                    func: callback,
                    tag,
                }),
            )?;
            self.counters[idx].fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Same-method URL rewrite shorthand.
    pub fn get(&self, pattern: &str, destination: &str) -> CoreResult<()> {
        self.rewrite(Method::Get, pattern, Method::Get, destination)
    }

    pub fn post(&self, pattern: &str, destination: &str) -> CoreResult<()> {
        self.rewrite(Method::Post, pattern, Method::Post, destination)
    }

    pub fn put(&self, pattern: &str, destination: &str) -> CoreResult<()> {
        self.rewrite(Method::Put, pattern, Method::Put, destination)
    }

    pub fn delete(&self, pattern: &str, destination: &str) -> CoreResult<()> {
        self.rewrite(Method::Delete, pattern, Method::Delete, destination)
    }

    /// Number of routes registered for `method`.
    pub fn route_count(&self, method: Method) -> u32 {
        method
            .index()
            .map(|i| self.counters[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Match `ctx` against the tree for its method.
    ///
    /// Returns 0 when no route matched or after a rewrite mutated the
    /// context (the caller continues normal dispatch with the new values);
    /// a status in 1..=999 when a callback ran or a status rule matched.
    pub fn process(&self, ctx: &mut Context) -> u16 {
        let Some(idx) = ctx.method.index() else {
            return 0;
        };

        ctx.captures.clear();
        ctx.route_names = None;
        let url = std::mem::take(&mut ctx.url);
        let bytes = url.as_bytes();
        let route_len = memchr::memchr(b'?', bytes).unwrap_or(bytes.len());
        if route_len < bytes.len() {
            ctx.url_params_set = true;
            ctx.query_offset = (route_len + 1) as u32;
        }

        let action = {
            let forest = self.forest.read();
            match forest.trees[idx].lookup(&bytes[..route_len], &mut ctx.captures) {
                Some(node) => {
                    ctx.route_names = node.names().cloned();
                    match node.payload() {
                        NodePayload::Execute(cb) => Some(Action::Execute(*cb)),
                        NodePayload::Rewrite(rule) => Some(Action::Rewrite(rule.clone())),
                        NodePayload::Empty => None,
                    }
                }
                None => None,
            }
        };
        ctx.url = url;

        // The read guard is released before user code runs, so a callback
        // may itself consult or extend the router.
        match action {
            Some(Action::Execute(cb)) => {
                ctx.route_tag = cb.tag;
                (cb.func)(ctx, cb.tag)
            }
            Some(Action::Rewrite(rule)) => rule.apply(ctx),
            None => {
                ctx.captures.clear();
                0
            }
        }
    }
}

enum Action {
    Execute(RouteCallback),
    Rewrite(std::sync::Arc<RewriteRule>),
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
