//! Socket server: bind/listen/accept loop, ban filter, worker dispatch.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::auth::AuthEngine;
use crate::ban::BanSet;
use crate::compress::CompressRegistry;
use crate::conn::Connection;
use crate::context::Context;
use crate::error::{CoreError, CoreResult};
use crate::http::reason_phrase;
use crate::metrics::ServerMetrics;
use crate::parser::HeadOptions;
use crate::partial::PartialRegistry;
use crate::pool::WorkerPool;
use crate::router::Router;

/// Fixed response for banned sources; sent before any parsing.
const TEAPOT: &[u8] =
    b"HTTP/1.1 418 I'm a teapot\r\nConnection: close\r\nContent-Length: 16\r\n\r\n418 I'm a teapot";

/// Request-side hooks and the main handler.
///
/// `on_before_body` returns 0 or 202 to continue (202 = accept the body
/// and defer to the main handler); any other status rejects the exchange.
pub trait Hooks: Send + Sync {
    fn on_header_parsed(&self, ctx: &mut Context) -> Option<u16> {
        let _ = ctx;
        None
    }

    fn on_before_body(&self, ctx: &mut Context) -> u16 {
        let _ = ctx;
        0
    }

    /// The main request handler. Return 0 for "not handled" (becomes 404).
    fn on_request(&self, ctx: &mut Context) -> u16;

    /// Called from the accept thread roughly once per second while idle.
    fn on_idle(&self) {}
}

/// Adapter so a plain function or closure can serve as the handler.
pub struct FnHooks<F>(pub F);

impl<F> Hooks for FnHooks<F>
where
    F: Fn(&mut Context) -> u16 + Send + Sync,
{
    fn on_request(&self, ctx: &mut Context) -> u16 {
        (self.0)(ctx)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub bind_host: String,
    pub port: u16,
    pub server_name: String,
    pub x_powered_by: Option<String>,
    pub send_date: bool,
    /// < 0: serve on the accept thread; 0: thread per connection;
    /// > 0: bounded pool of this many workers.
    pub pool_size: i32,
    pub pool_queue_cap: usize,
    /// Cap on promoted long-lived workers.
    pub dedicated_cap: usize,
    pub keep_alive_timeout_secs: u64,
    pub header_read_timeout_secs: u64,
    pub max_body_size: u64,
    /// Uploads above this promote the connection out of the pool.
    pub large_body_threshold: u64,
    pub send_buffer_size: usize,
    pub progressive_wait_max_secs: u64,
    /// Ban IPs that produce non-401/403 4xx responses or header timeouts.
    pub ban_40x: bool,
    pub ban_ttl_secs: usize,
    pub remote_ip_header: Option<String>,
    pub conn_id_header: Option<String>,
    pub max_header_lines: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8080,
            server_name: "mazurka".to_string(),
            x_powered_by: Some(concat!("mazurka/", env!("CARGO_PKG_VERSION")).to_string()),
            send_date: true,
            pool_size: num_cpus::get() as i32,
            pool_queue_cap: 256,
            dedicated_cap: 512,
            keep_alive_timeout_secs: 30,
            header_read_timeout_secs: 30,
            max_body_size: 64 * 1024 * 1024,
            large_body_threshold: 16 * 1024,
            send_buffer_size: 64 * 1024,
            progressive_wait_max_secs: 30,
            ban_40x: false,
            ban_ttl_secs: 4,
            remote_ip_header: None,
            conn_id_header: None,
            max_header_lines: 128,
        }
    }
}

impl ServerOptions {
    /// Load overrides from environment variables (with `.env` support).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut opts = Self::default();
        if let Ok(v) = std::env::var("MAZURKA_HOST") {
            opts.bind_host = v;
        }
        if let Ok(v) = std::env::var("MAZURKA_PORT")
            && let Ok(port) = v.parse()
        {
            opts.port = port;
        }
        if let Ok(v) = std::env::var("MAZURKA_POOL_SIZE")
            && let Ok(size) = v.parse()
        {
            opts.pool_size = size;
        }
        if let Ok(v) = std::env::var("MAZURKA_MAX_BODY")
            && let Ok(max) = v.parse()
        {
            opts.max_body_size = max;
        }
        if let Ok(v) = std::env::var("MAZURKA_BAN_40X") {
            opts.ban_40x = v == "1" || v.eq_ignore_ascii_case("true");
        }
        opts
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.send_buffer_size < 512 {
            return Err(CoreError::Config("send_buffer_size below 512".into()));
        }
        if self.keep_alive_timeout_secs == 0 {
            return Err(CoreError::Config("keep_alive_timeout_secs is zero".into()));
        }
        if self.pool_size > 0 && self.pool_queue_cap == 0 {
            return Err(CoreError::Config("pool enabled with zero queue cap".into()));
        }
        if self.ban_ttl_secs == 0 {
            return Err(CoreError::Config("ban_ttl_secs is zero".into()));
        }
        Ok(())
    }
}

/// Read-only view of server load, consumed by the peer cache layer.
pub trait ServerState: Send + Sync {
    fn request_queue_length(&self) -> usize;
    fn active_connections(&self) -> usize;
}

/// Shared server state: everything a connection needs to serve requests.
pub struct ServerCore {
    pub opts: ServerOptions,
    pub router: Router,
    /// Swappable so an embedder (e.g. the peer cache) can install its
    /// hooks after the server is bound. Replace before serving traffic.
    hooks: parking_lot::RwLock<Box<dyn Hooks>>,
    pub auth: AuthEngine,
    /// Owned by the server, borrowed by the peer cache coordinator.
    pub partials: Arc<PartialRegistry>,
    pub ban: BanSet,
    pub metrics: ServerMetrics,
    pub compress: CompressRegistry,
    pub head_options: HeadOptions,
    pub queue_len: AtomicUsize,
    terminated: AtomicBool,
    conn_seq: AtomicU32,
    dedicated: AtomicUsize,
}

impl ServerCore {
    pub fn new(opts: ServerOptions, router: Router, hooks: Box<dyn Hooks>, auth: AuthEngine) -> Self {
        let head_options = HeadOptions {
            remote_ip_header: opts.remote_ip_header.clone(),
            conn_id_header: opts.conn_id_header.clone(),
            max_header_lines: opts.max_header_lines,
        };
        let ban = BanSet::new(opts.ban_ttl_secs);
        Self {
            opts,
            router,
            hooks: parking_lot::RwLock::new(hooks),
            auth,
            partials: Arc::new(PartialRegistry::new()),
            ban,
            metrics: ServerMetrics::new(),
            compress: CompressRegistry::default(),
            head_options,
            queue_len: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            conn_seq: AtomicU32::new(1),
            dedicated: AtomicUsize::new(0),
        }
    }

    /// Replace the request hooks; intended for setup time, before the
    /// accept loop runs.
    pub fn set_hooks(&self, hooks: Box<dyn Hooks>) {
        *self.hooks.write() = hooks;
    }

    /// Run `f` against the installed hooks.
    pub fn with_hooks<R>(&self, f: impl FnOnce(&dyn Hooks) -> R) -> R {
        f(self.hooks.read().as_ref())
    }

    /// Monotonic 31-bit connection sequence.
    pub fn next_conn_id(&self) -> u32 {
        self.conn_seq.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff
    }

    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub fn try_begin_dedicated(&self) -> bool {
        let mut current = self.dedicated.load(Ordering::Relaxed);
        loop {
            if current >= self.opts.dedicated_cap {
                return false;
            }
            match self.dedicated.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(now) => current = now,
            }
        }
    }

    pub fn end_dedicated(&self) {
        self.dedicated.fetch_sub(1, Ordering::AcqRel);
    }

    /// Status line plus the standard server headers, CRLF terminated but
    /// still open for more headers.
    pub fn compose_head(&self, status: u16, http10: bool, keep_alive: bool) -> String {
        let mut head = String::with_capacity(160);
        match (status, http10) {
            (200, false) => head.push_str("HTTP/1.1 200 OK\r\n"),
            (206, false) => head.push_str("HTTP/1.1 206 Partial Content\r\n"),
            _ => {
                let mut buf = itoa::Buffer::new();
                head.push_str(if http10 { "HTTP/1.0 " } else { "HTTP/1.1 " });
                head.push_str(buf.format(status));
                head.push(' ');
                head.push_str(reason_phrase(status));
                head.push_str("\r\n");
            }
        }
        head.push_str("Server: ");
        head.push_str(&self.opts.server_name);
        head.push_str("\r\n");
        if let Some(xpb) = &self.opts.x_powered_by {
            head.push_str("X-Powered-By: ");
            head.push_str(xpb);
            head.push_str("\r\n");
        }
        if self.opts.send_date {
            head.push_str("Date: ");
            head.push_str(&httpdate::fmt_http_date(SystemTime::now()));
            head.push_str("\r\n");
        }
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        head
    }
}

impl ServerState for ServerCore {
    fn request_queue_length(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    fn active_connections(&self) -> usize {
        self.metrics.active_conns.load(Ordering::Relaxed)
    }
}

/// A bound server, not yet accepting.
pub struct HttpServer {
    core: Arc<ServerCore>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl HttpServer {
    pub fn bind(
        opts: ServerOptions,
        router: Router,
        hooks: Box<dyn Hooks>,
        auth: AuthEngine,
    ) -> CoreResult<Self> {
        opts.validate()?;
        let addr: SocketAddr = format!("{}:{}", opts.bind_host, opts.port)
            .parse()
            .map_err(|e| CoreError::Config(format!("bad bind address: {}", e)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        // Accept timeout drives ban rotation and shutdown observation.
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;

        let core = Arc::new(ServerCore::new(opts, router, hooks, auth));
        info!(addr = %local_addr, "mazurka http server bound");
        Ok(Self {
            core,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn core(&self) -> Arc<ServerCore> {
        self.core.clone()
    }

    /// Run the accept loop on the current thread until terminated.
    pub fn serve(self) -> CoreResult<()> {
        let core = self.core;
        let pool = if core.opts.pool_size > 0 {
            Some(WorkerPool::start(
                core.opts.pool_size as usize,
                core.opts.pool_queue_cap,
                core.clone(),
            ))
        } else {
            None
        };

        let mut last_rotate = Instant::now();
        while !core.terminated() {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if core.ban.is_banned(addr.ip()) {
                        debug!(ip = %addr.ip(), "refusing banned source");
                        let mut s = stream;
                        let _ = std::io::Write::write_all(&mut s, TEAPOT);
                        core.metrics.rejected_conns.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    dispatch_connection(&core, &pool, stream, addr);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => {
                    if core.terminated() {
                        break;
                    }
                    warn!(error = %e, "accept failed");
                }
            }

            // Rotate the ban buckets once per elapsed second and give the
            // embedder its idle tick.
            while last_rotate.elapsed() >= Duration::from_secs(1) {
                core.ban.rotate();
                last_rotate += Duration::from_secs(1);
                core.with_hooks(|h| h.on_idle());
            }
        }

        if let Some(pool) = pool {
            pool.shutdown();
        }
        // Give in-flight dedicated workers a moment to observe the flag.
        let deadline = Instant::now() + Duration::from_secs(2);
        while core.metrics.active_conns.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        info!("mazurka http server stopped");
        Ok(())
    }

    /// Spawn the accept loop on its own thread.
    pub fn start(self) -> RunningServer {
        let core = self.core.clone();
        let addr = self.local_addr;
        let handle = thread::Builder::new()
            .name("mazurka-accept".to_string())
            .spawn(move || {
                if let Err(e) = self.serve() {
                    warn!(error = %e, "server loop failed");
                }
            })
            .expect("failed to spawn accept thread");
        RunningServer { core, addr, handle }
    }
}

fn dispatch_connection(
    core: &Arc<ServerCore>,
    pool: &Option<WorkerPool>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    if core.opts.pool_size < 0 {
        // Single-thread mode for low-volume ports.
        Connection::new(core.clone(), stream, addr).run();
        return;
    }
    match pool {
        Some(pool) => {
            if !pool.dispatch(stream, addr) {
                // Queue overflow: close immediately as backpressure.
                core.metrics.rejected_conns.fetch_add(1, Ordering::Relaxed);
                debug!(ip = %addr.ip(), "pool queue full, dropping connection");
            }
        }
        None => {
            if core.try_begin_dedicated() {
                let core2 = core.clone();
                let spawned = thread::Builder::new()
                    .name("mazurka-conn".to_string())
                    .spawn(move || {
                        Connection::new(core2.clone(), stream, addr).run();
                        core2.end_dedicated();
                    });
                if let Err(e) = spawned {
                    debug!(error = %e, "failed to spawn connection thread");
                    core.end_dedicated();
                }
            } else {
                core.metrics.rejected_conns.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Handle to a server whose accept loop runs on a background thread.
pub struct RunningServer {
    core: Arc<ServerCore>,
    addr: SocketAddr,
    handle: thread::JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn core(&self) -> Arc<ServerCore> {
        self.core.clone()
    }

    /// Set the terminated flag, nudge the listener awake and join the
    /// accept thread.
    pub fn shutdown(self) {
        self.core.terminate();
        // Some kernels hold accept() even after shutdown; a throwaway
        // local connection unblocks it.
        let _ = TcpStream::connect_timeout(&self.addr, Duration::from_millis(200));
        let _ = self.handle.join();
    }
}

#[cfg(test)]
pub(crate) fn test_core() -> Arc<ServerCore> {
    let opts = ServerOptions {
        pool_size: 1,
        ..Default::default()
    };
    Arc::new(ServerCore::new(
        opts,
        Router::new(),
        Box::new(FnHooks(|_ctx: &mut Context| 404u16)),
        AuthEngine::none(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_validation() {
        assert!(ServerOptions::default().validate().is_ok());

        let bad = ServerOptions {
            send_buffer_size: 16,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = ServerOptions {
            pool_size: 4,
            pool_queue_cap: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn compose_head_variants() {
        let core = test_core();
        let head = core.compose_head(200, false, true);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Server: mazurka\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));

        let head = core.compose_head(404, false, false);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));

        let head = core.compose_head(200, true, false);
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
    }

    #[test]
    fn conn_ids_stay_31_bit() {
        let core = test_core();
        let a = core.next_conn_id();
        let b = core.next_conn_id();
        assert!(b > a);
        assert_eq!(a & 0x8000_0000, 0);
    }

    #[test]
    fn dedicated_cap_enforced() {
        let opts = ServerOptions {
            dedicated_cap: 2,
            ..Default::default()
        };
        let core = ServerCore::new(
            opts,
            Router::new(),
            Box::new(FnHooks(|_ctx: &mut Context| 404u16)),
            AuthEngine::none(),
        );
        assert!(core.try_begin_dedicated());
        assert!(core.try_begin_dedicated());
        assert!(!core.try_begin_dedicated());
        core.end_dedicated();
        assert!(core.try_begin_dedicated());
    }
}
