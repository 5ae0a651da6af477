//! Peer cache coordinator.
//!
//! Acts as both sides of the exchange: answers sibling `Request` frames
//! and bearer-authenticated HTTP GETs out of its local stores, and
//! satisfies local downloads from the best sibling before the caller
//! falls back to the origin.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use mazurka_core::{
    Context, EXPECTED_SIZE_HEADER, Hooks, Method, PARTIAL_ID_HEADER, PartialRegistry, STATIC_FILE,
    ServerState,
};

use crate::client::PeerClient;
use crate::crypt::PeerCrypt;
use crate::direct::{DirectUrl, bearer_matches_url, crc63c};
use crate::discovery::{Discovery, DiscoveryConfig, RequestResponder, ResponderVerdict};
use crate::error::{PeerError, PeerResult};
use crate::message::{HashRecord, MessageKind, PeerMessage};
use crate::netif::{list_interfaces, pick_interface};
use crate::settings::PeerSettings;

/// Seconds between idle housekeeping passes.
const IDLE_PERIOD_SECS: u64 = 65;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreClass {
    Temp,
    Permanent,
}

/// What the embedding HTTP-client subsystem wants fetched.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub hash: HashRecord,
    pub expected_size: Option<u64>,
    /// `(start, inclusive end)`; open end means to EOF.
    pub range: Option<(u64, Option<u64>)>,
    pub store: StoreClass,
}

/// `hex(algo || digest) + ".cache"`.
pub fn cache_filename(hash: &HashRecord) -> String {
    let tagged = hash.tagged();
    let mut name = String::with_capacity(tagged.len() * 2 + 6);
    for b in &tagged {
        name.push_str(&format!("{:02x}", b));
    }
    name.push_str(".cache");
    name
}

struct LastPeer {
    client: PeerClient,
    ip: Ipv4Addr,
}

pub struct PeerCache {
    settings: PeerSettings,
    crypt: Arc<PeerCrypt>,
    discovery: Arc<Discovery>,
    partials: Arc<PartialRegistry>,
    server: Arc<dyn ServerState>,
    uuid: [u8; 16],
    self_ip: Ipv4Addr,
    /// Serializes local cache-file mutations: copy-in, purge, touch.
    files_lock: Mutex<()>,
    /// Kept-open connection to the previously successful peer.
    last_peer: Mutex<Option<LastPeer>>,
    last_idle_tick: AtomicU64,
    last_purge_tick: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PeerCache {
    pub fn new(
        settings: PeerSettings,
        crypt: Arc<PeerCrypt>,
        discovery: Arc<Discovery>,
        partials: Arc<PartialRegistry>,
        server: Arc<dyn ServerState>,
        uuid: [u8; 16],
        self_ip: Ipv4Addr,
    ) -> PeerResult<Arc<Self>> {
        settings.validate()?;
        fs::create_dir_all(&settings.temp_path)?;
        fs::create_dir_all(&settings.perm_path)?;

        let cache = Arc::new(Self {
            settings,
            crypt,
            discovery,
            partials,
            server,
            uuid,
            self_ip,
            files_lock: Mutex::new(()),
            last_peer: Mutex::new(None),
            last_idle_tick: AtomicU64::new(now_secs()),
            last_purge_tick: AtomicU64::new(now_secs()),
        });

        if !cache.settings.options.no_server {
            let responder: Arc<dyn RequestResponder> = cache.clone();
            cache.discovery.set_responder(Arc::downgrade(&responder));
        }
        info!(uuid = ?uuid::Uuid::from_bytes(cache.uuid), "peer cache ready");
        Ok(cache)
    }

    /// Assemble a complete peer node: pick the best local interface,
    /// bind discovery on it, start the receive loop and wire the
    /// coordinator up. The HTTP server side is attached afterwards via
    /// [`PeerCacheHooks`].
    pub fn bootstrap(
        settings: PeerSettings,
        secret: &[u8],
        partials: Arc<PartialRegistry>,
        server: Arc<dyn ServerState>,
    ) -> PeerResult<(Arc<Self>, std::thread::JoinHandle<()>)> {
        settings.validate()?;
        let iface = pick_interface(list_interfaces()?, &settings.filter)?;
        let uuid = settings.instance_uuid();
        let crypt = Arc::new(PeerCrypt::new(secret)?);
        let cfg = DiscoveryConfig::from_settings(&settings, &iface, uuid);
        let self_ip = iface.addr;
        info!(iface = %iface.name, addr = %self_ip, "peer discovery interface selected");
        let discovery = Discovery::bind(cfg, crypt.clone())?;
        let receiver = discovery.spawn_receiver();
        let cache = Self::new(settings, crypt, discovery, partials, server, uuid, self_ip)?;
        Ok((cache, receiver))
    }

    pub fn settings(&self) -> &PeerSettings {
        &self.settings
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    // ---- Local store ----

    fn store_base(&self, store: StoreClass) -> &Path {
        match store {
            StoreClass::Temp => &self.settings.temp_path,
            StoreClass::Permanent => &self.settings.perm_path,
        }
    }

    fn min_bytes(&self, store: StoreClass) -> u64 {
        match store {
            StoreClass::Temp => self.settings.cache_temp_min_bytes,
            StoreClass::Permanent => self.settings.cache_perm_min_bytes,
        }
    }

    pub fn cache_path(&self, hash: &HashRecord, store: StoreClass) -> PathBuf {
        let name = cache_filename(hash);
        let base = self.store_base(store);
        if self.settings.options.sub_folders {
            // First digest nibble after the algo tag.
            base.join(&name[2..3]).join(name)
        } else {
            base.join(name)
        }
    }

    /// Look the hash up in both stores; the permanent one wins.
    pub fn find_local(&self, hash: &HashRecord) -> Option<(PathBuf, u64, StoreClass)> {
        for store in [StoreClass::Permanent, StoreClass::Temp] {
            let path = self.cache_path(hash, store);
            if let Ok(meta) = fs::metadata(&path) {
                return Some((path, meta.len(), store));
            }
        }
        None
    }

    /// Refresh the modification time, implementing LRU-by-access for the
    /// temp store.
    fn touch(&self, path: &Path) {
        let _guard = self.files_lock.lock();
        if let Ok(file) = fs::OpenOptions::new().append(true).open(path)
            && let Err(e) = file.set_modified(SystemTime::now())
        {
            debug!(?path, error = %e, "mtime refresh failed");
        }
    }

    // ---- Download path (client side) ----

    /// Satisfy a download from the local cache or a sibling peer.
    ///
    /// Returns the HTTP-ish status of the transfer, or 0 when the caller
    /// should fall back to the origin.
    pub fn on_download<W: Write + Seek>(
        &self,
        req: &DownloadRequest,
        out: &mut W,
    ) -> PeerResult<u16> {
        if req.hash.is_zero() {
            return Err(PeerError::Cache("download without content hash".into()));
        }

        if let Some((path, size, store)) = self.find_local(&req.hash) {
            if let Some(expected) = req.expected_size
                && expected != size
            {
                warn!(?path, size, expected, "local cache size mismatch, ignoring hit");
            } else {
                let status = stream_local_file(&path, req.range, out)?;
                if store == StoreClass::Temp {
                    self.touch(&path);
                }
                debug!(?path, status, "local cache hit");
                return Ok(status);
            }
        }

        // Too small for this store class: the origin is cheaper than a
        // broadcast round.
        if let Some(expected) = req.expected_size
            && expected < self.min_bytes(req.store)
        {
            return Ok(0);
        }

        if self.settings.options.try_last_peer
            && let Some(status) = self.try_last_peer(req, out)?
        {
            return Ok(status);
        }

        let mut msg = self.discovery.identity_message(MessageKind::Request);
        msg.hash = req.hash;
        msg.size = req.expected_size.unwrap_or(0);
        msg.connections = self.server.active_connections().min(u16::MAX as usize) as u16;
        if let Some((start, end)) = req.range {
            msg.range_start = start;
            msg.range_end = end.unwrap_or(req.expected_size.unwrap_or(u64::MAX).saturating_sub(1));
        }
        let responses = self.discovery.broadcast(msg)?;

        let mut usable: Vec<PeerMessage> = responses
            .into_iter()
            .filter(|r| {
                matches!(
                    r.kind,
                    MessageKind::ResponseFull | MessageKind::ResponsePartial
                )
            })
            .collect();
        if usable.is_empty() {
            return Ok(0);
        }
        sort_peers(&mut usable);

        let attempts = if self.settings.options.try_all_peers {
            self.settings.try_all_peers_count as usize
        } else {
            1
        };
        for peer in usable.iter().take(attempts) {
            match self.fetch_from_peer(peer, req, out) {
                Ok(status) => return Ok(status),
                Err(e) => {
                    debug!(peer = %peer.sender_ip, error = %e, "peer fetch failed, rewinding");
                    out.seek(SeekFrom::Start(0))?;
                }
            }
        }
        Ok(0)
    }

    /// Re-use the previously successful peer without broadcasting. The
    /// bearer carries a zero UUID since no fresh response proved identity.
    fn try_last_peer<W: Write + Seek>(
        &self,
        req: &DownloadRequest,
        out: &mut W,
    ) -> PeerResult<Option<u16>> {
        let mut slot = self.last_peer.lock();
        let Some(last) = slot.as_mut() else {
            return Ok(None);
        };

        let mut bearer_msg = self.discovery.identity_message(MessageKind::RequestBearer);
        bearer_msg.hash = req.hash;
        bearer_msg.size = req.expected_size.unwrap_or(0);
        bearer_msg.dest_ip = last.ip;
        bearer_msg.uuid = [0u8; 16];
        let bearer = self.crypt.encode_bearer(&bearer_msg)?;
        let url = format!("/{}", cache_filename(&req.hash));

        match last.client.get(
            &url,
            &bearer,
            req.range,
            out,
            self.settings.bytes_per_sec_limit(),
        ) {
            Ok(res) if res.status == 200 || res.status == 206 => {
                debug!(peer = %last.ip, "last-peer shortcut hit");
                Ok(Some(res.status))
            }
            Ok(res) => {
                debug!(peer = %last.ip, status = res.status, "last peer no longer has it");
                *slot = None;
                out.seek(SeekFrom::Start(0))?;
                Ok(None)
            }
            Err(e) => {
                debug!(peer = %last.ip, error = %e, "last peer gone");
                *slot = None;
                out.seek(SeekFrom::Start(0))?;
                Ok(None)
            }
        }
    }

    fn fetch_from_peer<W: Write + Seek>(
        &self,
        peer: &PeerMessage,
        req: &DownloadRequest,
        out: &mut W,
    ) -> PeerResult<u16> {
        let mut bearer_msg = self.discovery.identity_message(MessageKind::RequestBearer);
        bearer_msg.hash = req.hash;
        bearer_msg.size = peer.size;
        bearer_msg.dest_ip = peer.sender_ip;
        bearer_msg.uuid = peer.uuid;
        if let Some((start, end)) = req.range {
            bearer_msg.range_start = start;
            bearer_msg.range_end = end.unwrap_or(peer.size.saturating_sub(1));
        }
        let bearer = self.crypt.encode_bearer(&bearer_msg)?;

        let addr = SocketAddr::new(IpAddr::V4(peer.sender_ip), self.settings.tcp_port);
        let timeout = Duration::from_millis(self.settings.http_timeout_ms.max(1) as u64);
        let mut client = PeerClient::connect(addr, timeout)?;
        let url = format!("/{}", cache_filename(&req.hash));
        let res = client.get(
            &url,
            &bearer,
            req.range,
            out,
            self.settings.bytes_per_sec_limit(),
        )?;
        match res.status {
            200 | 206 => {
                *self.last_peer.lock() = Some(LastPeer {
                    client,
                    ip: peer.sender_ip,
                });
                Ok(res.status)
            }
            // 204 means the peer lost the file between the broadcast and
            // the GET; either way the next candidate is tried.
            other => Err(PeerError::Http(other)),
        }
    }

    // ---- Download lifecycle hooks ----

    /// A download finished into `partial_path`; publish it in the cache.
    pub fn on_downloaded(
        &self,
        partial_path: &Path,
        hash: &HashRecord,
        store: StoreClass,
        partial_id: Option<u64>,
    ) -> PeerResult<()> {
        let size = fs::metadata(partial_path)?.len();
        if size < self.min_bytes(store) {
            debug!(?partial_path, size, "below minimum size for store, not cached");
            return Ok(());
        }

        let final_path = self.cache_path(hash, store);
        let guard = self.files_lock.lock();

        if let Ok(existing) = fs::metadata(&final_path) {
            if existing.len() == size {
                debug!(?final_path, "already cached, skipping copy");
            } else {
                warn!(
                    ?final_path,
                    existing = existing.len(),
                    incoming = size,
                    "cache size mismatch, keeping existing file"
                );
            }
            drop(guard);
            if let Some(id) = partial_id {
                self.partials.change_file(id, &final_path);
            }
            return Ok(());
        }

        if store == StoreClass::Temp {
            let cap = self.settings.cache_temp_max_mb as u64 * 1024 * 1024;
            if size > cap {
                debug!(size, cap, "file alone exceeds the temp cap, dropped");
                return Ok(());
            }
            self.purge_temp_until(cap.saturating_sub(size));
        }

        if let Some(dir) = final_path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::copy(partial_path, &final_path)?;
        // A fresh mtime so LRU-by-access starts from now.
        if let Ok(file) = fs::OpenOptions::new().append(true).open(&final_path) {
            let _ = file.set_modified(SystemTime::now());
        }
        drop(guard);
        info!(?final_path, size, "cached");

        if let Some(id) = partial_id {
            self.partials.change_file(id, &final_path);
        }
        Ok(())
    }

    /// The download failed; the local copy may be corrupt.
    pub fn on_download_failed(&self, hash: &HashRecord) {
        let _guard = self.files_lock.lock();
        for store in [StoreClass::Temp, StoreClass::Permanent] {
            let path = self.cache_path(hash, store);
            match fs::remove_file(&path) {
                Ok(()) => warn!(?path, "removed possibly corrupt cache file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(?path, error = %e, "cache removal failed"),
            }
        }
    }

    /// Periodic housekeeping; safe to call every second, does real work
    /// only every [`IDLE_PERIOD_SECS`] and once per temp-TTL window.
    pub fn on_idle(&self) {
        let now = now_secs();

        let last = self.last_idle_tick.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= IDLE_PERIOD_SECS
            && self
                .last_idle_tick
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.discovery.rotate_ban();
        }

        let ttl_secs = self.settings.cache_temp_max_min as u64 * 60;
        let last = self.last_purge_tick.load(Ordering::Relaxed);
        if ttl_secs > 0
            && now.saturating_sub(last) >= ttl_secs
            && self
                .last_purge_tick
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.purge_temp_expired(ttl_secs);
        }
    }

    /// Delete temp files whose last access is beyond the TTL.
    fn purge_temp_expired(&self, ttl_secs: u64) {
        let _guard = self.files_lock.lock();
        let cutoff = SystemTime::now() - Duration::from_secs(ttl_secs);
        let mut removed = 0usize;
        for (path, _, mtime) in scan_cache_dir(&self.settings.temp_path) {
            if mtime < cutoff && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "temp cache expiry purge");
        }
    }

    /// Delete oldest temp files until the store total fits `budget`.
    fn purge_temp_until(&self, budget: u64) {
        let mut files = scan_cache_dir(&self.settings.temp_path);
        let mut total: u64 = files.iter().map(|(_, size, _)| size).sum();
        if total <= budget {
            return;
        }
        files.sort_by_key(|(_, _, mtime)| *mtime);
        for (path, size, _) in files {
            if total <= budget {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    total -= size;
                    debug!(?path, "evicted for space");
                }
                Err(e) => debug!(?path, error = %e, "eviction failed"),
            }
        }
    }

    // ---- HTTP server integration ----

    /// Admission control for the peer HTTP surface.
    pub fn validate_http_request(&self, ctx: &Context) -> Result<(), u16> {
        if ctx.method != Method::Get {
            return Err(405);
        }
        if ctx.url.is_empty() {
            return Err(400);
        }
        let Some(bearer) = ctx.head.authorization.strip_prefix("Bearer ") else {
            return Err(401);
        };

        if DirectUrl::is_direct(&ctx.url) {
            if !self.settings.options.http_direct {
                return Err(403);
            }
            // Direct mode is a localhost-only convenience.
            if !ctx.remote_ip.is_loopback() {
                return Err(403);
            }
            let msg = self
                .crypt
                .decode_bearer(bearer, MessageKind::DirectBearer)
                .map_err(|_| 401u16)?;
            if !bearer_matches_url(&msg, &ctx.url) {
                return Err(403);
            }
            return Ok(());
        }

        let msg = self
            .crypt
            .decode_bearer(bearer, MessageKind::RequestBearer)
            .map_err(|_| 401u16)?;
        if msg.dest_ip != self.self_ip {
            return Err(403);
        }
        if msg.uuid != [0u8; 16] && msg.uuid != self.uuid {
            return Err(403);
        }
        Ok(())
    }

    /// Serve a validated peer request: a cached file, a progressive
    /// partial, or a direct-mode origin fetch.
    pub fn serve_http_request(&self, ctx: &mut Context) -> u16 {
        let Some(bearer) = ctx.head.authorization.strip_prefix("Bearer ") else {
            return 401;
        };
        let bearer = bearer.to_string();

        if DirectUrl::is_direct(&ctx.url) {
            return self.serve_direct(ctx, &bearer);
        }

        let msg = match self.crypt.decode_bearer(&bearer, MessageKind::RequestBearer) {
            Ok(msg) => msg,
            Err(tag) => {
                debug!(?tag, "request bearer rejected at dispatch");
                return 401;
            }
        };
        ctx.bearer = bearer;

        if let Some((path, _, store)) = self.find_local(&msg.hash) {
            if store == StoreClass::Temp {
                self.touch(&path);
            }
            ctx.resp_body = path.to_string_lossy().into_owned().into_bytes();
            ctx.resp_content_type = STATIC_FILE.to_string();
            return 200;
        }

        if let Some((status, _current)) = self.partials.find(&msg.hash.tagged()) {
            ctx.resp_body = status.path.to_string_lossy().into_owned().into_bytes();
            ctx.resp_content_type = STATIC_FILE.to_string();
            ctx.resp_headers
                .push_str(&format!("{}: {}\r\n", EXPECTED_SIZE_HEADER, status.expected_size));
            ctx.resp_headers
                .push_str(&format!("{}: {}\r\n", PARTIAL_ID_HEADER, status.id));
            return 200;
        }

        // Tells the requester to broadcast again rather than fail.
        204
    }

    /// Direct mode: fetch the origin URL on behalf of a localhost client.
    fn serve_direct(&self, ctx: &mut Context, bearer: &str) -> u16 {
        let msg = match self.crypt.decode_bearer(bearer, MessageKind::DirectBearer) {
            Ok(msg) => msg,
            Err(_) => return 401,
        };
        if msg.opaque != crc63c(ctx.url.as_bytes()) {
            return 403;
        }
        let Some(url) = DirectUrl::parse(&ctx.url) else {
            return 400;
        };
        if url.https {
            // The plain-socket client cannot speak TLS; the embedder's
            // own HTTP stack handles https origins.
            return 501;
        }

        let resolved = std::net::ToSocketAddrs::to_socket_addrs(&(url.host.as_str(), url.port));
        let Some(addr) = resolved.ok().and_then(|mut addrs| addrs.next()) else {
            return 502;
        };
        let timeout = Duration::from_millis(self.settings.http_timeout_ms.max(1) as u64);
        let mut client = match PeerClient::connect(addr, timeout) {
            Ok(c) => c,
            Err(e) => {
                debug!(origin = %url.origin_url(), error = %e, "direct connect failed");
                return 502;
            }
        };
        let mut body = Vec::new();
        match client.get(&url.path, "", None, &mut body, None) {
            Ok(res) => {
                ctx.resp_body = body;
                ctx.resp_content_type = "application/octet-stream".to_string();
                res.status
            }
            Err(e) => {
                debug!(origin = %url.origin_url(), error = %e, "direct fetch failed");
                502
            }
        }
    }
}

/// UDP `Request` answering (server side of discovery).
impl RequestResponder for PeerCache {
    fn answer(&self, request: &PeerMessage) -> ResponderVerdict {
        if self.server.active_connections() > self.settings.client_count as usize {
            return ResponderVerdict::Overloaded;
        }
        if let Some((_, size, _)) = self.find_local(&request.hash) {
            return ResponderVerdict::Full(size);
        }
        if let Some((status, current)) = self.partials.find(&request.hash.tagged()) {
            return ResponderVerdict::Partial(current.min(status.expected_size));
        }
        ResponderVerdict::None
    }
}

/// HTTP hook adapter for [`mazurka_core::HttpServer`].
pub struct PeerCacheHooks {
    cache: Arc<PeerCache>,
}

impl PeerCacheHooks {
    pub fn new(cache: Arc<PeerCache>) -> Self {
        Self { cache }
    }
}

impl Hooks for PeerCacheHooks {
    fn on_before_body(&self, ctx: &mut Context) -> u16 {
        match self.cache.validate_http_request(ctx) {
            Ok(()) => 0,
            Err(status) => status,
        }
    }

    fn on_request(&self, ctx: &mut Context) -> u16 {
        self.cache.serve_http_request(ctx)
    }

    fn on_idle(&self) {
        self.cache.on_idle();
    }
}

/// Order broadcast responders: full copies first, then hardware class,
/// link speed, load; arrival order breaks remaining ties (stable sort).
fn sort_peers(peers: &mut [PeerMessage]) {
    peers.sort_by_key(|p| {
        let kind_rank = match p.kind {
            MessageKind::ResponseFull => 0u8,
            MessageKind::ResponsePartial => 1,
            _ => 2,
        };
        (
            kind_rank,
            p.hardware as u8,
            std::cmp::Reverse(p.speed_mbits),
            p.connections,
        )
    });
}

/// Stream a cached file into `out`, honoring a byte range.
fn stream_local_file<W: Write>(
    path: &Path,
    range: Option<(u64, Option<u64>)>,
    out: &mut W,
) -> PeerResult<u16> {
    let mut file = fs::File::open(path)?;
    let size = file.metadata()?.len();
    let (status, start, end) = match range {
        Some((start, _)) if start >= size => return Ok(416),
        Some((start, end)) => (206, start, end.unwrap_or(size - 1).min(size - 1)),
        None if size == 0 => return Ok(200),
        None => (200, 0, size - 1),
    };
    file.seek(SeekFrom::Start(start))?;
    let mut remaining = end - start + 1;
    let mut chunk = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = chunk.len().min(remaining as usize);
        let got = file.read(&mut chunk[..want])?;
        if got == 0 {
            return Err(PeerError::Cache(format!(
                "cache file truncated: {}",
                path.display()
            )));
        }
        out.write_all(&chunk[..got])?;
        remaining -= got as u64;
    }
    Ok(status)
}

/// `(path, size, mtime)` of every cache file under `base`, shard
/// sub-folders included.
fn scan_cache_dir(base: &Path) -> Vec<(PathBuf, u64, SystemTime)> {
    let mut out = Vec::new();
    let mut stack = vec![base.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "cache") {
                let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
                out.push((path, meta.len(), mtime));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HashAlgo;
    use std::io::Cursor;

    struct IdleServer;
    impl ServerState for IdleServer {
        fn request_queue_length(&self) -> usize {
            0
        }
        fn active_connections(&self) -> usize {
            0
        }
    }

    fn hash_of(byte: u8) -> HashRecord {
        HashRecord::new(HashAlgo::Sha256, &[byte; 32])
    }

    fn test_cache(dir: &Path) -> Arc<PeerCache> {
        test_cache_with(dir, |_| {})
    }

    fn test_cache_with(dir: &Path, tweak: impl FnOnce(&mut PeerSettings)) -> Arc<PeerCache> {
        let mut settings = PeerSettings {
            temp_path: dir.join("temp"),
            perm_path: dir.join("perm"),
            cache_temp_max_mb: 1,
            cache_temp_min_bytes: 16,
            cache_perm_min_bytes: 16,
            ..Default::default()
        };
        tweak(&mut settings);
        let crypt = Arc::new(PeerCrypt::new(b"cache test secret").unwrap());
        let cfg = crate::discovery::DiscoveryConfig {
            bind_addr: Ipv4Addr::new(127, 0, 0, 1),
            bind_port: 0,
            port: 1,
            self_ip: Ipv4Addr::new(127, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 0, 0, 0),
            broadcast_addr: Ipv4Addr::new(127, 0, 0, 1),
            speed_mbits: 1000,
            hardware: crate::message::HardwareKind::Ethernet,
            uuid: [1u8; 16],
            broadcast_timeout_ms: 10,
            broadcast_max_responses: 4,
            use_first_response: true,
            suppress_when_alone: false,
            ban_minutes: 4,
            banning_enabled: true,
            reply_to_broadcast: false,
        };
        let discovery = Discovery::bind(cfg, crypt.clone()).unwrap();
        PeerCache::new(
            settings,
            crypt,
            discovery,
            Arc::new(PartialRegistry::new()),
            Arc::new(IdleServer),
            [1u8; 16],
            Ipv4Addr::new(127, 0, 0, 1),
        )
        .unwrap()
    }

    #[test]
    fn filename_shape() {
        let name = cache_filename(&hash_of(0xab));
        assert!(name.starts_with("00abab"));
        assert!(name.ends_with(".cache"));
        // 1 algo byte + 32 digest bytes, two hex chars each.
        assert_eq!(name.len(), 66 + 6);
    }

    #[test]
    fn sharded_path_uses_first_digest_nibble() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache_with(dir.path(), |s| s.options.sub_folders = true);
        let path = cache.cache_path(&hash_of(0xab), StoreClass::Temp);
        let shard = path.parent().unwrap().file_name().unwrap();
        assert_eq!(shard, "a");
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("00abab"));
    }

    #[test]
    fn local_hit_streams_and_skips_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let hash = hash_of(1);
        let payload = vec![0x11u8; 4096];
        let path = cache.cache_path(&hash, StoreClass::Temp);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, &payload).unwrap();

        let req = DownloadRequest {
            hash,
            expected_size: Some(payload.len() as u64),
            range: None,
            store: StoreClass::Temp,
        };
        let mut out = Cursor::new(Vec::new());
        let status = cache.on_download(&req, &mut out).unwrap();
        assert_eq!(status, 200);
        assert_eq!(out.into_inner(), payload);
    }

    #[test]
    fn ranged_local_hit_is_206() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let hash = hash_of(2);
        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let path = cache.cache_path(&hash, StoreClass::Permanent);
        fs::write(&path, &payload).unwrap();

        let req = DownloadRequest {
            hash,
            expected_size: Some(1000),
            range: Some((100, Some(199))),
            store: StoreClass::Permanent,
        };
        let mut out = Cursor::new(Vec::new());
        let status = cache.on_download(&req, &mut out).unwrap();
        assert_eq!(status, 206);
        assert_eq!(out.into_inner(), payload[100..200].to_vec());
    }

    #[test]
    fn small_expected_size_falls_back_to_origin() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let req = DownloadRequest {
            hash: hash_of(3),
            expected_size: Some(4),
            range: None,
            store: StoreClass::Temp,
        };
        let mut out = Cursor::new(Vec::new());
        assert_eq!(cache.on_download(&req, &mut out).unwrap(), 0);
    }

    #[test]
    fn missing_hash_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let req = DownloadRequest {
            hash: HashRecord::default(),
            expected_size: None,
            range: None,
            store: StoreClass::Temp,
        };
        let mut out = Cursor::new(Vec::new());
        assert!(cache.on_download(&req, &mut out).is_err());
    }

    #[test]
    fn downloaded_file_is_promoted_and_size_capped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        // Three 400 KiB files against a 1 MiB cap: the oldest must go.
        for (i, age_touch) in [(1u8, true), (2, true), (3, false)] {
            let partial = dir.path().join(format!("part{}", i));
            fs::write(&partial, vec![i; 400 * 1024]).unwrap();
            cache
                .on_downloaded(&partial, &hash_of(i), StoreClass::Temp, None)
                .unwrap();
            if age_touch {
                // Backdate so eviction order is deterministic.
                let cached = cache.cache_path(&hash_of(i), StoreClass::Temp);
                let file = fs::OpenOptions::new().append(true).open(&cached).unwrap();
                file.set_modified(SystemTime::now() - Duration::from_secs(1000 * i as u64))
                    .unwrap();
            }
        }

        // The oldest (most backdated) file was evicted to fit the cap.
        assert!(!cache.cache_path(&hash_of(2), StoreClass::Temp).exists());
        assert!(cache.cache_path(&hash_of(1), StoreClass::Temp).exists());
        assert!(cache.cache_path(&hash_of(3), StoreClass::Temp).exists());

        let total: u64 = scan_cache_dir(&cache.settings.temp_path)
            .iter()
            .map(|(_, s, _)| s)
            .sum();
        assert!(total <= 1024 * 1024);
    }

    #[test]
    fn oversized_file_is_dropped_outright() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let partial = dir.path().join("big");
        fs::write(&partial, vec![9u8; 2 * 1024 * 1024]).unwrap();
        cache
            .on_downloaded(&partial, &hash_of(9), StoreClass::Temp, None)
            .unwrap();
        assert!(!cache.cache_path(&hash_of(9), StoreClass::Temp).exists());
    }

    #[test]
    fn failed_download_removes_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let hash = hash_of(4);
        let path = cache.cache_path(&hash, StoreClass::Temp);
        fs::write(&path, b"corrupt").unwrap();
        cache.on_download_failed(&hash);
        assert!(!path.exists());
    }

    #[test]
    fn responder_reports_full_partial_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        let full_hash = hash_of(5);
        let path = cache.cache_path(&full_hash, StoreClass::Temp);
        fs::write(&path, vec![5u8; 1024]).unwrap();

        let partial_hash = hash_of(6);
        let partial_path = dir.path().join("inflight");
        fs::write(&partial_path, vec![6u8; 600]).unwrap();
        cache
            .partials
            .add(&partial_path, 1000, &partial_hash.tagged());

        let mut req = PeerMessage {
            kind: MessageKind::Request,
            hash: full_hash,
            ..Default::default()
        };
        assert_eq!(cache.answer(&req), ResponderVerdict::Full(1024));

        req.hash = partial_hash;
        assert_eq!(cache.answer(&req), ResponderVerdict::Partial(600));

        req.hash = hash_of(7);
        assert_eq!(cache.answer(&req), ResponderVerdict::None);
    }

    #[test]
    fn http_validation_rules() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        let mut ctx = Context::new();
        ctx.method = Method::Post;
        ctx.url = "/x".to_string();
        assert_eq!(cache.validate_http_request(&ctx), Err(405));

        ctx.method = Method::Get;
        assert_eq!(cache.validate_http_request(&ctx), Err(401));

        // A well-formed request bearer addressed to us passes.
        let mut msg = PeerMessage {
            kind: MessageKind::RequestBearer,
            dest_ip: Ipv4Addr::new(127, 0, 0, 1),
            uuid: [1u8; 16],
            hash: hash_of(8),
            ..Default::default()
        };
        let bearer = cache.crypt.encode_bearer(&msg).unwrap();
        ctx.head.authorization = format!("Bearer {}", bearer);
        assert_eq!(cache.validate_http_request(&ctx), Ok(()));

        // Wrong destination IP is rejected.
        msg.dest_ip = Ipv4Addr::new(10, 0, 0, 9);
        let bearer = cache.crypt.encode_bearer(&msg).unwrap();
        ctx.head.authorization = format!("Bearer {}", bearer);
        assert_eq!(cache.validate_http_request(&ctx), Err(403));

        // Zero UUID is allowed (last-peer shortcut), wrong UUID is not.
        msg.dest_ip = Ipv4Addr::new(127, 0, 0, 1);
        msg.uuid = [0u8; 16];
        let bearer = cache.crypt.encode_bearer(&msg).unwrap();
        ctx.head.authorization = format!("Bearer {}", bearer);
        assert_eq!(cache.validate_http_request(&ctx), Ok(()));

        msg.uuid = [7u8; 16];
        let bearer = cache.crypt.encode_bearer(&msg).unwrap();
        ctx.head.authorization = format!("Bearer {}", bearer);
        assert_eq!(cache.validate_http_request(&ctx), Err(403));
    }

    #[test]
    fn serving_partial_sets_progressive_headers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        let hash = hash_of(10);
        let partial_path = dir.path().join("part.inflight");
        fs::write(&partial_path, vec![0u8; 600 * 1024]).unwrap();
        let id = cache.partials.add(&partial_path, 1024 * 1024, &hash.tagged());

        let msg = PeerMessage {
            kind: MessageKind::RequestBearer,
            dest_ip: Ipv4Addr::new(127, 0, 0, 1),
            uuid: [1u8; 16],
            hash,
            ..Default::default()
        };
        let bearer = cache.crypt.encode_bearer(&msg).unwrap();

        let mut ctx = Context::new();
        ctx.method = Method::Get;
        ctx.url = format!("/{}", cache_filename(&hash));
        ctx.head.authorization = format!("Bearer {}", bearer);

        let status = cache.serve_http_request(&mut ctx);
        assert_eq!(status, 200);
        assert_eq!(ctx.resp_content_type, STATIC_FILE);
        assert!(ctx.resp_headers.contains(&format!("{}: 1048576", EXPECTED_SIZE_HEADER)));
        assert!(ctx.resp_headers.contains(&format!("{}: {}", PARTIAL_ID_HEADER, id)));

        // Unknown hash answers 204 so the requester broadcasts again.
        let msg = PeerMessage {
            hash: hash_of(11),
            ..msg
        };
        let bearer = cache.crypt.encode_bearer(&msg).unwrap();
        ctx.head.authorization = format!("Bearer {}", bearer);
        assert_eq!(cache.serve_http_request(&mut ctx), 204);
    }

    #[test]
    fn direct_bearer_must_match_url() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache_with(dir.path(), |s| s.options.http_direct = true);
        let crypt = cache.crypt.clone();

        let url = "/http/origin.example/file.bin";
        let msg = PeerMessage {
            kind: MessageKind::DirectBearer,
            opaque: crc63c(url.as_bytes()),
            ..Default::default()
        };
        let bearer = crypt.encode_bearer(&msg).unwrap();

        let mut ctx = Context::new();
        ctx.method = Method::Get;
        ctx.url = url.to_string();
        ctx.remote_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        ctx.head.authorization = format!("Bearer {}", bearer);
        assert_eq!(cache.validate_http_request(&ctx), Ok(()));

        // Same bearer replayed against another URL fails the opaque check.
        ctx.url = "/http/origin.example/other.bin".to_string();
        assert_eq!(cache.validate_http_request(&ctx), Err(403));

        // Non-localhost sources are refused outright.
        ctx.url = url.to_string();
        ctx.remote_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(cache.validate_http_request(&ctx), Err(403));
    }

    #[test]
    fn peer_sort_order() {
        use MessageKind::*;
        let mk = |kind, hw, speed, conns| PeerMessage {
            kind,
            hardware: hw,
            speed_mbits: speed,
            connections: conns,
            ..Default::default()
        };
        use crate::message::HardwareKind::*;
        let mut peers = vec![
            mk(ResponsePartial, Ethernet, 10_000, 0),
            mk(ResponseFull, Wifi, 300, 2),
            mk(ResponseFull, Ethernet, 100, 5),
            mk(ResponseFull, Ethernet, 1000, 9),
            mk(ResponseFull, Ethernet, 1000, 1),
        ];
        sort_peers(&mut peers);
        // Full beats partial, ethernet beats wifi, speed desc, load asc.
        assert_eq!(peers[0].speed_mbits, 1000);
        assert_eq!(peers[0].connections, 1);
        assert_eq!(peers[1].connections, 9);
        assert_eq!(peers[2].speed_mbits, 100);
        assert_eq!(peers[3].hardware, Wifi);
        assert_eq!(peers[4].kind, ResponsePartial);
    }
}
