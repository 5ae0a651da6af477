//! Two peers on loopback: discovery over real UDP sockets, file transfer
//! over the real HTTP server, including progressive streaming of a file
//! that is still being downloaded.

use std::fs;
use std::io::Cursor;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mazurka_core::{
    AuthEngine, Context, FnHooks, HttpServer, PartialRegistry, Router, ServerOptions, ServerState,
};
use mazurka_peer::{
    Discovery, DiscoveryConfig, DownloadRequest, HardwareKind, HashAlgo, HashRecord, PeerCache,
    PeerCacheHooks, PeerCrypt, PeerSettings, StoreClass,
};

const SECRET: &[u8] = b"subnet shared secret for tests";
const LOOP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

struct IdleServer;
impl ServerState for IdleServer {
    fn request_queue_length(&self) -> usize {
        0
    }
    fn active_connections(&self) -> usize {
        0
    }
}

fn discovery_cfg(uuid: [u8; 16], target_port: u16) -> DiscoveryConfig {
    DiscoveryConfig {
        bind_addr: LOOP,
        bind_port: 0,
        port: target_port,
        self_ip: LOOP,
        netmask: Ipv4Addr::new(255, 0, 0, 0),
        broadcast_addr: LOOP,
        speed_mbits: 1000,
        hardware: HardwareKind::Ethernet,
        uuid,
        broadcast_timeout_ms: 2000,
        broadcast_max_responses: 8,
        use_first_response: true,
        suppress_when_alone: false,
        ban_minutes: 4,
        banning_enabled: true,
        reply_to_broadcast: false,
    }
}

fn settings_for(dir: &Path, tcp_port: u16) -> PeerSettings {
    PeerSettings {
        temp_path: dir.join("temp"),
        perm_path: dir.join("perm"),
        tcp_port,
        cache_temp_min_bytes: 16,
        cache_perm_min_bytes: 16,
        ..Default::default()
    }
}

fn payload_and_hash(len: usize) -> (Vec<u8>, HashRecord) {
    let payload: Vec<u8> = (0..len as u32).map(|i| (i % 249) as u8).collect();
    let hash = HashRecord::compute(HashAlgo::Sha256, &payload).unwrap();
    (payload, hash)
}

/// Serving peer: HTTP server wired to a peer cache, discovery listening.
struct ServingPeer {
    cache: Arc<PeerCache>,
    server: mazurka_core::RunningServer,
    udp_port: u16,
    http_port: u16,
}

fn start_serving_peer(dir: &Path, uuid: [u8; 16]) -> ServingPeer {
    let crypt = Arc::new(PeerCrypt::new(SECRET).unwrap());
    let discovery = Discovery::bind(discovery_cfg(uuid, 1), crypt.clone()).unwrap();
    let udp_port = discovery.local_port();
    discovery.spawn_receiver();

    let opts = ServerOptions {
        bind_host: "127.0.0.1".to_string(),
        port: 0,
        pool_size: 2,
        send_date: false,
        ..Default::default()
    };
    let server = HttpServer::bind(
        opts,
        Router::new(),
        Box::new(FnHooks(|_: &mut Context| 0u16)),
        AuthEngine::none(),
    )
    .unwrap();
    let http_port = server.local_addr().port();
    let core = server.core();

    let cache = PeerCache::new(
        settings_for(dir, http_port),
        crypt,
        discovery,
        core.partials.clone(),
        core.clone(),
        uuid,
        LOOP,
    )
    .unwrap();
    core.set_hooks(Box::new(PeerCacheHooks::new(cache.clone())));

    let server = server.start();
    ServingPeer {
        cache,
        server,
        udp_port,
        http_port,
    }
}

/// Requesting peer: cache + discovery only, no HTTP server of its own.
fn start_requesting_peer(
    dir: &Path,
    uuid: [u8; 16],
    target_udp: u16,
    target_http: u16,
) -> Arc<PeerCache> {
    let crypt = Arc::new(PeerCrypt::new(SECRET).unwrap());
    let discovery = Discovery::bind(discovery_cfg(uuid, target_udp), crypt.clone()).unwrap();
    discovery.spawn_receiver();

    let mut settings = settings_for(dir, target_http);
    settings.options.try_last_peer = false;
    PeerCache::new(
        settings,
        crypt,
        discovery,
        Arc::new(PartialRegistry::new()),
        Arc::new(IdleServer),
        uuid,
        LOOP,
    )
    .unwrap()
}

#[test]
fn full_file_found_via_broadcast_and_fetched() {
    let b_dir = tempfile::tempdir().unwrap();
    let a_dir = tempfile::tempdir().unwrap();

    let (payload, hash) = payload_and_hash(1_048_576);

    let b = start_serving_peer(b_dir.path(), [0xbb; 16]);
    // B holds the file in its permanent store.
    let cached = b.cache.cache_path(&hash, StoreClass::Permanent);
    fs::write(&cached, &payload).unwrap();

    let a = start_requesting_peer(a_dir.path(), [0xaa; 16], b.udp_port, b.http_port);

    let req = DownloadRequest {
        hash,
        expected_size: Some(payload.len() as u64),
        range: None,
        store: StoreClass::Temp,
    };
    let mut out = Cursor::new(Vec::new());
    let status = a.on_download(&req, &mut out).unwrap();
    assert_eq!(status, 200);

    let body = out.into_inner();
    assert_eq!(body.len(), payload.len());
    // The transferred bytes hash back to the requested identity.
    assert_eq!(HashRecord::compute(HashAlgo::Sha256, &body).unwrap(), hash);

    // Close A's kept-alive peer connection so B can drain quickly.
    drop(a);
    b.server.shutdown();
}

#[test]
fn ranged_fetch_from_peer() {
    let b_dir = tempfile::tempdir().unwrap();
    let a_dir = tempfile::tempdir().unwrap();

    let (payload, hash) = payload_and_hash(100_000);
    let b = start_serving_peer(b_dir.path(), [0xb2; 16]);
    fs::write(b.cache.cache_path(&hash, StoreClass::Permanent), &payload).unwrap();

    let a = start_requesting_peer(a_dir.path(), [0xa2; 16], b.udp_port, b.http_port);

    let req = DownloadRequest {
        hash,
        expected_size: Some(payload.len() as u64),
        range: Some((1000, Some(1999))),
        store: StoreClass::Temp,
    };
    let mut out = Cursor::new(Vec::new());
    let status = a.on_download(&req, &mut out).unwrap();
    assert_eq!(status, 206);
    assert_eq!(out.into_inner(), payload[1000..2000].to_vec());

    drop(a);
    b.server.shutdown();
}

#[test]
fn nobody_has_it_falls_back_to_origin() {
    let b_dir = tempfile::tempdir().unwrap();
    let a_dir = tempfile::tempdir().unwrap();

    let b = start_serving_peer(b_dir.path(), [0xb3; 16]);
    let a = start_requesting_peer(a_dir.path(), [0xa3; 16], b.udp_port, b.http_port);

    let (_, hash) = payload_and_hash(4096);
    let req = DownloadRequest {
        hash,
        expected_size: Some(1_000_000),
        range: None,
        store: StoreClass::Temp,
    };
    let mut out = Cursor::new(Vec::new());
    // B answers ResponseNone; the caller must go to the origin.
    assert_eq!(a.on_download(&req, &mut out).unwrap(), 0);
    assert!(out.into_inner().is_empty());

    drop(a);
    b.server.shutdown();
}

#[test]
fn progressive_transfer_of_inflight_download() {
    let b_dir = tempfile::tempdir().unwrap();
    let a_dir = tempfile::tempdir().unwrap();

    let (payload, hash) = payload_and_hash(1_048_576);
    let b = start_serving_peer(b_dir.path(), [0xb4; 16]);

    // B is itself mid-download: 600 KiB of 1 MiB on disk.
    let inflight = b_dir.path().join("h.inflight");
    fs::write(&inflight, &payload[..600 * 1024]).unwrap();
    let partials = b.server.core().partials.clone();
    let id = partials.add(&inflight, payload.len() as u64, &hash.tagged());

    // B's own download finishes while A streams.
    let writer = {
        let inflight = inflight.clone();
        let tail = payload[600 * 1024..].to_vec();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            let mut f = fs::OpenOptions::new().append(true).open(&inflight).unwrap();
            std::io::Write::write_all(&mut f, &tail).unwrap();
        })
    };

    let a = start_requesting_peer(a_dir.path(), [0xa4; 16], b.udp_port, b.http_port);
    let req = DownloadRequest {
        hash,
        expected_size: Some(payload.len() as u64),
        range: None,
        store: StoreClass::Temp,
    };
    let mut out = Cursor::new(Vec::new());
    let status = a.on_download(&req, &mut out).unwrap();
    writer.join().unwrap();

    assert_eq!(status, 200);
    let body = out.into_inner();
    assert_eq!(body.len(), payload.len());
    assert_eq!(HashRecord::compute(HashAlgo::Sha256, &body).unwrap(), hash);

    // The served-to-completion partial was removed from the registry.
    assert!(partials.poll(id).is_none());

    drop(a);
    b.server.shutdown();
}
