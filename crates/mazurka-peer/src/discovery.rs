//! UDP discovery: authenticated broadcast request/response rounds.
//!
//! One datagram socket serves both directions. On POSIX the socket binds
//! to the interface broadcast address so inbound broadcast frames are
//! received, and responses are sent back to the broadcast address, where
//! the requester is listening.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use mazurka_core::BanSet;

use crate::crypt::PeerCrypt;
use crate::error::{PeerError, PeerResult};
use crate::message::{HardwareKind, MessageKind, PeerMessage};
use crate::netif::NetInterface;
use crate::settings::PeerSettings;

/// Receive buffer for one datagram.
const FRAME_BUF: usize = 64 * 1024;

/// Decode failures from one source before it is banned.
const DECODE_BAN_THRESHOLD: u32 = 4;

/// What the cache coordinator knows about a requested hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderVerdict {
    None,
    Overloaded,
    Partial(u64),
    Full(u64),
}

/// Answers `Request` frames; implemented by the peer cache coordinator.
pub trait RequestResponder: Send + Sync {
    fn answer(&self, request: &PeerMessage) -> ResponderVerdict;
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Address the socket binds to (the interface broadcast address on
    /// POSIX; loopback in tests).
    pub bind_addr: Ipv4Addr,
    /// Port the socket binds to; 0 picks an ephemeral port.
    pub bind_port: u16,
    /// Port the peer group agreed on, used for outbound sends.
    pub port: u16,
    /// This node's identity address, carried in every frame.
    pub self_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Where broadcasts (and POSIX responses) are sent.
    pub broadcast_addr: Ipv4Addr,
    pub speed_mbits: u32,
    pub hardware: HardwareKind,
    pub uuid: [u8; 16],
    pub broadcast_timeout_ms: u32,
    pub broadcast_max_responses: u32,
    pub use_first_response: bool,
    /// Skip broadcasting for ~1 s after a round that nobody answered.
    pub suppress_when_alone: bool,
    pub ban_minutes: u32,
    pub banning_enabled: bool,
    /// POSIX sends responses to the broadcast address; unicast otherwise.
    pub reply_to_broadcast: bool,
}

impl DiscoveryConfig {
    pub fn from_settings(settings: &PeerSettings, iface: &NetInterface, uuid: [u8; 16]) -> Self {
        Self {
            bind_addr: iface.broadcast,
            bind_port: settings.udp_port,
            port: settings.udp_port,
            self_ip: iface.addr,
            netmask: iface.netmask,
            broadcast_addr: iface.broadcast,
            speed_mbits: iface.speed_mbits,
            hardware: iface.hardware,
            uuid,
            broadcast_timeout_ms: settings.broadcast_timeout_ms,
            broadcast_max_responses: settings.broadcast_max_responses,
            use_first_response: settings.options.first_response,
            suppress_when_alone: settings.options.broadcast_not_alone,
            ban_minutes: settings.ban_minutes,
            banning_enabled: !settings.options.no_ban_ip,
            reply_to_broadcast: true,
        }
    }
}

struct Round {
    seq: u32,
    open: bool,
    responses: Vec<PeerMessage>,
}

pub struct Discovery {
    sock: UdpSocket,
    local_port: u16,
    crypt: Arc<PeerCrypt>,
    cfg: DiscoveryConfig,
    /// UDP-level misbehavior set; rotated by the owner's idle hook.
    ban: BanSet,
    round: Mutex<Round>,
    round_wake: Condvar,
    /// Serializes whole broadcast rounds; strictly non-reentrant.
    broadcast_gate: Mutex<()>,
    responder: RwLock<Option<Weak<dyn RequestResponder>>>,
    terminated: AtomicBool,
    /// Second tick of the last round that returned nothing.
    last_alone_tick: AtomicU64,
}

fn now_tick() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Discovery {
    pub fn bind(cfg: DiscoveryConfig, crypt: Arc<PeerCrypt>) -> PeerResult<Arc<Self>> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;
        let bind: SocketAddr = SocketAddrV4::new(cfg.bind_addr, cfg.bind_port).into();
        socket.bind(&bind.into())?;
        let sock: UdpSocket = socket.into();
        let local_port = sock.local_addr()?.port();

        // Ban buckets are minute-grained: the idle hook rotates roughly
        // once per minute, so one bucket per configured minute.
        let ban = BanSet::new(cfg.ban_minutes.max(1) as usize);

        debug!(bind = %bind, port = local_port, "peer discovery bound");
        Ok(Arc::new(Self {
            sock,
            local_port,
            crypt,
            cfg,
            ban,
            round: Mutex::new(Round {
                seq: 0,
                open: false,
                responses: Vec::new(),
            }),
            round_wake: Condvar::new(),
            broadcast_gate: Mutex::new(()),
            responder: RwLock::new(None),
            terminated: AtomicBool::new(false),
            last_alone_tick: AtomicU64::new(0),
        }))
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn crypt(&self) -> &Arc<PeerCrypt> {
        &self.crypt
    }

    /// Install the cache coordinator. A weak reference avoids the
    /// coordinator/discovery ownership cycle.
    pub fn set_responder(&self, responder: Weak<dyn RequestResponder>) {
        *self.responder.write() = Some(responder);
    }

    /// Run the receive loop until [`Discovery::shutdown`].
    pub fn spawn_receiver(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let this = self.clone();
        thread::Builder::new()
            .name("mazurka-peer-udp".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; FRAME_BUF];
                while !this.terminated.load(Ordering::Acquire) {
                    match this.sock.recv_from(&mut buf) {
                        Ok((len, src)) => this.handle_datagram(&buf[..len], src),
                        Err(e)
                            if matches!(
                                e.kind(),
                                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                            ) => {}
                        Err(e) => {
                            if !this.terminated.load(Ordering::Acquire) {
                                warn!(error = %e, "udp receive failed");
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn discovery receiver")
    }

    pub fn shutdown(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    /// Advance the UDP ban buckets; driven by the owner's idle hook.
    pub fn rotate_ban(&self) {
        self.ban.rotate();
    }

    pub fn is_banned(&self, ip: Ipv4Addr) -> bool {
        self.ban.is_banned(ip.into())
    }

    /// One inbound datagram. Public so the full receive path is testable
    /// without broadcast-capable networking.
    pub fn handle_datagram(&self, frame: &[u8], src: SocketAddr) {
        let SocketAddr::V4(src_v4) = src else {
            return;
        };
        let src_ip = *src_v4.ip();
        // Our own broadcasts come back to us; another node on the same
        // host uses a different source port and stays visible.
        if src_ip == self.cfg.self_ip && src_v4.port() == self.local_port {
            return;
        }
        if self.cfg.banning_enabled && self.ban.is_banned(src_ip.into()) {
            trace!(ip = %src_ip, "frame from banned source dropped");
            return;
        }

        let msg = match self.crypt.decode_frame(frame) {
            Ok(msg) => msg,
            Err(tag) => {
                debug!(ip = %src_ip, ?tag, "undecodable frame");
                if self.cfg.banning_enabled
                    && self.ban.offend(src_ip.into(), DECODE_BAN_THRESHOLD)
                {
                    debug!(ip = %src_ip, "udp source banned");
                }
                return;
            }
        };
        trace!(ip = %src_ip, kind = ?msg.kind, seq = msg.seq, "frame accepted");

        if msg.kind.is_response() {
            // Catches unexpected NAT or promiscuous listeners.
            if msg.dest_ip != self.cfg.self_ip {
                debug!(ip = %src_ip, dest = %msg.dest_ip, "response for someone else");
                return;
            }
            self.collect_response(msg);
            return;
        }

        match msg.kind {
            MessageKind::Ping => {
                let mut pong = self.identity_message(MessageKind::Pong);
                pong.seq = msg.seq;
                pong.dest_ip = msg.sender_ip;
                self.send_reply(&pong, src);
            }
            MessageKind::Request => {
                let Some(responder) = self.responder.read().as_ref().and_then(Weak::upgrade)
                else {
                    return;
                };
                let verdict = responder.answer(&msg);
                let kind = match verdict {
                    ResponderVerdict::None => MessageKind::ResponseNone,
                    ResponderVerdict::Overloaded => MessageKind::ResponseOverloaded,
                    ResponderVerdict::Partial(_) => MessageKind::ResponsePartial,
                    ResponderVerdict::Full(_) => MessageKind::ResponseFull,
                };
                let mut reply = self.identity_message(kind);
                reply.seq = msg.seq;
                reply.dest_ip = msg.sender_ip;
                reply.hash = msg.hash;
                reply.size = match verdict {
                    ResponderVerdict::Partial(n) | ResponderVerdict::Full(n) => n,
                    _ => 0,
                };
                self.send_reply(&reply, src);
            }
            // Bearers ride HTTP, never UDP.
            _ => trace!(kind = ?msg.kind, "ignoring non-udp kind"),
        }
    }

    fn collect_response(&self, msg: PeerMessage) {
        let mut round = self.round.lock();
        if !round.open || msg.seq != round.seq {
            debug!(seq = msg.seq, open = round.open, "late response discarded");
            return;
        }
        round.responses.push(msg);
        let target = if self.cfg.use_first_response {
            1
        } else {
            self.cfg.broadcast_max_responses as usize
        };
        if round.responses.len() >= target {
            round.open = false;
            self.round_wake.notify_all();
        }
    }

    fn send_reply(&self, msg: &PeerMessage, src: SocketAddr) {
        let dest: SocketAddr = if self.cfg.reply_to_broadcast {
            SocketAddrV4::new(self.cfg.broadcast_addr, self.cfg.port).into()
        } else {
            src
        };
        match self.crypt.encode_frame(msg) {
            Ok(wire) => {
                if let Err(e) = self.sock.send_to(&wire, dest) {
                    debug!(error = %e, "reply send failed");
                }
            }
            Err(e) => warn!(error = %e, "reply encode failed"),
        }
    }

    /// A message template carrying this node's identity fields.
    pub fn identity_message(&self, kind: MessageKind) -> PeerMessage {
        let os = match std::env::consts::OS {
            "linux" => 1,
            "macos" => 2,
            "windows" => 3,
            _ => 0,
        };
        PeerMessage {
            kind,
            uuid: self.cfg.uuid,
            os,
            sender_ip: self.cfg.self_ip,
            netmask: self.cfg.netmask,
            broadcast: self.cfg.broadcast_addr,
            speed_mbits: self.cfg.speed_mbits,
            hardware: self.cfg.hardware,
            timestamp: PeerMessage::now_timestamp(),
            ..Default::default()
        }
    }

    /// Send one request to the broadcast address and aggregate responses.
    /// At most one round runs at a time.
    pub fn broadcast(&self, mut msg: PeerMessage) -> PeerResult<Vec<PeerMessage>> {
        let _gate = self.broadcast_gate.lock();

        if self.cfg.suppress_when_alone {
            let last = self.last_alone_tick.load(Ordering::Relaxed);
            if last != 0 && now_tick() <= last + 1 {
                trace!("suppressing broadcast, nobody answered a moment ago");
                return Ok(Vec::new());
            }
        }

        let seq = self.crypt.next_seq();
        msg.seq = seq;
        msg.dest_ip = Ipv4Addr::UNSPECIFIED;
        {
            let mut round = self.round.lock();
            round.seq = seq;
            round.open = true;
            round.responses.clear();
        }

        let wire = self.crypt.encode_frame(&msg)?;
        let dest = SocketAddrV4::new(self.cfg.broadcast_addr, self.cfg.port);
        self.sock.send_to(&wire, dest).map_err(PeerError::Io)?;

        let deadline =
            Instant::now() + Duration::from_millis(self.cfg.broadcast_timeout_ms as u64);
        let target = if self.cfg.use_first_response {
            1
        } else {
            self.cfg.broadcast_max_responses as usize
        };
        let responses = {
            let mut round = self.round.lock();
            while round.open && round.responses.len() < target {
                if self.round_wake.wait_until(&mut round, deadline).timed_out() {
                    break;
                }
            }
            round.open = false;
            std::mem::take(&mut round.responses)
        };

        if responses.is_empty() && self.cfg.suppress_when_alone {
            self.last_alone_tick.store(now_tick(), Ordering::Relaxed);
        }
        Ok(responses)
    }

    /// Liveness probe: broadcast a `Ping`, collect `Pong`s.
    pub fn ping(&self) -> PeerResult<Vec<PeerMessage>> {
        let msg = self.identity_message(MessageKind::Ping);
        self.broadcast(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HashAlgo, HashRecord};

    fn test_cfg(bind: Ipv4Addr, self_ip: Ipv4Addr, peer_port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            bind_addr: bind,
            bind_port: 0,
            port: peer_port,
            self_ip,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast_addr: Ipv4Addr::new(127, 0, 0, 1),
            speed_mbits: 1000,
            hardware: HardwareKind::Ethernet,
            uuid: [9u8; 16],
            broadcast_timeout_ms: 500,
            broadcast_max_responses: 8,
            use_first_response: true,
            suppress_when_alone: false,
            ban_minutes: 4,
            banning_enabled: true,
            reply_to_broadcast: false,
        }
    }

    struct FixedResponder(ResponderVerdict);
    impl RequestResponder for FixedResponder {
        fn answer(&self, _request: &PeerMessage) -> ResponderVerdict {
            self.0
        }
    }

    fn secret() -> Arc<PeerCrypt> {
        Arc::new(PeerCrypt::new(b"discovery test secret").unwrap())
    }

    #[test]
    fn ping_pong_round_trip_on_loopback() {
        let crypt = secret();
        let loop_ip = Ipv4Addr::new(127, 0, 0, 1);

        // B answers; A asks. Distinct identity addresses keep the
        // self-frame filter out of the way on loopback.
        let b = Discovery::bind(test_cfg(loop_ip, Ipv4Addr::new(10, 9, 9, 2), 0), crypt.clone())
            .unwrap();
        let _b_thread = b.spawn_receiver();

        let mut a_cfg = test_cfg(loop_ip, Ipv4Addr::new(10, 9, 9, 1), b.local_port());
        a_cfg.broadcast_timeout_ms = 2000;
        let a = Discovery::bind(a_cfg, crypt).unwrap();
        let _a_thread = a.spawn_receiver();

        let pongs = a.ping().unwrap();
        assert_eq!(pongs.len(), 1);
        assert_eq!(pongs[0].kind, MessageKind::Pong);
        assert_eq!(pongs[0].uuid, [9u8; 16]);
        assert_eq!(pongs[0].dest_ip, Ipv4Addr::new(10, 9, 9, 1));

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn request_answered_with_full_size() {
        let crypt = secret();
        let loop_ip = Ipv4Addr::new(127, 0, 0, 1);

        let b = Discovery::bind(test_cfg(loop_ip, Ipv4Addr::new(10, 9, 8, 2), 0), crypt.clone())
            .unwrap();
        let responder: Arc<dyn RequestResponder> =
            Arc::new(FixedResponder(ResponderVerdict::Full(1_048_576)));
        b.set_responder(Arc::downgrade(&responder));
        let _b_thread = b.spawn_receiver();

        let mut a_cfg = test_cfg(loop_ip, Ipv4Addr::new(10, 9, 8, 1), b.local_port());
        a_cfg.broadcast_timeout_ms = 2000;
        let a = Discovery::bind(a_cfg, crypt).unwrap();
        let _a_thread = a.spawn_receiver();

        let mut req = a.identity_message(MessageKind::Request);
        req.hash = HashRecord::new(HashAlgo::Sha256, &[5u8; 32]);
        let responses = a.broadcast(req).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind, MessageKind::ResponseFull);
        assert_eq!(responses[0].size, 1_048_576);
        assert_eq!(responses[0].hash, HashRecord::new(HashAlgo::Sha256, &[5u8; 32]));

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn malformed_frames_accumulate_into_a_ban() {
        let crypt = secret();
        let d = Discovery::bind(
            test_cfg(Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(10, 9, 7, 2), 0),
            crypt,
        )
        .unwrap();

        let src: SocketAddr = "192.0.2.7:9999".parse().unwrap();
        let junk = [0xa5u8; 228];
        for _ in 0..DECODE_BAN_THRESHOLD {
            d.handle_datagram(&junk, src);
        }
        assert!(d.is_banned(Ipv4Addr::new(192, 0, 2, 7)));

        // A now well-formed frame from the banned source is also dropped:
        // a Ping would otherwise produce a reply into the round state.
        let ping = d.identity_message(MessageKind::Ping);
        let wire = d.crypt.encode_frame(&ping).unwrap();
        d.handle_datagram(&wire, src);
        assert!(d.is_banned(Ipv4Addr::new(192, 0, 2, 7)));
    }

    #[test]
    fn responses_for_other_destinations_are_dropped() {
        let crypt = secret();
        let d = Discovery::bind(
            test_cfg(Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(10, 9, 6, 2), 0),
            crypt.clone(),
        )
        .unwrap();

        // Open a round by hand so an accepted response would land in it.
        let seq = crypt.next_seq();
        {
            let mut round = d.round.lock();
            round.seq = seq;
            round.open = true;
            round.responses.clear();
        }

        let mut msg = d.identity_message(MessageKind::ResponseFull);
        msg.seq = seq;
        msg.sender_ip = Ipv4Addr::new(10, 9, 6, 3);
        msg.dest_ip = Ipv4Addr::new(10, 9, 6, 99);
        let wire = crypt.encode_frame(&msg).unwrap();
        d.handle_datagram(&wire, "10.9.6.3:8099".parse().unwrap());
        assert!(d.round.lock().responses.is_empty());

        // The same frame addressed to us is collected.
        msg.dest_ip = Ipv4Addr::new(10, 9, 6, 2);
        let wire = crypt.encode_frame(&msg).unwrap();
        d.handle_datagram(&wire, "10.9.6.3:8099".parse().unwrap());
        assert_eq!(d.round.lock().responses.len(), 1);
    }

    #[test]
    fn stale_sequence_is_late() {
        let crypt = secret();
        let d = Discovery::bind(
            test_cfg(Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(10, 9, 5, 2), 0),
            crypt.clone(),
        )
        .unwrap();

        let old_seq = crypt.next_seq();
        let new_seq = crypt.next_seq();
        {
            let mut round = d.round.lock();
            round.seq = new_seq;
            round.open = true;
        }
        let mut msg = d.identity_message(MessageKind::ResponseNone);
        msg.seq = old_seq;
        msg.sender_ip = Ipv4Addr::new(10, 9, 5, 3);
        msg.dest_ip = Ipv4Addr::new(10, 9, 5, 2);
        let wire = crypt.encode_frame(&msg).unwrap();
        d.handle_datagram(&wire, "10.9.5.3:8099".parse().unwrap());
        assert!(d.round.lock().responses.is_empty());
    }
}
