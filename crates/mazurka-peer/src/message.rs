//! Fixed-layout peer cache message.
//!
//! Every UDP frame and bearer token carries exactly one [`PeerMessage`],
//! serialized to [`MESSAGE_LEN`] bytes with little-endian fields and
//! random tail padding. The padding is re-rolled for every message so two
//! encodings of the same logical message never produce equal plaintext.

use std::net::Ipv4Addr;

use rand::RngCore;

use crate::error::DecodeTag;

/// Serialized message size; fixed on every platform.
pub const MESSAGE_LEN: usize = 192;

/// Maximum digest bytes carried in a [`HashRecord`].
pub const HASH_MAX: usize = 64;

/// Seconds between the Unix epoch and 2020-01-01T00:00:00Z, the minimal
/// epoch the timestamp field counts from.
pub const MINIMAL_EPOCH_OFFSET: u64 = 1_577_836_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0,
    Pong = 1,
    Request = 2,
    ResponseNone = 3,
    ResponseOverloaded = 4,
    ResponsePartial = 5,
    ResponseFull = 6,
    RequestBearer = 7,
    DirectBearer = 8,
}

impl MessageKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => MessageKind::Ping,
            1 => MessageKind::Pong,
            2 => MessageKind::Request,
            3 => MessageKind::ResponseNone,
            4 => MessageKind::ResponseOverloaded,
            5 => MessageKind::ResponsePartial,
            6 => MessageKind::ResponseFull,
            7 => MessageKind::RequestBearer,
            8 => MessageKind::DirectBearer,
            _ => return None,
        })
    }

    /// Kinds whose sequence must fall inside the receiver's live window.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageKind::Pong
                | MessageKind::ResponseNone
                | MessageKind::ResponseOverloaded
                | MessageKind::ResponsePartial
                | MessageKind::ResponseFull
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum HardwareKind {
    Ethernet = 0,
    Wifi = 1,
    Loopback = 2,
    Other = 3,
}

impl HardwareKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => HardwareKind::Ethernet,
            1 => HardwareKind::Wifi,
            2 => HardwareKind::Loopback,
            3 => HardwareKind::Other,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HashAlgo {
    Sha256 = 0,
    Sha512 = 1,
    Sha3_256 = 2,
}

impl HashAlgo {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => HashAlgo::Sha256,
            1 => HashAlgo::Sha512,
            2 => HashAlgo::Sha3_256,
            _ => return None,
        })
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgo::Sha256 | HashAlgo::Sha3_256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }
}

/// Algorithm tag plus a fixed digest buffer; only the first
/// `algo.digest_len()` bytes are meaningful.
#[derive(Clone, Copy)]
pub struct HashRecord {
    pub algo: HashAlgo,
    pub digest: [u8; HASH_MAX],
}

impl HashRecord {
    pub fn new(algo: HashAlgo, digest: &[u8]) -> Self {
        let mut buf = [0u8; HASH_MAX];
        let n = digest.len().min(HASH_MAX);
        buf[..n].copy_from_slice(&digest[..n]);
        Self { algo, digest: buf }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.digest[..self.algo.digest_len()]
    }

    /// `algo byte || digest`, the identity used for cache file names and
    /// registry lookups.
    pub fn tagged(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.algo.digest_len());
        out.push(self.algo as u8);
        out.extend_from_slice(self.bytes());
        out
    }

    pub fn is_zero(&self) -> bool {
        self.bytes().iter().all(|&b| b == 0)
    }

    /// Hash `data` with `algo`. `None` when no hasher is wired in for
    /// the algorithm (SHA-3 is announced on the wire but not computed
    /// locally).
    pub fn compute(algo: HashAlgo, data: &[u8]) -> Option<Self> {
        use sha2::Digest as _;
        match algo {
            HashAlgo::Sha256 => Some(Self::new(algo, &sha2::Sha256::digest(data))),
            HashAlgo::Sha512 => Some(Self::new(algo, &sha2::Sha512::digest(data))),
            HashAlgo::Sha3_256 => None,
        }
    }
}

impl PartialEq for HashRecord {
    fn eq(&self, other: &Self) -> bool {
        self.algo == other.algo && self.bytes() == other.bytes()
    }
}

impl Eq for HashRecord {}

impl std::fmt::Debug for HashRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:", self.algo)?;
        for b in self.bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Default for HashRecord {
    fn default() -> Self {
        Self {
            algo: HashAlgo::Sha256,
            digest: [0u8; HASH_MAX],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    pub kind: MessageKind,
    pub seq: u32,
    pub uuid: [u8; 16],
    pub os: u32,
    pub sender_ip: Ipv4Addr,
    /// Unspecified (0.0.0.0) means broadcast.
    pub dest_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub speed_mbits: u32,
    pub hardware: HardwareKind,
    /// Seconds since the minimal epoch.
    pub timestamp: u32,
    pub connections: u16,
    pub hash: HashRecord,
    pub size: u64,
    pub range_start: u64,
    /// Inclusive.
    pub range_end: u64,
    pub opaque: u64,
    pub padding_version: u8,
}

/// Serialized field bytes before the random padding tail.
const FIXED_LEN: usize = 1 + 4 + 16 + 4 + 4 * 4 + 4 + 1 + 4 + 2 + (1 + HASH_MAX) + 8 * 4 + 1;
const PADDING_LEN: usize = MESSAGE_LEN - FIXED_LEN;

const _: () = assert!(FIXED_LEN == 150);
const _: () = assert!(PADDING_LEN == 42);

impl Default for PeerMessage {
    fn default() -> Self {
        Self {
            kind: MessageKind::Ping,
            seq: 0,
            uuid: [0u8; 16],
            os: 0,
            sender_ip: Ipv4Addr::UNSPECIFIED,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            broadcast: Ipv4Addr::UNSPECIFIED,
            speed_mbits: 0,
            hardware: HardwareKind::Other,
            timestamp: 0,
            connections: 0,
            hash: HashRecord::default(),
            size: 0,
            range_start: 0,
            range_end: 0,
            opaque: 0,
            padding_version: 0,
        }
    }
}

impl PeerMessage {
    /// Current time on the message clock.
    pub fn now_timestamp() -> u32 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs().saturating_sub(MINIMAL_EPOCH_OFFSET) as u32)
            .unwrap_or(0)
    }

    /// Serialize to the fixed wire layout with fresh random padding.
    pub fn encode(&self) -> [u8; MESSAGE_LEN] {
        let mut out = [0u8; MESSAGE_LEN];
        let mut pos = 0usize;
        let mut put = |bytes: &[u8], pos: &mut usize| {
            out_put(&mut out, pos, bytes);
        };

        put(&[self.kind as u8], &mut pos);
        put(&self.seq.to_le_bytes(), &mut pos);
        put(&self.uuid, &mut pos);
        put(&self.os.to_le_bytes(), &mut pos);
        put(&self.sender_ip.octets(), &mut pos);
        put(&self.dest_ip.octets(), &mut pos);
        put(&self.netmask.octets(), &mut pos);
        put(&self.broadcast.octets(), &mut pos);
        put(&self.speed_mbits.to_le_bytes(), &mut pos);
        put(&[self.hardware as u8], &mut pos);
        put(&self.timestamp.to_le_bytes(), &mut pos);
        put(&self.connections.to_le_bytes(), &mut pos);
        put(&[self.hash.algo as u8], &mut pos);
        put(&self.hash.digest, &mut pos);
        put(&self.size.to_le_bytes(), &mut pos);
        put(&self.range_start.to_le_bytes(), &mut pos);
        put(&self.range_end.to_le_bytes(), &mut pos);
        put(&self.opaque.to_le_bytes(), &mut pos);
        put(&[self.padding_version], &mut pos);
        debug_assert_eq!(pos, FIXED_LEN);

        // Random padding frustrates known-plaintext probing of the frame
        // cipher; no parser interprets these bytes.
        rand::thread_rng().fill_bytes(&mut out[FIXED_LEN..]);
        out
    }

    /// Deserialize and range-check the enum fields. Padding is ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeTag> {
        if buf.len() != MESSAGE_LEN {
            return Err(DecodeTag::Len);
        }
        let mut pos = 0usize;

        let kind = MessageKind::from_u8(take1(buf, &mut pos)).ok_or(DecodeTag::Kind)?;
        let seq = u32::from_le_bytes(take(buf, &mut pos));
        let uuid: [u8; 16] = take(buf, &mut pos);
        let os = u32::from_le_bytes(take(buf, &mut pos));
        let sender_ip = Ipv4Addr::from(take::<4>(buf, &mut pos));
        let dest_ip = Ipv4Addr::from(take::<4>(buf, &mut pos));
        let netmask = Ipv4Addr::from(take::<4>(buf, &mut pos));
        let broadcast = Ipv4Addr::from(take::<4>(buf, &mut pos));
        let speed_mbits = u32::from_le_bytes(take(buf, &mut pos));
        let hardware = HardwareKind::from_u8(take1(buf, &mut pos)).ok_or(DecodeTag::Hw)?;
        let timestamp = u32::from_le_bytes(take(buf, &mut pos));
        let connections = u16::from_le_bytes(take::<2>(buf, &mut pos));
        let algo = HashAlgo::from_u8(take1(buf, &mut pos)).ok_or(DecodeTag::Algo)?;
        let digest: [u8; HASH_MAX] = take(buf, &mut pos);
        let size = u64::from_le_bytes(take(buf, &mut pos));
        let range_start = u64::from_le_bytes(take(buf, &mut pos));
        let range_end = u64::from_le_bytes(take(buf, &mut pos));
        let opaque = u64::from_le_bytes(take(buf, &mut pos));
        let padding_version = take1(buf, &mut pos);
        debug_assert_eq!(pos, FIXED_LEN);

        Ok(Self {
            kind,
            seq,
            uuid,
            os,
            sender_ip,
            dest_ip,
            netmask,
            broadcast,
            speed_mbits,
            hardware,
            timestamp,
            connections,
            hash: HashRecord { algo, digest },
            size,
            range_start,
            range_end,
            opaque,
            padding_version,
        })
    }
}

fn out_put(out: &mut [u8; MESSAGE_LEN], pos: &mut usize, bytes: &[u8]) {
    out[*pos..*pos + bytes.len()].copy_from_slice(bytes);
    *pos += bytes.len();
}

fn take<const N: usize>(buf: &[u8], pos: &mut usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[*pos..*pos + N]);
    *pos += N;
    out
}

fn take1(buf: &[u8], pos: &mut usize) -> u8 {
    let b = buf[*pos];
    *pos += 1;
    b
}
