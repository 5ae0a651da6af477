//! Authenticated symmetric framing for peer messages.
//!
//! The wire layout is `iv:16 || ciphertext:192 || tag:16 || crc:4` where
//! the trailing checksum is `crc32c(magic, ciphertext || iv || tag)`, a
//! cheap pre-filter that rejects random datagrams before the AEAD runs.
//! Bearer tokens are the same frame in base64url.

use std::sync::atomic::{AtomicU32, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use ring::{aead, hmac};

use crate::error::{DecodeTag, PeerError, PeerResult};
use crate::message::{MESSAGE_LEN, MessageKind, PeerMessage};

pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const CRC_LEN: usize = 4;

/// Encrypted frame size on the wire.
pub const FRAME_LEN: usize = IV_LEN + MESSAGE_LEN + TAG_LEN + CRC_LEN;

/// Domain separation label for the key schedule.
const KEY_LABEL: &[u8] = b"mazurka peer frame key v1";

/// Sequences are 31-bit; reaching the top bit forces a re-anchor.
const SEQ_LIMIT: u32 = 0x8000_0000;

fn random_seq_anchor() -> u32 {
    // Leave plenty of headroom above the anchor before wraparound.
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    u32::from_le_bytes(bytes) & 0x3fff_ffff
}

/// Shared-secret frame cipher plus the per-process sequence window.
pub struct PeerCrypt {
    key: aead::LessSafeKey,
    /// Anti-fuzzing salt mixed into the trailing checksum.
    magic: u32,
    /// Lowest sequence this process will accept in responses.
    startup_low: AtomicU32,
    /// Last sequence handed out for an outgoing request.
    current: AtomicU32,
}

impl PeerCrypt {
    /// Derive the AES key and checksum magic from a shared secret.
    ///
    /// HMAC-SHA-256 over a fixed label yields 256 bits; the lower half
    /// keys AES-GCM-128 and a second HMAC iteration yields the 32-bit
    /// magic from its high word.
    pub fn new(secret: &[u8]) -> PeerResult<Self> {
        let hk = hmac::Key::new(hmac::HMAC_SHA256, secret);
        let first = hmac::sign(&hk, KEY_LABEL);
        let second = hmac::sign(&hk, first.as_ref());

        let key_bytes = &first.as_ref()[..16];
        let unbound = aead::UnboundKey::new(&aead::AES_128_GCM, key_bytes)
            .map_err(|_| PeerError::Crypto("AES key setup failed".into()))?;
        let magic = u32::from_le_bytes(
            second.as_ref()[28..32]
                .try_into()
                .map_err(|_| PeerError::Crypto("key schedule truncated".into()))?,
        );

        let anchor = random_seq_anchor();
        Ok(Self {
            key: aead::LessSafeKey::new(unbound),
            magic,
            startup_low: AtomicU32::new(anchor),
            current: AtomicU32::new(anchor),
        })
    }

    /// Allocate the next outgoing sequence. On 31-bit exhaustion the
    /// window re-anchors to a fresh random value, which peers observe as
    /// a restart.
    pub fn next_seq(&self) -> u32 {
        loop {
            let prev = self.current.load(Ordering::Acquire);
            let next = prev.wrapping_add(1);
            if next >= SEQ_LIMIT {
                let fresh = random_seq_anchor();
                self.startup_low.store(fresh, Ordering::Release);
                self.current.store(fresh, Ordering::Release);
                return fresh;
            }
            if self
                .current
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// `[startup_low, current_outgoing]`, the window valid responses must
    /// fall into. Rejects replays captured before this process started.
    pub fn seq_window(&self) -> (u32, u32) {
        (
            self.startup_low.load(Ordering::Acquire),
            self.current.load(Ordering::Acquire),
        )
    }

    fn seq_ok(&self, seq: u32) -> bool {
        let (low, high) = self.seq_window();
        seq >= low && seq <= high
    }

    fn checksum(&self, ciphertext: &[u8], iv: &[u8], tag: &[u8]) -> u32 {
        let mut crc = crc32c::crc32c_append(self.magic, ciphertext);
        crc = crc32c::crc32c_append(crc, iv);
        crc32c::crc32c_append(crc, tag)
    }

    /// Serialize and seal one message for the wire.
    pub fn encode_frame(&self, msg: &PeerMessage) -> PeerResult<Vec<u8>> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = aead::Nonce::try_assume_unique_for_key(&iv[..aead::NONCE_LEN])
            .map_err(|_| PeerError::Crypto("nonce setup failed".into()))?;

        let mut body = msg.encode().to_vec();
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, aead::Aad::empty(), &mut body)
            .map_err(|_| PeerError::Crypto("seal failed".into()))?;

        let mut wire = Vec::with_capacity(FRAME_LEN);
        wire.extend_from_slice(&iv);
        wire.extend_from_slice(&body);
        wire.extend_from_slice(tag.as_ref());
        let crc = self.checksum(&body, &iv, tag.as_ref());
        wire.extend_from_slice(&crc.to_le_bytes());
        Ok(wire)
    }

    /// Verify and open one wire frame.
    pub fn decode_frame(&self, wire: &[u8]) -> Result<PeerMessage, DecodeTag> {
        if wire.len() < FRAME_LEN {
            return Err(DecodeTag::Len);
        }
        let crc_off = wire.len() - CRC_LEN;
        let tag_off = crc_off - TAG_LEN;
        let iv = &wire[..IV_LEN];
        let ciphertext = &wire[IV_LEN..tag_off];
        let tag = &wire[tag_off..crc_off];

        let expected = u32::from_le_bytes(wire[crc_off..].try_into().map_err(|_| DecodeTag::Len)?);
        if self.checksum(ciphertext, iv, tag) != expected {
            return Err(DecodeTag::Crc);
        }

        let nonce = aead::Nonce::try_assume_unique_for_key(&iv[..aead::NONCE_LEN])
            .map_err(|_| DecodeTag::Aes)?;
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);
        let plain = self
            .key
            .open_in_place(nonce, aead::Aad::empty(), &mut sealed)
            .map_err(|_| DecodeTag::Aes)?;
        if plain.len() != MESSAGE_LEN {
            return Err(DecodeTag::Len);
        }

        let msg = PeerMessage::decode(plain)?;
        if msg.kind.is_response() && !self.seq_ok(msg.seq) {
            return Err(DecodeTag::Seq);
        }
        Ok(msg)
    }

    /// Encode a message as a base64url bearer token.
    pub fn encode_bearer(&self, msg: &PeerMessage) -> PeerResult<String> {
        let frame = self.encode_frame(msg)?;
        Ok(URL_SAFE_NO_PAD.encode(frame))
    }

    /// Decode a bearer and require a specific message kind.
    pub fn decode_bearer(
        &self,
        bearer: &str,
        expected: MessageKind,
    ) -> Result<PeerMessage, DecodeTag> {
        // base64url of a full frame: 4 chars per 3 bytes, unpadded.
        if bearer.len() < FRAME_LEN * 4 / 3 {
            return Err(DecodeTag::BLen);
        }
        let frame = URL_SAFE_NO_PAD
            .decode(bearer.as_bytes())
            .map_err(|_| DecodeTag::B64)?;
        let msg = self.decode_frame(&frame)?;
        if msg.kind != expected {
            return Err(DecodeTag::Bearer);
        }
        Ok(msg)
    }
}
