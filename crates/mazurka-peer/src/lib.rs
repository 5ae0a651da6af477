//! mazurka-peer: local peer-to-peer cache over the mazurka HTTP engine.
//!
//! Siblings on one broadcast domain discover each other with
//! authenticated UDP frames, advertise cached or in-flight files, and
//! serve each other chunks over bearer-authenticated HTTP before any
//! download falls back to its origin.

pub mod cache;
pub mod client;
pub mod crypt;
pub mod direct;
pub mod discovery;
pub mod error;
pub mod message;
pub mod netif;
pub mod settings;

// Re-exports for users
pub use cache::{DownloadRequest, PeerCache, PeerCacheHooks, StoreClass, cache_filename};
pub use client::{PeerClient, PeerResponse};
pub use crypt::{FRAME_LEN, PeerCrypt};
pub use direct::{DirectUrl, crc63c};
pub use discovery::{
    Discovery, DiscoveryConfig, RequestResponder, ResponderVerdict,
};
pub use error::{DecodeTag, PeerError, PeerResult};
pub use message::{
    HASH_MAX, HardwareKind, HashAlgo, HashRecord, MESSAGE_LEN, MessageKind, PeerMessage,
};
pub use netif::{InterfaceFilter, NetInterface, list_interfaces, pick_interface};
pub use settings::{PeerOptions, PeerSettings};
