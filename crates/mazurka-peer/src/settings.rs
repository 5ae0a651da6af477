//! Peer cache settings record.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{PeerError, PeerResult};
use crate::netif::InterfaceFilter;

/// Behavior toggles, all off by default except where noted.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PeerOptions {
    /// Shard cache directories 16 ways by the first digest nibble.
    pub sub_folders: bool,
    /// Stop waiting for broadcast responses after the first one.
    pub first_response: bool,
    /// Retry the previously successful peer before broadcasting.
    pub try_last_peer: bool,
    /// Walk all broadcast responders instead of only the best one.
    pub try_all_peers: bool,
    /// Suppress broadcasts for ~1 s after an empty round.
    pub broadcast_not_alone: bool,
    /// Client-only node: answer no UDP requests, serve no files.
    pub no_server: bool,
    pub no_ban_ip: bool,
    pub self_signed_https: bool,
    pub verbose_log: bool,
    /// Allow localhost direct-mode proxying.
    pub http_direct: bool,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            sub_folders: false,
            first_response: false,
            try_last_peer: true,
            try_all_peers: false,
            broadcast_not_alone: false,
            no_server: false,
            no_ban_ip: false,
            self_signed_https: false,
            verbose_log: false,
            http_direct: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    pub udp_port: u16,
    pub tcp_port: u16,
    pub filter: InterfaceFilter,
    pub options: PeerOptions,

    /// Outbound clamp applied to each peer transfer, 0 = unlimited.
    pub limit_mbps: u32,
    /// Active HTTP connections above this answer `ResponseOverloaded`.
    pub client_count: u32,
    pub broadcast_timeout_ms: u32,
    pub broadcast_max_responses: u32,
    /// Peers tried after a broadcast before giving up.
    pub try_all_peers_count: u32,
    /// Read timeout for peer HTTP transfers once connected.
    pub http_timeout_ms: u32,
    pub ban_minutes: u32,

    pub cache_temp_max_mb: u32,
    pub cache_temp_max_min: u32,
    pub cache_temp_min_bytes: u64,
    pub cache_perm_min_bytes: u64,

    pub temp_path: PathBuf,
    pub perm_path: PathBuf,

    /// Fixed instance identity; a random v4 UUID when unset.
    pub uuid: Option<String>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            udp_port: 8099,
            tcp_port: 8099,
            filter: InterfaceFilter::default(),
            options: PeerOptions::default(),
            limit_mbps: 0,
            client_count: 32,
            broadcast_timeout_ms: 10,
            broadcast_max_responses: 24,
            try_all_peers_count: 4,
            http_timeout_ms: 5000,
            ban_minutes: 4,
            cache_temp_max_mb: 1000,
            cache_temp_max_min: 60,
            cache_temp_min_bytes: 2048,
            cache_perm_min_bytes: 2048,
            temp_path: PathBuf::from("/tmp/mazurka-cache"),
            perm_path: PathBuf::from("/var/cache/mazurka"),
            uuid: None,
        }
    }
}

impl PeerSettings {
    /// Load overrides from environment variables (with `.env` support).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut s = Self::default();
        if let Ok(v) = std::env::var("MAZURKA_PEER_PORT")
            && let Ok(port) = v.parse()
        {
            s.udp_port = port;
            s.tcp_port = port;
        }
        if let Ok(v) = std::env::var("MAZURKA_PEER_TEMP_PATH") {
            s.temp_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MAZURKA_PEER_PERM_PATH") {
            s.perm_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MAZURKA_PEER_TEMP_MAX_MB")
            && let Ok(mb) = v.parse()
        {
            s.cache_temp_max_mb = mb;
        }
        if let Ok(v) = std::env::var("MAZURKA_PEER_DIRECT") {
            s.options.http_direct = v == "1" || v.eq_ignore_ascii_case("true");
        }
        s
    }

    /// Reject inconsistent combinations before anything is bound.
    pub fn validate(&self) -> PeerResult<()> {
        if self.udp_port == 0 || self.tcp_port == 0 {
            return Err(PeerError::Config("peer ports must be non-zero".into()));
        }
        if self.broadcast_max_responses == 0 {
            return Err(PeerError::Config("broadcast_max_responses is zero".into()));
        }
        if self.broadcast_timeout_ms == 0 {
            return Err(PeerError::Config("broadcast_timeout_ms is zero".into()));
        }
        if self.try_all_peers_count == 0 {
            return Err(PeerError::Config("try_all_peers_count is zero".into()));
        }
        if self.ban_minutes == 0 && !self.options.no_ban_ip {
            return Err(PeerError::Config(
                "ban_minutes is zero while banning is enabled".into(),
            ));
        }
        if self.cache_temp_max_mb == 0 {
            return Err(PeerError::Config("cache_temp_max_mb is zero".into()));
        }
        if self.options.self_signed_https && self.options.no_server {
            return Err(PeerError::Config(
                "self_signed_https without a server side".into(),
            ));
        }
        if self.temp_path.as_os_str().is_empty() {
            return Err(PeerError::Config("temp_path is empty".into()));
        }
        if let Some(uuid) = &self.uuid
            && uuid::Uuid::parse_str(uuid).is_err()
        {
            return Err(PeerError::Config(format!("invalid uuid override: {uuid}")));
        }
        Ok(())
    }

    /// Instance identity bytes: the override when set, else random.
    pub fn instance_uuid(&self) -> [u8; 16] {
        match &self.uuid {
            Some(s) => uuid::Uuid::parse_str(s)
                .map(|u| *u.as_bytes())
                .unwrap_or_else(|_| *uuid::Uuid::new_v4().as_bytes()),
            None => *uuid::Uuid::new_v4().as_bytes(),
        }
    }

    pub fn bytes_per_sec_limit(&self) -> Option<u64> {
        (self.limit_mbps > 0).then(|| self.limit_mbps as u64 * 1_000_000 / 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PeerSettings::default().validate().is_ok());
    }

    #[test]
    fn inconsistent_combinations_rejected() {
        let mut s = PeerSettings::default();
        s.options.self_signed_https = true;
        s.options.no_server = true;
        assert!(s.validate().is_err());

        let s = PeerSettings {
            broadcast_max_responses: 0,
            ..Default::default()
        };
        assert!(s.validate().is_err());

        let s = PeerSettings {
            uuid: Some("not-a-uuid".to_string()),
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn uuid_override_round_trips() {
        let s = PeerSettings {
            uuid: Some("6ba7b810-9dad-11d1-80b4-00c04fd430c8".to_string()),
            ..Default::default()
        };
        assert!(s.validate().is_ok());
        assert_eq!(s.instance_uuid(), s.instance_uuid());
    }

    #[test]
    fn rate_limit_conversion() {
        let s = PeerSettings {
            limit_mbps: 8,
            ..Default::default()
        };
        assert_eq!(s.bytes_per_sec_limit(), Some(1_000_000));
        assert_eq!(PeerSettings::default().bytes_per_sec_limit(), None);
    }
}
