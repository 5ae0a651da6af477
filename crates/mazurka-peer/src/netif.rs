//! Network interface enumeration and selection.
//!
//! The only platform-specific code in the crate lives here: a thin
//! `getifaddrs` walk plus `/sys`/`/proc` reads on Linux. Selection is
//! driven by an explicit [`InterfaceFilter`] parameter.

use std::collections::{HashMap, HashSet};
use std::ffi::CStr;
use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::error::{PeerError, PeerResult};
use crate::message::HardwareKind;

#[derive(Debug, Clone)]
pub struct NetInterface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub mac: [u8; 6],
    pub is_up: bool,
    pub is_loopback: bool,
    pub has_broadcast: bool,
    pub hardware: HardwareKind,
    pub speed_mbits: u32,
    pub has_gateway: bool,
}

/// Which interfaces qualify, and which ranking criteria to ignore.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct InterfaceFilter {
    pub ethernet_only: bool,
    /// Only private (RFC 1918) or loopback addresses.
    pub local_only: bool,
    pub require_broadcast: bool,
    pub ignore_gateway: bool,
    pub ignore_kind: bool,
    pub ignore_speed: bool,
}

fn kind_for_name(name: &str, is_loopback: bool) -> HardwareKind {
    if is_loopback {
        return HardwareKind::Loopback;
    }
    if name.starts_with("wl") || name.starts_with("wifi") || name.starts_with("ath") {
        return HardwareKind::Wifi;
    }
    if name.starts_with("eth") || name.starts_with("en") {
        return HardwareKind::Ethernet;
    }
    HardwareKind::Other
}

fn default_speed(kind: HardwareKind) -> u32 {
    match kind {
        HardwareKind::Ethernet => 1000,
        HardwareKind::Wifi => 300,
        HardwareKind::Loopback => 10_000,
        HardwareKind::Other => 100,
    }
}

#[cfg(target_os = "linux")]
fn sysfs_speed(name: &str) -> Option<u32> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{}/speed", name)).ok()?;
    let speed: i64 = raw.trim().parse().ok()?;
    (speed > 0).then_some(speed as u32)
}

#[cfg(not(target_os = "linux"))]
fn sysfs_speed(_name: &str) -> Option<u32> {
    None
}

/// Interfaces carrying a default route, read from the kernel route table.
#[cfg(target_os = "linux")]
fn gateway_interfaces() -> HashSet<String> {
    let mut out = HashSet::new();
    let Ok(table) = std::fs::read_to_string("/proc/net/route") else {
        return out;
    };
    for line in table.lines().skip(1) {
        let mut cols = line.split_whitespace();
        let (Some(iface), Some(dest)) = (cols.next(), cols.next()) else {
            continue;
        };
        if dest == "00000000" {
            out.insert(iface.to_string());
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
fn gateway_interfaces() -> HashSet<String> {
    HashSet::new()
}

fn is_private(addr: Ipv4Addr) -> bool {
    addr.is_private() || addr.is_loopback() || addr.is_link_local()
}

unsafe fn sockaddr_v4(sa: *const libc::sockaddr) -> Option<Ipv4Addr> {
    if sa.is_null() {
        return None;
    }
    unsafe {
        if (*sa).sa_family as i32 != libc::AF_INET {
            return None;
        }
        let sin = &*(sa as *const libc::sockaddr_in);
        Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
    }
}

/// Enumerate IPv4-capable interfaces via `getifaddrs`.
pub fn list_interfaces() -> PeerResult<Vec<NetInterface>> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills a linked list we walk read-only below and
    // release with freeifaddrs exactly once.
    unsafe {
        if libc::getifaddrs(&mut ifap) != 0 {
            return Err(PeerError::Io(std::io::Error::last_os_error()));
        }
    }

    let gateways = gateway_interfaces();
    let mut out: Vec<NetInterface> = Vec::new();
    let mut macs: HashMap<String, [u8; 6]> = HashMap::new();

    let mut cursor = ifap;
    while !cursor.is_null() {
        // SAFETY: cursor is a live node of the getifaddrs list.
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;

        let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
            .to_string_lossy()
            .into_owned();
        let flags = ifa.ifa_flags;
        let is_up = flags & libc::IFF_UP as u32 != 0;
        let is_loopback = flags & libc::IFF_LOOPBACK as u32 != 0;
        let broadcast_capable = flags & libc::IFF_BROADCAST as u32 != 0;

        if ifa.ifa_addr.is_null() {
            continue;
        }

        #[cfg(target_os = "linux")]
        unsafe {
            if (*ifa.ifa_addr).sa_family as i32 == libc::AF_PACKET {
                let sll = &*(ifa.ifa_addr as *const libc::sockaddr_ll);
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&sll.sll_addr[..6]);
                macs.insert(name.clone(), mac);
                continue;
            }
        }

        let Some(addr) = (unsafe { sockaddr_v4(ifa.ifa_addr) }) else {
            continue;
        };
        let netmask =
            unsafe { sockaddr_v4(ifa.ifa_netmask) }.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let broadcast = if broadcast_capable {
            unsafe { sockaddr_v4(ifa.ifa_ifu) }
                .unwrap_or_else(|| derive_broadcast(addr, netmask))
        } else {
            Ipv4Addr::UNSPECIFIED
        };

        let hardware = kind_for_name(&name, is_loopback);
        let speed_mbits = sysfs_speed(&name).unwrap_or_else(|| default_speed(hardware));
        out.push(NetInterface {
            has_gateway: gateways.contains(&name),
            name,
            addr,
            netmask,
            broadcast,
            mac: [0u8; 6],
            is_up,
            is_loopback,
            has_broadcast: broadcast_capable,
            hardware,
            speed_mbits,
        });
    }
    // SAFETY: ifap came from getifaddrs and is freed exactly once.
    unsafe { libc::freeifaddrs(ifap) };

    for iface in &mut out {
        if let Some(mac) = macs.get(&iface.name) {
            iface.mac = *mac;
        }
    }
    Ok(out)
}

pub fn derive_broadcast(addr: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(netmask))
}

/// Pick the best interface under `filter`: up, addressed, then ranked by
/// default-gateway presence, hardware kind and link speed.
pub fn pick_interface(
    mut candidates: Vec<NetInterface>,
    filter: &InterfaceFilter,
) -> PeerResult<NetInterface> {
    candidates.retain(|i| i.is_up && !i.addr.is_unspecified());
    if filter.ethernet_only {
        candidates.retain(|i| i.hardware == HardwareKind::Ethernet);
    }
    if filter.local_only {
        candidates.retain(|i| is_private(i.addr));
    }
    if filter.require_broadcast {
        candidates.retain(|i| i.has_broadcast && !i.broadcast.is_unspecified());
    }
    // Loopback only ever wins by being the sole survivor.
    candidates.sort_by(|a, b| {
        a.is_loopback
            .cmp(&b.is_loopback)
            .then_with(|| {
                if filter.ignore_gateway {
                    std::cmp::Ordering::Equal
                } else {
                    b.has_gateway.cmp(&a.has_gateway)
                }
            })
            .then_with(|| {
                if filter.ignore_kind {
                    std::cmp::Ordering::Equal
                } else {
                    a.hardware.cmp(&b.hardware)
                }
            })
            .then_with(|| {
                if filter.ignore_speed {
                    std::cmp::Ordering::Equal
                } else {
                    b.speed_mbits.cmp(&a.speed_mbits)
                }
            })
    });
    candidates.into_iter().next().ok_or(PeerError::NoInterface)
}
