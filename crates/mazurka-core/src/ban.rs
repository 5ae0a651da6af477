//! Time-bucketed IP ban set.
//!
//! Two instances run in a full deployment: one for UDP-level misbehavior
//! (minutes TTL) and one for HTTP-level 4xx floods (a few seconds TTL).
//! The owner drives [`BanSet::rotate`] once per elapsed second; a banned
//! address drops out after its TTL worth of rotations.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use parking_lot::Mutex;

struct BanInner {
    /// One slot per TTL second; `head` receives new bans and the slot
    /// after it is the oldest.
    slots: Vec<HashSet<IpAddr>>,
    head: usize,
    /// Offence scores for sources that misbehaved but are not banned yet.
    scores: HashMap<IpAddr, u32>,
}

pub struct BanSet {
    inner: Mutex<BanInner>,
}

/// Upper bound on tracked offence scores before the map is reset.
const MAX_TRACKED_SCORES: usize = 4096;

impl BanSet {
    /// `ttl_secs` is how long a ban lasts, at one-second granularity.
    pub fn new(ttl_secs: usize) -> Self {
        let slots = ttl_secs.max(1);
        Self {
            inner: Mutex::new(BanInner {
                slots: (0..slots).map(|_| HashSet::new()).collect(),
                head: 0,
                scores: HashMap::new(),
            }),
        }
    }

    /// Ban `ip` for the full TTL.
    pub fn ban(&self, ip: IpAddr) {
        let mut inner = self.inner.lock();
        let head = inner.head;
        inner.slots[head].insert(ip);
        inner.scores.remove(&ip);
    }

    /// Record one offence for `ip`; once `threshold` offences accumulate
    /// the address is banned. Returns true when the ban was applied.
    pub fn offend(&self, ip: IpAddr, threshold: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.scores.len() >= MAX_TRACKED_SCORES {
            inner.scores.clear();
        }
        let score = inner.scores.entry(ip).or_insert(0);
        *score += 1;
        if *score >= threshold.max(1) {
            inner.scores.remove(&ip);
            let head = inner.head;
            inner.slots[head].insert(ip);
            return true;
        }
        false
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let inner = self.inner.lock();
        inner.slots.iter().any(|s| s.contains(&ip))
    }

    /// Advance one second: the oldest slot is recycled for new bans.
    pub fn rotate(&self) {
        let mut inner = self.inner.lock();
        let next = (inner.head + 1) % inner.slots.len();
        inner.slots[next].clear();
        inner.head = next;
    }

    /// Number of currently banned addresses.
    pub fn count(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.iter().map(HashSet::len).sum()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for slot in &mut inner.slots {
            slot.clear();
        }
        inner.scores.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn ban_expires_after_ttl_rotations() {
        let set = BanSet::new(3);
        set.ban(ip(1));
        assert!(set.is_banned(ip(1)));

        set.rotate();
        set.rotate();
        assert!(set.is_banned(ip(1)));
        // The third rotation recycles the slot the ban lives in.
        set.rotate();
        assert!(!set.is_banned(ip(1)));
    }

    #[test]
    fn offence_threshold() {
        let set = BanSet::new(60);
        assert!(!set.offend(ip(2), 3));
        assert!(!set.offend(ip(2), 3));
        assert!(!set.is_banned(ip(2)));
        assert!(set.offend(ip(2), 3));
        assert!(set.is_banned(ip(2)));
    }

    #[test]
    fn count_and_clear() {
        let set = BanSet::new(10);
        set.ban(ip(1));
        set.ban(ip(2));
        assert_eq!(set.count(), 2);
        set.clear();
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn fresh_ban_survives_old_slot_recycling() {
        let set = BanSet::new(2);
        set.ban(ip(9));
        set.rotate();
        // Banned again inside the window; the newer entry keeps it banned
        // past the original expiry.
        set.ban(ip(9));
        set.rotate();
        assert!(set.is_banned(ip(9)));
        set.rotate();
        assert!(!set.is_banned(ip(9)));
    }
}
