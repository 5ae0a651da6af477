use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Server-wide counters, cache-line aligned to avoid false sharing
/// between the accept thread and the workers.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub active_conns: AtomicUsize,
    pub served_requests: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub rejected_conns: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            served_requests: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            rejected_conns: AtomicU64::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.served_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
