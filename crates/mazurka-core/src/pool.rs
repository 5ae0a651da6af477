//! Bounded worker pool for short HTTP exchanges.
//!
//! Pool workers parse the head of each queued connection and promote
//! keep-alive or large-body requests to dedicated threads so the pool
//! stays available for new arrivals. The dedicated set is capped
//! separately to bound memory.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::conn::{Connection, ExchangeResult, HeadStep};
use crate::server::ServerCore;

struct PoolShared {
    queue: Mutex<VecDeque<(TcpStream, SocketAddr)>>,
    available: Condvar,
    cap: usize,
    core: Arc<ServerCore>,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(size: usize, queue_cap: usize, core: Arc<ServerCore>) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::with_capacity(queue_cap)),
            available: Condvar::new(),
            cap: queue_cap.max(1),
            core,
        });

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("mazurka-worker-{}", i))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }

        Self { shared, workers }
    }

    /// Queue a connection; `false` means the queue is full and the caller
    /// must drop the socket.
    pub fn dispatch(&self, stream: TcpStream, addr: SocketAddr) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.cap {
            return false;
        }
        queue.push_back((stream, addr));
        self.shared
            .core
            .queue_len
            .store(queue.len(), Ordering::Relaxed);
        drop(queue);
        self.shared.available.notify_one();
        true
    }

    /// Wake every worker and join them. The core's terminated flag must be
    /// set first.
    pub fn shutdown(self) {
        self.shared.available.notify_all();
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    let core = &shared.core;
    loop {
        let (stream, addr) = {
            let mut queue = shared.queue.lock();
            loop {
                if core.terminated() {
                    return;
                }
                if let Some(item) = queue.pop_front() {
                    core.queue_len.store(queue.len(), Ordering::Relaxed);
                    break item;
                }
                shared
                    .available
                    .wait_for(&mut queue, Duration::from_millis(500));
            }
        };

        let mut conn = Connection::new(core.clone(), stream, addr);
        match conn.read_head() {
            HeadStep::Close => continue,
            HeadStep::Ready => {}
        }

        // Keep-alive and large uploads leave the pool before dispatching.
        if conn.wants_promotion() && core.try_begin_dedicated() {
            promote(core.clone(), conn, true);
            continue;
        }

        match conn.serve_parsed() {
            ExchangeResult::Close => {}
            ExchangeResult::KeepAlive => {
                if core.try_begin_dedicated() {
                    promote(core.clone(), conn, false);
                } else {
                    trace!(ip = %addr.ip(), "dedicated set full, closing keep-alive");
                }
            }
        }
    }
}

fn promote(core: Arc<ServerCore>, conn: Connection, serve_pending: bool) {
    let spawned = thread::Builder::new()
        .name("mazurka-conn".to_string())
        .spawn(move || {
            if serve_pending {
                conn.run_promoted();
            } else {
                conn.run();
            }
            core.end_dedicated();
        });
    if let Err(e) = spawned {
        debug!(error = %e, "failed to spawn dedicated worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_core;
    use std::net::TcpListener;

    #[test]
    fn dispatch_respects_queue_cap() {
        let core = test_core();
        // No workers: the queue only fills.
        let pool = WorkerPool::start(0, 2, core.clone());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let make = || {
            let c = TcpStream::connect(addr).unwrap();
            let (s, a) = listener.accept().unwrap();
            drop(c);
            (s, a)
        };

        let (s1, a1) = make();
        let (s2, a2) = make();
        let (s3, a3) = make();
        assert!(pool.dispatch(s1, a1));
        assert!(pool.dispatch(s2, a2));
        assert!(!pool.dispatch(s3, a3));
        assert_eq!(core.queue_len.load(Ordering::Relaxed), 2);

        core.terminate();
        pool.shutdown();
    }
}
