//! Registry of in-flight file downloads.
//!
//! While a download is registered here, the HTTP server can stream the
//! bytes that have already arrived to another peer (a progressive
//! response), and the discovery layer can advertise the current length.
//! The hash bytes are opaque at this level.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

struct Entry {
    id: u64,
    path: PathBuf,
    expected_size: u64,
    hash: Vec<u8>,
    aborted: bool,
}

/// Point-in-time view of a registered partial.
#[derive(Debug, Clone)]
pub struct PartialStatus {
    pub id: u64,
    pub path: PathBuf,
    pub expected_size: u64,
    pub aborted: bool,
}

#[derive(Default)]
pub struct PartialRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl PartialRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an in-flight download; returns its handle.
    pub fn add(&self, path: impl Into<PathBuf>, expected_size: u64, hash: &[u8]) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Entry {
            id,
            path: path.into(),
            expected_size,
            hash: hash.to_vec(),
            aborted: false,
        });
        id
    }

    /// Look up a partial by content hash. The current on-disk length is
    /// read at call time, so the caller sees a monotonically growing value.
    pub fn find(&self, hash: &[u8]) -> Option<(PartialStatus, u64)> {
        let entries = self.entries.lock();
        let entry = entries.iter().find(|e| e.hash == hash && !e.aborted)?;
        let current = std::fs::metadata(&entry.path).map(|m| m.len()).unwrap_or(0);
        Some((
            PartialStatus {
                id: entry.id,
                path: entry.path.clone(),
                expected_size: entry.expected_size,
                aborted: entry.aborted,
            },
            current,
        ))
    }

    /// Atomically re-point a partial at its final location (used when a
    /// finished download is promoted into the cache).
    pub fn change_file(&self, id: u64, new_path: impl Into<PathBuf>) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.id == id) {
            Some(e) => {
                e.path = new_path.into();
                true
            }
            None => false,
        }
    }

    /// Mark the partial aborted; in-flight progressive responses observe
    /// this and close their connections.
    pub fn abort(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.id == id) {
            Some(e) => {
                e.aborted = true;
                true
            }
            None => false,
        }
    }

    /// Drop the entry entirely (progressive response finished).
    pub fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Current view of a registered partial, or `None` once removed.
    pub fn poll(&self, id: u64) -> Option<PartialStatus> {
        let entries = self.entries.lock();
        entries.iter().find(|e| e.id == id).map(|e| PartialStatus {
            id: e.id,
            path: e.path.clone(),
            expected_size: e.expected_size,
            aborted: e.aborted,
        })
    }

    /// Whether `path` currently belongs to a registered partial.
    pub fn status_for_path(&self, path: &Path) -> Option<PartialStatus> {
        let entries = self.entries.lock();
        entries.iter().find(|e| e.path == path).map(|e| PartialStatus {
            id: e.id,
            path: e.path.clone(),
            expected_size: e.expected_size,
            aborted: e.aborted,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn add_find_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.tmp");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[0u8; 600]).unwrap();

        let reg = PartialRegistry::new();
        let id = reg.add(&path, 1000, b"hash-a");

        let (status, current) = reg.find(b"hash-a").unwrap();
        assert_eq!(status.id, id);
        assert_eq!(status.expected_size, 1000);
        assert_eq!(current, 600);

        assert!(reg.find(b"hash-b").is_none());
        assert!(reg.remove(id));
        assert!(reg.find(b"hash-a").is_none());
        assert!(!reg.remove(id));
    }

    #[test]
    fn abort_hides_from_find_but_polls() {
        let reg = PartialRegistry::new();
        let id = reg.add("/nonexistent/p", 10, b"h");
        assert!(reg.abort(id));
        assert!(reg.find(b"h").is_none());
        assert!(reg.poll(id).unwrap().aborted);
    }

    #[test]
    fn change_file_swaps_path() {
        let reg = PartialRegistry::new();
        let id = reg.add("/tmp/a", 10, b"h");
        assert!(reg.change_file(id, "/tmp/b"));
        assert_eq!(reg.poll(id).unwrap().path, PathBuf::from("/tmp/b"));
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let reg = PartialRegistry::new();
        let a = reg.add("/tmp/a", 1, b"x");
        let b = reg.add("/tmp/b", 1, b"y");
        assert!(b > a);
    }
}
