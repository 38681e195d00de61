//! Admitted-Connection Registry
//!
//! Shared map of live handlers keyed by a monotonically increasing admission
//! id. The acceptor inserts, the reaper snapshots and removes, shutdown
//! drains. One mutex guards the map; none of the operations hold it across
//! handler calls or awaits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::handler::ClientHandler;

/// One admitted connection: the handler plus the admission metadata the
/// reaper needs to apply the age policy.
#[derive(Clone)]
pub struct RegistryEntry {
    pub handler: Arc<dyn ClientHandler>,
    pub peer: SocketAddr,
    pub admitted_at: Instant,
}

/// Registry of admitted connections.
pub struct Registry {
    entries: Mutex<HashMap<u64, RegistryEntry>>,
    /// Mirrors `entries.len()`, updated under the lock, read without it.
    count: AtomicUsize,
    next_key: AtomicU64,
    inserted: Notify,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            count: AtomicUsize::new(0),
            next_key: AtomicU64::new(1),
            inserted: Notify::new(),
        }
    }

    /// Admit a handler, returning its admission id. Ids are unique for the
    /// lifetime of the registry, so two admissions in the same instant can
    /// never displace one another.
    pub fn insert(&self, handler: Arc<dyn ClientHandler>, peer: SocketAddr) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let entry = RegistryEntry {
            handler,
            peer,
            admitted_at: Instant::now(),
        };

        {
            let mut entries = self.entries.lock();
            entries.insert(key, entry);
            self.count.store(entries.len(), Ordering::Release);
        }
        // Wake the reaper if it is parked on an empty registry. notify_one
        // stores at most one permit, so an un-awaited wake costs a single
        // spurious recheck later.
        self.inserted.notify_one();

        key
    }

    /// Remove an entry. Returns `None` when another path already removed it,
    /// which is the caller's cue that teardown is someone else's job.
    pub fn remove(&self, key: u64) -> Option<RegistryEntry> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(&key);
        self.count.store(entries.len(), Ordering::Release);
        removed
    }

    /// Copy out the current entries so callers can examine handlers without
    /// holding the map lock.
    pub fn snapshot(&self) -> Vec<(u64, RegistryEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Take every entry out of the registry, leaving it empty.
    pub fn drain(&self) -> Vec<(u64, RegistryEntry)> {
        let mut entries = self.entries.lock();
        let drained = entries.drain().collect();
        self.count.store(0, Ordering::Release);
        drained
    }

    /// Lock-free count of admitted connections.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next `insert`. Used by the reaper to park instead
    /// of polling while the registry is empty.
    pub async fn wait_for_entry(&self) {
        self.inserted.notified().await;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
