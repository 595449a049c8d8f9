//! Pending message bookkeeping.
//!
//! Maps in-flight identifiers to their Pending Entries so that asynchronous
//! acknowledgments and responses can be matched with the message that
//! produced them. Resolution and retirement happen under one lock
//! acquisition, so a concurrent reader never sees a half-retired entry.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::transport::PacketId;

/// Bookkeeping record for a message awaiting acknowledgment or response.
#[derive(Debug)]
pub struct PendingEntry {
    id: PacketId,
    message: Bytes,
    created_at: Instant,
    waiter: Option<oneshot::Sender<()>>,
}

impl PendingEntry {
    /// Create an entry nobody waits on.
    pub fn new(id: PacketId, message: Bytes) -> Self {
        Self {
            id,
            message,
            created_at: Instant::now(),
            waiter: None,
        }
    }

    /// Create an entry whose resolution wakes the returned receiver.
    pub fn awaiting(id: PacketId, message: Bytes) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mut entry = Self::new(id, message);
        entry.waiter = Some(tx);
        (entry, rx)
    }

    /// Identifier of the message.
    pub fn id(&self) -> PacketId {
        self.id
    }

    /// Encoded message bytes.
    pub fn message(&self) -> &Bytes {
        &self.message
    }

    /// Time the entry has been outstanding.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn complete(mut self) {
        if let Some(waiter) = self.waiter.take() {
            // The sender may already have given up; that is fine.
            let _ = waiter.send(());
        }
    }
}

/// Identifier → Pending Entry map guarded by a single mutex.
///
/// `K` is a bare [`PacketId`] where one peer shares the socket, or
/// `(SocketAddr, PacketId)` where many clients do.
#[derive(Debug)]
pub struct PendingTracker<K> {
    entries: Mutex<HashMap<K, PendingEntry>>,
}

impl<K> PendingTracker<K>
where
    K: Eq + Hash + Copy,
{
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register an entry. Fails while another entry for `key` is live.
    pub fn register(&self, key: K, entry: PendingEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(Error::DuplicateId(entry.id));
        }
        entries.insert(key, entry);
        Ok(())
    }

    /// Resolve and retire in one step.
    pub fn take(&self, key: &K) -> Option<PendingEntry> {
        self.entries.lock().remove(key)
    }

    /// Retire an entry without using it. Returns whether it was live.
    pub fn retire(&self, key: &K) -> bool {
        self.take(key).is_some()
    }

    /// Retire the entry for an acknowledgment and wake its sender.
    ///
    /// Returns `false` for stale or unknown acknowledgments.
    pub fn resolve_ack(&self, key: &K) -> bool {
        match self.take(key) {
            Some(entry) => {
                entry.complete();
                true
            }
            None => false,
        }
    }

    /// Whether `key` has a live entry.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Drop entries older than `max_age`. Returns how many were dropped.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.age() <= max_age);
        before - entries.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no entry is live.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K> Default for PendingTracker<K>
where
    K: Eq + Hash + Copy,
{
    fn default() -> Self {
        Self::new()
    }
}
