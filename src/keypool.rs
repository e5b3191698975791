//! Pre-generated address pool, split into external and internal lanes.
//!
//! Indices are globally unique and monotonically increasing across both
//! lanes. A reservation removes the index from its lane until the caller
//! either keeps it (the entry is gone for good and the caller erases the
//! record) or the [`ReservedKey`] guard drops, which puts it back.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use dashcore::{PubkeyHash, PublicKey};

/// A single pool entry, as persisted in the `pool` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPoolEntry {
    /// Creation time, unix seconds.
    pub time: u64,
    pub pubkey: PublicKey,
    /// Whether the key belongs to the internal (change) lane.
    pub internal: bool,
}

#[derive(Default)]
struct KeyPoolInner {
    entries: BTreeMap<i64, KeyPoolEntry>,
    external: BTreeSet<i64>,
    internal: BTreeSet<i64>,
    max_index: i64,
    key_to_index: HashMap<PubkeyHash, i64>,
}

impl KeyPoolInner {
    fn lane_mut(&mut self, internal: bool) -> &mut BTreeSet<i64> {
        if internal {
            &mut self.internal
        } else {
            &mut self.external
        }
    }
}

/// Two-lane keypool. Cheap to clone; clones share state so reservation
/// guards stay valid however the wallet is moved around.
#[derive(Clone, Default)]
pub struct KeyPool {
    inner: Arc<Mutex<KeyPoolInner>>,
}

impl KeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KeyPoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next unassigned index.
    pub fn next_index(&self) -> i64 {
        self.lock().max_index + 1
    }

    /// Insert a fresh entry produced by top-up. `index` must be greater
    /// than every index ever used.
    pub fn insert(&self, index: i64, entry: KeyPoolEntry) {
        let mut inner = self.lock();
        inner.max_index = inner.max_index.max(index);
        inner.key_to_index.insert(entry.pubkey.pubkey_hash(), index);
        inner.lane_mut(entry.internal).insert(index);
        inner.entries.insert(index, entry);
    }

    /// Insert an entry read back from disk at startup.
    pub fn load_entry(&self, index: i64, entry: KeyPoolEntry) {
        self.insert(index, entry);
    }

    /// Number of keys available in a lane.
    pub fn count(&self, internal: bool) -> usize {
        let inner = self.lock();
        if internal {
            inner.internal.len()
        } else {
            inner.external.len()
        }
    }

    /// Number of keys available in the external lane.
    pub fn count_external(&self) -> usize {
        self.count(false)
    }

    /// Total available keys across both lanes.
    pub fn size(&self) -> usize {
        let inner = self.lock();
        inner.external.len() + inner.internal.len()
    }

    /// Creation time of the oldest available key, if any.
    pub fn oldest_time(&self) -> Option<u64> {
        let inner = self.lock();
        let oldest_of = |lane: &BTreeSet<i64>| {
            lane.first().and_then(|idx| inner.entries.get(idx)).map(|e| e.time)
        };
        match (oldest_of(&inner.external), oldest_of(&inner.internal)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Index the given pubkey hash was assigned, if it came from the pool.
    pub fn index_of(&self, key: &PubkeyHash) -> Option<i64> {
        self.lock().key_to_index.get(key).copied()
    }

    /// Reserve the lowest-indexed key of a lane. Returns `None` when the
    /// lane is empty; callers top up first. The returned guard puts the
    /// key back on drop unless [`ReservedKey::keep`] is called.
    pub fn reserve(&self, internal: bool) -> Option<ReservedKey> {
        let mut inner = self.lock();
        let index = *inner.lane_mut(internal).iter().next()?;
        inner.lane_mut(internal).remove(&index);
        let pubkey = inner.entries.get(&index)?.pubkey;
        drop(inner);

        Some(ReservedKey {
            pool: Arc::clone(&self.inner),
            reservation: Some((index, pubkey, internal)),
        })
    }

    /// Discard every entry with index at or below `through`, in both
    /// lanes. Used when a rescan shows addresses up to that index were
    /// handed out while the pool was out of sync (old backup restored).
    /// Returns the removed indices so the caller can erase records.
    pub fn mark_used_through(&self, through: i64) -> Vec<i64> {
        let mut inner = self.lock();
        let doomed: Vec<i64> = inner.entries.range(..=through).map(|(idx, _)| *idx).collect();
        for idx in &doomed {
            inner.external.remove(idx);
            inner.internal.remove(idx);
            if let Some(entry) = inner.entries.remove(idx) {
                inner.key_to_index.remove(&entry.pubkey.pubkey_hash());
            }
        }
        doomed
    }

    /// Wipe the pool entirely (refill is the caller's job). Returns the
    /// removed indices for record erasure.
    pub fn clear(&self) -> Vec<i64> {
        let mut inner = self.lock();
        let all: Vec<i64> = inner.entries.keys().copied().collect();
        inner.entries.clear();
        inner.external.clear();
        inner.internal.clear();
        inner.key_to_index.clear();
        all
    }
}

/// A key held out of the pool for the duration of a transaction build.
///
/// Dropping the guard returns the key to its lane; [`keep`](Self::keep)
/// consumes the reservation permanently.
pub struct ReservedKey {
    pool: Arc<Mutex<KeyPoolInner>>,
    reservation: Option<(i64, PublicKey, bool)>,
}

impl ReservedKey {
    pub fn index(&self) -> Option<i64> {
        self.reservation.as_ref().map(|(idx, _, _)| *idx)
    }

    pub fn pubkey(&self) -> Option<PublicKey> {
        self.reservation.as_ref().map(|(_, pk, _)| *pk)
    }

    /// Commit the reservation: the entry leaves the pool for good.
    /// Returns the index so the caller can erase the `pool` record.
    pub fn keep(mut self) -> Option<i64> {
        let (index, pubkey, _) = self.reservation.take()?;
        let mut inner = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.remove(&index);
        inner.key_to_index.remove(&pubkey.pubkey_hash());
        Some(index)
    }
}

impl Drop for ReservedKey {
    fn drop(&mut self) {
        if let Some((index, _, internal)) = self.reservation.take() {
            let mut inner = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.entries.contains_key(&index) {
                inner.lane_mut(internal).insert(index);
            }
        }
    }
}
