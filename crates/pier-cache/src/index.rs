//! In-memory index of cached entries.
//!
//! The index is plain data with no I/O; [`CacheEngine`] wraps it in a single
//! mutex and never holds that lock across a store call.
//!
//! [`CacheEngine`]: crate::CacheEngine

use std::collections::{HashMap, HashSet};

use pier_types::{CacheEntry, ContentId, ObjectMeta, Timestamp};

/// An index entry plus bookkeeping the engine needs around eviction.
#[derive(Debug, Clone, Copy)]
struct Slot {
    entry: CacheEntry,
    /// Insertion sequence number; changes whenever new bytes are stored.
    seq: u64,
    /// A removal for this entry is in flight.
    evicting: bool,
}

/// Eviction candidate handed out by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Victim {
    /// Entry to remove.
    pub id: ContentId,
    /// Sequence number the entry had when it was selected.
    pub seq: u64,
}

/// How an in-flight eviction ended, as seen by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The entry was dropped from the index.
    Removed(CacheEntry),
    /// The removal failed; the entry stays indexed for a later retry.
    Retained,
    /// The entry was stored again while its removal was in flight.
    Superseded,
    /// The entry disappeared from the index in the meantime.
    Gone,
}

/// Result of comparing the index with a store listing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Index entries whose bytes are no longer stored.
    pub dropped: usize,
    /// Index entries whose recorded size differed from the stored size.
    pub resized: usize,
    /// Stored objects the index does not know about.
    pub unindexed: Vec<ObjectMeta>,
}

/// All cache entries plus the running byte total.
///
/// `total_bytes` always equals the sum of `size_bytes` over all entries,
/// including entries whose removal is in flight. Bytes of in-flight removals
/// are additionally tracked in `pending_bytes` so concurrent evictions do not
/// evict more than needed.
#[derive(Debug, Default)]
pub struct CacheIndex {
    slots: HashMap<ContentId, Slot>,
    total_bytes: u64,
    pending_bytes: u64,
    next_seq: u64,
}

impl CacheIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Sum of all entry sizes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Sequence number the next insertion will receive.
    pub fn current_seq(&self) -> u64 {
        self.next_seq
    }

    /// Whether an entry exists for `id`.
    pub fn contains(&self, id: &ContentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Look up an entry without touching it.
    pub fn get(&self, id: &ContentId) -> Option<CacheEntry> {
        self.slots.get(id).map(|s| s.entry)
    }

    /// All entries, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.slots.values().map(|s| &s.entry)
    }

    /// Earliest `stored_at` across all entries.
    pub fn oldest_stored_at(&self) -> Option<Timestamp> {
        self.slots.values().map(|s| s.entry.stored_at).min()
    }

    /// Insert or replace the entry for `id` with freshly stored bytes.
    pub fn insert(&mut self, id: ContentId, size_bytes: u64, now: Timestamp) -> CacheEntry {
        let entry = CacheEntry {
            id,
            size_bytes,
            stored_at: now,
            last_accessed_at: now,
        };
        self.put_slot(entry);
        entry
    }

    /// Insert an object found in the store but missing from the index.
    ///
    /// The object counts as last accessed at the later of its write time
    /// and the access the store recorded. Returns `false` if the index
    /// already has an entry for it.
    pub fn adopt(&mut self, meta: ObjectMeta) -> bool {
        if self.slots.contains_key(&meta.id) {
            return false;
        }
        self.put_slot(CacheEntry {
            id: meta.id,
            size_bytes: meta.size_bytes,
            stored_at: meta.stored_at,
            last_accessed_at: meta.stored_at.max(meta.accessed_at),
        });
        true
    }

    fn put_slot(&mut self, entry: CacheEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(old) = self.slots.insert(
            entry.id,
            Slot {
                entry,
                seq,
                evicting: false,
            },
        ) {
            self.release(&old);
        }
        self.total_bytes += entry.size_bytes;
    }

    /// Account for a slot leaving the index.
    fn release(&mut self, slot: &Slot) {
        self.total_bytes -= slot.entry.size_bytes;
        if slot.evicting {
            self.pending_bytes -= slot.entry.size_bytes;
        }
    }

    /// Record an access. `last_accessed_at` never moves backwards.
    pub fn touch(&mut self, id: &ContentId, now: Timestamp) -> Option<CacheEntry> {
        let slot = self.slots.get_mut(id)?;
        slot.entry.last_accessed_at = slot.entry.last_accessed_at.max(now);
        Some(slot.entry)
    }

    /// Drop an entry whose bytes turned out to be missing.
    ///
    /// Entries with a removal in flight are left to that removal.
    pub fn forget(&mut self, id: &ContentId) -> Option<CacheEntry> {
        if self.slots.get(id).is_none_or(|s| s.evicting) {
            return None;
        }
        let slot = self.slots.remove(id)?;
        self.release(&slot);
        Some(slot.entry)
    }

    /// Select least-recently-accessed entries until the bytes not already
    /// being evicted fit under `max_bytes`.
    ///
    /// Ties on `last_accessed_at` are broken by id. Entries in `skip` are
    /// never selected. Selected entries are marked as evicting.
    pub fn select_over_budget(&mut self, max_bytes: u64, skip: &HashSet<ContentId>) -> Vec<Victim> {
        let mut remaining = self.total_bytes - self.pending_bytes;
        if remaining <= max_bytes {
            return Vec::new();
        }

        let mut candidates: Vec<CacheEntry> = self
            .slots
            .values()
            .filter(|s| !s.evicting && !skip.contains(&s.entry.id))
            .map(|s| s.entry)
            .collect();
        candidates.sort_unstable_by_key(|e| (e.last_accessed_at, e.id));

        let mut victims = Vec::new();
        for entry in candidates {
            if remaining <= max_bytes {
                break;
            }
            remaining -= entry.size_bytes;
            victims.push(self.mark(&entry.id));
        }
        victims
    }

    /// Select every entry idle for longer than `max_idle_ms` at `now`.
    pub fn select_expired(&mut self, now: Timestamp, max_idle_ms: u64) -> Vec<Victim> {
        let expired: Vec<ContentId> = self
            .slots
            .values()
            .filter(|s| !s.evicting && now.saturating_sub(s.entry.last_accessed_at) > max_idle_ms)
            .map(|s| s.entry.id)
            .collect();
        expired.iter().map(|id| self.mark(id)).collect()
    }

    fn mark(&mut self, id: &ContentId) -> Victim {
        let slot = self.slots.get_mut(id).expect("marked entry must exist");
        slot.evicting = true;
        self.pending_bytes += slot.entry.size_bytes;
        Victim { id: *id, seq: slot.seq }
    }

    /// Settle an eviction once the store call returned.
    ///
    /// `removed` is true when the bytes are gone from the store.
    pub fn finish_eviction(&mut self, victim: Victim, removed: bool) -> EvictionOutcome {
        let Some(slot) = self.slots.get(&victim.id).copied() else {
            return EvictionOutcome::Gone;
        };
        if slot.seq != victim.seq {
            return EvictionOutcome::Superseded;
        }
        if removed {
            self.slots.remove(&victim.id);
            self.release(&slot);
            EvictionOutcome::Removed(slot.entry)
        } else {
            if let Some(s) = self.slots.get_mut(&victim.id) {
                s.evicting = false;
            }
            self.pending_bytes -= slot.entry.size_bytes;
            EvictionOutcome::Retained
        }
    }

    /// Bring a superseded entry in line with what the store actually holds.
    ///
    /// Returns `true` if the entry was dropped.
    pub fn settle_superseded(&mut self, id: &ContentId, stored: Option<ObjectMeta>) -> bool {
        match stored {
            Some(meta) => {
                self.set_size(id, meta.size_bytes);
                false
            }
            None => self.forget(id).is_some(),
        }
    }

    fn set_size(&mut self, id: &ContentId, size_bytes: u64) -> bool {
        let Some(slot) = self.slots.get_mut(id) else {
            return false;
        };
        let old = slot.entry.size_bytes;
        if old == size_bytes {
            return false;
        }
        slot.entry.size_bytes = size_bytes;
        let evicting = slot.evicting;
        self.total_bytes = self.total_bytes - old + size_bytes;
        if evicting {
            self.pending_bytes = self.pending_bytes - old + size_bytes;
        }
        true
    }

    /// Compare the index with a store listing taken after sequence
    /// `listed_at_seq` was handed out.
    ///
    /// Entries inserted after the listing started, or with a removal in
    /// flight, are left alone: the listing may not reflect them yet.
    pub fn reconcile(&mut self, listing: &[ObjectMeta], listed_at_seq: u64) -> Reconciliation {
        let stored: HashMap<ContentId, &ObjectMeta> = listing.iter().map(|m| (m.id, m)).collect();
        let mut result = Reconciliation::default();

        let stale: Vec<ContentId> = self
            .slots
            .values()
            .filter(|s| !s.evicting && s.seq < listed_at_seq)
            .map(|s| s.entry.id)
            .collect();
        for id in stale {
            match stored.get(&id) {
                Some(meta) => {
                    if self.set_size(&id, meta.size_bytes) {
                        result.resized += 1;
                    }
                }
                None => {
                    if self.forget(&id).is_some() {
                        result.dropped += 1;
                    }
                }
            }
        }

        result.unindexed = listing
            .iter()
            .filter(|m| !self.slots.contains_key(&m.id))
            .copied()
            .collect();
        result
    }

    /// Recompute `total_bytes` from the entries and return the previous
    /// value if it had drifted.
    pub fn recount(&mut self) -> Option<u64> {
        let actual: u64 = self.slots.values().map(|s| s.entry.size_bytes).sum();
        let pending: u64 = self
            .slots
            .values()
            .filter(|s| s.evicting)
            .map(|s| s.entry.size_bytes)
            .sum();
        self.pending_bytes = pending;
        if actual == self.total_bytes {
            return None;
        }
        let previous = self.total_bytes;
        self.total_bytes = actual;
        Some(previous)
    }
}
