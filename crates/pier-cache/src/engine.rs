//! The cache engine: size ceiling, freshness expiry and reconciliation on
//! top of an [`ObjectStore`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use pier_store::{ObjectStore, StoreError};
use pier_types::{CacheEntry, CacheInfo, CacheLimits, ContentId, Timestamp, now_millis};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::CacheError;
use crate::index::{CacheIndex, EvictionOutcome, Victim};

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedObject {
    /// Index entry after the access was recorded.
    pub entry: CacheEntry,
    /// Object bytes.
    pub data: Bytes,
}

/// Summary of one [`CacheEngine::scan_and_evict`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// The store could not be listed, so reconciliation was skipped.
    pub listing_failed: bool,
    /// Index entries dropped because their bytes were gone.
    pub dropped: usize,
    /// Index entries whose size was corrected.
    pub resized: usize,
    /// Stored objects added to the index.
    pub adopted: usize,
    /// Entries removed for exceeding the refresh age.
    pub expired: usize,
    /// Entries removed to get under the size ceiling.
    pub evicted: usize,
    /// Removals that failed and will be retried.
    pub failed: usize,
    /// Accounted bytes after the scan.
    pub total_bytes: u64,
    /// Indexed entries after the scan.
    pub entry_count: usize,
}

impl ScanReport {
    /// Number of index/storage mismatches corrected by this scan.
    pub fn anomalies(&self) -> usize {
        self.dropped + self.resized + self.adopted
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RemovalStats {
    removed: usize,
    failed: usize,
}

/// Bounded, self-evicting object cache.
///
/// Object bytes live in the [`ObjectStore`]; the engine keeps a
/// [`CacheIndex`] of sizes and access times behind one mutex. The lock only
/// guards in-memory bookkeeping and is never held across a store call, so
/// lookups of unrelated objects only contend for the few instructions that
/// update the index.
///
/// Limits are published through a `watch` channel: an update replaces the
/// whole [`CacheLimits`] value at once, and the background scanner is woken
/// to re-arm its timer.
pub struct CacheEngine {
    store: Arc<dyn ObjectStore>,
    index: Mutex<CacheIndex>,
    limits: watch::Sender<CacheLimits>,
}

impl CacheEngine {
    /// Create an engine with an empty index over `store`.
    ///
    /// Objects already in the store are picked up by the first scan; use
    /// [`CacheEngine::open`] to index them immediately.
    pub fn new(store: Arc<dyn ObjectStore>, limits: CacheLimits) -> Self {
        let (limits, _) = watch::channel(limits);
        Self {
            store,
            index: Mutex::new(CacheIndex::new()),
            limits,
        }
    }

    /// Create an engine and index everything already in `store`.
    pub async fn open(store: Arc<dyn ObjectStore>, limits: CacheLimits) -> Result<Self, CacheError> {
        let engine = Self::new(store, limits);
        let listing = engine.store.list_all().await?;
        {
            let mut index = engine.index();
            for meta in listing {
                index.adopt(meta);
            }
        }
        let info = engine.load_cache_info();
        info!(
            entries = info.entry_count,
            total_bytes = info.total_bytes,
            max_bytes = info.max_bytes,
            "cache index loaded"
        );
        Ok(engine)
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().expect("cache index lock poisoned")
    }

    /// The underlying object store.
    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Current limits.
    pub fn limits(&self) -> CacheLimits {
        *self.limits.borrow()
    }

    /// Subscribe to limit changes.
    pub fn subscribe_limits(&self) -> watch::Receiver<CacheLimits> {
        self.limits.subscribe()
    }

    /// Bytes currently accounted for.
    pub fn total_bytes(&self) -> u64 {
        self.index().total_bytes()
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.index().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.index().is_empty()
    }

    /// Index entry for `id`, without recording an access.
    pub fn entry(&self, id: &ContentId) -> Option<CacheEntry> {
        self.index().get(id)
    }

    // ------------------------------------------------------------------
    // Lookup / store
    // ------------------------------------------------------------------

    /// Look up an object and record the access, in the index and in the
    /// store.
    pub async fn lookup(&self, id: ContentId) -> Result<Option<CachedObject>, CacheError> {
        self.lookup_at(id, now_millis()).await
    }

    /// [`lookup`](Self::lookup) with an explicit clock.
    pub async fn lookup_at(
        &self,
        id: ContentId,
        now: Timestamp,
    ) -> Result<Option<CachedObject>, CacheError> {
        if !self.index().contains(&id) {
            return Ok(None);
        }

        match self.store.get(id).await? {
            Some(data) => {
                let Some(entry) = self.index().touch(&id, now) else {
                    return Ok(None);
                };
                // Persist the access so a restart does not age the object.
                if let Err(e) = self.store.touch(id, entry.last_accessed_at).await {
                    debug!(%id, error = %e, "failed to record access time");
                }
                Ok(Some(CachedObject { entry, data }))
            }
            None => {
                if let Some(entry) = self.index().forget(&id) {
                    warn!(%id, size = entry.size_bytes, "indexed object missing from store, dropped");
                }
                Ok(None)
            }
        }
    }

    /// Store an object, replacing any previous bytes for `id`.
    ///
    /// The index is only updated once the store accepted the bytes. If the
    /// new total exceeds the ceiling, least-recently-accessed entries are
    /// evicted before this returns.
    pub async fn store(&self, id: ContentId, data: Bytes) -> Result<CacheEntry, CacheError> {
        self.store_at(id, data, now_millis()).await
    }

    /// [`store`](Self::store) with an explicit clock.
    pub async fn store_at(
        &self,
        id: ContentId,
        data: Bytes,
        now: Timestamp,
    ) -> Result<CacheEntry, CacheError> {
        let size = self.store.put(id, data).await?;
        let (entry, over_budget) = {
            let mut index = self.index();
            let entry = index.insert(id, size, now);
            (entry, index.total_bytes() > self.limits().max_bytes)
        };
        debug!(%id, size, "cached object");

        if over_budget {
            self.evict_over_budget().await;
        }
        Ok(entry)
    }

    // ------------------------------------------------------------------
    // Limits
    // ------------------------------------------------------------------

    /// Replace the live limits.
    ///
    /// A lower ceiling evicts down to it right away; a new scan interval
    /// re-arms the scanner's timer.
    pub async fn update_limits(&self, limits: CacheLimits) {
        let previous = self.limits.send_replace(limits);
        if previous != limits {
            info!(
                max_bytes = limits.max_bytes,
                scan_interval_secs = limits.scan_interval_secs,
                refresh_age_secs = limits.refresh_age_secs,
                "cache limits updated"
            );
        }
        if self.total_bytes() > limits.max_bytes {
            self.evict_over_budget().await;
        }
    }

    // ------------------------------------------------------------------
    // Scan
    // ------------------------------------------------------------------

    /// Reconcile the index with the store, expire idle entries and evict
    /// down to the ceiling.
    pub async fn scan_and_evict(&self) -> ScanReport {
        self.scan_and_evict_at(now_millis()).await
    }

    /// [`scan_and_evict`](Self::scan_and_evict) with an explicit clock.
    pub async fn scan_and_evict_at(&self, now: Timestamp) -> ScanReport {
        let mut report = ScanReport::default();

        // 1. Reconcile accounting with what is actually stored.
        self.reconcile(&mut report).await;

        // 2. Freshness: expire idle entries regardless of size pressure.
        let max_idle_ms = self.limits().refresh_age_millis();
        let expired = self.index().select_expired(now, max_idle_ms);
        if !expired.is_empty() {
            debug!(count = expired.len(), max_idle_ms, "expiring idle entries");
        }
        let stats = self.remove_victims(expired).await;
        report.expired = stats.removed;
        report.failed += stats.failed;

        // 3. Size pressure: evict oldest-accessed first.
        let stats = self.evict_over_budget().await;
        report.evicted = stats.removed;
        report.failed += stats.failed;

        {
            let index = self.index();
            report.total_bytes = index.total_bytes();
            report.entry_count = index.len();
        }
        report
    }

    async fn reconcile(&self, report: &mut ScanReport) {
        let listed_at = self.index().current_seq();
        let listing = match self.store.list_all().await {
            Ok(listing) => listing,
            Err(e) => {
                error!(error = %e, "failed to list object store, skipping reconciliation");
                report.listing_failed = true;
                return;
            }
        };

        let outcome = self.index().reconcile(&listing, listed_at);
        report.dropped = outcome.dropped;
        report.resized = outcome.resized;

        // Re-check each unindexed object: it may have been evicted since the
        // listing was taken.
        for candidate in outcome.unindexed {
            match self.store.stat(candidate.id).await {
                Ok(Some(meta)) => {
                    if self.index().adopt(meta) {
                        report.adopted += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(id = %candidate.id, error = %e, "failed to stat unindexed object"),
            }
        }

        if let Some(previous) = self.index().recount() {
            warn!(previous, "cache byte total drifted, recounted");
        }
        if report.anomalies() > 0 {
            warn!(
                dropped = report.dropped,
                resized = report.resized,
                adopted = report.adopted,
                "cache index reconciled with store"
            );
        }
    }

    /// Evict least-recently-accessed entries until the total fits.
    ///
    /// Entries whose removal fails are skipped for the rest of this pass and
    /// stay indexed, so they are retried by the next scan.
    async fn evict_over_budget(&self) -> RemovalStats {
        let mut stats = RemovalStats::default();
        let mut skip = HashSet::new();

        loop {
            let max_bytes = self.limits().max_bytes;
            let victims = self.index().select_over_budget(max_bytes, &skip);
            if victims.is_empty() {
                break;
            }
            for victim in victims {
                if self.remove_victim(victim).await {
                    stats.removed += 1;
                } else {
                    stats.failed += 1;
                    skip.insert(victim.id);
                }
            }
        }

        if stats.removed > 0 || stats.failed > 0 {
            let total_bytes = self.total_bytes();
            debug!(
                evicted = stats.removed,
                failed = stats.failed,
                total_bytes,
                "evicted over-budget entries"
            );
            if total_bytes > self.limits().max_bytes {
                warn!(total_bytes, "cache still over budget, retrying on next scan");
            }
        }
        stats
    }

    async fn remove_victims(&self, victims: Vec<Victim>) -> RemovalStats {
        let mut stats = RemovalStats::default();
        for victim in victims {
            if self.remove_victim(victim).await {
                stats.removed += 1;
            } else {
                stats.failed += 1;
            }
        }
        stats
    }

    /// Remove one selected entry from the store and then from the index.
    ///
    /// Returns `false` if the bytes could not be removed.
    async fn remove_victim(&self, victim: Victim) -> bool {
        let removed = match self.store.remove(victim.id).await {
            Ok(()) => true,
            Err(StoreError::NotFound(_)) => true,
            Err(e) => {
                warn!(id = %victim.id, error = %e, "failed to remove cached object, keeping it indexed");
                false
            }
        };

        let outcome = self.index().finish_eviction(victim, removed);
        match outcome {
            EvictionOutcome::Removed(entry) => {
                debug!(id = %entry.id, size = entry.size_bytes, "evicted cached object");
                true
            }
            EvictionOutcome::Retained => false,
            EvictionOutcome::Gone => removed,
            EvictionOutcome::Superseded => {
                // New bytes were stored while the removal was in flight; ask
                // the store which write won.
                match self.store.stat(victim.id).await {
                    Ok(stored) => {
                        self.index().settle_superseded(&victim.id, stored);
                    }
                    Err(e) => {
                        warn!(id = %victim.id, error = %e, "failed to stat re-stored object");
                    }
                }
                removed
            }
        }
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Read-only snapshot for status output and reporting.
    pub fn load_cache_info(&self) -> CacheInfo {
        self.load_cache_info_at(now_millis())
    }

    /// [`load_cache_info`](Self::load_cache_info) with an explicit clock.
    pub fn load_cache_info_at(&self, now: Timestamp) -> CacheInfo {
        let index = self.index();
        CacheInfo {
            total_bytes: index.total_bytes(),
            entry_count: index.len(),
            max_bytes: self.limits().max_bytes,
            oldest_entry_age: index
                .oldest_stored_at()
                .map(|at| Duration::from_millis(now.saturating_sub(at))),
        }
    }
}
