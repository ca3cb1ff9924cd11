//! An [`ObjectStore`] wrapper that injects latency and failures.
//!
//! `FlakyStore` wraps any `Arc<dyn ObjectStore>`, sleeps for a random
//! duration before each operation and can be switched into failing
//! `put` or `remove` calls. The RNG is seeded for reproducible runs.
//!
//! # Example
//!
//! ```ignore
//! let flaky = FlakyStore::new(inner)
//!     .read_latency(5, 20)    // 5–20 ms per read
//!     .write_latency(10, 30)  // 10–30 ms per write
//!     .seed(42);
//! flaky.fail_removes(true);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use pier_types::{ContentId, ObjectMeta, Timestamp};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::error::StoreError;
use crate::traits::{CompactReport, ObjectStore};

/// An [`ObjectStore`] wrapper for fault-injection tests.
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    read_latency_ms: (u64, u64),
    write_latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
    fail_puts: AtomicBool,
    fail_removes: AtomicBool,
}

impl FlakyStore {
    /// Wrap an existing store with no latency and no failures.
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            read_latency_ms: (0, 0),
            write_latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            fail_puts: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
        }
    }

    /// Set the read latency range in milliseconds (uniform random).
    pub fn read_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.read_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the write latency range in milliseconds (uniform random).
    pub fn write_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.write_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the RNG seed for deterministic behaviour.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Make every subsequent `put` fail with an I/O error (simulated disk full).
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `remove` fail with an I/O error.
    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Sleep for a random duration in `[min, max]` milliseconds.
    async fn delay(&self, range: (u64, u64)) {
        let (min, max) = range;

        if max == 0 {
            return;
        }

        let ms = if min == max {
            min
        } else {
            self.rng
                .lock()
                .expect("rng lock poisoned")
                .random_range(min..=max)
        };

        if ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
        }
    }

    fn injected(op: &str) -> StoreError {
        StoreError::Io(std::io::Error::other(format!("injected {op} failure")))
    }
}

#[async_trait::async_trait]
impl ObjectStore for FlakyStore {
    async fn put(&self, id: ContentId, data: Bytes) -> Result<u64, StoreError> {
        self.delay(self.write_latency_ms).await;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Self::injected("put"));
        }
        self.inner.put(id, data).await
    }

    async fn get(&self, id: ContentId) -> Result<Option<Bytes>, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.get(id).await
    }

    async fn remove(&self, id: ContentId) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(Self::injected("remove"));
        }
        self.inner.remove(id).await
    }

    async fn touch(&self, id: ContentId, at: Timestamp) -> Result<(), StoreError> {
        self.inner.touch(id, at).await
    }

    async fn stat(&self, id: ContentId) -> Result<Option<ObjectMeta>, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.stat(id).await
    }

    async fn list_all(&self) -> Result<Vec<ObjectMeta>, StoreError> {
        self.inner.list_all().await
    }

    async fn compact(&self) -> Result<CompactReport, StoreError> {
        self.inner.compact().await
    }
}
