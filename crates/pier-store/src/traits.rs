//! Core trait for object storage.

use bytes::Bytes;
use pier_types::{ContentId, ObjectMeta, Timestamp};

use crate::error::StoreError;

/// Outcome of [`ObjectStore::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactReport {
    /// Leftover temporary files removed.
    pub temp_files_removed: usize,
    /// Empty fan-out directories removed.
    pub dirs_removed: usize,
}

/// Trait for storing and retrieving cached objects.
///
/// All implementations must be `Send + Sync` for use across async tasks.
/// Writes are all-or-nothing: a reader sees either the previous bytes of an
/// object or the new ones, never a partial write, and a failed `put` leaves
/// nothing behind.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store (or atomically overwrite) an object. Returns the stored size.
    async fn put(&self, id: ContentId, data: Bytes) -> Result<u64, StoreError>;

    /// Retrieve an object. Returns `None` if not found.
    async fn get(&self, id: ContentId) -> Result<Option<Bytes>, StoreError>;

    /// Remove an object. Returns [`StoreError::NotFound`] if it does not exist.
    async fn remove(&self, id: ContentId) -> Result<(), StoreError>;

    /// Record that an object was served at `at`, so the access survives a
    /// restart. Returns [`StoreError::NotFound`] if it does not exist.
    async fn touch(&self, id: ContentId, at: Timestamp) -> Result<(), StoreError>;

    /// Size, write time and last recorded access of an object. Returns
    /// `None` if not found.
    async fn stat(&self, id: ContentId) -> Result<Option<ObjectMeta>, StoreError>;

    /// Snapshot of every stored object.
    ///
    /// Each call walks the store again, so the listing can be restarted at
    /// any time.
    async fn list_all(&self) -> Result<Vec<ObjectMeta>, StoreError>;

    /// Reclaim space held by interrupted writes.
    async fn compact(&self) -> Result<CompactReport, StoreError> {
        Ok(CompactReport::default())
    }
}
