//! In-memory object storage backend.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use pier_types::{ContentId, ObjectMeta, Timestamp, now_millis};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::ObjectStore;

struct StoredObject {
    data: Bytes,
    stored_at: Timestamp,
    accessed_at: Timestamp,
}

/// In-memory object store backed by a `RwLock<HashMap>`.
///
/// Useful for testing and for nodes configured to run without a disk cache.
/// Capacity is not enforced here; the cache engine owns the size ceiling.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ContentId, StoredObject>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held, computed from the stored objects.
    pub fn used_bytes(&self) -> u64 {
        let map = self.objects.read().expect("lock poisoned");
        map.values().map(|o| o.data.len() as u64).sum()
    }

    /// Insert an object behind the cache's back (for drift tests).
    #[doc(hidden)]
    pub fn insert_raw(&self, id: ContentId, data: Bytes, stored_at: Timestamp) {
        let mut map = self.objects.write().expect("lock poisoned");
        map.insert(
            id,
            StoredObject {
                data,
                stored_at,
                accessed_at: stored_at,
            },
        );
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, id: ContentId, data: Bytes) -> Result<u64, StoreError> {
        let size = data.len() as u64;
        let mut map = self.objects.write().expect("lock poisoned");
        debug!(%id, size, "storing object in memory");
        let now = now_millis();
        map.insert(
            id,
            StoredObject {
                data,
                stored_at: now,
                accessed_at: now,
            },
        );
        Ok(size)
    }

    async fn get(&self, id: ContentId) -> Result<Option<Bytes>, StoreError> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(&id).map(|o| o.data.clone()))
    }

    async fn remove(&self, id: ContentId) -> Result<(), StoreError> {
        let mut map = self.objects.write().expect("lock poisoned");
        match map.remove(&id) {
            Some(_) => {
                debug!(%id, "removed object from memory");
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn touch(&self, id: ContentId, at: Timestamp) -> Result<(), StoreError> {
        let mut map = self.objects.write().expect("lock poisoned");
        let object = map.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        object.accessed_at = at;
        Ok(())
    }

    async fn stat(&self, id: ContentId) -> Result<Option<ObjectMeta>, StoreError> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(&id).map(|o| ObjectMeta {
            id,
            size_bytes: o.data.len() as u64,
            stored_at: o.stored_at,
            accessed_at: o.accessed_at,
        }))
    }

    async fn list_all(&self) -> Result<Vec<ObjectMeta>, StoreError> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map
            .iter()
            .map(|(id, o)| ObjectMeta {
                id: *id,
                size_bytes: o.data.len() as u64,
                stored_at: o.stored_at,
                accessed_at: o.accessed_at,
            })
            .collect())
    }
}
