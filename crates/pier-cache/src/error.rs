//! Error types for the cache engine.

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to access the object store.
    #[error("store error: {0}")]
    Store(#[from] pier_store::StoreError),
}
