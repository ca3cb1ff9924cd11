//! Bounded, self-evicting object cache.
//!
//! [`CacheEngine`] keeps object bytes in an [`ObjectStore`] under a size
//! ceiling that can change at runtime, expires entries that have not been
//! accessed for longer than the refresh age, and periodically reconciles its
//! in-memory [`CacheIndex`] with what is actually stored.
//!
//! [`ObjectStore`]: pier_store::ObjectStore

pub mod engine;
pub mod error;
pub mod index;
pub mod scanner;

pub use engine::{CacheEngine, CachedObject, ScanReport};
pub use error::CacheError;
pub use index::CacheIndex;
