//! Object storage trait and backend implementations.
//!
//! This crate defines the [`ObjectStore`] trait for persisting cached object
//! bytes keyed by [`ContentId`](pier_types::ContentId), along with:
//!
//! - [`FileStore`]: one file per object with a 2-level fan-out directory layout.
//! - [`MemoryStore`]: in-memory storage backed by a `RwLock<HashMap>`.
//! - [`FlakyStore`]: wrapper injecting latency and failures, for tests.

mod error;
mod file_store;
mod flaky_store;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use file_store::FileStore;
pub use flaky_store::FlakyStore;
pub use memory_store::MemoryStore;
pub use traits::{CompactReport, ObjectStore};
