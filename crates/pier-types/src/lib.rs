//! Shared types and identifiers for Pier.
//!
//! This crate defines the value types passed between the Pier crates:
//! the content identifier ([`ContentId`]), cache bookkeeping records
//! ([`ObjectMeta`], [`CacheEntry`], [`CacheInfo`]) and the live-adjustable
//! cache limits ([`CacheLimits`]).

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// Convert a [`SystemTime`] into a [`Timestamp`], clamping pre-epoch values to 0.
pub fn to_millis(time: SystemTime) -> Timestamp {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

// ---------------------------------------------------------------------------
// ContentId
// ---------------------------------------------------------------------------

/// Stable identifier for a cached object.
///
/// Derived from the object's logical request identity (`mode/chapter/image`)
/// with BLAKE3, and used verbatim as the storage key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ContentId([u8; 32]);

impl ContentId {
    /// Create an ID by hashing arbitrary data with BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Create the ID of an image request.
    ///
    /// `mode` is the image quality (`data` or `data-saver`); the same image in
    /// two qualities gets two distinct IDs.
    pub fn for_image(mode: &str, chapter_hash: &str, image: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(mode.as_bytes());
        hasher.update(b"/");
        hasher.update(chapter_hash.as_bytes());
        hasher.update(b"/");
        hasher.update(image.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for ContentId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ContentId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({self})")
    }
}

/// Error returned when parsing a [`ContentId`] from hex.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid content id: {0}")]
pub struct ParseContentIdError(#[from] hex::FromHexError);

impl FromStr for ContentId {
    type Err = ParseContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

// ---------------------------------------------------------------------------
// Cache records
// ---------------------------------------------------------------------------

/// Size and age of an object as reported by the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object identifier.
    pub id: ContentId,
    /// Size of the stored bytes.
    pub size_bytes: u64,
    /// When the current bytes were written.
    pub stored_at: Timestamp,
    /// Last access the store recorded; `stored_at` if none was.
    pub accessed_at: Timestamp,
}

/// A single entry of the cache index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    /// Object identifier (also the storage key).
    pub id: ContentId,
    /// Size of the stored bytes; authoritative for aggregate accounting.
    pub size_bytes: u64,
    /// When the current bytes were written.
    pub stored_at: Timestamp,
    /// Last time the entry was stored or served.
    pub last_accessed_at: Timestamp,
}

/// Live-adjustable cache limits.
///
/// Always replaced as a whole so readers never observe a half-updated triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLimits {
    /// Size ceiling for the cache, in bytes.
    pub max_bytes: u64,
    /// Seconds between two background scans.
    pub scan_interval_secs: u32,
    /// Maximum idle time of an entry before it is expired.
    pub refresh_age_secs: u32,
}

impl CacheLimits {
    /// Interval between two background scans.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.scan_interval_secs.max(1)))
    }

    /// Maximum idle time in milliseconds.
    pub fn refresh_age_millis(&self) -> u64 {
        u64::from(self.refresh_age_secs) * 1000
    }
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024 * 1024,
            scan_interval_secs: 300,
            refresh_age_secs: 86_400,
        }
    }
}

/// Read-only snapshot of the cache, for status output and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    /// Bytes currently accounted for.
    pub total_bytes: u64,
    /// Number of indexed entries.
    pub entry_count: usize,
    /// Current size ceiling.
    pub max_bytes: u64,
    /// Age of the oldest stored entry, if any.
    pub oldest_entry_age: Option<Duration>,
}
