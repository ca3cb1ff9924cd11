//! File-based object storage backend.
//!
//! Stores one file per object with a 2-level fan-out directory structure:
//! `{base_dir}/{hex[0..2]}/{hex[2..4]}/{hex}`. The file's mtime is the write
//! time and its atime is the last recorded access.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use filetime::FileTime;
use pier_types::{ContentId, ObjectMeta, Timestamp, to_millis};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::traits::{CompactReport, ObjectStore};

/// Suffix shared by all in-progress writes.
const TMP_SUFFIX: &str = ".tmp";

/// File-based object store with 2-level fan-out directory layout.
///
/// Each object is stored as a file at:
/// `{base_dir}/{hex(id)[0..2]}/{hex(id)[2..4]}/{hex(id)}`.
///
/// Writes are atomic: data is written and synced to a uniquely named
/// temporary file first, then renamed into place. Readers therefore see the
/// old bytes or the new bytes, never a torn file.
pub struct FileStore {
    base_dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileStore {
    /// Create a new file store rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Root directory of the store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Compute the full file path for an object ID.
    fn object_path(&self, id: &ContentId) -> PathBuf {
        let hex = id.to_string();
        self.base_dir.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    fn tmp_path(&self, path: &Path) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.{n}{TMP_SUFFIX}", std::process::id()));
        path.with_file_name(name)
    }

    async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }

    /// Walk the fan-out tree, calling `visit` for every regular file.
    async fn walk<F>(&self, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(&Path, &str, std::fs::Metadata),
    {
        let mut level0 = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(d0) = level0.next_entry().await? {
            if !d0.file_type().await?.is_dir() {
                continue;
            }
            let mut level1 = tokio::fs::read_dir(d0.path()).await?;
            while let Some(d1) = level1.next_entry().await? {
                if !d1.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = tokio::fs::read_dir(d1.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    let meta = match entry.metadata().await {
                        Ok(meta) => meta,
                        // Removed between read_dir and stat.
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(StoreError::Io(e)),
                    };
                    if !meta.is_file() {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str() {
                        visit(&entry.path(), name, meta);
                    }
                }
            }
        }
        Ok(())
    }
}

fn object_meta(id: ContentId, meta: &std::fs::Metadata) -> ObjectMeta {
    let stored_at = meta.modified().map(to_millis).unwrap_or_default();
    ObjectMeta {
        id,
        size_bytes: meta.len(),
        stored_at,
        accessed_at: meta.accessed().map(to_millis).unwrap_or(stored_at),
    }
}

#[async_trait::async_trait]
impl ObjectStore for FileStore {
    async fn put(&self, id: ContentId, data: Bytes) -> Result<u64, StoreError> {
        let path = self.object_path(&id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.tmp_path(&path);
        let written = match Self::write_synced(&tmp_path, &data).await {
            Ok(()) => tokio::fs::rename(&tmp_path, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %tmp_path.display(), error = %cleanup, "failed to remove temp file");
            }
            return Err(StoreError::Io(e));
        }

        debug!(%id, path = %path.display(), size = data.len(), "stored object to file");
        Ok(data.len() as u64)
    }

    async fn get(&self, id: ContentId) -> Result<Option<Bytes>, StoreError> {
        let path = self.object_path(&id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn remove(&self, id: ContentId) -> Result<(), StoreError> {
        let path = self.object_path(&id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%id, "removed object file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn touch(&self, id: ContentId, at: Timestamp) -> Result<(), StoreError> {
        let path = self.object_path(&id);
        let atime = FileTime::from_unix_time((at / 1_000) as i64, (at % 1_000) as u32 * 1_000_000);
        let result = tokio::task::spawn_blocking(move || filetime::set_file_atime(&path, atime))
            .await
            .map_err(std::io::Error::other)?;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn stat(&self, id: ContentId) -> Result<Option<ObjectMeta>, StoreError> {
        let path = self.object_path(&id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(object_meta(id, &meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn list_all(&self) -> Result<Vec<ObjectMeta>, StoreError> {
        let mut objects = Vec::new();
        self.walk(|_, name, meta| {
            if let Ok(id) = name.parse::<ContentId>() {
                objects.push(object_meta(id, &meta));
            }
        })
        .await?;
        Ok(objects)
    }

    async fn compact(&self) -> Result<CompactReport, StoreError> {
        let mut leftovers = Vec::new();
        self.walk(|path, name, _| {
            if name.ends_with(TMP_SUFFIX) {
                leftovers.push(path.to_path_buf());
            }
        })
        .await?;

        let mut report = CompactReport::default();
        for path in leftovers {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.temp_files_removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp file"),
            }
        }

        // Prune empty fan-out directories, innermost first. `remove_dir`
        // refuses non-empty directories, which is exactly the filter we want.
        let mut level0 = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(d0) = level0.next_entry().await? {
            if !d0.file_type().await?.is_dir() {
                continue;
            }
            let mut level1 = tokio::fs::read_dir(d0.path()).await?;
            while let Some(d1) = level1.next_entry().await? {
                if d1.file_type().await?.is_dir() && tokio::fs::remove_dir(d1.path()).await.is_ok()
                {
                    report.dirs_removed += 1;
                }
            }
            if tokio::fs::remove_dir(d0.path()).await.is_ok() {
                report.dirs_removed += 1;
            }
        }

        debug!(
            temp_files = report.temp_files_removed,
            dirs = report.dirs_removed,
            "compacted file store"
        );
        Ok(report)
    }
}
