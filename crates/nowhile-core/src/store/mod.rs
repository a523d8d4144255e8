//! Persistent storage for received files.
//!
//! Completed inbound artifacts are handed to a [`BlobStore`]. Entries carry
//! an expiry time and are removed by [`BlobStore::prune_expired`], which the
//! session calls periodically.
//!
//! [`FileBlobStore`] keeps each artifact as `<transfer id>.bin` next to a
//! JSON index:
//!
//! ```text
//! <dir>/
//! ├── index.json
//! ├── 6f1c...e2.bin
//! └── 93ab...0d.bin
//! ```

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::PeerId;

const INDEX_FILE: &str = "index.json";

/// Descriptive data saved alongside an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMeta {
    /// Original file name
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// Sending peer
    pub sender_id: PeerId,
    /// Sender display name
    pub sender_name: String,
}

/// A stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    /// Transfer that produced the artifact
    pub transfer_id: Uuid,
    /// Original file name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    pub mime_type: String,
    /// Sending peer
    pub sender_id: PeerId,
    /// Sender display name
    pub sender_name: String,
    /// When it was stored
    pub stored_at: DateTime<Utc>,
    /// When it will be pruned
    pub expires_at: DateTime<Utc>,
}

impl StoredFile {
    fn new(transfer_id: Uuid, size: u64, meta: &ArtifactMeta, retention: Duration) -> Self {
        let stored_at = Utc::now();
        let expires_at = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| stored_at.checked_add_signed(retention))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            transfer_id,
            name: meta.name.clone(),
            size,
            mime_type: meta.mime_type.clone(),
            sender_id: meta.sender_id.clone(),
            sender_name: meta.sender_name.clone(),
            stored_at,
            expires_at,
        }
    }

    /// Whether the entry has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage for received artifacts.
///
/// Methods are blocking; async callers should run them on
/// `tokio::task::spawn_blocking`.
pub trait BlobStore: Send + Sync {
    /// Store an artifact.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreError` if it cannot be written.
    fn save(&self, transfer_id: Uuid, bytes: &[u8], meta: &ArtifactMeta) -> Result<StoredFile>;

    /// Stored artifacts, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreError` if the index cannot be read.
    fn list(&self) -> Result<Vec<StoredFile>>;

    /// Read one artifact.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreError` if the contents cannot be read.
    fn load(&self, transfer_id: &Uuid) -> Result<Option<(StoredFile, Vec<u8>)>>;

    /// Remove one artifact. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreError` if the removal fails.
    fn delete(&self, transfer_id: &Uuid) -> Result<bool>;

    /// Remove every expired artifact and return what was removed.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreError` if the removal fails.
    fn prune_expired(&self) -> Result<Vec<StoredFile>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    version: u32,
    files: Vec<StoredFile>,
}

/// Directory-backed [`BlobStore`].
#[derive(Debug)]
pub struct FileBlobStore {
    dir: PathBuf,
    retention: Duration,
    index: Mutex<Vec<StoredFile>>,
}

impl FileBlobStore {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the index is
    /// unreadable.
    pub fn open(dir: impl Into<PathBuf>, retention: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::StoreError(format!(
                "Failed to create store directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let index_path = dir.join(INDEX_FILE);
        let files = if index_path.exists() {
            let file = fs::File::open(&index_path).map_err(|e| {
                Error::StoreError(format!(
                    "Failed to open store index at {}: {}",
                    index_path.display(),
                    e
                ))
            })?;
            let index: StoreIndex =
                serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                    Error::StoreError(format!(
                        "Failed to parse store index at {}: {}",
                        index_path.display(),
                        e
                    ))
                })?;
            index.files
        } else {
            Vec::new()
        };

        tracing::debug!(dir = %dir.display(), files = files.len(), "Opened blob store");
        Ok(Self {
            dir,
            retention,
            index: Mutex::new(files),
        })
    }

    /// Get the default store directory.
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "nowhile", "Nowhile")
            .map(|dirs| dirs.data_dir().join("received"))
    }

    /// Root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy an artifact out of the store into `dest_dir` under its original
    /// name. An existing file with that name gets a numeric suffix instead
    /// of being overwritten.
    ///
    /// # Errors
    ///
    /// Returns `Error::FileNotFound` for an unknown id, or an I/O error if
    /// the copy fails.
    pub fn export(&self, transfer_id: &Uuid, dest_dir: &Path) -> Result<PathBuf> {
        let (entry, bytes) = self
            .load(transfer_id)?
            .ok_or_else(|| Error::FileNotFound(transfer_id.to_string()))?;

        // Names come from remote peers: keep only the final component.
        let name = Path::new(&entry.name)
            .file_name()
            .map_or_else(|| transfer_id.to_string(), |n| n.to_string_lossy().to_string());

        fs::create_dir_all(dest_dir)?;
        let target = available_path(dest_dir, &name);
        fs::write(&target, bytes)?;
        tracing::info!(transfer = %transfer_id, path = %target.display(), "Exported file");
        Ok(target)
    }

    fn blob_path(&self, transfer_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{transfer_id}.bin"))
    }

    fn write_index(&self, files: &[StoredFile]) -> Result<()> {
        let index_path = self.dir.join(INDEX_FILE);
        let file = fs::File::create(&index_path).map_err(|e| {
            Error::StoreError(format!(
                "Failed to create store index at {}: {}",
                index_path.display(),
                e
            ))
        })?;

        let index = StoreIndex {
            version: 1,
            files: files.to_vec(),
        };
        serde_json::to_writer_pretty(BufWriter::new(file), &index).map_err(|e| {
            Error::StoreError(format!(
                "Failed to write store index at {}: {}",
                index_path.display(),
                e
            ))
        })
    }

    fn remove_blob(&self, transfer_id: &Uuid) -> Result<()> {
        let path = self.blob_path(transfer_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StoreError(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

fn available_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map_or_else(|| name.to_string(), |s| s.to_string_lossy().to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());

    (1u32..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

impl BlobStore for FileBlobStore {
    fn save(&self, transfer_id: Uuid, bytes: &[u8], meta: &ArtifactMeta) -> Result<StoredFile> {
        let path = self.blob_path(&transfer_id);
        fs::write(&path, bytes).map_err(|e| {
            Error::StoreError(format!("Failed to write {}: {}", path.display(), e))
        })?;

        let entry = StoredFile::new(transfer_id, bytes.len() as u64, meta, self.retention);
        let mut index = lock(&self.index);
        index.retain(|f| f.transfer_id != transfer_id);
        index.insert(0, entry.clone());
        self.write_index(&index)?;

        tracing::debug!(transfer = %transfer_id, size = entry.size, "Stored file");
        Ok(entry)
    }

    fn list(&self) -> Result<Vec<StoredFile>> {
        let mut files = lock(&self.index).clone();
        files.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));
        Ok(files)
    }

    fn load(&self, transfer_id: &Uuid) -> Result<Option<(StoredFile, Vec<u8>)>> {
        let Some(entry) = lock(&self.index)
            .iter()
            .find(|f| &f.transfer_id == transfer_id)
            .cloned()
        else {
            return Ok(None);
        };

        let path = self.blob_path(transfer_id);
        let bytes = fs::read(&path)
            .map_err(|e| Error::StoreError(format!("Failed to read {}: {}", path.display(), e)))?;
        Ok(Some((entry, bytes)))
    }

    fn delete(&self, transfer_id: &Uuid) -> Result<bool> {
        let mut index = lock(&self.index);
        let before = index.len();
        index.retain(|f| &f.transfer_id != transfer_id);
        if index.len() == before {
            return Ok(false);
        }

        self.remove_blob(transfer_id)?;
        self.write_index(&index)?;
        Ok(true)
    }

    fn prune_expired(&self) -> Result<Vec<StoredFile>> {
        let now = Utc::now();
        let mut index = lock(&self.index);
        let (expired, kept): (Vec<StoredFile>, Vec<StoredFile>) =
            index.drain(..).partition(|f| f.is_expired_at(now));
        *index = kept;

        if expired.is_empty() {
            return Ok(expired);
        }

        for file in &expired {
            self.remove_blob(&file.transfer_id)?;
        }
        self.write_index(&index)?;
        tracing::info!(count = expired.len(), "Pruned expired files");
        Ok(expired)
    }
}

/// In-memory [`BlobStore`] for tests and throwaway sessions.
#[derive(Debug)]
pub struct MemoryBlobStore {
    retention: Duration,
    files: Mutex<HashMap<Uuid, (StoredFile, Vec<u8>)>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            files: Mutex::new(HashMap::new()),
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn save(&self, transfer_id: Uuid, bytes: &[u8], meta: &ArtifactMeta) -> Result<StoredFile> {
        let entry = StoredFile::new(transfer_id, bytes.len() as u64, meta, self.retention);
        lock(&self.files).insert(transfer_id, (entry.clone(), bytes.to_vec()));
        Ok(entry)
    }

    fn list(&self) -> Result<Vec<StoredFile>> {
        let mut files: Vec<StoredFile> = lock(&self.files)
            .values()
            .map(|(entry, _)| entry.clone())
            .collect();
        files.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));
        Ok(files)
    }

    fn load(&self, transfer_id: &Uuid) -> Result<Option<(StoredFile, Vec<u8>)>> {
        Ok(lock(&self.files).get(transfer_id).cloned())
    }

    fn delete(&self, transfer_id: &Uuid) -> Result<bool> {
        Ok(lock(&self.files).remove(transfer_id).is_some())
    }

    fn prune_expired(&self) -> Result<Vec<StoredFile>> {
        let now = Utc::now();
        let mut files = lock(&self.files);
        let expired: Vec<Uuid> = files
            .values()
            .filter(|(entry, _)| entry.is_expired_at(now))
            .map(|(entry, _)| entry.transfer_id)
            .collect();
        Ok(expired
            .iter()
            .filter_map(|id| files.remove(id).map(|(entry, _)| entry))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn meta(name: &str) -> ArtifactMeta {
        ArtifactMeta {
            name: name.to_string(),
            mime_type: "text/plain".to_string(),
            sender_id: PeerId::parse("ABC234").unwrap(),
            sender_name: "Laptop".to_string(),
        }
    }

    #[test]
    fn test_save_load_reopen() {
        let tmp_dir = TempDir::new().unwrap();
        let id = Uuid::new_v4();

        {
            let store = FileBlobStore::open(tmp_dir.path(), DAY).unwrap();
            let entry = store.save(id, b"hello", &meta("hello.txt")).unwrap();
            assert_eq!(entry.size, 5);
            assert!(entry.expires_at > entry.stored_at);
        }

        let store = FileBlobStore::open(tmp_dir.path(), DAY).unwrap();
        let (entry, bytes) = store.load(&id).unwrap().expect("stored");
        assert_eq!(entry.name, "hello.txt");
        assert_eq!(entry.sender_name, "Laptop");
        assert_eq!(bytes, b"hello");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_delete() {
        let tmp_dir = TempDir::new().unwrap();
        let store = FileBlobStore::open(tmp_dir.path(), DAY).unwrap();
        let id = Uuid::new_v4();
        store.save(id, b"x", &meta("x.txt")).unwrap();

        assert!(store.delete(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
        assert!(store.load(&id).unwrap().is_none());
        assert!(!tmp_dir.path().join(format!("{id}.bin")).exists());
    }

    #[test]
    fn test_prune_expired() {
        let tmp_dir = TempDir::new().unwrap();
        let store = FileBlobStore::open(tmp_dir.path(), Duration::ZERO).unwrap();
        let id = Uuid::new_v4();
        store.save(id, b"gone soon", &meta("a.txt")).unwrap();

        let pruned = store.prune_expired().unwrap();
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].transfer_id, id);
        assert!(store.list().unwrap().is_empty());
        assert!(store.prune_expired().unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_fresh_entries() {
        let tmp_dir = TempDir::new().unwrap();
        let store = FileBlobStore::open(tmp_dir.path(), DAY).unwrap();
        store.save(Uuid::new_v4(), b"keep", &meta("a.txt")).unwrap();

        assert!(store.prune_expired().unwrap().is_empty());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_export_avoids_overwrite() {
        let tmp_dir = TempDir::new().unwrap();
        let store = FileBlobStore::open(tmp_dir.path().join("store"), DAY).unwrap();
        let out = tmp_dir.path().join("out");
        let id = Uuid::new_v4();
        store.save(id, b"data", &meta("../../report.txt")).unwrap();

        let first = store.export(&id, &out).unwrap();
        let second = store.export(&id, &out).unwrap();

        assert_eq!(first, out.join("report.txt"));
        assert_eq!(second, out.join("report (1).txt"));
        assert_eq!(std::fs::read(second).unwrap(), b"data");
    }

    #[test]
    fn test_export_unknown_id() {
        let tmp_dir = TempDir::new().unwrap();
        let store = FileBlobStore::open(tmp_dir.path(), DAY).unwrap();
        assert!(matches!(
            store.export(&Uuid::new_v4(), tmp_dir.path()),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryBlobStore::new(DAY);
        let id = Uuid::new_v4();
        store.save(id, b"abc", &meta("m.txt")).unwrap();

        assert_eq!(store.load(&id).unwrap().map(|(_, b)| b), Some(b"abc".to_vec()));
        assert!(store.prune_expired().unwrap().is_empty());
        assert!(store.delete(&id).unwrap());
        assert!(store.list().unwrap().is_empty());
    }
}
