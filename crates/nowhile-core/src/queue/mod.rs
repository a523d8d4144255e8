//! Files waiting to be sent.
//!
//! A [`QueuedFile`] is resolved once, at enqueue time: name, size and MIME
//! type are read from the filesystem so that sending later does not need
//! to touch file metadata again.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Type tag used when the MIME type cannot be guessed.
pub const FALLBACK_MIME: &str = "application/octet-stream";

/// A file awaiting assignment to one or more peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedFile {
    /// Queue entry id
    pub id: Uuid,
    /// Source path
    pub path: PathBuf,
    /// File name sent to peers
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    pub mime_type: String,
    /// When the file was queued
    pub added_at: DateTime<Utc>,
}

impl QueuedFile {
    /// Resolve a file on disk into a queue entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or is not a regular file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!(
                "not a regular file: {}",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidInput(format!("no file name in {}", path.display())))?;

        Ok(Self {
            id: Uuid::new_v4(),
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
            mime_type: mime_guess::from_path(path)
                .first()
                .map_or_else(|| FALLBACK_MIME.to_string(), |m| m.to_string()),
            added_at: Utc::now(),
        })
    }
}

/// Ordered list of queued files.
#[derive(Debug, Default)]
pub struct SendQueue {
    files: Vec<QueuedFile>,
}

impl SendQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to the end of the queue.
    pub fn push(&mut self, file: QueuedFile) {
        self.files.push(file);
    }

    /// Remove one entry.
    pub fn remove(&mut self, id: &Uuid) -> Option<QueuedFile> {
        let index = self.files.iter().position(|f| &f.id == id)?;
        Some(self.files.remove(index))
    }

    /// Take every entry, leaving the queue empty.
    pub fn take_all(&mut self) -> Vec<QueuedFile> {
        std::mem::take(&mut self.files)
    }

    /// Queued files, oldest first.
    #[must_use]
    pub fn files(&self) -> &[QueuedFile] {
        &self.files
    }

    /// Number of queued files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total bytes queued.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Format a byte count for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_path_resolves_metadata() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("notes.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let file = QueuedFile::from_path(&path).expect("queue");
        assert_eq!(file.name, "notes.txt");
        assert_eq!(file.size, 11);
        assert_eq!(file.mime_type, "text/plain");
    }

    #[test]
    fn test_unknown_extension_falls_back() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("blob.zzunknown");
        std::fs::write(&path, b"x").unwrap();

        let file = QueuedFile::from_path(&path).expect("queue");
        assert_eq!(file.mime_type, FALLBACK_MIME);
    }

    #[test]
    fn test_missing_and_directory_rejected() {
        let tmp_dir = TempDir::new().unwrap();
        assert!(matches!(
            QueuedFile::from_path(&tmp_dir.path().join("absent.bin")),
            Err(Error::FileNotFound(_))
        ));
        assert!(matches!(
            QueuedFile::from_path(tmp_dir.path()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_queue_operations() {
        let tmp_dir = TempDir::new().unwrap();
        let mut queue = SendQueue::new();
        for (name, len) in [("a.bin", 10), ("b.bin", 20)] {
            let path = tmp_dir.path().join(name);
            std::fs::write(&path, vec![0u8; len]).unwrap();
            queue.push(QueuedFile::from_path(&path).unwrap());
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_size(), 30);

        let first = queue.files()[0].id;
        assert_eq!(queue.remove(&first).map(|f| f.name), Some("a.bin".to_string()));
        assert!(queue.remove(&first).is_none());

        let taken = queue.take_all();
        assert_eq!(taken.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(10_485_760), "10.0 MB");
    }
}
