//! Recently connected peers.
//!
//! Every successful handshake records the peer with a last-seen time so it
//! can be reconnected quickly later. Entries older than the configured
//! window are dropped when the cache is loaded or pruned. Explicitly
//! disconnecting a peer removes it.

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::PeerId;

/// A peer seen recently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentPeer {
    /// Peer id
    pub id: PeerId,
    /// Display name from the last handshake
    pub name: String,
    /// Last handshake or disconnect
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecentDatabase {
    version: u32,
    peers: Vec<RecentPeer>,
}

/// Recent peer cache, newest first, optionally persisted as JSON.
#[derive(Debug)]
pub struct RecencyCache {
    path: Option<PathBuf>,
    entries: Vec<RecentPeer>,
    window: Duration,
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl RecencyCache {
    /// A cache that is never written to disk.
    #[must_use]
    pub fn in_memory(window: Duration) -> Self {
        Self {
            path: None,
            entries: Vec::new(),
            window,
        }
    }

    /// Load the cache stored at `path`, dropping expired entries.
    ///
    /// A missing file yields an empty cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: PathBuf, window: Duration) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: Some(path),
                entries: Vec::new(),
                window,
            });
        }

        let file = fs::File::open(&path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to open recent peers at {}: {}",
                path.display(),
                e
            ))
        })?;

        let db: RecentDatabase = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to parse recent peers at {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut cache = Self {
            path: Some(path),
            entries: db.peers,
            window,
        };
        cache.entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        cache.drop_expired(Utc::now());
        Ok(cache)
    }

    /// Get the default recent peers path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "nowhile", "Nowhile")
            .map(|dirs| dirs.data_dir().join("recent_peers.json"))
    }

    /// Record a handshake from `id` now.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be saved.
    pub fn record(&mut self, id: &PeerId, name: &str) -> Result<()> {
        self.record_at(id, name, Utc::now())
    }

    /// Record a handshake from `id` at `at`. Existing entries are updated
    /// and moved to the front.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be saved.
    pub fn record_at(&mut self, id: &PeerId, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.entries.retain(|p| &p.id != id);
        self.entries.insert(
            0,
            RecentPeer {
                id: id.clone(),
                name: name.to_string(),
                last_seen: at,
            },
        );
        self.save()
    }

    /// Refresh the last-seen time of a known peer. Unknown peers are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be saved.
    pub fn touch(&mut self, id: &PeerId) -> Result<bool> {
        let Some(index) = self.entries.iter().position(|p| &p.id == id) else {
            return Ok(false);
        };
        let mut peer = self.entries.remove(index);
        peer.last_seen = Utc::now();
        self.entries.insert(0, peer);
        self.save()?;
        Ok(true)
    }

    /// Peers seen within the configured window, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<RecentPeer> {
        self.list_within(self.window)
    }

    /// Peers seen within `within`, newest first.
    #[must_use]
    pub fn list_within(&self, within: Duration) -> Vec<RecentPeer> {
        let cutoff = cutoff(Utc::now(), within);
        self.entries
            .iter()
            .filter(|p| p.last_seen >= cutoff)
            .cloned()
            .collect()
    }

    /// Look up one peer.
    #[must_use]
    pub fn get(&self, id: &PeerId) -> Option<&RecentPeer> {
        self.entries.iter().find(|p| &p.id == id)
    }

    /// Forget one peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be saved.
    pub fn remove(&mut self, id: &PeerId) -> Result<bool> {
        let before = self.entries.len();
        self.entries.retain(|p| &p.id != id);
        if self.entries.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Forget every peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be saved.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.save()
    }

    /// Drop entries older than the window. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be saved.
    pub fn prune(&mut self) -> Result<usize> {
        let dropped = self.drop_expired(Utc::now());
        if dropped > 0 {
            self.save()?;
        }
        Ok(dropped)
    }

    /// Number of stored entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Backing file, if persisted.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn drop_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = cutoff(now, self.window);
        let before = self.entries.len();
        self.entries.retain(|p| p.last_seen >= cutoff);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Expired recent peers");
        }
        dropped
    }

    /// Write the cache to its backing file. In-memory caches do nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!(
                    "Failed to create recent peers directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = RecentDatabase {
            version: 1,
            peers: self.entries.clone(),
        };

        let file = fs::File::create(path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to create recent peers at {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::to_writer_pretty(BufWriter::new(file), &db).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to write recent peers at {}: {}",
                path.display(),
                e
            ))
        })
    }
}
