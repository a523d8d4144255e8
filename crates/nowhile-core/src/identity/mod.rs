//! Peer ids and the local identity.
//!
//! Every endpoint is addressed by a 6-character peer id that a person can
//! read aloud to someone else.
//!
//! ## Id Format
//!
//! Any 6 characters from `A-Z` and `0-9` are accepted. Generated ids draw
//! from a 31-character alphabet that leaves out ambiguous characters:
//! - Excluded: `0`, `1`, `I`, `L`, `O`
//!
//! ## Example
//!
//! ```rust,ignore
//! use nowhile_core::identity::{LocalIdentity, PeerId};
//!
//! let id = PeerId::parse("k7q2zd")?;
//! assert_eq!(id.as_str(), "K7Q2ZD");
//!
//! let identity = LocalIdentity::load_or_create(&path, "Laptop")?;
//! ```

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The character set used for id generation.
/// Excludes ambiguous characters: 0, 1, I, L, O
pub const ID_CHARSET: &[u8] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

/// Length of a peer id
pub const PEER_ID_LENGTH: usize = 6;

/// A validated peer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Parse and validate a peer id.
    ///
    /// Input is trimmed and uppercased before validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the id has the wrong length or characters
    /// outside `A-Z0-9`.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized = input.trim().to_uppercase();

        if normalized.len() != PEER_ID_LENGTH {
            return Err(Error::InvalidPeerId(format!(
                "peer id must be {} characters, got {}",
                PEER_ID_LENGTH,
                normalized.len()
            )));
        }

        if let Some(c) = normalized
            .chars()
            .find(|c| !(c.is_ascii_uppercase() || c.is_ascii_digit()))
        {
            return Err(Error::InvalidPeerId(format!(
                "invalid character '{c}' in peer id"
            )));
        }

        Ok(Self(normalized))
    }

    /// Generate a new random peer id.
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let id: String = (0..PEER_ID_LENGTH)
            .map(|_| {
                let idx = rng.gen_range(0..ID_CHARSET.len());
                ID_CHARSET[idx] as char
            })
            .collect();

        Self(id)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

/// The identity this endpoint presents to others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIdentity {
    /// Peer id registered with the transport
    pub id: PeerId,
    /// Display name sent in handshakes
    pub name: String,
    /// When this id was generated
    pub created_at: DateTime<Utc>,
}

impl LocalIdentity {
    /// Create an identity with a freshly generated id.
    #[must_use]
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            id: PeerId::generate(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }

    /// Replace the id with a new random one, keeping the display name.
    ///
    /// Returns the previous id.
    pub fn regenerate(&mut self) -> PeerId {
        let mut next = PeerId::generate();
        while next == self.id {
            next = PeerId::generate();
        }
        self.created_at = Utc::now();
        std::mem::replace(&mut self.id, next)
    }

    /// Get the default identity file path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "nowhile", "Nowhile")
            .map(|dirs| dirs.data_dir().join("identity.json"))
    }

    /// Load the identity stored at `path`, creating and saving a new one
    /// if the file is missing or holds an invalid id.
    ///
    /// # Errors
    ///
    /// Returns an error if a new identity cannot be written.
    pub fn load_or_create(path: &Path, name: &str) -> Result<Self> {
        match Self::load_from(path) {
            Ok(Some(identity)) => return Ok(identity),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable identity");
            }
        }

        let identity = Self::generate(name);
        identity.save_to(path)?;
        tracing::info!(id = %identity.id, "Generated new local identity");
        Ok(identity)
    }

    /// Load an identity from `path`, or `None` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to open identity at {}: {}",
                path.display(),
                e
            ))
        })?;

        let identity = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to parse identity at {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Some(identity))
    }

    /// Save the identity to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to create identity at {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_valid_id() {
        let id = PeerId::parse("ABC123").expect("parse");
        assert_eq!(id.as_str(), "ABC123");
    }

    #[test]
    fn test_parse_normalizes_case_and_whitespace() {
        let id = PeerId::parse("  k7q2zd ").expect("parse");
        assert_eq!(id.as_str(), "K7Q2ZD");
    }

    #[test]
    fn test_parse_wrong_length() {
        assert!(PeerId::parse("ABC12").is_err());
        assert!(PeerId::parse("ABC1234").is_err());
        assert!(PeerId::parse("").is_err());
    }

    #[test]
    fn test_parse_invalid_characters() {
        assert!(PeerId::parse("ABC-12").is_err());
        assert!(PeerId::parse("ÄBC123").is_err());
    }

    #[test]
    fn test_generate_uses_charset() {
        for _ in 0..100 {
            let id = PeerId::generate();
            assert_eq!(id.as_str().len(), PEER_ID_LENGTH);
            assert!(id.as_str().bytes().all(|b| ID_CHARSET.contains(&b)));
            assert!(PeerId::parse(id.as_str()).is_ok());
        }
    }

    #[test]
    fn test_serde_rejects_invalid_id() {
        let ok: PeerId = serde_json::from_str("\"ABC123\"").expect("valid id");
        assert_eq!(ok.as_str(), "ABC123");

        let bad: std::result::Result<PeerId, _> = serde_json::from_str("\"abc\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_regenerate_changes_id() {
        let mut identity = LocalIdentity::generate("Laptop");
        let before = identity.id.clone();
        let previous = identity.regenerate();

        assert_eq!(previous, before);
        assert_ne!(identity.id, before);
        assert_eq!(identity.name, "Laptop");
    }

    #[test]
    fn test_load_or_create_persists() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("identity.json");

        let created = LocalIdentity::load_or_create(&path, "Desk").unwrap();
        let loaded = LocalIdentity::load_or_create(&path, "Other").unwrap();

        assert_eq!(created.id, loaded.id);
        assert_eq!(loaded.name, "Desk");
    }

    #[test]
    fn test_load_or_create_replaces_corrupt_file() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("identity.json");
        std::fs::write(&path, r#"{"id":"bad id","name":"x","created_at":"2024-01-01T00:00:00Z"}"#)
            .unwrap();

        let identity = LocalIdentity::load_or_create(&path, "Fresh").unwrap();
        assert_eq!(identity.name, "Fresh");
        assert!(LocalIdentity::load_from(&path).unwrap().is_some());
    }
}
