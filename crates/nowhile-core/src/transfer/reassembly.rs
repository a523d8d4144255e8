//! Per-transfer accumulator for inbound chunks.

use chrono::{DateTime, Utc};

use crate::identity::PeerId;
use crate::protocol::FileDescriptor;

/// Chunks received for one inbound transfer, in arrival order.
///
/// Lives from METADATA to END. Never persisted.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    descriptor: FileDescriptor,
    sender: PeerId,
    sender_name: String,
    started_at: DateTime<Utc>,
    chunks: Vec<Vec<u8>>,
    received: u64,
}

impl ReassemblyBuffer {
    /// Open a buffer for the transfer described by `descriptor`.
    #[must_use]
    pub fn new(descriptor: FileDescriptor, sender: PeerId, sender_name: String) -> Self {
        Self {
            descriptor,
            sender,
            sender_name,
            started_at: Utc::now(),
            chunks: Vec::new(),
            received: 0,
        }
    }

    /// Append the next chunk. Returns the running byte count.
    pub fn append(&mut self, data: Vec<u8>) -> u64 {
        self.received += data.len() as u64;
        if !data.is_empty() {
            self.chunks.push(data);
        }
        self.received
    }

    /// Bytes received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Number of non-empty chunks held.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The METADATA that opened this buffer.
    #[must_use]
    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    /// Peer sending the file.
    #[must_use]
    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// Display name of the sender when the transfer started.
    #[must_use]
    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    /// When METADATA arrived.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Concatenate the chunks into the complete artifact, consuming the
    /// buffer.
    #[must_use]
    pub fn finalize(self) -> (FileDescriptor, Vec<u8>) {
        let bytes = if self.chunks.len() == 1 {
            self.chunks.into_iter().next().unwrap_or_default()
        } else {
            let mut bytes = Vec::with_capacity(usize::try_from(self.received).unwrap_or(0));
            for chunk in self.chunks {
                bytes.extend_from_slice(&chunk);
            }
            bytes
        };
        (self.descriptor, bytes)
    }
}
