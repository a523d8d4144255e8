//! Transfer coordination.
//!
//! [`TransferCoordinator`] is the protocol state machine for file transfers
//! in both directions. It owns the active transfer records and the inbound
//! reassembly buffers; nothing else mutates them.
//!
//! ## Outbound
//!
//! ```text
//! PENDING ──METADATA sent──► IN_PROGRESS ──END sent──► COMPLETED
//!                                 │
//!                                 └── read error / link lost ──► FAILED
//! ```
//!
//! ## Inbound
//!
//! - METADATA opens a [`ReassemblyBuffer`] and a record at 0%.
//! - CHUNK appends to the buffer. Without a buffer it is dropped.
//! - END finalizes the buffer into a [`ReceivedArtifact`]. Without a buffer
//!   it is dropped.
//!
//! Transfer ids are never reused within a session. Frames for an id that
//! already ended are orphans and are dropped.
//!
//! ## Progress
//!
//! Progress is published at most once per `progress_interval`, except that
//! the update reaching the final byte is always published. Values never
//! decrease and a successful transfer always ends at 100.

pub mod reassembly;

pub use reassembly::ReassemblyBuffer;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::producer::{ProducerJob, ProducerMessage};
use crate::protocol::{FileDescriptor, Frame};
use crate::queue::QueuedFile;

/// Something that can deliver frames to peers.
pub trait FrameSender {
    /// Deliver `frame` to `peer`. Returns `false` if the frame was dropped
    /// because no open link exists.
    fn send_frame(&self, peer: &PeerId, frame: &Frame) -> bool;
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Sending a file
    Outgoing,
    /// Receiving a file
    Incoming,
}

/// Transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Registered, METADATA not yet delivered
    Pending,
    /// Streaming chunks
    InProgress,
    /// All bytes delivered
    Completed,
    /// Stopped by an error
    Failed,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::InProgress => write!(f, "In progress"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Tracked state of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    /// Transfer id
    pub id: Uuid,
    /// Direction
    pub direction: TransferDirection,
    /// File name
    pub file_name: String,
    /// File size in bytes
    pub file_size: u64,
    /// MIME type
    pub file_type: String,
    /// Published progress, 0-100
    pub progress: u8,
    /// Bytes sent or received so far
    pub bytes_transferred: u64,
    /// Status
    pub status: TransferStatus,
    /// Remote peer
    pub peer: PeerId,
    /// When the transfer started
    pub started_at: DateTime<Utc>,
}

/// Terminal record of an outbound transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentFileLog {
    /// Transfer id
    pub id: Uuid,
    /// File name
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// MIME type
    pub file_type: String,
    /// Recipient
    pub recipient: PeerId,
    /// When the transfer finished
    pub finished_at: DateTime<Utc>,
    /// Final status
    pub status: TransferStatus,
}

/// A completed inbound file, ready for the blob store.
#[derive(Debug, Clone)]
pub struct ReceivedArtifact {
    /// METADATA of the transfer
    pub descriptor: FileDescriptor,
    /// File contents
    pub bytes: Vec<u8>,
    /// Sender
    pub sender: PeerId,
    /// Sender display name
    pub sender_name: String,
    /// When the transfer started
    pub started_at: DateTime<Utc>,
}

/// Observable transfer changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A record was created
    Started(TransferRecord),
    /// Published progress moved forward
    Progress {
        /// Transfer id
        transfer_id: Uuid,
        /// Progress, 0-100
        progress: u8,
        /// Bytes so far
        bytes_transferred: u64,
    },
    /// Transfer finished successfully
    Completed(TransferRecord),
    /// Transfer stopped by an error
    Failed {
        /// Record at the time of failure
        record: TransferRecord,
        /// What went wrong
        reason: String,
    },
    /// Transfer dropped because its peer disconnected
    Abandoned(TransferRecord),
}

#[derive(Debug)]
struct ActiveTransfer {
    record: TransferRecord,
    last_progress_at: Option<Instant>,
}

fn percent(bytes: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = u128::from(bytes.min(total)) * 100 / u128::from(total);
    u8::try_from(pct).unwrap_or(100)
}

/// Protocol state machine for outbound and inbound transfers.
#[derive(Debug)]
pub struct TransferCoordinator {
    config: TransferConfig,
    active: HashMap<Uuid, ActiveTransfer>,
    buffers: HashMap<Uuid, ReassemblyBuffer>,
    finished: HashSet<Uuid>,
    sent_history: Vec<SentFileLog>,
    events: Vec<TransferEvent>,
}

impl TransferCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            active: HashMap::new(),
            buffers: HashMap::new(),
            finished: HashSet::new(),
            sent_history: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Start sending `file` to `peer`: registers the record, emits METADATA,
    /// and returns the producer job that will stream the chunks.
    ///
    /// # Errors
    ///
    /// Returns `Error::LinkLost` if METADATA could not be delivered; the
    /// record is marked failed.
    pub fn begin_outgoing<S>(
        &mut self,
        file: &QueuedFile,
        peer: &PeerId,
        sender: &S,
    ) -> Result<ProducerJob>
    where
        S: FrameSender + ?Sized,
    {
        let transfer_id = self.fresh_id();
        let mut record = TransferRecord {
            id: transfer_id,
            direction: TransferDirection::Outgoing,
            file_name: file.name.clone(),
            file_size: file.size,
            file_type: file.mime_type.clone(),
            progress: 0,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            peer: peer.clone(),
            started_at: Utc::now(),
        };

        let metadata = Frame::Metadata(FileDescriptor {
            transfer_id,
            file_name: file.name.clone(),
            file_size: file.size,
            file_type: file.mime_type.clone(),
        });

        if !sender.send_frame(peer, &metadata) {
            let reason = "link not open".to_string();
            record.status = TransferStatus::Failed;
            self.finished.insert(transfer_id);
            self.log_sent(&record);
            self.events.push(TransferEvent::Failed {
                record,
                reason: reason.clone(),
            });
            return Err(Error::LinkLost {
                peer: peer.clone(),
                reason,
            });
        }

        tracing::info!(transfer = %transfer_id, peer = %peer, file = %file.name, size = file.size, "Sending file");
        record.status = TransferStatus::InProgress;
        self.events.push(TransferEvent::Started(record.clone()));
        self.active.insert(
            transfer_id,
            ActiveTransfer {
                record,
                last_progress_at: None,
            },
        );

        Ok(ProducerJob {
            transfer_id,
            path: file.path.clone(),
            chunk_size: self.config.chunk_size,
        })
    }

    /// Forward producer output to the recipient.
    ///
    /// Output for transfers that are no longer active is ignored.
    ///
    /// # Errors
    ///
    /// - `Error::ChunkProducer` if the producer reported a read failure
    /// - `Error::LinkLost` if the link closed mid-transfer
    ///
    /// Either way the transfer is marked failed and its producer should be
    /// cancelled.
    pub fn on_producer_message<S>(&mut self, message: ProducerMessage, sender: &S) -> Result<()>
    where
        S: FrameSender + ?Sized,
    {
        let transfer_id = message.transfer_id();
        let Some(active) = self.active.get(&transfer_id) else {
            tracing::debug!(transfer = %transfer_id, "Dropping producer output for inactive transfer");
            return Ok(());
        };
        let peer = active.record.peer.clone();

        match message {
            ProducerMessage::Chunk { data, .. } => {
                let len = data.len() as u64;
                if !sender.send_frame(&peer, &Frame::Chunk { transfer_id, data }) {
                    return Err(self.link_lost(transfer_id, peer));
                }
                if let Some(active) = self.active.get_mut(&transfer_id) {
                    active.record.bytes_transferred += len;
                }
                self.publish_progress(transfer_id);
                Ok(())
            }
            ProducerMessage::End { .. } => {
                if !sender.send_frame(&peer, &Frame::End { transfer_id }) {
                    return Err(self.link_lost(transfer_id, peer));
                }
                if let Some(record) = self.complete(transfer_id) {
                    tracing::info!(transfer = %transfer_id, peer = %peer, "File sent");
                    self.log_sent(&record);
                }
                Ok(())
            }
            ProducerMessage::Error { message, .. } => {
                tracing::warn!(transfer = %transfer_id, error = %message, "Chunk producer failed");
                if let Some(record) = self.fail(transfer_id, &message) {
                    self.log_sent(&record);
                }
                Err(Error::ChunkProducer {
                    transfer: transfer_id,
                    message,
                })
            }
        }
    }

    /// Route an inbound frame.
    ///
    /// Returns the finished artifact when an END completes a transfer.
    /// HANDSHAKE and CHAT frames are not transfer frames and are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Error::SizeMismatch` if a CHUNK pushes the received byte
    /// count past the declared size, or END arrives and the count differs
    /// from it; the transfer is marked failed.
    pub fn on_frame(
        &mut self,
        from: &PeerId,
        sender_name: &str,
        frame: Frame,
    ) -> Result<Option<ReceivedArtifact>> {
        match frame {
            Frame::Metadata(descriptor) => {
                self.on_metadata(from, sender_name, descriptor);
                Ok(None)
            }
            Frame::Chunk { transfer_id, data } => {
                self.on_chunk(from, transfer_id, data)?;
                Ok(None)
            }
            Frame::End { transfer_id } => self.on_end(from, transfer_id),
            Frame::Handshake(_) | Frame::Chat(_) => Ok(None),
        }
    }

    /// Drop every active transfer with `peer`. Records are abandoned
    /// rather than finalized and their ids can never be reused.
    ///
    /// Returns the ids of abandoned outgoing transfers, whose producers
    /// should be cancelled.
    pub fn abandon_peer(&mut self, peer: &PeerId) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, active)| &active.record.peer == peer)
            .map(|(id, _)| *id)
            .collect();

        let mut outgoing = Vec::new();
        for id in ids {
            self.buffers.remove(&id);
            self.finished.insert(id);
            if let Some(active) = self.active.remove(&id) {
                tracing::info!(transfer = %id, peer = %peer, "Abandoning transfer");
                if active.record.direction == TransferDirection::Outgoing {
                    outgoing.push(id);
                }
                self.events.push(TransferEvent::Abandoned(active.record));
            }
        }
        outgoing
    }

    /// Take the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<TransferEvent> {
        std::mem::take(&mut self.events)
    }

    /// Active transfers, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<TransferRecord> {
        let mut records: Vec<TransferRecord> =
            self.active.values().map(|a| a.record.clone()).collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    /// One active transfer.
    #[must_use]
    pub fn record(&self, id: &Uuid) -> Option<&TransferRecord> {
        self.active.get(id).map(|a| &a.record)
    }

    /// Finished outbound transfers, oldest first.
    #[must_use]
    pub fn sent_history(&self) -> &[SentFileLog] {
        &self.sent_history
    }

    /// Whether an inbound buffer exists for `id`.
    #[must_use]
    pub fn has_buffer(&self, id: &Uuid) -> bool {
        self.buffers.contains_key(id)
    }

    /// Whether `id` has ended and will never be accepted again.
    #[must_use]
    pub fn is_finished(&self, id: &Uuid) -> bool {
        self.finished.contains(id)
    }

    fn fresh_id(&self) -> Uuid {
        loop {
            let id = Uuid::new_v4();
            if !self.finished.contains(&id) && !self.active.contains_key(&id) {
                return id;
            }
        }
    }

    fn on_metadata(&mut self, from: &PeerId, sender_name: &str, descriptor: FileDescriptor) {
        let transfer_id = descriptor.transfer_id;
        if self.finished.contains(&transfer_id)
            || self.active.contains_key(&transfer_id)
            || self.buffers.contains_key(&transfer_id)
        {
            tracing::debug!(transfer = %transfer_id, peer = %from, "Ignoring METADATA for known transfer");
            return;
        }

        tracing::info!(transfer = %transfer_id, peer = %from, file = %descriptor.file_name, size = descriptor.file_size, "Receiving file");
        let record = TransferRecord {
            id: transfer_id,
            direction: TransferDirection::Incoming,
            file_name: descriptor.file_name.clone(),
            file_size: descriptor.file_size,
            file_type: descriptor.file_type.clone(),
            progress: 0,
            bytes_transferred: 0,
            status: TransferStatus::InProgress,
            peer: from.clone(),
            started_at: Utc::now(),
        };

        self.events.push(TransferEvent::Started(record.clone()));
        self.active.insert(
            transfer_id,
            ActiveTransfer {
                record,
                last_progress_at: None,
            },
        );
        self.buffers.insert(
            transfer_id,
            ReassemblyBuffer::new(descriptor, from.clone(), sender_name.to_string()),
        );
    }

    fn on_chunk(&mut self, from: &PeerId, transfer_id: Uuid, data: Vec<u8>) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(&transfer_id) else {
            tracing::debug!(transfer = %transfer_id, peer = %from, "Dropping orphaned CHUNK");
            return Ok(());
        };
        if buffer.sender() != from {
            tracing::debug!(transfer = %transfer_id, peer = %from, "Dropping CHUNK from wrong peer");
            return Ok(());
        }

        let expected = buffer.descriptor().file_size;
        let received = buffer.received() + data.len() as u64;
        if received > expected {
            let err = Error::SizeMismatch {
                transfer: transfer_id,
                expected,
                actual: received,
            };
            tracing::warn!(transfer = %transfer_id, error = %err, "Peer sent more than declared");
            self.fail(transfer_id, &err.to_string());
            return Err(err);
        }

        buffer.append(data);
        if let Some(active) = self.active.get_mut(&transfer_id) {
            active.record.bytes_transferred = received;
        }
        self.publish_progress(transfer_id);
        Ok(())
    }

    fn on_end(&mut self, from: &PeerId, transfer_id: Uuid) -> Result<Option<ReceivedArtifact>> {
        if self
            .buffers
            .get(&transfer_id)
            .is_none_or(|buffer| buffer.sender() != from)
        {
            tracing::debug!(transfer = %transfer_id, peer = %from, "Dropping orphaned END");
            return Ok(None);
        }
        let Some(buffer) = self.buffers.remove(&transfer_id) else {
            return Ok(None);
        };

        let sender = buffer.sender().clone();
        let sender_name = buffer.sender_name().to_string();
        let started_at = buffer.started_at();
        let (descriptor, bytes) = buffer.finalize();

        let actual = bytes.len() as u64;
        if actual != descriptor.file_size {
            let err = Error::SizeMismatch {
                transfer: transfer_id,
                expected: descriptor.file_size,
                actual,
            };
            tracing::warn!(transfer = %transfer_id, error = %err, "Discarding incomplete file");
            self.fail(transfer_id, &err.to_string());
            return Err(err);
        }

        self.complete(transfer_id);
        tracing::info!(transfer = %transfer_id, peer = %from, size = actual, "File received");

        Ok(Some(ReceivedArtifact {
            descriptor,
            bytes,
            sender,
            sender_name,
            started_at,
        }))
    }

    fn publish_progress(&mut self, transfer_id: Uuid) {
        let interval = self.config.progress_interval;
        let Some(active) = self.active.get_mut(&transfer_id) else {
            return;
        };

        let record = &mut active.record;
        let progress = percent(record.bytes_transferred, record.file_size);
        let is_final = record.bytes_transferred >= record.file_size;
        let now = Instant::now();
        let due = active
            .last_progress_at
            .is_none_or(|last| now.duration_since(last) >= interval);

        if !(due || is_final) || progress <= record.progress {
            return;
        }

        record.progress = progress;
        active.last_progress_at = Some(now);
        self.events.push(TransferEvent::Progress {
            transfer_id,
            progress,
            bytes_transferred: record.bytes_transferred,
        });
    }

    fn complete(&mut self, transfer_id: Uuid) -> Option<TransferRecord> {
        let mut active = self.active.remove(&transfer_id)?;
        self.finished.insert(transfer_id);

        let record = &mut active.record;
        if record.progress < 100 {
            record.progress = 100;
            self.events.push(TransferEvent::Progress {
                transfer_id,
                progress: 100,
                bytes_transferred: record.bytes_transferred,
            });
        }
        record.status = TransferStatus::Completed;
        self.events.push(TransferEvent::Completed(record.clone()));
        Some(active.record)
    }

    fn fail(&mut self, transfer_id: Uuid, reason: &str) -> Option<TransferRecord> {
        self.buffers.remove(&transfer_id);
        self.finished.insert(transfer_id);
        let mut active = self.active.remove(&transfer_id)?;

        active.record.status = TransferStatus::Failed;
        self.events.push(TransferEvent::Failed {
            record: active.record.clone(),
            reason: reason.to_string(),
        });
        Some(active.record)
    }

    fn link_lost(&mut self, transfer_id: Uuid, peer: PeerId) -> Error {
        let reason = "link closed mid-transfer".to_string();
        tracing::warn!(transfer = %transfer_id, peer = %peer, "Link lost while sending");
        if let Some(record) = self.fail(transfer_id, &reason) {
            self.log_sent(&record);
        }
        Error::LinkLost { peer, reason }
    }

    fn log_sent(&mut self, record: &TransferRecord) {
        if record.direction != TransferDirection::Outgoing {
            return;
        }
        self.sent_history.push(SentFileLog {
            id: record.id,
            name: record.file_name.clone(),
            size: record.file_size,
            file_type: record.file_type.clone(),
            recipient: record.peer.clone(),
            finished_at: Utc::now(),
            status: record.status,
        });
    }
}
