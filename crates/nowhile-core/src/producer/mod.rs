//! Chunk producers.
//!
//! A [`ProducerPool`] owns a fixed set of worker tasks that pull jobs from
//! a shared queue. Each job reads one file in `chunk_size` slices and hands
//! every slice to the session as an owned [`ProducerMessage`]:
//!
//! ```text
//!   submit(job) ──► flume queue ──► worker 1..N ──► mpsc (bounded) ──► next_message()
//! ```
//!
//! For a file of `size` bytes a job emits `ceil(size / chunk_size)` chunks
//! covering `[0, size)` in increasing offset order, then exactly one `End`.
//! A read failure emits one `Error` and the job stops. Cancelled jobs go
//! quiet without a terminal message.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A file to slice.
#[derive(Debug, Clone)]
pub struct ProducerJob {
    /// Transfer the chunks belong to
    pub transfer_id: Uuid,
    /// Source file
    pub path: PathBuf,
    /// Bytes per chunk
    pub chunk_size: usize,
}

/// Output of a producer.
#[derive(Debug)]
pub enum ProducerMessage {
    /// Next slice of the file
    Chunk {
        /// Transfer id
        transfer_id: Uuid,
        /// Offset of the first byte
        offset: u64,
        /// The bytes
        data: Vec<u8>,
    },
    /// Every byte has been produced
    End {
        /// Transfer id
        transfer_id: Uuid,
    },
    /// Reading failed
    Error {
        /// Transfer id
        transfer_id: Uuid,
        /// What went wrong
        message: String,
    },
}

impl ProducerMessage {
    /// Transfer this message belongs to.
    #[must_use]
    pub const fn transfer_id(&self) -> Uuid {
        match self {
            Self::Chunk { transfer_id, .. }
            | Self::End { transfer_id }
            | Self::Error { transfer_id, .. } => *transfer_id,
        }
    }
}

struct QueuedJob {
    job: ProducerJob,
    cancel: CancellationToken,
}

/// Reusable pool of chunk producer workers.
pub struct ProducerPool {
    jobs: flume::Sender<QueuedJob>,
    messages: mpsc::Receiver<ProducerMessage>,
    tokens: HashMap<Uuid, CancellationToken>,
    workers: Vec<JoinHandle<()>>,
}

impl ProducerPool {
    /// Spawn `workers` producer tasks. `capacity` bounds the number of
    /// chunks waiting to be picked up.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (jobs_tx, jobs_rx) = flume::unbounded::<QueuedJob>();
        let (messages_tx, messages_rx) = mpsc::channel(capacity.max(1));

        let workers = (0..workers.max(1))
            .map(|index| {
                let jobs = jobs_rx.clone();
                let messages = messages_tx.clone();
                tokio::spawn(async move {
                    while let Ok(queued) = jobs.recv_async().await {
                        if queued.cancel.is_cancelled() {
                            continue;
                        }
                        tracing::debug!(worker = index, transfer = %queued.job.transfer_id, "Producer picked up job");
                        produce(&queued.job, &queued.cancel, &messages).await;
                    }
                })
            })
            .collect();

        Self {
            jobs: jobs_tx,
            messages: messages_rx,
            tokens: HashMap::new(),
            workers,
        }
    }

    /// Queue a job.
    pub fn submit(&mut self, job: ProducerJob) {
        let cancel = CancellationToken::new();
        self.tokens.insert(job.transfer_id, cancel.clone());
        let transfer_id = job.transfer_id;
        if self.jobs.send(QueuedJob { job, cancel }).is_err() {
            tracing::error!(transfer = %transfer_id, "Producer pool is shut down");
            self.tokens.remove(&transfer_id);
        }
    }

    /// Stop producing for a transfer. Messages already queued may still
    /// arrive and should be ignored by the caller.
    pub fn cancel(&mut self, transfer_id: &Uuid) -> bool {
        self.tokens.remove(transfer_id).is_some_and(|token| {
            token.cancel();
            true
        })
    }

    /// Number of jobs queued or running.
    pub fn active_jobs(&self) -> usize {
        self.tokens.len()
    }

    /// Wait for the next message from any worker. Cancel safe.
    pub async fn next_message(&mut self) -> Option<ProducerMessage> {
        let message = self.messages.recv().await?;
        if matches!(
            message,
            ProducerMessage::End { .. } | ProducerMessage::Error { .. }
        ) {
            self.tokens.remove(&message.transfer_id());
        }
        Some(message)
    }

    /// Cancel every job and stop the workers.
    pub fn shutdown(&mut self) {
        for (_, token) in self.tokens.drain() {
            token.cancel();
        }
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

impl Drop for ProducerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn produce(
    job: &ProducerJob,
    cancel: &CancellationToken,
    messages: &mpsc::Sender<ProducerMessage>,
) {
    let transfer_id = job.transfer_id;
    let emit = |message: ProducerMessage| async move {
        tokio::select! {
            () = cancel.cancelled() => false,
            sent = messages.send(message) => sent.is_ok(),
        }
    };

    let mut file = match tokio::fs::File::open(&job.path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(transfer = %transfer_id, path = %job.path.display(), error = %e, "Cannot open source file");
            emit(ProducerMessage::Error {
                transfer_id,
                message: format!("cannot open {}: {e}", job.path.display()),
            })
            .await;
            return;
        }
    };

    let chunk_size = job.chunk_size.max(1);
    let mut offset = 0u64;
    loop {
        if cancel.is_cancelled() {
            tracing::debug!(transfer = %transfer_id, "Producer cancelled");
            return;
        }

        let mut buf = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            match file.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    tracing::warn!(transfer = %transfer_id, offset, error = %e, "Read failed");
                    emit(ProducerMessage::Error {
                        transfer_id,
                        message: format!("read failed at offset {offset}: {e}"),
                    })
                    .await;
                    return;
                }
            }
        }

        if filled == 0 {
            emit(ProducerMessage::End { transfer_id }).await;
            return;
        }

        buf.truncate(filled);
        let sent = emit(ProducerMessage::Chunk {
            transfer_id,
            offset,
            data: buf,
        })
        .await;
        if !sent {
            return;
        }
        offset += filled as u64;

        if filled < chunk_size {
            emit(ProducerMessage::End { transfer_id }).await;
            return;
        }
    }
}
