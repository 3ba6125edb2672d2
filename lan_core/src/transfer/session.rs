//! One file transfer: validation, chunk bookkeeping and finalization.
//!
//! Chunks are decoded on the connection task and handed to a writer task
//! through a bounded queue. When the queue is full the connection stops
//! reading from the socket until the writer catches up.

use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::constants::{LAN_TRANSFER_ALLOWED_EXTENSIONS, LAN_TRANSFER_ALLOWED_MIME_TYPES, total_chunks};
use super::protocol::{FileStart, decode_chunk};
use crate::error::{ErrorCode, TransferError};
use crate::state::{FileTransferProgress, FileTransferStatus};
use crate::storage::{Storage, StorageSink};

/// Check a `file_start` against the receiver's rules, in protocol order
pub fn validate_file_start(
    start: &FileStart,
    chunk_size: u64,
    available_space: u64,
) -> Result<(), TransferError> {
    let extension = Path::new(&start.file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()));
    let extension_allowed = extension
        .as_deref()
        .is_some_and(|ext| LAN_TRANSFER_ALLOWED_EXTENSIONS.contains(&ext));
    if !extension_allowed {
        return Err(TransferError::UnsupportedFileType(format!(
            "{} (allowed: {})",
            start.file_name,
            LAN_TRANSFER_ALLOWED_EXTENSIONS.join(", ")
        )));
    }

    let mime = start.mime_type.trim().to_ascii_lowercase();
    if !LAN_TRANSFER_ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
        return Err(TransferError::UnsupportedFileType(format!(
            "MIME type {} is not allowed",
            start.mime_type
        )));
    }

    if start.chunk_size != chunk_size {
        return Err(TransferError::InvalidChunkLayout(format!(
            "chunkSize {} does not match receiver chunk size {}",
            start.chunk_size, chunk_size
        )));
    }
    if start.file_size == 0 {
        return Err(TransferError::InvalidChunkLayout(
            "fileSize must be greater than zero".to_string(),
        ));
    }
    let expected_chunks = total_chunks(start.file_size, chunk_size);
    if start.total_chunks != expected_chunks {
        return Err(TransferError::InvalidChunkLayout(format!(
            "totalChunks {} does not match {} for {} bytes",
            start.total_chunks, expected_chunks, start.file_size
        )));
    }

    if available_space < start.file_size {
        return Err(TransferError::InsufficientStorage {
            required: start.file_size,
            available: available_space,
        });
    }

    Ok(())
}

struct PendingWrite {
    offset: u64,
    bytes: Bytes,
}

/// Writer task owning the storage sink
struct ChunkWriter<K> {
    tx: mpsc::Sender<PendingWrite>,
    cancel: CancellationToken,
    handle: JoinHandle<(K, io::Result<()>)>,
}

impl<K: StorageSink> ChunkWriter<K> {
    fn spawn(sink: K, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_writer(sink, rx, cancel.clone()));
        Self { tx, cancel, handle }
    }

    /// Waits for queue capacity
    async fn enqueue(&self, offset: u64, bytes: Bytes) -> Result<(), TransferError> {
        self.tx
            .send(PendingWrite { offset, bytes })
            .await
            .map_err(|_| TransferError::DiskError(io::Error::other("chunk writer stopped")))
    }

    /// Wait for every queued write, then hand the sink back
    async fn drain(self) -> Result<(K, io::Result<()>), TransferError> {
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| TransferError::DiskError(io::Error::other(e)))
    }

    /// Drop queued writes and hand the sink back
    async fn discard(self) -> Option<K> {
        self.cancel.cancel();
        drop(self.tx);
        match self.handle.await {
            Ok((sink, _)) => Some(sink),
            Err(e) => {
                tracing::error!("Chunk writer task failed: {}", e);
                None
            }
        }
    }
}

async fn run_writer<K: StorageSink>(
    mut sink: K,
    mut rx: mpsc::Receiver<PendingWrite>,
    cancel: CancellationToken,
) -> (K, io::Result<()>) {
    let mut result = Ok(());
    loop {
        let write = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            write = rx.recv() => write,
        };
        let Some(write) = write else { break };

        // After a failure keep draining so the reader never stalls
        if result.is_err() {
            continue;
        }
        // A stalled disk must not hold up cancellation
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            written = sink.write_at(write.offset, &write.bytes) => written,
        };
        if let Err(e) = written {
            tracing::error!("Write at offset {} failed: {}", write.offset, e);
            result = Err(e);
        }
    }

    if cancel.is_cancelled() && result.is_ok() {
        result = Err(interrupted());
    }
    (sink, result)
}

fn interrupted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "transfer interrupted")
}

/// What happened to an incoming chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Written,
    /// Already received; overwritten in place
    Rewritten,
    /// Index outside the file; dropped
    Ignored,
}

/// Receiving side of exactly one file
pub struct FileTransferSession<K> {
    progress: FileTransferProgress,
    chunk_size: u64,
    checksum: String,
    /// Decoded length of each received chunk, by index
    chunk_lengths: HashMap<u64, u64>,
    writer: ChunkWriter<K>,
    started: Instant,
}

impl<K: StorageSink> FileTransferSession<K> {
    /// Validate `start` and open its destination
    pub async fn open<S>(
        storage: &S,
        start: &FileStart,
        chunk_size: u64,
        write_queue_depth: usize,
    ) -> Result<Self, TransferError>
    where
        S: Storage<Sink = K>,
    {
        let available = storage.available_space().await?;
        validate_file_start(start, chunk_size, available)?;

        let sink = storage.create(&start.file_name, start.file_size).await?;
        tracing::info!(
            "Receiving {} ({} bytes, {} chunks) as transfer {}",
            start.file_name,
            start.file_size,
            start.total_chunks,
            start.transfer_id
        );

        Ok(Self {
            progress: FileTransferProgress::new(
                &start.transfer_id,
                &start.file_name,
                start.file_size,
                start.total_chunks,
            ),
            chunk_size,
            checksum: start.checksum.clone(),
            chunk_lengths: HashMap::new(),
            writer: ChunkWriter::spawn(sink, write_queue_depth),
            started: Instant::now(),
        })
    }

    pub fn transfer_id(&self) -> &str {
        &self.progress.transfer_id
    }

    pub fn progress(&self) -> &FileTransferProgress {
        &self.progress
    }

    /// Cancelling this token makes a pending `accept_chunk` or `finish`
    /// give up on the disk and fail with `DISK_ERROR`.
    pub fn interrupter(&self) -> CancellationToken {
        self.writer.cancel.clone()
    }

    fn expected_chunk_len(&self, index: u64) -> u64 {
        let offset = index * self.chunk_size;
        self.chunk_size.min(self.progress.file_size.saturating_sub(offset))
    }

    fn check_transfer_id(&self, transfer_id: &str) -> Result<(), TransferError> {
        if transfer_id != self.progress.transfer_id {
            return Err(TransferError::MalformedMessage(format!(
                "unknown transferId {} (active: {})",
                transfer_id, self.progress.transfer_id
            )));
        }
        Ok(())
    }

    /// Decode one `file_chunk` and queue it for writing at its offset
    pub async fn accept_chunk(
        &mut self,
        transfer_id: &str,
        chunk_index: u64,
        data: &str,
    ) -> Result<ChunkOutcome, TransferError> {
        self.check_transfer_id(transfer_id)?;

        if chunk_index >= self.progress.total_chunks {
            tracing::warn!(
                "Ignoring chunk {} of transfer {} (only {} chunks)",
                chunk_index,
                transfer_id,
                self.progress.total_chunks
            );
            return Ok(ChunkOutcome::Ignored);
        }

        let bytes = decode_chunk(data)?;
        let len = bytes.len() as u64;
        let expected = self.expected_chunk_len(chunk_index);
        if len > expected {
            return Err(TransferError::MalformedMessage(format!(
                "chunk {} carries {} bytes, at most {} expected",
                chunk_index, len, expected
            )));
        }

        self.writer
            .enqueue(chunk_index * self.chunk_size, bytes)
            .await?;

        let outcome = match self.chunk_lengths.insert(chunk_index, len) {
            Some(previous) => {
                self.progress.bytes_received = self.progress.bytes_received - previous + len;
                ChunkOutcome::Rewritten
            }
            None => {
                self.progress.bytes_received += len;
                self.progress.chunks_received += 1;
                ChunkOutcome::Written
            }
        };
        self.progress.update_timing(self.started.elapsed());

        Ok(outcome)
    }

    /// Handle `file_end`: drain writes, verify, and publish or delete the file
    pub async fn finish(
        mut self,
        transfer_id: &str,
    ) -> Result<(FileTransferProgress, Result<PathBuf, TransferError>), (Self, TransferError)> {
        if let Err(e) = self.check_transfer_id(transfer_id) {
            return Err((self, e));
        }

        self.progress.status = FileTransferStatus::Completing;
        self.progress.update_timing(self.started.elapsed());

        let FileTransferSession {
            mut progress,
            checksum,
            writer,
            started,
            ..
        } = self;

        let interrupt = writer.cancel.clone();
        let result = finalize(writer, &progress, &checksum, &interrupt).await;
        progress.update_timing(started.elapsed());
        match &result {
            Ok(path) => {
                progress.status = FileTransferStatus::Complete;
                progress.estimated_remaining_ms = Some(0);
                tracing::info!(
                    "Transfer {} complete: {:?} in {} ms",
                    progress.transfer_id,
                    path,
                    progress.elapsed_ms.unwrap_or(0)
                );
            }
            Err(e) => {
                tracing::error!("Transfer {} failed: {}", progress.transfer_id, e);
                progress.fail(e.code(), e.to_string());
            }
        }

        Ok((progress, result))
    }

    /// Abandon the transfer and delete the partial file
    pub async fn abort(self, code: ErrorCode, reason: &str) -> FileTransferProgress {
        let FileTransferSession {
            mut progress,
            writer,
            started,
            ..
        } = self;

        tracing::warn!("Aborting transfer {}: {}", progress.transfer_id, reason);
        if let Some(sink) = writer.discard().await {
            if let Err(e) = sink.abort_and_delete().await {
                tracing::error!("Failed to delete partial file: {}", e);
            }
        }

        progress.update_timing(started.elapsed());
        progress.fail(code, reason);
        progress
    }
}

async fn finalize<K: StorageSink>(
    writer: ChunkWriter<K>,
    progress: &FileTransferProgress,
    expected_checksum: &str,
    interrupt: &CancellationToken,
) -> Result<PathBuf, TransferError> {
    let (mut sink, write_result) = writer.drain().await?;

    if let Err(e) = write_result {
        discard_sink(sink).await;
        return Err(TransferError::DiskError(e));
    }

    if progress.bytes_received != progress.file_size {
        discard_sink(sink).await;
        return Err(TransferError::IncompleteTransfer(format!(
            "received {}/{} bytes ({}/{} chunks)",
            progress.bytes_received,
            progress.file_size,
            progress.chunks_received,
            progress.total_chunks
        )));
    }

    let checksum = tokio::select! {
        biased;
        _ = interrupt.cancelled() => Err(interrupted()),
        sum = sink.checksum() => sum,
    };
    let actual = match checksum {
        Ok(sum) => sum,
        Err(e) => {
            discard_sink(sink).await;
            return Err(TransferError::DiskError(e));
        }
    };
    if !actual.eq_ignore_ascii_case(expected_checksum.trim()) {
        discard_sink(sink).await;
        return Err(TransferError::ChecksumMismatch {
            expected: expected_checksum.to_string(),
            actual,
        });
    }

    Ok(sink.finalize().await?)
}

async fn discard_sink<K: StorageSink>(sink: K) {
    if let Err(e) = sink.abort_and_delete().await {
        tracing::error!("Failed to delete partial file: {}", e);
    }
}
