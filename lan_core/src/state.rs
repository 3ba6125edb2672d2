//! Snapshots the server publishes to its host application.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ErrorCode;
use crate::transfer::handshake::ConnectedClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanTransferServerStatus {
    #[default]
    Idle,
    Starting,
    Listening,
    Handshaking,
    Connected,
    ReceivingFile,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTransferStatus {
    #[default]
    Idle,
    Receiving,
    Completing,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferProgress {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_received: u64,
    pub percentage: f64,
    pub chunks_received: u64,
    pub total_chunks: u64,
    pub status: FileTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Unix epoch milliseconds
    pub start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
}

impl FileTransferProgress {
    pub fn new(
        transfer_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        total_chunks: u64,
    ) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            file_name: file_name.into(),
            file_size,
            bytes_received: 0,
            percentage: 0.0,
            chunks_received: 0,
            total_chunks,
            status: FileTransferStatus::Receiving,
            error: None,
            error_code: None,
            start_time: epoch_millis(),
            elapsed_ms: None,
            estimated_remaining_ms: None,
        }
    }

    /// Recompute percentage and estimates from the byte counters
    pub fn update_timing(&mut self, elapsed: Duration) {
        self.percentage = percentage(self.bytes_received, self.file_size);
        let elapsed_ms = elapsed.as_millis() as u64;
        self.elapsed_ms = Some(elapsed_ms);

        self.estimated_remaining_ms = if self.bytes_received == 0 {
            None
        } else {
            let remaining = self.file_size.saturating_sub(self.bytes_received);
            Some((elapsed_ms as f64 * remaining as f64 / self.bytes_received as f64) as u64)
        };
    }

    pub fn fail(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.status = FileTransferStatus::Error;
        self.error = Some(message.into());
        self.error_code = Some(code);
        self.estimated_remaining_ms = None;
    }
}

/// `bytes / total * 100`, clamped to `[0, 100]`
pub fn percentage(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (bytes as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Aggregate server state, owned by `TransferServer`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanTransferState {
    pub status: LanTransferServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_client: Option<ConnectedClient>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_transfer: Option<FileTransferProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_file_path: Option<PathBuf>,
}

/// Events pushed to the host application
#[derive(Debug, Clone)]
pub enum LanEvent {
    StateChanged(LanTransferState),
    TransferCompleted {
        transfer_id: String,
        file_path: PathBuf,
    },
    TransferFailed {
        transfer_id: String,
        code: ErrorCode,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_is_clamped() {
        assert_eq!(percentage(0, 100), 0.0);
        assert_eq!(percentage(50, 200), 25.0);
        assert_eq!(percentage(300, 200), 100.0);
        assert_eq!(percentage(10, 0), 0.0);
    }

    #[test]
    fn test_estimated_remaining() {
        let mut progress = FileTransferProgress::new("t", "a.zip", 1000, 2);
        progress.update_timing(Duration::from_millis(100));
        assert_eq!(progress.estimated_remaining_ms, None);

        progress.bytes_received = 250;
        progress.update_timing(Duration::from_millis(100));
        assert_eq!(progress.percentage, 25.0);
        assert_eq!(progress.elapsed_ms, Some(100));
        assert_eq!(progress.estimated_remaining_ms, Some(300));
    }

    #[test]
    fn test_state_serializes_for_observers() {
        let state = LanTransferState {
            status: LanTransferServerStatus::ReceivingFile,
            port: Some(53317),
            ..Default::default()
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"status":"receiving_file","port":53317}"#);
    }
}
