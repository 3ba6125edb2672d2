//! Error taxonomy for the transfer core.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: String, actual: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Handshake required before {0}")]
    HandshakeRequired(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Invalid chunk layout: {0}")]
    InvalidChunkLayout(String),

    #[error("Insufficient storage: {required} bytes required, {available} available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Incomplete transfer: {0}")]
    IncompleteTransfer(String),

    #[error("Disk error: {0}")]
    DiskError(#[from] std::io::Error),

    #[error("Peer busy: {0}")]
    PeerBusy(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),
}

/// Machine-readable code carried in `file_complete` and `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProtocolVersionMismatch,
    MalformedMessage,
    HandshakeRequired,
    UnsupportedFileType,
    InvalidChunkLayout,
    InsufficientStorage,
    ChecksumMismatch,
    IncompleteTransfer,
    DiskError,
    PeerBusy,
    Timeout,
    TransportClosed,
}

impl TransferError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ProtocolVersionMismatch { .. } => ErrorCode::ProtocolVersionMismatch,
            Self::MalformedMessage(_) => ErrorCode::MalformedMessage,
            Self::HandshakeRequired(_) => ErrorCode::HandshakeRequired,
            Self::UnsupportedFileType(_) => ErrorCode::UnsupportedFileType,
            Self::InvalidChunkLayout(_) => ErrorCode::InvalidChunkLayout,
            Self::InsufficientStorage { .. } => ErrorCode::InsufficientStorage,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::IncompleteTransfer(_) => ErrorCode::IncompleteTransfer,
            Self::DiskError(_) => ErrorCode::DiskError,
            Self::PeerBusy(_) => ErrorCode::PeerBusy,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::TransportClosed(_) => ErrorCode::TransportClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::ChecksumMismatch).unwrap();
        assert_eq!(json, "\"CHECKSUM_MISMATCH\"");

        let json = serde_json::to_string(&ErrorCode::IncompleteTransfer).unwrap();
        assert_eq!(json, "\"INCOMPLETE_TRANSFER\"");

        let code: ErrorCode = serde_json::from_str("\"DISK_ERROR\"").unwrap();
        assert_eq!(code, ErrorCode::DiskError);
    }

    #[test]
    fn test_io_error_maps_to_disk_error() {
        let err: TransferError = std::io::Error::other("device full").into();
        assert_eq!(err.code(), ErrorCode::DiskError);
        assert!(err.to_string().contains("device full"));
    }
}
