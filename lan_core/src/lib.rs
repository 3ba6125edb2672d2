pub mod config;
pub mod error;
pub mod pairing;
pub mod state;
pub mod storage;
pub mod transfer;

pub use config::ServerConfig;
pub use error::{ErrorCode, TransferError};
pub use pairing::{ConnectionInfo, PairingError};
pub use state::{FileTransferProgress, LanEvent, LanTransferServerStatus, LanTransferState};
pub use storage::{DiskStorage, Storage, StorageSink};
pub use transfer::TransferServer;
