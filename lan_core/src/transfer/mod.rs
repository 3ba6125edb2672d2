//! LAN file transfer over newline-delimited JSON on TCP.
//!
//! This module provides:
//! - The wire protocol and its codec
//! - Handshake validation
//! - Per-file receive sessions with a bounded write queue
//! - The receiving server and a reference sender

pub mod constants;
pub mod handshake;
pub mod protocol;
pub mod sender;
pub mod server;
pub mod session;
pub mod utils;

// Re-export public API
pub use constants::{CHUNK_SIZE, LAN_TRANSFER_PROTOCOL_VERSION, TRANSFER_PORT};
pub use protocol::{ClientMessage, FileStart, MessageCodec, ServerMessage};
pub use sender::{SendOptions, SendProgress, SendReport, send_file};
pub use server::TransferServer;
pub use session::FileTransferSession;
