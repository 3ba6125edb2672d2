use std::time::Duration;

/// Protocol version both ends must declare in the handshake
pub const LAN_TRANSFER_PROTOCOL_VERSION: &str = "1";

/// Default TCP port for the receiver
pub const TRANSFER_PORT: u16 = 53317;

/// Chunk size for file transfer (512KB)
pub const CHUNK_SIZE: u64 = 512 * 1024;

/// Hard limit on the duration of one transfer (10 minutes)
pub const LAN_TRANSFER_GLOBAL_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Time a freshly connected peer has to send its handshake
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Silence on the control channel longer than this means the peer is gone
pub const IDLE_TIMEOUT_SECS: u64 = 60;

/// Consecutive malformed messages tolerated before the connection is closed
pub const MAX_MALFORMED_MESSAGES: u32 = 3;

/// Chunks buffered between the socket reader and the disk writer
pub const WRITE_QUEUE_DEPTH: usize = 8;

/// Longest control line accepted (a base64 chunk is ~700KB)
pub const MAX_LINE_LENGTH: usize = 2 * 1024 * 1024;

pub const MAX_FILENAME_LENGTH: usize = 255;

pub const LAN_TRANSFER_ALLOWED_EXTENSIONS: &[&str] = &[".zip"];

pub const LAN_TRANSFER_ALLOWED_MIME_TYPES: &[&str] =
    &["application/zip", "application/x-zip-compressed"];

/// mDNS service type advertised by the host application
pub const LAN_TRANSFER_SERVICE_TYPE: &str = "cherrystudio";
pub const LAN_TRANSFER_SERVICE_FULL_NAME: &str = "_cherrystudio._tcp";
pub const LAN_TRANSFER_DOMAIN: &str = "local.";

pub fn global_timeout() -> Duration {
    Duration::from_millis(LAN_TRANSFER_GLOBAL_TIMEOUT_MS)
}

/// Number of chunks needed for `file_size` bytes
pub fn total_chunks(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}
