use std::io;
use std::path::Path;
use tokio::fs::File;

use crate::storage::sha256_reader;

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

/// MIME type announced for a file, by extension
pub fn mime_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Compute the SHA-256 of a file, lowercase hex
pub async fn compute_file_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    sha256_reader(&mut file).await
}
