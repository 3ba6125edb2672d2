//! Storage boundary for received files.
//!
//! The transfer session only talks to `Storage`/`StorageSink`; `DiskStorage`
//! is the filesystem implementation used by the server.

use sha2::{Digest, Sha256};
use std::future::Future;
use std::io;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::transfer::constants::MAX_FILENAME_LENGTH;

/// Read buffer for checksum computation (1MB)
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// A place received files can be created in
pub trait Storage: Send + Sync + 'static {
    type Sink: StorageSink;

    /// Free bytes at the destination
    fn available_space(&self) -> impl Future<Output = io::Result<u64>> + Send;

    /// Create a sink for a file of `file_size` bytes
    fn create(
        &self,
        file_name: &str,
        file_size: u64,
    ) -> impl Future<Output = io::Result<Self::Sink>> + Send;
}

/// Destination of one file, exclusively owned by the active transfer
pub trait StorageSink: Send + 'static {
    fn write_at(&mut self, offset: u64, bytes: &[u8])
    -> impl Future<Output = io::Result<()>> + Send;

    /// SHA-256 of everything written so far, lowercase hex
    fn checksum(&mut self) -> impl Future<Output = io::Result<String>> + Send;

    /// Make the file visible at its final location
    fn finalize(self) -> impl Future<Output = io::Result<PathBuf>> + Send;

    fn abort_and_delete(self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Files land in a download directory, written through a hidden part file
#[derive(Debug, Clone)]
pub struct DiskStorage {
    download_dir: PathBuf,
}

impl DiskStorage {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }
}

impl Storage for DiskStorage {
    type Sink = PartFile;

    async fn available_space(&self) -> io::Result<u64> {
        let dir = self.download_dir.clone();
        tokio::task::spawn_blocking(move || disk_space_for(&dir))
            .await
            .map_err(io::Error::other)
    }

    async fn create(&self, file_name: &str, file_size: u64) -> io::Result<PartFile> {
        tokio::fs::create_dir_all(&self.download_dir).await?;

        let file_name = sanitize_file_name(file_name);
        // Named by id alone so a maximal file name still fits
        let part_path = self
            .download_dir
            .join(format!(".lan-transfer-{}.part", uuid::Uuid::new_v4().simple()));

        let file = open_secure_file(&part_path).await?;
        if let Err(e) = file.set_len(file_size).await {
            drop(file);
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(e);
        }

        tracing::debug!("Created part file {:?} ({} bytes)", part_path, file_size);
        Ok(PartFile {
            file,
            part_path,
            dir: self.download_dir.clone(),
            file_name,
        })
    }
}

/// Available space on the disk holding `dir`, by longest mount-point match
fn disk_space_for(dir: &Path) -> u64 {
    let path = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let best = disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len());

    match best {
        Some(disk) => disk.available_space(),
        None => {
            tracing::warn!("No disk found for {:?}, skipping free-space check", path);
            u64::MAX
        }
    }
}

/// Open a file with secure permissions (0o600 on Unix) for read/write
pub async fn open_secure_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    options.open(path).await
}

/// Partially received file
#[derive(Debug)]
pub struct PartFile {
    file: File,
    part_path: PathBuf,
    dir: PathBuf,
    file_name: String,
}

impl PartFile {
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }
}

impl StorageSink for PartFile {
    async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await
    }

    async fn checksum(&mut self) -> io::Result<String> {
        self.file.flush().await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        sha256_reader(&mut self.file).await
    }

    async fn finalize(self) -> io::Result<PathBuf> {
        let PartFile {
            mut file,
            part_path,
            dir,
            file_name,
        } = self;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let final_path = resolve_conflict_path(&dir, &file_name).await;
        if let Err(e) = tokio::fs::rename(&part_path, &final_path).await {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(e);
        }
        tracing::info!("Saved {:?}", final_path);
        Ok(final_path)
    }

    async fn abort_and_delete(self) -> io::Result<()> {
        let PartFile {
            file, part_path, ..
        } = self;
        drop(file);

        match tokio::fs::remove_file(&part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// First free path of `name`, `name (1)`, `name (2)`... in `dir`
async fn resolve_conflict_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let (stem, ext) = match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    };

    let mut n = 1u32;
    loop {
        let suffix = format!(" ({})", n);
        let mut keep = MAX_FILENAME_LENGTH
            .saturating_sub(suffix.len() + ext.len())
            .min(stem.len());
        while !stem.is_char_boundary(keep) {
            keep -= 1;
        }
        let candidate = dir.join(format!("{}{}{}", &stem[..keep], suffix, ext));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// SHA-256 of a byte slice, lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of everything left in `reader`, lowercase hex
pub async fn sha256_reader<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Sanitize file name to prevent path traversal attacks
pub fn sanitize_file_name(file_name: &str) -> String {
    // Last component, whichever separator the sender's platform uses
    let file_name = file_name
        .split(|c| c == '/' || c == '\\')
        .last()
        .unwrap_or("unknown_file");

    let mut clean_name: String = file_name.chars().filter(|c| !c.is_control()).collect();

    let reserved_names = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let stem = clean_name.split('.').next().unwrap_or("");
    if reserved_names.iter().any(|r| stem.eq_ignore_ascii_case(r)) {
        return "unknown_file".to_string();
    }

    if clean_name == ".." || clean_name == "." || clean_name.trim().is_empty() {
        return "unknown_file".to_string();
    }

    if clean_name.len() > MAX_FILENAME_LENGTH {
        // Keep the extension, it is what the allow-list checked
        let ext = match clean_name.rfind('.') {
            Some(idx) if clean_name.len() - idx < 20 => clean_name[idx..].to_string(),
            _ => String::new(),
        };
        let mut cutoff = MAX_FILENAME_LENGTH - ext.len();
        while !clean_name.is_char_boundary(cutoff) {
            cutoff -= 1;
        }
        clean_name.truncate(cutoff);
        clean_name.push_str(&ext);
    }

    clean_name
}
