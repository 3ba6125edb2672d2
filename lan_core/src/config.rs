use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::transfer::constants::{
    CHUNK_SIZE, HANDSHAKE_TIMEOUT_SECS, IDLE_TIMEOUT_SECS, MAX_MALFORMED_MESSAGES, TRANSFER_PORT,
    WRITE_QUEUE_DEPTH, global_timeout,
};

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "lan";
const APP_NAME: &str = "lan_transfer";
const RECEIVED_DIR: &str = "received";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    /// 0 lets the OS pick
    pub port: u16,
    pub download_dir: PathBuf,
    pub chunk_size: u64,
    /// Watchdog on a whole transfer, armed at `file_start`
    pub transfer_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Silence after which the peer is considered gone
    pub idle_timeout: Duration,
    pub max_malformed_messages: u32,
    pub write_queue_depth: usize,
    /// Failed transfers close the connection and park the server in `error`
    pub close_on_transfer_error: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: TRANSFER_PORT,
            download_dir: get_download_dir(),
            chunk_size: CHUNK_SIZE,
            transfer_timeout: global_timeout(),
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
            max_malformed_messages: MAX_MALFORMED_MESSAGES,
            write_queue_depth: WRITE_QUEUE_DEPTH,
            close_on_transfer_error: false,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `LAN_TRANSFER_*` variables (a `.env` file is honoured)
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("LAN_TRANSFER_PORT") {
            config.port = port;
        }
        if let Some(bind) = env_parse::<IpAddr>("LAN_TRANSFER_BIND") {
            config.bind_addr = bind;
        }
        if let Ok(dir) = std::env::var("LAN_TRANSFER_DOWNLOAD_DIR") {
            if !dir.trim().is_empty() {
                config.download_dir = PathBuf::from(dir);
            }
        }
        if let Some(secs) = env_parse::<u64>("LAN_TRANSFER_TIMEOUT_SECS") {
            config.transfer_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("LAN_TRANSFER_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(close) = env_parse::<bool>("LAN_TRANSFER_CLOSE_ON_ERROR") {
            config.close_on_transfer_error = close;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

/// Where received files are stored unless configured otherwise
pub fn get_download_dir() -> PathBuf {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.data_dir().join(RECEIVED_DIR))
        .unwrap_or_else(|| PathBuf::from(".").join(RECEIVED_DIR))
}
