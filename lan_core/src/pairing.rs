//! Pairing codes for out-of-band connection setup.
//!
//! A `ConnectionInfo` is compressed into a fixed-shape JSON tuple
//! `["CSA", selectedIp, [candidateIps], port, timestamp]` that is small
//! enough to render as a QR code. IPv4 addresses travel as `u32`.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Magic token at the head of every compressed pairing code
pub const PAIRING_MAGIC: &str = "CSA";

/// `type` of a connection info produced by this application
pub const CONNECTION_INFO_TYPE: &str = "cherry-studio-app";

/// Pairing codes older than this should not be trusted
pub const PAIRING_CODE_MAX_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("Invalid pairing code: {0}")]
    InvalidPairingCode(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// One address the receiver may be reachable at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub host: String,
    /// Not carried by the compressed form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Not carried by the compressed form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

impl Candidate {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            interface: None,
            priority: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    #[serde(rename = "type")]
    pub kind: String,
    /// Ordered by descending connect priority
    pub candidates: Vec<Candidate>,
    pub selected_host: Option<String>,
    pub port: u16,
    /// Unix epoch milliseconds
    pub timestamp: u64,
}

/// Wire form: `["CSA", selectedIp | null, [candidateIps], port, timestamp]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedConnectionInfo(
    pub String,
    pub Option<u32>,
    pub Vec<u32>,
    pub u16,
    pub u64,
);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

fn ip_to_int(host: &str) -> Result<u32, PairingError> {
    host.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| PairingError::InvalidAddress(host.to_string()))
}

fn int_to_ip(value: u32) -> String {
    Ipv4Addr::from(value).to_string()
}

/// Compress a connection info for the QR payload
pub fn encode(info: &ConnectionInfo) -> Result<CompressedConnectionInfo, PairingError> {
    let selected = info.selected_host.as_deref().map(ip_to_int).transpose()?;
    let candidates = info
        .candidates
        .iter()
        .map(|c| ip_to_int(&c.host))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompressedConnectionInfo(
        PAIRING_MAGIC.to_string(),
        selected,
        candidates,
        info.port,
        info.timestamp,
    ))
}

/// Expand a compressed pairing code. Interface and priority are not recoverable.
pub fn decode(code: CompressedConnectionInfo) -> Result<ConnectionInfo, PairingError> {
    let CompressedConnectionInfo(magic, selected, candidates, port, timestamp) = code;
    if magic != PAIRING_MAGIC {
        return Err(PairingError::InvalidPairingCode(format!(
            "unexpected magic token {:?}",
            magic
        )));
    }

    Ok(ConnectionInfo {
        kind: CONNECTION_INFO_TYPE.to_string(),
        candidates: candidates
            .into_iter()
            .map(|ip| Candidate::new(int_to_ip(ip)))
            .collect(),
        selected_host: selected.map(int_to_ip),
        port,
        timestamp,
    })
}

/// Render the compressed form as the JSON text embedded in the QR code
pub fn encode_to_string(info: &ConnectionInfo) -> Result<String, PairingError> {
    let compressed = encode(info)?;
    serde_json::to_string(&compressed)
        .map_err(|e| PairingError::InvalidPairingCode(e.to_string()))
}

/// Parse the JSON text scanned from a QR code
pub fn decode_str(payload: &str) -> Result<ConnectionInfo, PairingError> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| PairingError::InvalidPairingCode(e.to_string()))?;

    match value.as_array() {
        Some(items) if items.len() == 5 => {}
        Some(items) => {
            return Err(PairingError::InvalidPairingCode(format!(
                "expected 5 elements, got {}",
                items.len()
            )));
        }
        None => {
            return Err(PairingError::InvalidPairingCode(
                "payload is not an array".to_string(),
            ));
        }
    }

    if value[0].as_str() != Some(PAIRING_MAGIC) {
        return Err(PairingError::InvalidPairingCode(format!(
            "unexpected magic token {}",
            value[0]
        )));
    }

    let code: CompressedConnectionInfo = serde_json::from_value(value)
        .map_err(|e| PairingError::InvalidPairingCode(e.to_string()))?;
    decode(code)
}

impl ConnectionInfo {
    /// Build connection info from the local IPv4 interfaces
    pub fn for_local_interfaces(port: u16) -> Self {
        let candidates = local_candidates();
        let selected_host = candidates.first().map(|c| c.host.clone());
        Self {
            kind: CONNECTION_INFO_TYPE.to_string(),
            candidates,
            selected_host,
            port,
            timestamp: now_millis(),
        }
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        let age = now_millis().saturating_sub(self.timestamp);
        age > max_age.as_millis() as u64
    }

    /// Hosts in the order a client should try them
    pub fn connect_order(&self) -> Vec<String> {
        let mut hosts = Vec::with_capacity(self.candidates.len() + 1);
        if let Some(selected) = &self.selected_host {
            hosts.push(selected.clone());
        }
        for candidate in &self.candidates {
            if !hosts.contains(&candidate.host) {
                hosts.push(candidate.host.clone());
            }
        }
        hosts
    }
}

/// Rank an address: private LAN ranges first, 192.168.x.x best
fn lan_priority(ip: &Ipv4Addr) -> u32 {
    let octets = ip.octets();
    match octets {
        [192, 168, _, _] => 3,
        [10, _, _, _] => 2,
        [172, b, _, _] if (16..=31).contains(&b) => 1,
        _ => 0,
    }
}

/// Enumerate IPv4, non-loopback interfaces ranked by connect priority
pub fn local_candidates() -> Vec<Candidate> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!("Failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };

    rank_candidates(interfaces)
}

fn rank_candidates(interfaces: Vec<(String, IpAddr)>) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = interfaces
        .into_iter()
        .filter_map(|(name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(Candidate {
                host: v4.to_string(),
                interface: Some(name),
                priority: Some(lan_priority(&v4)),
            }),
            _ => None,
        })
        .collect();

    // Stable sort keeps enumeration order within a rank
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
    candidates
}
