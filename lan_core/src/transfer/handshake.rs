//! Version/identity check performed before any file data flows.

use serde::{Deserialize, Serialize};

use super::constants::LAN_TRANSFER_PROTOCOL_VERSION;
use super::protocol::ServerMessage;
use crate::error::TransferError;

/// Identity the peer declared in its handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedClient {
    pub device_name: String,
    pub platform: Option<String>,
    pub version: String,
    pub app_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingHandshake,
    Accepted(ConnectedClient),
    Rejected(String),
}

/// Handshake state for one connection
#[derive(Debug)]
pub struct Handshake {
    supported_version: String,
    state: HandshakeState,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(LAN_TRANSFER_PROTOCOL_VERSION)
    }
}

impl Handshake {
    pub fn new(supported_version: impl Into<String>) -> Self {
        Self {
            supported_version: supported_version.into(),
            state: HandshakeState::AwaitingHandshake,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn client(&self) -> Option<&ConnectedClient> {
        match &self.state {
            HandshakeState::Accepted(client) => Some(client),
            _ => None,
        }
    }

    /// Validate a `handshake` message and produce the `handshake_ack` to send.
    ///
    /// Only the first handshake on a connection is evaluated; later ones are
    /// refused with `PeerBusy` and leave the state untouched.
    pub fn evaluate(
        &mut self,
        device_name: String,
        version: String,
        platform: Option<String>,
        app_version: Option<String>,
    ) -> Result<ServerMessage, TransferError> {
        match self.state {
            HandshakeState::AwaitingHandshake => {}
            HandshakeState::Accepted(_) => {
                return Err(TransferError::PeerBusy(
                    "a handshake was already accepted on this connection".to_string(),
                ));
            }
            HandshakeState::Rejected(_) => {
                return Err(TransferError::PeerBusy(
                    "handshake was already rejected".to_string(),
                ));
            }
        }

        if version != self.supported_version {
            let err = TransferError::ProtocolVersionMismatch {
                expected: self.supported_version.clone(),
                actual: version,
            };
            self.state = HandshakeState::Rejected(err.to_string());
            return Ok(ServerMessage::HandshakeAck {
                accepted: false,
                message: Some(err.to_string()),
            });
        }

        if device_name.trim().is_empty() {
            let reason = "deviceName must not be empty".to_string();
            self.state = HandshakeState::Rejected(reason.clone());
            return Ok(ServerMessage::HandshakeAck {
                accepted: false,
                message: Some(reason),
            });
        }

        self.state = HandshakeState::Accepted(ConnectedClient {
            device_name,
            platform,
            version,
            app_version,
        });
        Ok(ServerMessage::HandshakeAck {
            accepted: true,
            message: None,
        })
    }
}
