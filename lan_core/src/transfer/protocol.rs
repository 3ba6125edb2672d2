//! Control-channel protocol.
//!
//! Every message is a UTF-8 JSON object tagged by `type` and terminated by
//! `\n`. Chunk payloads ride inside `file_chunk` messages as base64.

use crate::error::{ErrorCode, TransferError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::constants::MAX_LINE_LENGTH;

/// Messages from the sending peer to the receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Handshake {
        device_name: String,
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_version: Option<String>,
    },
    /// Stray acknowledgement echoed by some peers; ignored
    HandshakeAck {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// `payload` is echoed back verbatim, whatever its JSON type
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Pong {
        received: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    FileStart(FileStart),
    #[serde(rename_all = "camelCase")]
    FileChunk {
        transfer_id: String,
        chunk_index: u64,
        /// Base64-encoded bytes
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    FileEnd { transfer_id: String },
}

/// Announcement of an incoming file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStart {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    /// SHA-256 of the whole file, hex
    pub checksum: String,
    pub total_chunks: u64,
    pub chunk_size: u64,
}

/// Messages from the receiver back to the sending peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HandshakeAck {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Pong {
        received: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    FileStartAck {
        transfer_id: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete {
        transfer_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl ServerMessage {
    pub fn error(err: &TransferError) -> Self {
        Self::Error {
            message: err.to_string(),
            code: Some(err.code()),
        }
    }
}

/// One decoded line: either a well-formed message or the reason it wasn't
#[derive(Debug)]
pub enum Inbound<T> {
    Message(T),
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Control line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serialize a message as one `\n`-terminated JSON line
pub fn encode_message<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line (without its terminator)
pub fn decode_message<T: DeserializeOwned>(line: &str) -> Result<T, TransferError> {
    let line = line.trim_end_matches('\r');
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| TransferError::MalformedMessage(format!("invalid JSON: {}", e)))?;

    match value.get("type") {
        Some(serde_json::Value::String(_)) => {}
        Some(_) => {
            return Err(TransferError::MalformedMessage(
                "`type` is not a string".to_string(),
            ));
        }
        None => {
            return Err(TransferError::MalformedMessage(
                "missing `type` field".to_string(),
            ));
        }
    }

    serde_json::from_value(value).map_err(|e| TransferError::MalformedMessage(e.to_string()))
}

pub fn encode_chunk(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_chunk(data: &str) -> Result<Bytes, TransferError> {
    STANDARD
        .decode(data)
        .map(Bytes::from)
        .map_err(|e| TransferError::MalformedMessage(format!("invalid base64 chunk: {}", e)))
}

/// Newline-delimited JSON codec.
///
/// Decodes `In` and encodes any serializable message. A line that fails to
/// parse, including one that is not UTF-8, is yielded as `Inbound::Malformed`
/// so the stream survives it.
pub struct MessageCodec<In> {
    lines: AnyDelimiterCodec,
    _marker: PhantomData<fn() -> In>,
}

impl<In> MessageCodec<In> {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                b"\n".to_vec(),
                max_length,
            ),
            _marker: PhantomData,
        }
    }
}

impl<In> Default for MessageCodec<In> {
    fn default() -> Self {
        Self::new()
    }
}

fn map_lines_error(err: AnyDelimiterCodecError, max_length: usize) -> CodecError {
    match err {
        AnyDelimiterCodecError::MaxChunkLengthExceeded => CodecError::LineTooLong(max_length),
        AnyDelimiterCodecError::Io(e) => CodecError::Io(e),
    }
}

impl<In: DeserializeOwned> MessageCodec<In> {
    fn parse(line: Bytes) -> Option<Inbound<In>> {
        let line = match std::str::from_utf8(&line) {
            Ok(line) => line,
            Err(e) => return Some(Inbound::Malformed(format!("line is not UTF-8: {}", e))),
        };
        if line.trim().is_empty() {
            return None;
        }
        Some(match decode_message(line) {
            Ok(msg) => Inbound::Message(msg),
            Err(TransferError::MalformedMessage(reason)) => Inbound::Malformed(reason),
            Err(e) => Inbound::Malformed(e.to_string()),
        })
    }
}

impl<In: DeserializeOwned> Decoder for MessageCodec<In> {
    type Item = Inbound<In>;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let max = self.lines.max_length();
        loop {
            match self.lines.decode(buf).map_err(|e| map_lines_error(e, max))? {
                Some(line) => match Self::parse(line) {
                    Some(item) => return Ok(Some(item)),
                    None => continue,
                },
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let max = self.lines.max_length();
        loop {
            match self
                .lines
                .decode_eof(buf)
                .map_err(|e| map_lines_error(e, max))?
            {
                Some(line) => match Self::parse(line) {
                    Some(item) => return Ok(Some(item)),
                    None => continue,
                },
                None => return Ok(None),
            }
        }
    }
}

impl<In, Out: Serialize> Encoder<&Out> for MessageCodec<In> {
    type Error = CodecError;

    fn encode(&mut self, msg: &Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(msg)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
