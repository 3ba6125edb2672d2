//! Sending side of the protocol: the desktop peer pushing one file.

use anyhow::{Context, Result, anyhow, bail};
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::constants::{CHUNK_SIZE, LAN_TRANSFER_PROTOCOL_VERSION, total_chunks};
use super::protocol::{ClientMessage, FileStart, Inbound, MessageCodec, ServerMessage, encode_chunk};
use super::utils::{compute_file_hash, format_transfer_speed, mime_type_for};

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub device_name: String,
    pub platform: Option<String>,
    pub app_version: Option<String>,
    pub chunk_size: u64,
    /// Longest wait for any single reply from the receiver
    pub reply_timeout: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            device_name: sysinfo::System::host_name().unwrap_or_else(|| "Unknown".to_string()),
            platform: Some(std::env::consts::OS.to_string()),
            app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            chunk_size: CHUNK_SIZE,
            reply_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendProgress {
    pub transfer_id: String,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub chunks_sent: u64,
    pub total_chunks: u64,
    pub speed: String,
}

#[derive(Debug, Clone)]
pub struct SendReport {
    pub transfer_id: String,
    /// Where the receiver stored the file
    pub remote_path: Option<String>,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

/// Connect to a receiver and push `path`
pub async fn send_file(
    addr: SocketAddr,
    path: &Path,
    options: &SendOptions,
    progress_tx: Option<mpsc::Sender<SendProgress>>,
) -> Result<SendReport> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    stream.set_nodelay(true)?;
    tracing::info!("Connected to receiver {}", addr);

    send_file_over(stream, path, options, progress_tx).await
}

/// Push `path` over an already connected stream
pub async fn send_file_over<T>(
    stream: T,
    path: &Path,
    options: &SendOptions,
    progress_tx: Option<mpsc::Sender<SendProgress>>,
) -> Result<SendReport>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let file_size = file.metadata().await?.len();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid file name: {}", path.display()))?
        .to_string();

    tracing::info!("Computing checksum for {} ({} bytes)", file_name, file_size);
    let checksum = compute_file_hash(path).await?;

    let mut framed = Framed::new(stream, MessageCodec::<ServerMessage>::new());

    framed
        .send(&ClientMessage::Handshake {
            device_name: options.device_name.clone(),
            version: LAN_TRANSFER_PROTOCOL_VERSION.to_string(),
            platform: options.platform.clone(),
            app_version: options.app_version.clone(),
        })
        .await?;
    match next_reply(&mut framed, options.reply_timeout).await? {
        ServerMessage::HandshakeAck { accepted: true, .. } => {}
        ServerMessage::HandshakeAck { message, .. } => {
            bail!(
                "Handshake rejected: {}",
                message.unwrap_or_else(|| "no reason given".to_string())
            );
        }
        other => bail!("Expected handshake_ack, got {:?}", other),
    }

    let transfer_id = uuid::Uuid::new_v4().to_string();
    let chunk_count = total_chunks(file_size, options.chunk_size);
    framed
        .send(&ClientMessage::FileStart(FileStart {
            transfer_id: transfer_id.clone(),
            file_name: file_name.clone(),
            file_size,
            mime_type: mime_type_for(path).to_string(),
            checksum,
            total_chunks: chunk_count,
            chunk_size: options.chunk_size,
        }))
        .await?;
    match next_reply(&mut framed, options.reply_timeout).await? {
        ServerMessage::FileStartAck { accepted: true, .. } => {}
        ServerMessage::FileStartAck { message, .. } => {
            bail!(
                "Transfer rejected: {}",
                message.unwrap_or_else(|| "no reason given".to_string())
            );
        }
        other => bail!("Expected file_start_ack, got {:?}", other),
    }

    let start_time = Instant::now();
    let mut buffer = vec![0u8; options.chunk_size as usize];
    let mut sent: u64 = 0;

    for chunk_index in 0..chunk_count {
        let len = (file_size - sent).min(options.chunk_size) as usize;
        file.read_exact(&mut buffer[..len]).await?;

        framed
            .send(&ClientMessage::FileChunk {
                transfer_id: transfer_id.clone(),
                chunk_index,
                data: encode_chunk(&buffer[..len]),
            })
            .await?;
        sent += len as u64;

        // The receiver may give up mid-stream (watchdog, disk error)
        if let Some(frame) = framed.next().now_or_never() {
            let reply = reply_from(frame)?;
            return Err(unexpected_mid_stream(reply));
        }

        if let Some(tx) = &progress_tx {
            let speed = format_transfer_speed(sent, start_time.elapsed().as_secs_f64());
            let _ = tx.try_send(SendProgress {
                transfer_id: transfer_id.clone(),
                bytes_sent: sent,
                total_bytes: file_size,
                chunks_sent: chunk_index + 1,
                total_chunks: chunk_count,
                speed,
            });
        }
    }

    framed
        .send(&ClientMessage::FileEnd {
            transfer_id: transfer_id.clone(),
        })
        .await?;

    match next_reply(&mut framed, options.reply_timeout).await? {
        ServerMessage::FileComplete {
            success: true,
            file_path,
            ..
        } => {
            let elapsed = start_time.elapsed();
            tracing::info!(
                "Sent {} ({} bytes) in {:.1}s ({})",
                file_name,
                sent,
                elapsed.as_secs_f64(),
                format_transfer_speed(sent, elapsed.as_secs_f64())
            );
            Ok(SendReport {
                transfer_id,
                remote_path: file_path,
                bytes_sent: sent,
                elapsed,
            })
        }
        other => Err(unexpected_mid_stream(other)),
    }
}

fn unexpected_mid_stream(reply: ServerMessage) -> anyhow::Error {
    match reply {
        ServerMessage::FileComplete {
            error, error_code, ..
        } => anyhow!(
            "Receiver failed the transfer ({:?}): {}",
            error_code,
            error.unwrap_or_default()
        ),
        ServerMessage::Error { message, code } => {
            anyhow!("Receiver error ({:?}): {}", code, message)
        }
        other => anyhow!("Unexpected reply from receiver: {:?}", other),
    }
}

type Frame = Option<Result<Inbound<ServerMessage>, super::protocol::CodecError>>;

fn reply_from(frame: Frame) -> Result<ServerMessage> {
    match frame {
        Some(Ok(Inbound::Message(msg))) => Ok(msg),
        Some(Ok(Inbound::Malformed(reason))) => bail!("Malformed reply from receiver: {}", reason),
        Some(Err(e)) => Err(e.into()),
        None => bail!("Receiver closed the connection"),
    }
}

/// Next reply that is not a `pong`
async fn next_reply<T>(
    framed: &mut Framed<T, MessageCodec<ServerMessage>>,
    wait: Duration,
) -> Result<ServerMessage>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = timeout(wait, framed.next())
            .await
            .map_err(|_| anyhow!("Timed out waiting for the receiver"))?;
        match reply_from(frame)? {
            ServerMessage::Pong { .. } => continue,
            msg => return Ok(msg),
        }
    }
}
