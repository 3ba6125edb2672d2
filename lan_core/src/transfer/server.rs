//! Listening socket lifecycle and the per-peer connection state machine.
//!
//! One peer is served at a time. The accept loop owns the active peer task;
//! further connections are answered with a busy rejection and closed.

use futures_util::{SinkExt, StreamExt};
use std::future::pending;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::handshake::{Handshake, HandshakeState};
use super::protocol::{ClientMessage, CodecError, FileStart, Inbound, MessageCodec, ServerMessage};
use super::session::{ChunkOutcome, FileTransferSession};
use super::utils::format_transfer_speed;
use crate::config::ServerConfig;
use crate::error::{ErrorCode, TransferError};
use crate::state::{
    FileTransferProgress, FileTransferStatus, LanEvent, LanTransferServerStatus, LanTransferState,
};
use crate::storage::{DiskStorage, Storage};

/// How a peer connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerExit {
    /// Peer gone; keep listening. Carries the failure, if any
    Disconnected(Option<String>),
    /// Stop listening and park the server in `error`
    Fatal(String),
    Cancelled,
}

type Reply = Result<Option<PeerExit>, CodecError>;

/// What cut a pending disk operation short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Stopped,
    TimedOut,
}

struct ServerInner<S> {
    config: ServerConfig,
    storage: S,
    state_tx: watch::Sender<LanTransferState>,
    event_tx: mpsc::Sender<LanEvent>,
}

impl<S> ServerInner<S> {
    fn new(config: ServerConfig, storage: S, event_tx: mpsc::Sender<LanEvent>) -> Self {
        let (state_tx, _) = watch::channel(LanTransferState::default());
        Self {
            config,
            storage,
            state_tx,
            event_tx,
        }
    }

    /// Mutate the state and publish the new snapshot
    fn update(&self, f: impl FnOnce(&mut LanTransferState)) {
        self.state_tx.send_modify(f);
        let snapshot = self.state_tx.borrow().clone();
        self.emit(LanEvent::StateChanged(snapshot));
    }

    /// Never blocks the connection; a full or closed sink drops the event
    fn emit(&self, event: LanEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Event not delivered: {}", e);
        }
    }

    /// Publish the state a finished peer leaves behind
    fn settle(&self, exit: PeerExit) {
        match exit {
            PeerExit::Disconnected(reason) => {
                self.update(|state| {
                    state.status = LanTransferServerStatus::Listening;
                    state.connected_client = None;
                    if reason.is_some() {
                        state.last_error = reason;
                    }
                });
            }
            PeerExit::Fatal(reason) => {
                tracing::error!("Transfer server stopping: {}", reason);
                self.update(|state| {
                    state.status = LanTransferServerStatus::Error;
                    state.connected_client = None;
                    state.last_error = Some(reason);
                });
            }
            PeerExit::Cancelled => {}
        }
    }
}

struct RunningServer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Receiver side of the LAN transfer protocol
pub struct TransferServer<S: Storage> {
    inner: Arc<ServerInner<S>>,
    running: Mutex<Option<RunningServer>>,
}

impl TransferServer<DiskStorage> {
    /// Server writing into `config.download_dir`
    pub fn with_disk_storage(config: ServerConfig, event_tx: mpsc::Sender<LanEvent>) -> Self {
        let storage = DiskStorage::new(config.download_dir.clone());
        Self::new(config, storage, event_tx)
    }
}

impl<S: Storage> TransferServer<S> {
    pub fn new(config: ServerConfig, storage: S, event_tx: mpsc::Sender<LanEvent>) -> Self {
        Self {
            inner: Arc::new(ServerInner::new(config, storage, event_tx)),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Current state snapshot
    pub fn state(&self) -> LanTransferState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LanTransferState> {
        self.inner.state_tx.subscribe()
    }

    /// Bind and start accepting peers. Returns the bound port.
    ///
    /// Allowed from `idle` and `error`; while running this returns the
    /// current port without rebinding.
    pub async fn start(&self) -> io::Result<u16> {
        let mut running = self.running.lock().await;

        if let Some(server) = running.as_ref() {
            if !server.task.is_finished() {
                if let Some(port) = self.inner.state_tx.borrow().port {
                    return Ok(port);
                }
            }
        }
        if let Some(previous) = running.take() {
            previous.cancel.cancel();
            let _ = previous.task.await;
        }

        self.inner.update(|state| {
            *state = LanTransferState {
                status: LanTransferServerStatus::Starting,
                ..Default::default()
            };
        });

        let addr = SocketAddr::new(self.inner.config.bind_addr, self.inner.config.port);
        let bound = match TcpListener::bind(addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!("Failed to listen on {}: {}", addr, e);
                self.inner.update(|state| {
                    state.status = LanTransferServerStatus::Error;
                    state.last_error = Some(format!("Failed to listen on {}: {}", addr, e));
                });
                return Err(e);
            }
        };

        let port = local.port();
        tracing::info!("Listening for transfers on {}", local);
        self.inner.update(|state| {
            state.status = LanTransferServerStatus::Listening;
            state.port = Some(port);
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(self.inner.clone(), listener, cancel.clone()));
        *running = Some(RunningServer { cancel, task });

        Ok(port)
    }

    /// Stop listening, drop the peer and any partial file. Status becomes `idle`.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(server) = running.take() {
            server.cancel.cancel();
            if let Err(e) = server.task.await {
                tracing::error!("Accept loop failed: {}", e);
            }
            tracing::info!("Transfer server stopped");
        }
        self.inner.update(|state| *state = LanTransferState::default());
    }
}

impl<S: Storage> Drop for TransferServer<S> {
    fn drop(&mut self) {
        if let Some(server) = self.running.get_mut().take() {
            server.cancel.cancel();
        }
    }
}

async fn accept_loop<S: Storage>(
    inner: Arc<ServerInner<S>>,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    let peers = cancel.child_token();
    let mut active: Option<JoinHandle<PeerExit>> = None;
    let mut fatal = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            exit = join_peer(&mut active) => match exit {
                PeerExit::Fatal(_) => {
                    fatal = Some(exit);
                    break;
                }
                exit => {
                    inner.settle(exit);
                }
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let peer = addr.to_string();
                    if active.is_some() {
                        tracing::warn!("Rejecting {}: another peer is connected", peer);
                        let wait = inner.config.handshake_timeout;
                        tokio::spawn(reject_busy(stream, peer, wait));
                        continue;
                    }

                    tracing::info!("Peer connected: {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let inner = inner.clone();
                    let cancel = peers.child_token();
                    active = Some(tokio::spawn(async move {
                        serve_peer(&inner, stream, peer, cancel).await
                    }));
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    fatal = Some(PeerExit::Fatal(format!("Accept failed: {}", e)));
                    break;
                }
            },
        }
    }

    // Nobody may connect once the server reports `error`
    drop(listener);
    peers.cancel();
    if let Some(handle) = active.take() {
        let _ = handle.await;
    }
    if let Some(exit) = fatal {
        inner.settle(exit);
    }
}

async fn join_peer(active: &mut Option<JoinHandle<PeerExit>>) -> PeerExit {
    let Some(handle) = active.as_mut() else {
        return pending().await;
    };
    let exit = match handle.await {
        Ok(exit) => exit,
        Err(e) => PeerExit::Fatal(format!("Connection task failed: {}", e)),
    };
    *active = None;
    exit
}

/// Answer the first message of a surplus connection, then close it
async fn reject_busy<T>(stream: T, peer: String, wait: std::time::Duration)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, MessageCodec::<ClientMessage>::new());
    let busy = TransferError::PeerBusy("another peer is already connected".to_string());

    let reply = match timeout(wait, framed.next()).await {
        Ok(Some(Ok(Inbound::Message(ClientMessage::Handshake { .. })))) => {
            ServerMessage::HandshakeAck {
                accepted: false,
                message: Some(busy.to_string()),
            }
        }
        Ok(Some(Ok(_))) => ServerMessage::error(&busy),
        _ => return,
    };

    if let Err(e) = framed.send(&reply).await {
        tracing::debug!("Failed to send busy rejection to {}: {}", peer, e);
    }
}

/// Drive one peer connection until it ends. The stream can be any transport.
async fn serve_peer<S, T>(
    inner: &ServerInner<S>,
    stream: T,
    peer: String,
    cancel: CancellationToken,
) -> PeerExit
where
    S: Storage,
    T: AsyncRead + AsyncWrite + Unpin,
{
    inner.update(|state| {
        state.status = LanTransferServerStatus::Handshaking;
        state.connected_client = None;
    });

    let connection = PeerConnection {
        inner,
        framed: Framed::new(stream, MessageCodec::new()),
        peer,
        cancel,
        handshake: Handshake::default(),
        session: None,
        watchdog: None,
        malformed: 0,
    };
    connection.run().await
}

async fn watchdog(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

fn message_kind(msg: &ClientMessage) -> &'static str {
    match msg {
        ClientMessage::Handshake { .. } => "handshake",
        ClientMessage::HandshakeAck { .. } => "handshake_ack",
        ClientMessage::Ping { .. } => "ping",
        ClientMessage::Pong { .. } => "pong",
        ClientMessage::FileStart(_) => "file_start",
        ClientMessage::FileChunk { .. } => "file_chunk",
        ClientMessage::FileEnd { .. } => "file_end",
    }
}

struct PeerConnection<'a, S: Storage, T> {
    inner: &'a ServerInner<S>,
    framed: Framed<T, MessageCodec<ClientMessage>>,
    peer: String,
    cancel: CancellationToken,
    handshake: Handshake,
    session: Option<FileTransferSession<S::Sink>>,
    /// Deadline of the active transfer
    watchdog: Option<Instant>,
    /// Consecutive malformed messages
    malformed: u32,
}

impl<S, T> PeerConnection<'_, S, T>
where
    S: Storage,
    T: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self) -> PeerExit {
        let inner = self.inner;
        let cancel = self.cancel.clone();
        let config = &inner.config;
        let handshake_deadline = Instant::now() + config.handshake_timeout;
        let idle_timeout = config.idle_timeout;
        let mut last_seen = Instant::now();

        let exit = loop {
            let awaiting_handshake = matches!(
                self.handshake.state(),
                HandshakeState::AwaitingHandshake
            );

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => break PeerExit::Cancelled,
                _ = watchdog(self.watchdog) => self.on_watchdog().await,
                _ = sleep_until(handshake_deadline), if awaiting_handshake => {
                    let err = TransferError::Timeout(format!(
                        "no handshake from {} within {:?}",
                        self.peer, config.handshake_timeout
                    ));
                    break PeerExit::Disconnected(Some(err.to_string()));
                }
                _ = sleep_until(last_seen + idle_timeout) => {
                    let err = TransferError::Timeout(format!(
                        "no traffic from {} for {:?}",
                        self.peer, idle_timeout
                    ));
                    break PeerExit::Disconnected(Some(err.to_string()));
                }
                frame = self.framed.next() => {
                    last_seen = Instant::now();
                    match frame {
                        None => break PeerExit::Disconnected(None),
                        Some(Err(e)) => {
                            let err = TransferError::TransportClosed(e.to_string());
                            break PeerExit::Disconnected(Some(err.to_string()));
                        }
                        Some(Ok(Inbound::Malformed(reason))) => {
                            self.on_malformed(TransferError::MalformedMessage(reason)).await
                        }
                        Some(Ok(Inbound::Message(msg))) => self.dispatch(msg).await,
                    }
                }
            };

            match step {
                Ok(None) => {}
                Ok(Some(exit)) => break exit,
                Err(_) if cancel.is_cancelled() => break PeerExit::Cancelled,
                Err(e) => {
                    let err = TransferError::TransportClosed(format!(
                        "failed to reply to {}: {}",
                        self.peer, e
                    ));
                    break PeerExit::Disconnected(Some(err.to_string()));
                }
            }
        };

        tracing::info!("Peer {} finished: {:?}", self.peer, exit);
        self.release_session(&exit).await;
        exit
    }

    /// Abort whatever transfer the ending connection left behind
    async fn release_session(&mut self, exit: &PeerExit) {
        let Some(session) = self.session.take() else {
            return;
        };

        let reason = match exit {
            PeerExit::Cancelled => "server stopped",
            PeerExit::Disconnected(None) => "peer disconnected",
            PeerExit::Disconnected(Some(reason)) | PeerExit::Fatal(reason) => reason.as_str(),
        };
        let progress = session.abort(ErrorCode::TransportClosed, reason).await;
        if *exit == PeerExit::Cancelled {
            return;
        }

        self.inner.emit(LanEvent::TransferFailed {
            transfer_id: progress.transfer_id.clone(),
            code: ErrorCode::TransportClosed,
            message: reason.to_string(),
        });
        self.inner.update(|state| {
            state.file_transfer = Some(progress);
            state.last_error = Some(reason.to_string());
        });
    }

    /// A peer that stops reading must not hold up `stop()`
    async fn send(&mut self, msg: ServerMessage) -> Result<(), CodecError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CodecError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "server stopping",
            ))),
            sent = self.framed.send(&msg) => sent,
        }
    }

    async fn dispatch(&mut self, msg: ClientMessage) -> Reply {
        match msg {
            ClientMessage::Handshake {
                device_name,
                version,
                platform,
                app_version,
            } => {
                self.malformed = 0;
                self.on_handshake(device_name, version, platform, app_version)
                    .await
            }
            ClientMessage::Ping { payload } => {
                self.malformed = 0;
                self.send(ServerMessage::Pong {
                    received: true,
                    payload,
                })
                .await?;
                Ok(None)
            }
            ClientMessage::HandshakeAck { .. } | ClientMessage::Pong { .. } => {
                self.malformed = 0;
                tracing::debug!("Ignoring {} from {}", message_kind(&msg), self.peer);
                Ok(None)
            }
            other if self.handshake.client().is_none() => {
                let err = TransferError::HandshakeRequired(message_kind(&other).to_string());
                tracing::warn!("{} from {}", err, self.peer);
                self.send(ServerMessage::error(&err)).await?;
                Ok(None)
            }
            ClientMessage::FileStart(start) => {
                self.malformed = 0;
                self.on_file_start(start).await
            }
            ClientMessage::FileChunk {
                transfer_id,
                chunk_index,
                data,
            } => self.on_file_chunk(transfer_id, chunk_index, data).await,
            ClientMessage::FileEnd { transfer_id } => self.on_file_end(transfer_id).await,
        }
    }

    async fn on_malformed(&mut self, err: TransferError) -> Reply {
        self.malformed += 1;
        let limit = self.inner.config.max_malformed_messages;
        tracing::warn!(
            "Malformed message from {} ({}/{}): {}",
            self.peer,
            self.malformed,
            limit,
            err
        );
        self.send(ServerMessage::error(&err)).await?;

        if self.malformed > limit {
            let closed = TransferError::TransportClosed(format!(
                "{} consecutive malformed messages from {}",
                self.malformed, self.peer
            ));
            return Ok(Some(PeerExit::Fatal(closed.to_string())));
        }
        Ok(None)
    }

    async fn on_handshake(
        &mut self,
        device_name: String,
        version: String,
        platform: Option<String>,
        app_version: Option<String>,
    ) -> Reply {
        let ack = match self
            .handshake
            .evaluate(device_name, version, platform, app_version)
        {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!("Repeated handshake from {}: {}", self.peer, e);
                self.send(ServerMessage::error(&e)).await?;
                return Ok(None);
            }
        };

        match self.handshake.state().clone() {
            HandshakeState::Accepted(client) => {
                tracing::info!(
                    "Handshake accepted: {} ({}) from {}",
                    client.device_name,
                    client.platform.as_deref().unwrap_or("unknown platform"),
                    self.peer
                );
                self.inner.update(|state| {
                    state.status = LanTransferServerStatus::Connected;
                    state.connected_client = Some(client);
                });
                self.send(ack).await?;
                Ok(None)
            }
            HandshakeState::Rejected(reason) => {
                tracing::warn!("Handshake rejected for {}: {}", self.peer, reason);
                self.send(ack).await?;
                Ok(Some(PeerExit::Fatal(reason)))
            }
            HandshakeState::AwaitingHandshake => Ok(None),
        }
    }

    async fn on_file_start(&mut self, start: FileStart) -> Reply {
        if let Some(active) = &self.session {
            let message = format!("Transfer {} is already in progress", active.transfer_id());
            tracing::warn!("Rejecting file_start {}: {}", start.transfer_id, message);
            self.send(ServerMessage::FileStartAck {
                transfer_id: start.transfer_id,
                accepted: false,
                message: Some(message),
            })
            .await?;
            return Ok(None);
        }

        let inner = self.inner;
        let config = &inner.config;
        let opened = FileTransferSession::open(
            &inner.storage,
            &start,
            config.chunk_size,
            config.write_queue_depth,
        )
        .await;

        match opened {
            Ok(session) => {
                let progress = session.progress().clone();
                self.session = Some(session);
                self.watchdog = Some(Instant::now() + config.transfer_timeout);
                self.inner.update(|state| {
                    state.status = LanTransferServerStatus::ReceivingFile;
                    state.file_transfer = Some(progress);
                    state.completed_file_path = None;
                });
                self.send(ServerMessage::FileStartAck {
                    transfer_id: start.transfer_id,
                    accepted: true,
                    message: None,
                })
                .await?;
            }
            Err(e) => {
                tracing::warn!(
                    "Rejected file_start {} ({}) from {}: {}",
                    start.transfer_id,
                    start.file_name,
                    self.peer,
                    e
                );
                let message = e.to_string();
                self.inner.update(|state| state.last_error = Some(message.clone()));
                self.send(ServerMessage::FileStartAck {
                    transfer_id: start.transfer_id,
                    accepted: false,
                    message: Some(message),
                })
                .await?;
            }
        }
        Ok(None)
    }

    async fn on_file_chunk(&mut self, transfer_id: String, chunk_index: u64, data: String) -> Reply {
        let Some(session) = self.session.as_mut() else {
            return self
                .on_malformed(TransferError::MalformedMessage(format!(
                    "chunk {} for {} without an active transfer",
                    chunk_index, transfer_id
                )))
                .await;
        };

        // A full write queue parks us here; stop() and the watchdog still win
        let accepted = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Stopped),
            _ = watchdog(self.watchdog) => Err(Interrupt::TimedOut),
            accepted = session.accept_chunk(&transfer_id, chunk_index, &data) => Ok(accepted),
        };
        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(Interrupt::Stopped) => return Ok(Some(PeerExit::Cancelled)),
            Err(Interrupt::TimedOut) => return self.on_watchdog().await,
        };

        match accepted {
            Ok(outcome) => {
                self.malformed = 0;
                if outcome != ChunkOutcome::Ignored {
                    let progress = session.progress().clone();
                    let elapsed_secs = progress.elapsed_ms.unwrap_or(0) as f64 / 1000.0;
                    tracing::debug!(
                        "{}: chunk {} ({}/{}, {:.1}%, {})",
                        transfer_id,
                        chunk_index,
                        progress.chunks_received,
                        progress.total_chunks,
                        progress.percentage,
                        format_transfer_speed(progress.bytes_received, elapsed_secs)
                    );
                    self.inner
                        .update(|state| state.file_transfer = Some(progress));
                }
                Ok(None)
            }
            Err(e) if e.code() == ErrorCode::MalformedMessage => self.on_malformed(e).await,
            Err(e) => {
                tracing::error!("Chunk {} of {} failed: {}", chunk_index, transfer_id, e);
                self.send(ServerMessage::error(&e)).await?;
                Ok(None)
            }
        }
    }

    async fn on_file_end(&mut self, transfer_id: String) -> Reply {
        let session = match self.session.take() {
            Some(session) if session.transfer_id() == transfer_id => session,
            other => {
                self.session = other;
                return self
                    .on_malformed(TransferError::MalformedMessage(format!(
                        "file_end for unknown transfer {}",
                        transfer_id
                    )))
                    .await;
            }
        };

        let mut completing = session.progress().clone();
        completing.status = FileTransferStatus::Completing;
        self.inner
            .update(|state| state.file_transfer = Some(completing));

        let interrupter = session.interrupter();
        let deadline = self.watchdog;
        let finishing = session.finish(&transfer_id);
        tokio::pin!(finishing);

        // Draining and hashing can stall on a slow disk
        let mut interrupted = None;
        let finished = loop {
            tokio::select! {
                biased;
                finished = &mut finishing => break finished,
                _ = self.cancel.cancelled(), if interrupted.is_none() => {
                    interrupted = Some(Interrupt::Stopped);
                    interrupter.cancel();
                }
                _ = watchdog(deadline), if interrupted.is_none() => {
                    interrupted = Some(Interrupt::TimedOut);
                    interrupter.cancel();
                }
            }
        };

        let (mut progress, result) = match finished {
            Ok(finished) => finished,
            Err((session, e)) => {
                self.session = Some(session);
                return self.on_malformed(e).await;
            }
        };
        self.watchdog = None;
        self.malformed = 0;

        match (result, interrupted) {
            (Ok(path), _) => self.complete_transfer(progress, path).await,
            (Err(_), Some(Interrupt::Stopped)) => Ok(Some(PeerExit::Cancelled)),
            (Err(_), Some(Interrupt::TimedOut)) => {
                let err = self.timed_out();
                progress.fail(err.code(), err.to_string());
                self.fail_transfer(progress, err.code(), err.to_string(), false)
                    .await
            }
            (Err(e), None) => {
                self.fail_transfer(progress, e.code(), e.to_string(), true)
                    .await
            }
        }
    }

    async fn complete_transfer(&mut self, progress: FileTransferProgress, path: PathBuf) -> Reply {
        let transfer_id = progress.transfer_id.clone();
        self.inner.update(|state| {
            state.status = LanTransferServerStatus::Connected;
            state.file_transfer = Some(progress);
            state.completed_file_path = Some(path.clone());
        });
        self.inner.emit(LanEvent::TransferCompleted {
            transfer_id: transfer_id.clone(),
            file_path: path.clone(),
        });

        self.send(ServerMessage::FileComplete {
            transfer_id,
            success: true,
            file_path: Some(path.display().to_string()),
            error: None,
            error_code: None,
        })
        .await?;
        Ok(None)
    }

    /// Report a terminal transfer failure. The partial file is already gone.
    async fn fail_transfer(
        &mut self,
        progress: FileTransferProgress,
        code: ErrorCode,
        message: String,
        may_close: bool,
    ) -> Reply {
        let transfer_id = progress.transfer_id.clone();
        self.inner.update(|state| {
            state.status = LanTransferServerStatus::Connected;
            state.file_transfer = Some(progress);
            state.last_error = Some(message.clone());
        });
        self.inner.emit(LanEvent::TransferFailed {
            transfer_id: transfer_id.clone(),
            code,
            message: message.clone(),
        });

        self.send(ServerMessage::FileComplete {
            transfer_id,
            success: false,
            file_path: None,
            error: Some(message.clone()),
            error_code: Some(code),
        })
        .await?;

        if may_close && self.inner.config.close_on_transfer_error {
            return Ok(Some(PeerExit::Fatal(message)));
        }
        Ok(None)
    }

    fn timed_out(&self) -> TransferError {
        TransferError::IncompleteTransfer(format!(
            "transfer timed out after {:?}",
            self.inner.config.transfer_timeout
        ))
    }

    async fn on_watchdog(&mut self) -> Reply {
        self.watchdog = None;
        let Some(session) = self.session.take() else {
            return Ok(None);
        };

        let err = self.timed_out();
        let progress = session.abort(err.code(), &err.to_string()).await;
        self.fail_transfer(progress, err.code(), err.to_string(), false)
            .await
    }
}
