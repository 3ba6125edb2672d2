use futures_util::{SinkExt, StreamExt};
use lan_core::pairing::{self, Candidate, ConnectionInfo};
use lan_core::state::FileTransferStatus;
use lan_core::storage::sha256_hex;
use lan_core::transfer::protocol::{ClientMessage, FileStart, Inbound, MessageCodec, ServerMessage};
use lan_core::transfer::{SendOptions, send_file};
use lan_core::{
    DiskStorage, ErrorCode, LanEvent, LanTransferServerStatus, LanTransferState, ServerConfig,
    TransferServer,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;

type Client = Framed<TcpStream, MessageCodec<ServerMessage>>;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("lan_core=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

fn test_config(download_dir: &Path) -> ServerConfig {
    ServerConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        download_dir: download_dir.to_path_buf(),
        ..Default::default()
    }
}

struct Receiver {
    server: TransferServer<DiskStorage>,
    port: u16,
    state: watch::Receiver<LanTransferState>,
    events: mpsc::Receiver<LanEvent>,
    dir: tempfile::TempDir,
}

async fn start_receiver(tweak: impl FnOnce(&mut ServerConfig)) -> Receiver {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);

    let (event_tx, events) = mpsc::channel(1024);
    let server = TransferServer::with_disk_storage(config, event_tx);
    let port = server.start().await.unwrap();
    let state = server.subscribe();

    Receiver {
        server,
        port,
        state,
        events,
        dir,
    }
}

impl Receiver {
    fn addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port)
    }

    async fn wait_for(&mut self, status: LanTransferServerStatus) -> LanTransferState {
        let state = timeout(WAIT, self.state.wait_for(|s| s.status == status))
            .await
            .unwrap_or_else(|_| panic!("server never reached {:?}", status))
            .unwrap();
        state.clone()
    }

    fn dir_entries(&self) -> usize {
        std::fs::read_dir(self.dir.path()).unwrap().count()
    }
}

async fn connect(port: u16) -> Client {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    Framed::new(stream, MessageCodec::new())
}

async fn recv(client: &mut Client) -> ServerMessage {
    match timeout(WAIT, client.next()).await {
        Ok(Some(Ok(Inbound::Message(msg)))) => msg,
        other => panic!("Expected a server message, got {:?}", other),
    }
}

async fn expect_closed(client: &mut Client) {
    match timeout(WAIT, client.next()).await {
        Ok(None) | Ok(Some(Err(_))) => {}
        other => panic!("Expected the connection to close, got {:?}", other),
    }
}

async fn handshake(client: &mut Client, version: &str) -> ServerMessage {
    client
        .send(&ClientMessage::Handshake {
            device_name: "Test Desktop".to_string(),
            version: version.to_string(),
            platform: Some("linux".to_string()),
            app_version: Some("1.0.0".to_string()),
        })
        .await
        .unwrap();
    recv(client).await
}

fn small_file_start(transfer_id: &str, data: &[u8]) -> ClientMessage {
    ClientMessage::FileStart(FileStart {
        transfer_id: transfer_id.to_string(),
        file_name: "backup.zip".to_string(),
        file_size: data.len() as u64,
        mime_type: "application/zip".to_string(),
        checksum: sha256_hex(data),
        total_chunks: 1,
        chunk_size: lan_core::transfer::CHUNK_SIZE,
    })
}

fn accepted_ack() -> ServerMessage {
    ServerMessage::HandshakeAck {
        accepted: true,
        message: None,
    }
}

#[tokio::test]
async fn test_full_transfer_with_reference_sender() {
    let mut receiver = start_receiver(|_| {}).await;

    let source = tempfile::tempdir().unwrap();
    let path = source.path().join("export.zip");
    let content: Vec<u8> = (0..1_200_000u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(&path, &content).unwrap();

    let (progress_tx, mut progress_rx) = mpsc::channel(16);
    let report = send_file(
        receiver.addr(),
        &path,
        &SendOptions::default(),
        Some(progress_tx),
    )
    .await
    .unwrap();
    assert_eq!(report.bytes_sent, 1_200_000);

    let saved = receiver.dir.path().join("export.zip");
    assert_eq!(report.remote_path, Some(saved.display().to_string()));
    assert_eq!(std::fs::read(&saved).unwrap(), content);
    assert_eq!(receiver.dir_entries(), 1);

    let mut last = None;
    while let Ok(progress) = progress_rx.try_recv() {
        last = Some(progress);
    }
    assert_eq!(last.unwrap().total_chunks, 3);

    // The sender hangs up once the file is confirmed
    let state = receiver.wait_for(LanTransferServerStatus::Listening).await;
    assert_eq!(state.completed_file_path, Some(saved.clone()));
    let progress = state.file_transfer.unwrap();
    assert_eq!(progress.status, FileTransferStatus::Complete);
    assert_eq!(progress.chunks_received, 3);
    assert_eq!(progress.bytes_received, 1_200_000);

    let mut completed = None;
    while let Ok(event) = receiver.events.try_recv() {
        if let LanEvent::TransferCompleted { file_path, .. } = event {
            completed = Some(file_path);
        }
    }
    assert_eq!(completed, Some(saved));

    receiver.server.stop().await;
    assert_eq!(receiver.server.state().status, LanTransferServerStatus::Idle);
}

#[tokio::test]
async fn test_pairing_code_leads_to_receiver() {
    let receiver = start_receiver(|_| {}).await;

    let info = ConnectionInfo {
        kind: pairing::CONNECTION_INFO_TYPE.to_string(),
        candidates: vec![Candidate::new("127.0.0.1"), Candidate::new("192.168.1.20")],
        selected_host: Some("127.0.0.1".to_string()),
        port: receiver.port,
        timestamp: 1_700_000_000_123,
    };
    let payload = pairing::encode_to_string(&info).unwrap();
    let scanned = pairing::decode_str(&payload).unwrap();
    assert_eq!(scanned.port, receiver.port);

    let host: IpAddr = scanned.connect_order()[0].parse().unwrap();
    let stream = TcpStream::connect((host, scanned.port)).await.unwrap();
    let mut client: Client = Framed::new(stream, MessageCodec::new());
    assert_eq!(handshake(&mut client, "1").await, accepted_ack());
}

#[tokio::test]
async fn test_version_mismatch_closes_and_parks_in_error() {
    let mut receiver = start_receiver(|_| {}).await;
    let mut client = connect(receiver.port).await;

    match handshake(&mut client, "2").await {
        ServerMessage::HandshakeAck { accepted, message } => {
            assert!(!accepted);
            assert!(message.unwrap().contains("expected 1, got 2"));
        }
        other => panic!("Expected HandshakeAck, got {:?}", other),
    }
    expect_closed(&mut client).await;

    let state = receiver.wait_for(LanTransferServerStatus::Error).await;
    assert!(state.last_error.unwrap().contains("version mismatch"));
    assert!(TcpStream::connect(receiver.addr()).await.is_err());

    // start() is allowed again from `error`
    let port = receiver.server.start().await.unwrap();
    assert_eq!(
        receiver.server.state().status,
        LanTransferServerStatus::Listening
    );
    let mut client = connect(port).await;
    assert_eq!(handshake(&mut client, "1").await, accepted_ack());
}

#[tokio::test]
async fn test_second_handshake_gets_peer_busy() {
    let mut receiver = start_receiver(|_| {}).await;
    let mut client = connect(receiver.port).await;
    assert_eq!(handshake(&mut client, "1").await, accepted_ack());

    match handshake(&mut client, "1").await {
        ServerMessage::Error { code, .. } => assert_eq!(code, Some(ErrorCode::PeerBusy)),
        other => panic!("Expected Error, got {:?}", other),
    }

    client
        .send(&ClientMessage::Ping {
            payload: Some("still there".into()),
        })
        .await
        .unwrap();
    assert_eq!(
        recv(&mut client).await,
        ServerMessage::Pong {
            received: true,
            payload: Some("still there".into())
        }
    );

    let state = receiver.wait_for(LanTransferServerStatus::Connected).await;
    assert_eq!(state.connected_client.unwrap().device_name, "Test Desktop");
}

#[tokio::test]
async fn test_second_peer_is_turned_away() {
    let mut receiver = start_receiver(|_| {}).await;
    let mut first = connect(receiver.port).await;
    assert_eq!(handshake(&mut first, "1").await, accepted_ack());
    receiver.wait_for(LanTransferServerStatus::Connected).await;

    let mut second = connect(receiver.port).await;
    match handshake(&mut second, "1").await {
        ServerMessage::HandshakeAck { accepted, .. } => assert!(!accepted),
        other => panic!("Expected HandshakeAck, got {:?}", other),
    }
    expect_closed(&mut second).await;

    let mut third = connect(receiver.port).await;
    third
        .send(&ClientMessage::Ping { payload: None })
        .await
        .unwrap();
    match recv(&mut third).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, Some(ErrorCode::PeerBusy)),
        other => panic!("Expected Error, got {:?}", other),
    }

    assert_eq!(
        receiver.server.state().status,
        LanTransferServerStatus::Connected
    );
    first
        .send(&ClientMessage::Ping { payload: None })
        .await
        .unwrap();
    assert!(matches!(recv(&mut first).await, ServerMessage::Pong { .. }));
}

#[tokio::test]
async fn test_watchdog_expiry_then_new_transfer() {
    let mut receiver = start_receiver(|config| {
        config.transfer_timeout = Duration::from_millis(300);
    })
    .await;
    let data = b"zip bytes!".to_vec();

    let mut client = connect(receiver.port).await;
    assert_eq!(handshake(&mut client, "1").await, accepted_ack());
    client.send(&small_file_start("slow", &data)).await.unwrap();
    assert!(matches!(
        recv(&mut client).await,
        ServerMessage::FileStartAck { accepted: true, .. }
    ));

    match recv(&mut client).await {
        ServerMessage::FileComplete {
            transfer_id,
            success,
            error_code,
            ..
        } => {
            assert_eq!(transfer_id, "slow");
            assert!(!success);
            assert_eq!(error_code, Some(ErrorCode::IncompleteTransfer));
        }
        other => panic!("Expected FileComplete, got {:?}", other),
    }
    let state = receiver.wait_for(LanTransferServerStatus::Connected).await;
    assert_eq!(
        state.file_transfer.unwrap().status,
        FileTransferStatus::Error
    );
    assert_eq!(receiver.dir_entries(), 0);

    client.send(&small_file_start("fast", &data)).await.unwrap();
    assert!(matches!(
        recv(&mut client).await,
        ServerMessage::FileStartAck { accepted: true, .. }
    ));
    client
        .send(&ClientMessage::FileChunk {
            transfer_id: "fast".to_string(),
            chunk_index: 0,
            data: lan_core::transfer::protocol::encode_chunk(&data),
        })
        .await
        .unwrap();
    client
        .send(&ClientMessage::FileEnd {
            transfer_id: "fast".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(
        recv(&mut client).await,
        ServerMessage::FileComplete { success: true, .. }
    ));
    assert_eq!(
        std::fs::read(receiver.dir.path().join("backup.zip")).unwrap(),
        data
    );
}

#[tokio::test]
async fn test_disconnect_mid_transfer_returns_to_listening() {
    let mut receiver = start_receiver(|_| {}).await;
    let data = b"zip bytes!".to_vec();

    let mut client = connect(receiver.port).await;
    assert_eq!(handshake(&mut client, "1").await, accepted_ack());
    client.send(&small_file_start("t1", &data)).await.unwrap();
    recv(&mut client).await;
    receiver.wait_for(LanTransferServerStatus::ReceivingFile).await;
    drop(client);

    let state = receiver.wait_for(LanTransferServerStatus::Listening).await;
    assert!(state.connected_client.is_none());
    assert!(state.last_error.is_some());
    let progress = state.file_transfer.unwrap();
    assert_eq!(progress.status, FileTransferStatus::Error);
    assert_eq!(progress.error_code, Some(ErrorCode::TransportClosed));
    assert_eq!(receiver.dir_entries(), 0);

    let mut client = connect(receiver.port).await;
    assert_eq!(handshake(&mut client, "1").await, accepted_ack());
}

#[tokio::test]
async fn test_rejected_file_start_keeps_connection() {
    let mut receiver = start_receiver(|_| {}).await;
    let mut client = connect(receiver.port).await;
    assert_eq!(handshake(&mut client, "1").await, accepted_ack());

    let mut start = FileStart {
        transfer_id: "t1".to_string(),
        file_name: "installer.exe".to_string(),
        file_size: 10,
        mime_type: "application/zip".to_string(),
        checksum: sha256_hex(b"0123456789"),
        total_chunks: 1,
        chunk_size: lan_core::transfer::CHUNK_SIZE,
    };
    client
        .send(&ClientMessage::FileStart(start.clone()))
        .await
        .unwrap();
    match recv(&mut client).await {
        ServerMessage::FileStartAck {
            accepted, message, ..
        } => {
            assert!(!accepted);
            assert!(message.unwrap().contains("Unsupported file type"));
        }
        other => panic!("Expected FileStartAck, got {:?}", other),
    }

    start.file_name = "backup.zip".to_string();
    start.total_chunks = 2;
    client
        .send(&ClientMessage::FileStart(start))
        .await
        .unwrap();
    assert!(matches!(
        recv(&mut client).await,
        ServerMessage::FileStartAck {
            accepted: false,
            ..
        }
    ));

    let state = receiver.wait_for(LanTransferServerStatus::Connected).await;
    assert!(state.file_transfer.is_none());
    assert_eq!(receiver.dir_entries(), 0);
}

#[tokio::test]
async fn test_checksum_failure_can_close_the_server() {
    let mut receiver = start_receiver(|config| {
        config.close_on_transfer_error = true;
    })
    .await;
    let data = b"zip bytes!".to_vec();

    let mut client = connect(receiver.port).await;
    assert_eq!(handshake(&mut client, "1").await, accepted_ack());
    client.send(&small_file_start("t1", &data)).await.unwrap();
    recv(&mut client).await;
    client
        .send(&ClientMessage::FileChunk {
            transfer_id: "t1".to_string(),
            chunk_index: 0,
            data: lan_core::transfer::protocol::encode_chunk(b"zip bytes?"),
        })
        .await
        .unwrap();
    client
        .send(&ClientMessage::FileEnd {
            transfer_id: "t1".to_string(),
        })
        .await
        .unwrap();

    match recv(&mut client).await {
        ServerMessage::FileComplete {
            success,
            error_code,
            ..
        } => {
            assert!(!success);
            assert_eq!(error_code, Some(ErrorCode::ChecksumMismatch));
        }
        other => panic!("Expected FileComplete, got {:?}", other),
    }
    expect_closed(&mut client).await;

    let state = receiver.wait_for(LanTransferServerStatus::Error).await;
    assert!(state.last_error.unwrap().contains("Checksum mismatch"));
    assert_eq!(receiver.dir_entries(), 0);
}

#[tokio::test]
async fn test_stop_discards_partial_file() {
    let mut receiver = start_receiver(|_| {}).await;
    let data = b"zip bytes!".to_vec();

    let mut client = connect(receiver.port).await;
    assert_eq!(handshake(&mut client, "1").await, accepted_ack());
    client.send(&small_file_start("t1", &data)).await.unwrap();
    recv(&mut client).await;
    receiver.wait_for(LanTransferServerStatus::ReceivingFile).await;
    assert_eq!(receiver.dir_entries(), 1);

    receiver.server.stop().await;
    assert_eq!(receiver.server.state(), LanTransferState::default());
    assert_eq!(receiver.dir_entries(), 0);
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn test_start_is_a_no_op_while_running() {
    let receiver = start_receiver(|_| {}).await;
    assert_eq!(receiver.server.start().await.unwrap(), receiver.port);
    assert_eq!(receiver.server.state().port, Some(receiver.port));
}
