mod display;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lan_core::pairing::{self, ConnectionInfo, PAIRING_CODE_MAX_AGE};
use lan_core::transfer::constants::{LAN_TRANSFER_DOMAIN, LAN_TRANSFER_SERVICE_FULL_NAME};
use lan_core::transfer::sender::{SendOptions, send_file_over};
use lan_core::{ServerConfig, TransferServer};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt};

/// Connect attempt per pairing candidate
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// LAN transfer host: receive exports from a desktop peer, or push one.
#[derive(Parser, Debug)]
#[command(name = "lan_host", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for a peer and print the pairing code to scan
    Receive {
        /// Port to listen on (0 picks a free one)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Directory where received files are stored
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Stop listening after a failed transfer
        #[arg(long)]
        close_on_error: bool,
    },

    /// Send a .zip to a receiver
    Send {
        /// File to send
        file: PathBuf,

        /// Receiver address, e.g. 192.168.1.20:53317
        #[arg(short, long, conflicts_with = "code", required_unless_present = "code")]
        addr: Option<SocketAddr>,

        /// Pairing code payload as shown by `receive`
        #[arg(short, long)]
        code: Option<String>,

        /// Device name announced in the handshake
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show what a pairing code contains
    Decode { payload: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lan_host=info,lan_core=info,warn")),
        )
        .init();

    match Args::parse().command {
        Command::Receive {
            port,
            bind,
            dir,
            close_on_error,
        } => {
            let mut config = ServerConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(dir) = dir {
                config.download_dir = dir;
            }
            config.close_on_transfer_error |= close_on_error;
            receive(config).await
        }
        Command::Send {
            file,
            addr,
            code,
            name,
        } => {
            let mut options = SendOptions::default();
            if let Some(name) = name {
                options.device_name = name;
            }
            let targets = match (addr, code) {
                (Some(addr), _) => vec![addr],
                (None, Some(code)) => targets_from_code(&code)?,
                (None, None) => bail!("Either --addr or --code is required"),
            };
            send(file, targets, options).await
        }
        Command::Decode { payload } => {
            let info = pairing::decode_str(&payload)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            println!("connect order: {}", info.connect_order().join(", "));
            if info.is_expired(PAIRING_CODE_MAX_AGE) {
                println!("warning: this pairing code is older than {:?}", PAIRING_CODE_MAX_AGE);
            }
            Ok(())
        }
    }
}

async fn receive(config: ServerConfig) -> Result<()> {
    std::fs::create_dir_all(&config.download_dir).with_context(|| {
        format!(
            "Failed to create download directory {}",
            config.download_dir.display()
        )
    })?;
    let download_dir = config.download_dir.clone();

    let (event_tx, event_rx) = mpsc::channel(1000);
    let server = TransferServer::with_disk_storage(config, event_tx);
    let printer = tokio::spawn(display::print_events(event_rx));

    let port = server.start().await.context("Failed to start receiver")?;

    let info = ConnectionInfo::for_local_interfaces(port);
    if info.candidates.is_empty() {
        tracing::warn!("No LAN interface found; peers will not be able to reach this host");
    }
    let payload = pairing::encode_to_string(&info)?;

    tracing::info!(
        "Advertise {}.{} on port {} for discovery",
        LAN_TRANSFER_SERVICE_FULL_NAME,
        LAN_TRANSFER_DOMAIN,
        port
    );
    println!("Saving files to {}", download_dir.display());
    println!("Scan to connect ({}):", info.connect_order().join(", "));
    match display::render_qr(&payload) {
        Some(qr) => println!("{}", qr),
        None => tracing::warn!("Pairing code too long for a QR code"),
    }
    println!("Pairing code: {}", payload);
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    drop(server);
    let _ = printer.await;
    Ok(())
}

fn targets_from_code(code: &str) -> Result<Vec<SocketAddr>> {
    let info = pairing::decode_str(code)?;
    if info.is_expired(PAIRING_CODE_MAX_AGE) {
        tracing::warn!("Pairing code is older than {:?}", PAIRING_CODE_MAX_AGE);
    }

    let targets = info
        .connect_order()
        .iter()
        .filter_map(|host| host.parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, info.port))
        .collect::<Vec<_>>();
    if targets.is_empty() {
        bail!("Pairing code carries no address");
    }
    Ok(targets)
}

/// First candidate that accepts a TCP connection
async fn connect_first(targets: &[SocketAddr]) -> Result<TcpStream> {
    for target in targets {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                tracing::info!("Connected to {}", target);
                return Ok(stream);
            }
            Ok(Err(e)) => tracing::warn!("Failed to connect to {}: {}", target, e),
            Err(_) => tracing::warn!("Timed out connecting to {}", target),
        }
    }
    bail!("No receiver reachable at {:?}", targets)
}

async fn send(file: PathBuf, targets: Vec<SocketAddr>, options: SendOptions) -> Result<()> {
    let stream = connect_first(&targets).await?;
    stream.set_nodelay(true)?;

    let (progress_tx, progress_rx) = mpsc::channel(64);
    let printer = tokio::spawn(display::print_progress(progress_rx));

    let result = send_file_over(stream, &file, &options, Some(progress_tx)).await;
    let _ = printer.await;

    let report = result?;
    println!(
        "Sent {} ({} bytes in {:.1}s)",
        file.display(),
        report.bytes_sent,
        report.elapsed.as_secs_f64()
    );
    if let Some(path) = report.remote_path {
        println!("Receiver saved it as {}", path);
    }
    Ok(())
}
