use lan_core::transfer::sender::SendProgress;
use lan_core::{LanEvent, LanTransferServerStatus};
use qrcode::QrCode;
use qrcode::render::unicode::Dense1x2;
use tokio::sync::mpsc;

/// Render a payload as a terminal QR code
pub fn render_qr(payload: &str) -> Option<String> {
    let code = QrCode::new(payload.as_bytes()).ok()?;
    Some(
        code.render::<Dense1x2>()
            .dark_color(Dense1x2::Light)
            .light_color(Dense1x2::Dark)
            .build(),
    )
}

/// Log server events until the server goes away
pub async fn print_events(mut event_rx: mpsc::Receiver<LanEvent>) {
    let mut last_status = None;
    let mut last_percent = None;

    while let Some(event) = event_rx.recv().await {
        match event {
            LanEvent::StateChanged(state) => {
                if last_status != Some(state.status) {
                    last_status = Some(state.status);
                    match state.status {
                        LanTransferServerStatus::Connected => {
                            if let Some(client) = &state.connected_client {
                                tracing::info!(
                                    "Connected: {} ({})",
                                    client.device_name,
                                    client.platform.as_deref().unwrap_or("unknown")
                                );
                            }
                        }
                        LanTransferServerStatus::Error => tracing::error!(
                            "Receiver stopped: {}",
                            state.last_error.as_deref().unwrap_or("unknown error")
                        ),
                        status => tracing::info!("Status: {:?}", status),
                    }
                }

                if let Some(progress) = &state.file_transfer {
                    // One line per 10%
                    let bucket = (progress.percentage / 10.0) as u32;
                    if last_percent != Some(bucket) {
                        last_percent = Some(bucket);
                        tracing::info!(
                            "{}: {:.0}% ({}/{} chunks)",
                            progress.file_name,
                            progress.percentage,
                            progress.chunks_received,
                            progress.total_chunks
                        );
                    }
                }
            }
            LanEvent::TransferCompleted { file_path, .. } => {
                last_percent = None;
                println!("Received {}", file_path.display());
            }
            LanEvent::TransferFailed { code, message, .. } => {
                last_percent = None;
                println!("Transfer failed ({:?}): {}", code, message);
            }
        }
    }
}

pub async fn print_progress(mut progress_rx: mpsc::Receiver<SendProgress>) {
    while let Some(progress) = progress_rx.recv().await {
        let percent = if progress.total_bytes == 0 {
            100.0
        } else {
            progress.bytes_sent as f64 / progress.total_bytes as f64 * 100.0
        };
        tracing::info!(
            "Sent {}/{} chunks ({:.0}%, {})",
            progress.chunks_sent,
            progress.total_chunks,
            percent,
            progress.speed
        );
    }
}
