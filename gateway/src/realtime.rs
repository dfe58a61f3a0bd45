use crate::metrics::REALTIME_SUBSCRIBERS;
use crate::model::{ChangeEvent, Device};
use crate::registry::DeviceRegistry;
use crate::rest::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct SnapshotFrame {
    event: &'static str,
    devices: Vec<Device>,
}

#[derive(Serialize)]
struct ChangeFrame {
    event: &'static str,
    device: Device,
}

/// Full registry snapshot sent to a subscriber on connect or resync
pub fn snapshot_frame(devices: &[Device]) -> serde_json::Result<String> {
    serde_json::to_string(&SnapshotFrame {
        event: "snapshot",
        devices: devices.iter().map(Device::reported).collect(),
    })
}

pub fn change_frame(event: &ChangeEvent) -> serde_json::Result<String> {
    serde_json::to_string(&ChangeFrame {
        event: event.kind.as_str(),
        device: event.device.reported(),
    })
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let registry = Arc::clone(&state.engine.registry);
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| serve_subscriber(socket, registry, shutdown))
}

async fn serve_subscriber(
    mut socket: WebSocket,
    registry: Arc<DeviceRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Subscribe before taking the snapshot so no mutation falls in between
    let mut events = registry.notifier().subscribe();
    REALTIME_SUBSCRIBERS.inc();
    info!("Real-time subscriber connected");

    if send_snapshot(&mut socket, &registry).await {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let delivered = match event {
                        Ok(event) => send_frame(&mut socket, change_frame(&event)).await,
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Real-time subscriber lagged by {} events, resyncing", missed);
                            send_snapshot(&mut socket, &registry).await
                        }
                        Err(RecvError::Closed) => false,
                    };
                    if !delivered {
                        break;
                    }
                }
                message = socket.recv() => {
                    match message {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    REALTIME_SUBSCRIBERS.dec();
    info!("Real-time subscriber disconnected");
}

async fn send_snapshot(socket: &mut WebSocket, registry: &DeviceRegistry) -> bool {
    send_frame(socket, snapshot_frame(&registry.list())).await
}

async fn send_frame(socket: &mut WebSocket, frame: serde_json::Result<String>) -> bool {
    match frame {
        Ok(text) => match socket.send(Message::Text(text)).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Real-time send failed: {}", e);
                false
            }
        },
        Err(e) => {
            warn!("Failed to encode real-time frame: {}", e);
            true
        }
    }
}
