use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::sync::{SnapshotSender, VehicleState, VehicleStore};

#[derive(Clone)]
pub struct WsState {
    pub store: VehicleStore,
    pub updates_tx: SnapshotSender,
}

/// Server message sent to clients
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ServerMessage {
    /// Full fleet snapshot (sent once on connect)
    Snapshot { vehicles: Vec<VehicleState> },
    /// One vehicle changed
    VehicleUpdate {
        vehicle: VehicleState,
        timestamp: String,
    },
    /// A vehicle named in an update is no longer tracked
    VehicleRemoved { vehicle_id: String },
}

/// WebSocket endpoint for live vehicle snapshots
pub async fn ws_vehicles(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before reading the store so no committed update lands in
    // the gap between the initial snapshot and the live stream.
    let mut updates_rx = state.updates_tx.subscribe();

    let vehicles = {
        let store = state.store.read().await;
        let mut vehicles: Vec<VehicleState> =
            store.values().map(|s| s.as_ref().clone()).collect();
        vehicles.sort_by(|a, b| a.id.cmp(&b.id));
        vehicles
    };
    if send_message(&mut sender, &ServerMessage::Snapshot { vehicles })
        .await
        .is_err()
    {
        return;
    }

    let forward_state = state.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            match updates_rx.recv().await {
                Ok(update) => {
                    let vehicle = forward_state
                        .store
                        .read()
                        .await
                        .get(&update.vehicle_id)
                        .cloned();
                    let msg = match vehicle {
                        Some(vehicle) => ServerMessage::VehicleUpdate {
                            vehicle: vehicle.as_ref().clone(),
                            timestamp: update.timestamp,
                        },
                        None => ServerMessage::VehicleRemoved {
                            vehicle_id: update.vehicle_id,
                        },
                    };
                    if send_message(&mut sender, &msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                // A lagged observer only missed intermediate states; the
                // next update carries the full current snapshot anyway.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });

    // Drain client frames; this connection has no inbound protocol
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    forward_task.abort();
}

async fn send_message(
    sender: &mut (impl SinkExt<Message> + Unpin),
    msg: &ServerMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
