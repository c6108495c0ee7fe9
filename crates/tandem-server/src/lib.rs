//! Tandem WebSocket Relay
//!
//! Forwards document and awareness payloads between clients in the same
//! room. Payloads are opaque (possibly encrypted) base64 strings; the relay
//! keeps a bounded backlog per room so late joiners can catch up.
//!
//! ## Protocol
//!
//! See [`tandem_core::sync`]. In short:
//! ```json
//! { "type": "join", "room": "room-id" }
//! { "type": "sync", "data": "<base64>", "snapshot": true }
//! { "type": "awareness", "state": { ... } }
//! ```

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::{collections::HashSet, sync::Arc};
use tandem_core::sync::{ClientMessage, RoomBacklog, ServerMessage, encode_payload};
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

type RoomMessage = (String, ServerMessage);

/// Room state
struct Room {
    tx: broadcast::Sender<RoomMessage>,
    peers: HashSet<String>,
    /// Replayed to joiners
    backlog: RoomBacklog,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            peers: HashSet::new(),
            backlog: RoomBacklog::new(),
        }
    }
}

/// Shared relay state
#[derive(Default)]
pub struct AppState {
    rooms: DashMap<String, Room>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of peers in a room.
    pub fn peer_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |r| r.peers.len())
    }

    /// Add peer to room, returning its receiver, the backlog and the new peer count.
    fn join_room(&self, room_id: &str, peer_id: &str) -> (broadcast::Receiver<RoomMessage>, Vec<String>, usize) {
        let mut room = self.rooms.entry(room_id.to_string()).or_insert_with(Room::new);
        room.peers.insert(peer_id.to_string());
        (room.tx.subscribe(), room.backlog.entries(), room.peers.len())
    }

    /// Remove peer from room. Empty rooms are dropped along with their backlog.
    fn leave_room(&self, room_id: &str, peer_id: &str) {
        let remaining = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                room.peers.remove(peer_id);
                room.peers.len()
            }
            None => return,
        };
        if remaining == 0 {
            self.rooms.remove_if(room_id, |_, room| room.peers.is_empty());
            debug!("Room {} closed", room_id);
            return;
        }
        self.broadcast(
            room_id,
            peer_id,
            ServerMessage::PeerLeft {
                peer_id: peer_id.to_string(),
                peer_count: remaining,
            },
        );
    }

    fn record_sync(&self, room_id: &str, data: String, snapshot: bool) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.backlog.push(data, snapshot);
        }
    }

    fn broadcast(&self, room_id: &str, from: &str, msg: ServerMessage) {
        if let Some(room) = self.rooms.get(room_id) {
            let _ = room.tx.send((from.to_string(), msg));
        }
    }
}

/// Build the relay router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> &'static str {
    "Tandem Relay Server - Connect via WebSocket at /ws"
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_json(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to encode message: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// Per-connection state
struct Connection {
    peer_id: String,
    room: Option<String>,
    room_rx: Option<broadcast::Receiver<RoomMessage>>,
}

impl Connection {
    fn leave(&mut self, state: &AppState) {
        if let Some(room) = self.room.take() {
            state.leave_room(&room, &self.peer_id);
            info!("Peer {} left room {}", self.peer_id, room);
        }
        self.room_rx = None;
    }

    /// Apply a client message; returns the direct reply, if any.
    fn handle(&mut self, state: &AppState, msg: ClientMessage) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Join { room } => {
                self.leave(state);
                let (rx, initial_sync, peer_count) = state.join_room(&room, &self.peer_id);
                self.room_rx = Some(rx);
                self.room = Some(room.clone());
                state.broadcast(
                    &room,
                    &self.peer_id,
                    ServerMessage::PeerJoined {
                        peer_id: self.peer_id.clone(),
                        peer_count,
                    },
                );
                info!("Peer {} joined room {} ({} peers)", self.peer_id, room, peer_count);
                Some(ServerMessage::Joined {
                    room,
                    peer_id: self.peer_id.clone(),
                    peer_count,
                    initial_sync,
                })
            }
            ClientMessage::Leave => {
                self.leave(state);
                None
            }
            ClientMessage::Sync { data, snapshot } => {
                if let Some(room) = &self.room {
                    state.record_sync(room, data.clone(), snapshot);
                    state.broadcast(
                        room,
                        &self.peer_id,
                        ServerMessage::Sync {
                            from: self.peer_id.clone(),
                            data,
                        },
                    );
                }
                None
            }
            ClientMessage::Awareness { state: awareness } => {
                if let Some(room) = &self.room {
                    state.broadcast(
                        room,
                        &self.peer_id,
                        ServerMessage::Awareness {
                            from: self.peer_id.clone(),
                            state: awareness,
                        },
                    );
                }
                None
            }
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let mut conn = Connection {
        peer_id: Uuid::new_v4().to_string(),
        room: None,
        room_rx: None,
    };
    info!("New connection: {}", conn.peer_id);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => conn.handle(&state, client_msg),
                        Err(e) => {
                            warn!("Invalid message from {}: {}", conn.peer_id, e);
                            Some(ServerMessage::Error {
                                message: format!("Invalid message: {}", e),
                            })
                        }
                    },
                    // Binary frames are raw document updates
                    Some(Ok(Message::Binary(data))) => conn.handle(
                        &state,
                        ClientMessage::Sync {
                            data: encode_payload(&data),
                            snapshot: false,
                        },
                    ),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", conn.peer_id, e);
                        break;
                    }
                };
                if let Some(reply) = reply {
                    if !send_json(&mut sender, &reply).await {
                        break;
                    }
                }
            }

            msg = async {
                match &mut conn.room_rx {
                    Some(rx) => Some(rx.recv().await),
                    None => std::future::pending().await,
                }
            } => {
                match msg {
                    Some(Ok((from, server_msg))) => {
                        // No echo
                        if from != conn.peer_id && !send_json(&mut sender, &server_msg).await {
                            break;
                        }
                    }
                    Some(Err(RecvError::Lagged(skipped))) => {
                        warn!("Peer {} lagged, skipped {} messages", conn.peer_id, skipped);
                    }
                    Some(Err(RecvError::Closed)) | None => {
                        conn.room_rx = None;
                    }
                }
            }
        }
    }

    conn.leave(&state);
    info!("Connection closed: {}", conn.peer_id);
}
