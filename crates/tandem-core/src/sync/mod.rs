//! Relay wire protocol and client transports.
//!
//! Messages are JSON objects tagged by `type`:
//!
//! ```json
//! { "type": "join", "room": "room-id" }
//! { "type": "sync", "data": "<base64 payload>", "snapshot": false }
//! { "type": "awareness", "state": { "peer_id": "…", "display_name": "…" } }
//! ```
//!
//! `data` carries Loro bytes, sealed with the room key when the room is
//! encrypted. The relay never looks inside.

use std::collections::VecDeque;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::awareness::AwarenessState;

mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod native;

pub use memory::{MemoryRelay, MemoryTransport};
#[cfg(not(target_arch = "wasm32"))]
pub use native::NativeWebSocket;

/// Platform WebSocket used by [`crate::session::open`].
#[cfg(not(target_arch = "wasm32"))]
pub type PlatformWebSocket = NativeWebSocket;

/// Maximum number of updates a relay keeps after the latest snapshot.
pub const MAX_ROOM_HISTORY: usize = 100;

/// Messages sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join { room: String },
    Leave,
    /// Document payload (base64). `snapshot` marks a full-state export,
    /// which lets the relay drop older backlog.
    Sync {
        data: String,
        #[serde(default)]
        snapshot: bool,
    },
    Awareness { state: AwarenessState },
}

/// Messages received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join confirmed. `peer_id` is this connection's relay id and
    /// `initial_sync` the room backlog, oldest first.
    Joined {
        room: String,
        peer_id: String,
        peer_count: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        initial_sync: Vec<String>,
    },
    PeerJoined { peer_id: String, peer_count: usize },
    PeerLeft { peer_id: String, peer_count: usize },
    Sync { from: String, data: String },
    Awareness { from: String, state: AwarenessState },
    Error { message: String },
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events from a transport, drained with [`Transport::poll_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    JoinedRoom {
        room: String,
        peer_id: String,
        peer_count: usize,
        initial_sync: Vec<Vec<u8>>,
    },
    PeerJoined { peer_id: String, peer_count: usize },
    PeerLeft { peer_id: String, peer_count: usize },
    SyncReceived { from: String, data: Vec<u8> },
    AwarenessReceived { from: String, state: AwarenessState },
    Error { message: String },
}

impl SyncEvent {
    /// Decode a relay message. Returns `None` for sync payloads that are not
    /// valid base64.
    pub fn from_server_message(msg: ServerMessage) -> Option<Self> {
        let event = match msg {
            ServerMessage::Joined {
                room,
                peer_id,
                peer_count,
                initial_sync,
            } => SyncEvent::JoinedRoom {
                room,
                peer_id,
                peer_count,
                initial_sync: initial_sync
                    .iter()
                    .filter_map(|data| match decode_payload(data) {
                        Some(bytes) => Some(bytes),
                        None => {
                            log::warn!("Dropping undecodable backlog entry");
                            None
                        }
                    })
                    .collect(),
            },
            ServerMessage::PeerJoined { peer_id, peer_count } => {
                SyncEvent::PeerJoined { peer_id, peer_count }
            }
            ServerMessage::PeerLeft { peer_id, peer_count } => {
                SyncEvent::PeerLeft { peer_id, peer_count }
            }
            ServerMessage::Sync { from, data } => {
                let Some(data) = decode_payload(&data) else {
                    log::warn!("Dropping undecodable sync payload from {}", from);
                    return None;
                };
                SyncEvent::SyncReceived { from, data }
            }
            ServerMessage::Awareness { from, state } => SyncEvent::AwarenessReceived { from, state },
            ServerMessage::Error { message } => SyncEvent::Error { message },
        };
        Some(event)
    }

    /// Parse and decode a raw text frame.
    pub fn from_text(text: &str) -> Option<Self> {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => Self::from_server_message(msg),
            Err(e) => {
                log::warn!("Failed to parse server message: {}", e);
                None
            }
        }
    }
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(data: &str) -> Option<Vec<u8>> {
    STANDARD.decode(data).ok()
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A message pipe to the relay.
///
/// Non-blocking: `connect` starts the handshake, and its outcome shows up as
/// [`SyncEvent::Connected`] or [`SyncEvent::Error`] on a later poll.
pub trait Transport {
    fn connect(&mut self, url: &str) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    /// Send a text frame.
    fn send(&self, msg: &str) -> Result<(), TransportError>;

    /// Drain pending events.
    fn poll_events(&mut self) -> Vec<SyncEvent>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn send_message(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(msg)?;
        self.send(&json)
    }
}

/// Per-room payload backlog replayed to joiners: the latest snapshot plus
/// the updates published after it.
#[derive(Debug, Clone)]
pub struct RoomBacklog {
    snapshot: Option<String>,
    updates: VecDeque<String>,
    capacity: usize,
}

impl RoomBacklog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ROOM_HISTORY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            snapshot: None,
            updates: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, data: String, snapshot: bool) {
        if snapshot {
            self.snapshot = Some(data);
            self.updates.clear();
            return;
        }
        self.updates.push_back(data);
        while self.updates.len() > self.capacity {
            self.updates.pop_front();
        }
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.snapshot
            .iter()
            .chain(self.updates.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.iter().count() + self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RoomBacklog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::Sync {
            data: "AAEC".into(),
            snapshot: true,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "sync");
        assert_eq!(json["snapshot"], true);

        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"sync","data":"AAEC"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Sync {
                data: "AAEC".into(),
                snapshot: false
            }
        );
        let leave: ClientMessage = serde_json::from_str(r#"{"type":"leave"}"#).unwrap();
        assert_eq!(leave, ClientMessage::Leave);
    }

    #[test]
    fn test_joined_decodes_backlog() {
        let text = format!(
            r#"{{"type":"joined","room":"r","peer_id":"p","peer_count":2,"initial_sync":["{}","***"]}}"#,
            encode_payload(&[1, 2, 3])
        );
        match SyncEvent::from_text(&text) {
            Some(SyncEvent::JoinedRoom {
                peer_count,
                initial_sync,
                ..
            }) => {
                assert_eq!(peer_count, 2);
                assert_eq!(initial_sync, vec![vec![1, 2, 3]]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_sync_payload_dropped() {
        let msg = ServerMessage::Sync {
            from: "x".into(),
            data: "not base64!".into(),
        };
        assert!(SyncEvent::from_server_message(msg).is_none());
        assert!(SyncEvent::from_text("{\"type\":\"bogus\"}").is_none());
    }

    #[test]
    fn test_backlog_snapshot_resets_updates() {
        let mut backlog = RoomBacklog::with_capacity(2);
        backlog.push("u1".into(), false);
        backlog.push("u2".into(), false);
        backlog.push("u3".into(), false);
        assert_eq!(backlog.entries(), ["u2", "u3"]);

        backlog.push("s".into(), true);
        backlog.push("u4".into(), false);
        assert_eq!(backlog.entries(), ["s", "u4"]);
    }
}
