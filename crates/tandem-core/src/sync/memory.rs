//! In-process relay for tests and offline use.
//!
//! Behaves like the WebSocket relay: rooms with a payload backlog, fan-out to
//! every other member, no echo to the sender. Delivery happens on `send`;
//! receivers see the messages on their next `poll_events`.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use super::{
    ClientMessage, ConnectionState, RoomBacklog, ServerMessage, SyncEvent, Transport,
    TransportError,
};

#[derive(Default)]
struct Connection {
    inbox: Vec<SyncEvent>,
    room: Option<String>,
    open: bool,
}

#[derive(Default)]
struct Room {
    members: BTreeSet<String>,
    backlog: RoomBacklog,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    connections: HashMap<String, Connection>,
    rooms: HashMap<String, Room>,
    /// Every frame accepted from clients, in arrival order.
    frames: Vec<(String, ClientMessage)>,
}

impl RelayState {
    fn deliver(&mut self, conn_id: &str, msg: ServerMessage) {
        let Some(event) = SyncEvent::from_server_message(msg) else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(conn_id) {
            if conn.open {
                conn.inbox.push(event);
            }
        }
    }

    fn broadcast(&mut self, room_id: &str, from: &str, msg: ServerMessage) {
        let members: Vec<String> = match self.rooms.get(room_id) {
            Some(room) => room.members.iter().filter(|m| *m != from).cloned().collect(),
            None => return,
        };
        for member in members {
            self.deliver(&member, msg.clone());
        }
    }

    fn leave(&mut self, conn_id: &str) {
        let Some(room_id) = self.connections.get_mut(conn_id).and_then(|c| c.room.take()) else {
            return;
        };
        let peer_count = match self.rooms.get_mut(&room_id) {
            Some(room) => {
                room.members.remove(conn_id);
                room.members.len()
            }
            None => return,
        };
        if peer_count == 0 {
            self.rooms.remove(&room_id);
            return;
        }
        self.broadcast(
            &room_id,
            conn_id,
            ServerMessage::PeerLeft {
                peer_id: conn_id.to_string(),
                peer_count,
            },
        );
    }

    fn handle(&mut self, conn_id: &str, msg: ClientMessage) {
        self.frames.push((conn_id.to_string(), msg.clone()));
        let current_room = self.connections.get(conn_id).and_then(|c| c.room.clone());
        match msg {
            ClientMessage::Join { room } => {
                self.leave(conn_id);
                let entry = self.rooms.entry(room.clone()).or_default();
                entry.members.insert(conn_id.to_string());
                let peer_count = entry.members.len();
                let initial_sync = entry.backlog.entries();
                if let Some(conn) = self.connections.get_mut(conn_id) {
                    conn.room = Some(room.clone());
                }
                self.deliver(
                    conn_id,
                    ServerMessage::Joined {
                        room: room.clone(),
                        peer_id: conn_id.to_string(),
                        peer_count,
                        initial_sync,
                    },
                );
                self.broadcast(
                    &room,
                    conn_id,
                    ServerMessage::PeerJoined {
                        peer_id: conn_id.to_string(),
                        peer_count,
                    },
                );
            }
            ClientMessage::Leave => self.leave(conn_id),
            ClientMessage::Sync { data, snapshot } => {
                let Some(room_id) = current_room else { return };
                if let Some(room) = self.rooms.get_mut(&room_id) {
                    room.backlog.push(data.clone(), snapshot);
                }
                self.broadcast(
                    &room_id,
                    conn_id,
                    ServerMessage::Sync {
                        from: conn_id.to_string(),
                        data,
                    },
                );
            }
            ClientMessage::Awareness { state } => {
                let Some(room_id) = current_room else { return };
                self.broadcast(
                    &room_id,
                    conn_id,
                    ServerMessage::Awareness {
                        from: conn_id.to_string(),
                        state,
                    },
                );
            }
        }
    }
}

/// Shared handle to an in-memory relay. Clones refer to the same relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Rc<RefCell<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, unconnected client of this relay.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            relay: self.clone(),
            conn_id: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Drop a connection as if the network failed.
    pub fn sever(&self, conn_id: &str) {
        let mut relay = self.inner.borrow_mut();
        relay.leave(conn_id);
        if let Some(conn) = relay.connections.get_mut(conn_id) {
            conn.inbox.push(SyncEvent::Disconnected);
            conn.open = false;
        }
    }

    /// Number of members in a room.
    pub fn room_size(&self, room: &str) -> usize {
        self.inner
            .borrow()
            .rooms
            .get(room)
            .map_or(0, |r| r.members.len())
    }

    /// Every frame received so far, with the sending connection id.
    pub fn frames(&self) -> Vec<(String, ClientMessage)> {
        self.inner.borrow().frames.clone()
    }

    /// Number of document payloads received from `conn_id`.
    pub fn sync_frames_from(&self, conn_id: &str) -> usize {
        self.inner
            .borrow()
            .frames
            .iter()
            .filter(|(from, msg)| from == conn_id && matches!(msg, ClientMessage::Sync { .. }))
            .count()
    }
}

/// Client end of a [`MemoryRelay`].
pub struct MemoryTransport {
    relay: MemoryRelay,
    conn_id: Option<String>,
    state: ConnectionState,
}

impl MemoryTransport {
    /// Relay id of the current connection.
    pub fn connection_id(&self) -> Option<&str> {
        self.conn_id.as_deref()
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, _url: &str) -> Result<(), TransportError> {
        if self.conn_id.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        let mut relay = self.relay.inner.borrow_mut();
        relay.next_id += 1;
        let conn_id = format!("conn-{}", relay.next_id);
        relay.connections.insert(
            conn_id.clone(),
            Connection {
                inbox: vec![SyncEvent::Connected],
                room: None,
                open: true,
            },
        );
        self.conn_id = Some(conn_id);
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(conn_id) = self.conn_id.take() {
            let mut relay = self.relay.inner.borrow_mut();
            relay.leave(&conn_id);
            relay.connections.remove(&conn_id);
        }
        self.state = ConnectionState::Disconnected;
    }

    fn send(&self, msg: &str) -> Result<(), TransportError> {
        let Some(conn_id) = self.conn_id.as_deref() else {
            return Err(TransportError::NotConnected);
        };
        if self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let mut relay = self.relay.inner.borrow_mut();
        if !relay.connections.get(conn_id).is_some_and(|c| c.open) {
            return Err(TransportError::SendFailed("connection closed".into()));
        }
        match serde_json::from_str::<ClientMessage>(msg) {
            Ok(parsed) => relay.handle(conn_id, parsed),
            Err(e) => relay.deliver(
                conn_id,
                ServerMessage::Error {
                    message: format!("Invalid message: {}", e),
                },
            ),
        }
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<SyncEvent> {
        let Some(conn_id) = self.conn_id.clone() else {
            return Vec::new();
        };
        let events = {
            let mut relay = self.relay.inner.borrow_mut();
            match relay.connections.get_mut(&conn_id) {
                Some(conn) => std::mem::take(&mut conn.inbox),
                None => Vec::new(),
            }
        };
        for event in &events {
            match event {
                SyncEvent::Connected => self.state = ConnectionState::Connected,
                SyncEvent::Disconnected => {
                    self.state = ConnectionState::Disconnected;
                    self.relay.inner.borrow_mut().connections.remove(&conn_id);
                    self.conn_id = None;
                }
                _ => {}
            }
        }
        events
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}
