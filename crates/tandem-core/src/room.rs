//! One room's network channel: joins, reconnects, seals document payloads,
//! and turns relay traffic into [`RoomEvent`]s.

use crate::awareness::AwarenessState;
use crate::crypto::{self, RoomKey};
use crate::observer::{Observers, SubscriptionId};
use crate::sync::{ClientMessage, SyncEvent, Transport, TransportError, encode_payload};

/// Coarse connection status reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// A status transition, with the relay's peer count (0 unless connected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionChange {
    pub status: ConnectionStatus,
    pub peer_count: usize,
}

/// Outgoing payloads.
#[derive(Debug, Clone)]
pub enum Envelope {
    /// Incremental document update.
    Update(Vec<u8>),
    /// Full document state.
    Snapshot(Vec<u8>),
    Awareness(AwarenessState),
}

/// Inbound traffic, already decrypted.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Joined (or re-joined) the room. `backlog` holds document payloads to
    /// merge, oldest first.
    Joined { peer_id: String, backlog: Vec<Vec<u8>> },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    Document { from: String, data: Vec<u8> },
    Awareness { from: String, state: AwarenessState },
    Disconnected,
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms: initial_ms.max(1),
            max_ms: max_ms.max(initial_ms),
            attempt: 0,
        }
    }

    /// Delay before the next attempt; doubles each call up to the cap.
    pub fn next_delay(&mut self) -> u64 {
        let factor = 1u64.checked_shl(self.attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.initial_ms.saturating_mul(factor).min(self.max_ms);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub struct RoomSession<T: Transport> {
    transport: T,
    url: String,
    room_id: Option<String>,
    key: Option<RoomKey>,
    status: ConnectionStatus,
    peer_count: usize,
    /// This connection's relay id, known once joined.
    connection_id: Option<String>,
    observers: Observers<ConnectionChange>,
    backoff: Backoff,
    reconnect_at: Option<u64>,
    advised_unencrypted: bool,
    /// Set by `connect`, cleared by `disconnect`.
    wanted: bool,
}

impl<T: Transport> RoomSession<T> {
    pub fn new(transport: T, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            room_id: None,
            key: None,
            status: ConnectionStatus::Disconnected,
            peer_count: 0,
            connection_id: None,
            observers: Observers::new(),
            backoff: Backoff::new(500, 30_000),
            reconnect_at: None,
            advised_unencrypted: false,
            wanted: false,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start joining `room_id`. Returns once the connection attempt is under
    /// way; progress is reported through [`RoomSession::poll`] and observers.
    pub fn connect(&mut self, room_id: &str, key: Option<RoomKey>, now_ms: u64) {
        self.room_id = Some(room_id.to_string());
        self.key = key;
        self.wanted = true;
        if self.key.is_none() && !self.advised_unencrypted {
            log::warn!("Room {} is not end-to-end encrypted", room_id);
            self.advised_unencrypted = true;
        }
        self.attempt(now_ms);
    }

    fn attempt(&mut self, now_ms: u64) {
        self.reconnect_at = None;
        match self.transport.connect(&self.url) {
            Ok(()) => self.set_status(ConnectionStatus::Connecting, 0),
            Err(TransportError::AlreadyConnected) => {}
            Err(e) => {
                log::warn!("Connecting to {} failed: {}", self.url, e);
                self.schedule_reconnect(now_ms);
            }
        }
    }

    fn schedule_reconnect(&mut self, now_ms: u64) {
        let delay = self.backoff.next_delay();
        log::info!("Reconnecting in {} ms", delay);
        self.reconnect_at = Some(now_ms + delay);
        self.set_status(ConnectionStatus::Disconnected, 0);
    }

    pub fn disconnect(&mut self) {
        self.wanted = false;
        self.reconnect_at = None;
        if self.transport.is_connected() && self.room_id.is_some() {
            let _ = self.transport.send_message(&ClientMessage::Leave);
        }
        self.transport.disconnect();
        self.connection_id = None;
        self.set_status(ConnectionStatus::Disconnected, 0);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn on_connection_change(&mut self, callback: impl FnMut(&ConnectionChange) + 'static) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn clear_subscribers(&mut self) {
        self.observers.clear();
    }

    fn set_status(&mut self, status: ConnectionStatus, peer_count: usize) {
        if self.status == status && self.peer_count == peer_count {
            return;
        }
        self.status = status;
        self.peer_count = peer_count;
        self.observers.notify(&ConnectionChange { status, peer_count });
    }

    /// Send a payload to the room. Document payloads are sealed with the
    /// room key; awareness goes in clear. Returns false if nothing was sent.
    pub fn send(&mut self, envelope: Envelope) -> bool {
        if self.status != ConnectionStatus::Connected {
            return false;
        }
        let msg = match envelope {
            Envelope::Awareness(state) => ClientMessage::Awareness { state },
            Envelope::Update(bytes) => match self.seal(&bytes) {
                Some(data) => ClientMessage::Sync { data, snapshot: false },
                None => return false,
            },
            Envelope::Snapshot(bytes) => match self.seal(&bytes) {
                Some(data) => ClientMessage::Sync { data, snapshot: true },
                None => return false,
            },
        };
        match self.transport.send_message(&msg) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Send failed: {}", e);
                false
            }
        }
    }

    fn seal(&self, bytes: &[u8]) -> Option<String> {
        match &self.key {
            Some(key) => match crypto::encrypt(key, bytes) {
                Ok(sealed) => Some(encode_payload(&sealed)),
                Err(e) => {
                    log::warn!("Dropping outgoing payload: {}", e);
                    None
                }
            },
            None => Some(encode_payload(bytes)),
        }
    }

    fn open(&self, from: &str, data: Vec<u8>) -> Option<Vec<u8>> {
        match &self.key {
            Some(key) => match crypto::decrypt(key, &data) {
                Ok(plain) => Some(plain),
                Err(e) => {
                    log::warn!("Dropping payload from {}: {}", from, e);
                    None
                }
            },
            None => Some(data),
        }
    }

    /// Drain the transport and run the reconnect timer.
    pub fn poll(&mut self, now_ms: u64) -> Vec<RoomEvent> {
        if self.wanted && self.reconnect_at.is_some_and(|at| now_ms >= at) {
            self.attempt(now_ms);
        }

        let mut out = Vec::new();
        for event in self.transport.poll_events() {
            match event {
                SyncEvent::Connected => {
                    if let Some(room) = self.room_id.clone() {
                        if let Err(e) = self.transport.send_message(&ClientMessage::Join { room }) {
                            log::warn!("Join failed: {}", e);
                        }
                    }
                }
                SyncEvent::JoinedRoom {
                    room,
                    peer_id,
                    peer_count,
                    initial_sync,
                } => {
                    log::info!("Joined room {} as {} ({} peers)", room, peer_id, peer_count);
                    self.backoff.reset();
                    self.connection_id = Some(peer_id.clone());
                    let backlog = initial_sync
                        .into_iter()
                        .filter_map(|data| self.open("backlog", data))
                        .collect();
                    self.set_status(ConnectionStatus::Connected, peer_count);
                    out.push(RoomEvent::Joined { peer_id, backlog });
                }
                SyncEvent::PeerJoined { peer_id, peer_count } => {
                    self.set_status(ConnectionStatus::Connected, peer_count);
                    out.push(RoomEvent::PeerJoined { peer_id });
                }
                SyncEvent::PeerLeft { peer_id, peer_count } => {
                    self.set_status(ConnectionStatus::Connected, peer_count);
                    out.push(RoomEvent::PeerLeft { peer_id });
                }
                SyncEvent::SyncReceived { from, data } => {
                    if let Some(data) = self.open(&from, data) {
                        out.push(RoomEvent::Document { from, data });
                    }
                }
                SyncEvent::AwarenessReceived { from, state } => {
                    out.push(RoomEvent::Awareness { from, state });
                }
                SyncEvent::Disconnected => {
                    self.connection_id = None;
                    out.push(RoomEvent::Disconnected);
                    if self.wanted {
                        self.schedule_reconnect(now_ms);
                    } else {
                        self.set_status(ConnectionStatus::Disconnected, 0);
                    }
                }
                SyncEvent::Error { message } => {
                    log::warn!("Relay error: {}", message);
                    if !self.transport.is_connected() && self.wanted {
                        self.connection_id = None;
                        out.push(RoomEvent::Disconnected);
                        self.schedule_reconnect(now_ms);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_room_key, import_key};
    use crate::sync::MemoryRelay;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn session(relay: &MemoryRelay, key: Option<RoomKey>) -> RoomSession<crate::sync::MemoryTransport> {
        let mut room = RoomSession::new(relay.transport(), "memory://relay");
        room.connect("board", key, 0);
        room.poll(0);
        room.poll(0);
        room
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(500, 3_000);
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays, [500, 1_000, 2_000, 3_000, 3_000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), 500);
    }

    #[test]
    fn test_connection_transitions_reported() {
        let relay = MemoryRelay::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut room = RoomSession::new(relay.transport(), "memory://relay");
        let sink = seen.clone();
        room.on_connection_change(move |c: &ConnectionChange| sink.borrow_mut().push(*c));

        room.connect("board", None, 0);
        room.poll(0);
        room.poll(0);
        assert_eq!(room.status(), ConnectionStatus::Connected);

        let mut other = session(&relay, None);
        room.poll(0);
        assert_eq!(room.peer_count(), 2);

        other.disconnect();
        room.poll(0);
        room.disconnect();

        let statuses: Vec<_> = seen.borrow().iter().map(|c| (c.status, c.peer_count)).collect();
        assert_eq!(
            statuses,
            [
                (ConnectionStatus::Connecting, 0),
                (ConnectionStatus::Connected, 1),
                (ConnectionStatus::Connected, 2),
                (ConnectionStatus::Connected, 1),
                (ConnectionStatus::Disconnected, 0),
            ]
        );
    }

    #[test]
    fn test_encrypted_payloads_roundtrip() {
        let relay = MemoryRelay::new();
        let secret = generate_room_key();
        let mut a = session(&relay, Some(import_key(&secret).unwrap()));
        let mut b = session(&relay, Some(import_key(&secret).unwrap()));
        a.poll(0);

        assert!(a.send(Envelope::Update(b"doc bytes".to_vec())));
        let frames = relay.frames();
        let (_, last) = frames.last().unwrap();
        match last {
            ClientMessage::Sync { data, .. } => assert_ne!(data, &encode_payload(b"doc bytes")),
            other => panic!("unexpected {:?}", other),
        }

        let events = b.poll(0);
        assert!(events.contains(&RoomEvent::Document {
            from: a.connection_id().unwrap().to_string(),
            data: b"doc bytes".to_vec(),
        }));
    }

    #[test]
    fn test_wrong_key_payload_dropped() {
        let relay = MemoryRelay::new();
        let mut a = session(&relay, Some(import_key(&generate_room_key()).unwrap()));
        let mut b = session(&relay, Some(import_key(&generate_room_key()).unwrap()));
        a.poll(0);

        assert!(a.send(Envelope::Update(b"secret".to_vec())));
        let events = b.poll(0);
        assert!(!events.iter().any(|e| matches!(e, RoomEvent::Document { .. })));
        assert_eq!(b.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_send_before_connected_is_dropped() {
        let relay = MemoryRelay::new();
        let mut room = RoomSession::new(relay.transport(), "memory://relay");
        assert!(!room.send(Envelope::Update(vec![1])));
        room.connect("board", None, 0);
        assert!(!room.send(Envelope::Update(vec![1])));
        assert!(relay.frames().is_empty());
    }

    #[test]
    fn test_reconnects_after_drop() {
        let relay = MemoryRelay::new();
        let mut room = session(&relay, None);
        let conn = room.connection_id().unwrap().to_string();

        relay.sever(&conn);
        let events = room.poll(1_000);
        assert_eq!(events, vec![RoomEvent::Disconnected]);
        assert_eq!(room.status(), ConnectionStatus::Disconnected);

        room.poll(1_499);
        assert_eq!(room.status(), ConnectionStatus::Disconnected);
        room.poll(1_500);
        let events = room.poll(1_500);
        assert!(matches!(events[..], [RoomEvent::Joined { .. }]));
        assert_eq!(room.status(), ConnectionStatus::Connected);
        assert_ne!(room.connection_id(), Some(conn.as_str()));
    }
}
