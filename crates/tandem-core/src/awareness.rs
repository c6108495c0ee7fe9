//! Ephemeral per-peer presence: who is here, what they look at and select,
//! and whom they follow. Never persisted; rebuilt from broadcasts on reconnect.

use std::collections::{BTreeSet, HashMap};

use kurbo::{Point, Vec2};
use serde::{Deserialize, Serialize};

use crate::element::ElementId;
use crate::observer::{Observers, SubscriptionId};

/// Records idle for longer than this are left out of active views.
pub const STALE_AFTER_MS: u64 = 30_000;

/// Camera of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub pan: Vec2,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            pan: Vec2::ZERO,
            zoom: 1.0,
        }
    }
}

/// Presence record of a single peer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AwarenessState {
    pub peer_id: String,
    pub display_name: String,
    /// Peer color as `#rrggbb`.
    pub color: String,
    #[serde(default)]
    pub is_owner: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Point>,
    #[serde(default)]
    pub selected_element_ids: Vec<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following_peer_id: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub last_active_at: u64,
}

impl AwarenessState {
    /// Whether the record falls inside the staleness window at `now`.
    pub fn is_active(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_active_at) <= stale_after_ms
    }
}

/// Filter a record set down to peers active at `now`.
pub fn active_peers(records: &[AwarenessState], now_ms: u64, stale_after_ms: u64) -> Vec<&AwarenessState> {
    records
        .iter()
        .filter(|r| r.is_active(now_ms, stale_after_ms))
        .collect()
}

/// Tracks the local presence record and every remote peer's last record.
pub struct AwarenessTracker {
    local: AwarenessState,
    /// Remote records keyed by peer id; last write wins.
    peers: HashMap<String, AwarenessState>,
    /// Relay connection id -> peer id, learned from incoming broadcasts.
    connections: HashMap<String, String>,
    /// Peers currently following the local peer.
    spectators: BTreeSet<String>,
    observers: Observers<[AwarenessState]>,
    stale_after_ms: u64,
    /// Local record changed since the last broadcast.
    dirty: bool,
    last_published_at: Option<u64>,
}

impl AwarenessTracker {
    pub fn new(local: AwarenessState) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            connections: HashMap::new(),
            spectators: BTreeSet::new(),
            observers: Observers::new(),
            stale_after_ms: STALE_AFTER_MS,
            dirty: true,
            last_published_at: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after_ms: u64) -> Self {
        self.stale_after_ms = stale_after_ms;
        self
    }

    pub fn local(&self) -> &AwarenessState {
        &self.local
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local.peer_id
    }

    // --- Local record ---

    /// Replace the local record wholesale.
    pub fn publish(&mut self, local: AwarenessState) {
        self.local = local;
        self.dirty = true;
    }

    pub fn set_following(&mut self, peer_id: Option<String>) {
        self.local.following_peer_id = peer_id;
        self.dirty = true;
    }

    pub fn set_selection(&mut self, ids: Vec<ElementId>) {
        self.local.selected_element_ids = ids;
        self.dirty = true;
    }

    pub fn set_display_name(&mut self, name: String) {
        self.local.display_name = name;
        self.dirty = true;
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.local.viewport = Some(viewport);
        self.dirty = true;
    }

    pub fn set_cursor(&mut self, cursor: Option<Point>) {
        self.local.cursor = cursor;
        self.dirty = true;
    }

    /// Record user activity without changing anything else.
    pub fn touch(&mut self, now_ms: u64) {
        self.local.last_active_at = now_ms;
    }

    /// Whether the local record should go out now: it changed, or the
    /// heartbeat interval elapsed.
    pub fn needs_publish(&self, now_ms: u64, heartbeat_ms: u64) -> bool {
        match self.last_published_at {
            _ if self.dirty => true,
            Some(last) => now_ms.saturating_sub(last) >= heartbeat_ms,
            None => true,
        }
    }

    /// Stamp and return the record to broadcast.
    pub fn take_outgoing(&mut self, now_ms: u64) -> AwarenessState {
        self.local.last_active_at = now_ms;
        self.dirty = false;
        self.last_published_at = Some(now_ms);
        self.local.clone()
    }

    /// Force the next `needs_publish` to fire (e.g. after reconnecting).
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    // --- Remote records ---

    /// Store a peer's broadcast. `now_ms` is the local receive time, used as
    /// the activity stamp so peers' clock skew cannot make records stale.
    pub fn receive(&mut self, connection_id: &str, mut state: AwarenessState, now_ms: u64) {
        if state.peer_id.is_empty() || state.peer_id == self.local.peer_id {
            return;
        }
        state.last_active_at = now_ms;
        self.connections
            .insert(connection_id.to_string(), state.peer_id.clone());
        self.peers.insert(state.peer_id.clone(), state);
        self.changed();
    }

    /// Drop the record behind a relay connection that left.
    pub fn remove_connection(&mut self, connection_id: &str) -> Option<AwarenessState> {
        let peer_id = self.connections.remove(connection_id)?;
        let removed = self.peers.remove(&peer_id);
        if removed.is_some() {
            self.changed();
        }
        removed
    }

    /// Forget every remote record (disconnect); they are rebuilt on reconnect.
    pub fn clear_peers(&mut self) {
        let had_peers = !self.peers.is_empty();
        self.peers.clear();
        self.connections.clear();
        if had_peers {
            self.changed();
        }
    }

    /// Peer id behind a relay connection, if it has broadcast presence.
    pub fn peer_for_connection(&self, connection_id: &str) -> Option<&str> {
        self.connections.get(connection_id).map(String::as_str)
    }

    pub fn peer(&self, peer_id: &str) -> Option<&AwarenessState> {
        self.peers.get(peer_id)
    }

    /// Every known remote record, sorted by peer id.
    pub fn records(&self) -> Vec<AwarenessState> {
        let mut records: Vec<_> = self.peers.values().cloned().collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }

    /// Remote records inside the staleness window.
    pub fn active_records(&self, now_ms: u64) -> Vec<AwarenessState> {
        self.records()
            .into_iter()
            .filter(|r| r.is_active(now_ms, self.stale_after_ms))
            .collect()
    }

    /// Whether an owner record is currently fresh.
    pub fn owner_present(&self, now_ms: u64) -> bool {
        self.peers
            .values()
            .any(|r| r.is_owner && r.is_active(now_ms, self.stale_after_ms))
    }

    /// Peers following the local peer.
    pub fn spectators(&self) -> &BTreeSet<String> {
        &self.spectators
    }

    pub fn is_being_watched(&self) -> bool {
        !self.spectators.is_empty()
    }

    // --- Observers ---

    pub fn on_change(&mut self, callback: impl FnMut(&[AwarenessState]) + 'static) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn clear_subscribers(&mut self) {
        self.observers.clear();
    }

    fn changed(&mut self) {
        let local_id = &self.local.peer_id;
        self.spectators = self
            .peers
            .values()
            .filter(|r| r.following_peer_id.as_deref() == Some(local_id.as_str()))
            .map(|r| r.peer_id.clone())
            .collect();
        if !self.observers.is_empty() {
            let records = self.records();
            self.observers.notify(&records);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn state(peer_id: &str) -> AwarenessState {
        AwarenessState {
            peer_id: peer_id.to_string(),
            display_name: peer_id.to_uppercase(),
            color: "#123456".into(),
            ..Default::default()
        }
    }

    fn tracker() -> AwarenessTracker {
        AwarenessTracker::new(state("me"))
    }

    #[test]
    fn test_staleness_window() {
        let now = 1_000_000;
        let mut old = state("old");
        old.last_active_at = now - 31_000;
        let mut fresh = state("fresh");
        fresh.last_active_at = now - 29_000;

        let records = vec![old, fresh];
        let active = active_peers(&records, now, STALE_AFTER_MS);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].peer_id, "fresh");
    }

    #[test]
    fn test_tracker_active_records_use_receive_time() {
        let mut t = tracker();
        t.receive("c1", state("a"), 0);
        t.receive("c2", state("b"), 20_000);

        let active: Vec<_> = t.active_records(49_000).into_iter().map(|r| r.peer_id).collect();
        assert_eq!(active, ["b"]);
        assert_eq!(t.records().len(), 2);
    }

    #[test]
    fn test_last_write_wins_per_peer() {
        let mut t = tracker();
        let mut first = state("a");
        first.display_name = "First".into();
        let mut second = state("a");
        second.display_name = "Second".into();
        t.receive("c1", first, 1);
        t.receive("c1", second, 2);

        assert_eq!(t.records().len(), 1);
        assert_eq!(t.peer("a").unwrap().display_name, "Second");
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut t = tracker();
        t.receive("c0", state("me"), 1);
        assert!(t.records().is_empty());
    }

    #[test]
    fn test_spectator_index() {
        let mut t = tracker();
        let mut follower = state("a");
        follower.following_peer_id = Some("me".into());
        t.receive("c1", follower, 1);
        let mut other = state("b");
        other.following_peer_id = Some("a".into());
        t.receive("c2", other, 1);

        assert!(t.is_being_watched());
        assert_eq!(t.spectators().iter().collect::<Vec<_>>(), ["a"]);

        let mut unfollow = state("a");
        unfollow.following_peer_id = None;
        t.receive("c1", unfollow, 2);
        assert!(!t.is_being_watched());
    }

    #[test]
    fn test_remove_connection_drops_record() {
        let mut t = tracker();
        t.receive("c1", state("a"), 1);
        assert_eq!(t.peer_for_connection("c1"), Some("a"));
        assert!(t.remove_connection("c1").is_some());
        assert!(t.peer("a").is_none());
        assert!(t.remove_connection("c1").is_none());
    }

    #[test]
    fn test_on_change_delivers_full_set() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut t = tracker();
        let sink = seen.clone();
        t.on_change(move |records: &[AwarenessState]| sink.borrow_mut().push(records.len()));

        t.receive("c1", state("a"), 1);
        t.receive("c2", state("b"), 1);
        t.remove_connection("c1");
        assert_eq!(*seen.borrow(), vec![1, 2, 1]);
    }

    #[test]
    fn test_owner_presence() {
        let mut t = tracker();
        let mut owner = state("o");
        owner.is_owner = true;
        t.receive("c1", owner, 10_000);
        assert!(t.owner_present(40_000));
        assert!(!t.owner_present(40_001));
    }

    #[test]
    fn test_publish_heartbeat() {
        let mut t = tracker();
        assert!(t.needs_publish(0, 15_000));
        let out = t.take_outgoing(100);
        assert_eq!(out.last_active_at, 100);
        assert!(!t.needs_publish(10_000, 15_000));
        assert!(t.needs_publish(15_100, 15_000));

        t.set_selection(vec!["e1".into()]);
        assert!(t.needs_publish(200, 15_000));
        assert_eq!(t.take_outgoing(200).selected_element_ids, ["e1"]);
    }
}
