//! The collaborative session: the public surface the UI layer drives.
//!
//! A [`Session`] owns one board's element store, its undo stack, presence
//! tracking, the room connection, and (for the owner) the history log. All
//! of it runs on the caller's thread: mutations apply immediately and are
//! broadcast, and [`Session::poll`] processes inbound traffic and timers.
//!
//! ```no_run
//! use tandem_core::{Element, ElementKind, SessionOptions};
//!
//! let mut session = tandem_core::open("board-1", "Ada", None, SessionOptions::owner());
//! session.add_element(Element::new(ElementKind::Rectangle, 10.0, 10.0));
//! loop {
//!     session.poll();
//!     # break;
//! }
//! ```

use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use kurbo::{Point, Vec2};
use uuid::Uuid;

use crate::awareness::{AwarenessState, AwarenessTracker, Viewport};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::crdt::{ElementStore, StoreResult};
use crate::crypto::{self, RoomKey};
use crate::element::{Element, ElementId, ElementPatch, sort_canonical};
use crate::history::{HistoryManager, diff_elements};
use crate::liveness::{LivenessEvent, OwnerLivenessMonitor};
use crate::observer::{Observers, SubscriptionId};
use crate::permission::{Permission, PermissionGate};
use crate::room::{Backoff, ConnectionChange, ConnectionStatus, Envelope, RoomEvent, RoomSession};
use crate::storage::{HistoryStorage, MemoryHistoryStorage};
use crate::sync::Transport;
use crate::undo::UndoRedoStack;

/// Colors handed out to peers, picked by id.
const PEER_COLORS: [&str; 8] = [
    "#e03131", "#2f9e44", "#1971c2", "#f08c00", "#9c36b5", "#0c8599", "#e8590c", "#5c940d",
];

/// Deterministic color for a peer id.
pub fn peer_color(peer_id: &str) -> &'static str {
    let hash = peer_id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    PEER_COLORS[hash as usize % PEER_COLORS.len()]
}

/// Role options fixed when the session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionOptions {
    pub read_only: bool,
    pub is_owner: bool,
    pub permission: Permission,
}

impl SessionOptions {
    pub fn owner() -> Self {
        Self {
            is_owner: true,
            ..Self::default()
        }
    }

    pub fn guest(permission: Permission) -> Self {
        Self {
            permission,
            ..Self::default()
        }
    }
}

/// Whether document payloads are sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionStatus {
    Encrypted,
    /// No key was supplied.
    Unencrypted,
    /// A key was supplied but could not be imported.
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub color: String,
}

/// Configures and opens a [`Session`].
pub struct SessionBuilder {
    room_id: String,
    display_name: String,
    encryption_key: Option<String>,
    options: SessionOptions,
    config: SyncConfig,
    clock: Rc<dyn Clock>,
    history_storage: Option<Arc<dyn HistoryStorage>>,
    user_id: Option<String>,
}

impl SessionBuilder {
    pub fn new(room_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: display_name.into(),
            encryption_key: None,
            options: SessionOptions::default(),
            config: SyncConfig::default(),
            clock: Rc::new(SystemClock),
            history_storage: None,
            user_id: None,
        }
    }

    /// Out-of-band room secret (e.g. the URL fragment).
    pub fn encryption_key(mut self, secret: impl Into<String>) -> Self {
        self.encryption_key = Some(secret.into());
        self
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Where the owner's history goes. Defaults to memory.
    pub fn history_storage(mut self, storage: Arc<dyn HistoryStorage>) -> Self {
        self.history_storage = Some(storage);
        self
    }

    /// Stable user id; a random one is generated otherwise.
    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Open the session over `transport` and start joining the room.
    pub fn open<T: Transport>(self, transport: T) -> Session<T> {
        let SessionBuilder {
            room_id,
            display_name,
            encryption_key,
            options,
            config,
            clock,
            history_storage,
            user_id,
        } = self;
        let now = clock.now_ms();

        let (key, encryption) = import_room_key(encryption_key.as_deref());
        let gate = PermissionGate::from_options(options.read_only, options.is_owner, options.permission);

        let user_id = user_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let local = AwarenessState {
            color: peer_color(&user_id).to_string(),
            peer_id: user_id,
            display_name,
            is_owner: gate.is_owner(),
            last_active_at: now,
            ..Default::default()
        };
        let awareness = AwarenessTracker::new(local).with_stale_after(config.stale_after_ms);

        let mut history = gate.is_owner().then(|| {
            let storage = history_storage
                .unwrap_or_else(|| Arc::new(MemoryHistoryStorage::new()) as Arc<dyn HistoryStorage>);
            HistoryManager::new(room_id.clone(), storage, clock.clone())
                .with_persist_interval(config.history_persist_interval_ms)
        });
        if let Some(history) = &mut history {
            pollster::block_on(history.initialize());
        }
        let liveness = (!gate.is_owner())
            .then(|| OwnerLivenessMonitor::with_timing(config.owner_grace_ms, config.redirect_delay_ms));

        let mut room = RoomSession::new(transport, config.server_url.clone())
            .with_backoff(Backoff::new(config.reconnect_initial_ms, config.reconnect_max_ms));
        room.connect(&room_id, key, now);

        log::info!(
            "Opened session for room {} ({}, {:?})",
            room_id,
            if gate.is_owner() { "owner" } else { "guest" },
            gate.permission()
        );

        Session {
            store: ElementStore::new(),
            undo: UndoRedoStack::with_capacity(config.undo_capacity),
            room,
            awareness,
            liveness,
            liveness_observers: Observers::new(),
            history,
            gate,
            encryption,
            config,
            clock,
            gesture: None,
            joined_at: None,
            owner_seen: false,
            ended: false,
            destroyed: false,
        }
    }
}

/// Move the elements a remote merge touched into the gesture baseline.
fn rebase_gesture(baseline: &mut Vec<Element>, before: &[Element], after: &[Element]) {
    let diff = diff_elements(before, after);
    let touched: HashSet<&str> = diff
        .added
        .iter()
        .chain(&diff.deleted)
        .chain(&diff.updated)
        .map(String::as_str)
        .collect();
    if touched.is_empty() {
        return;
    }
    baseline.retain(|e| !touched.contains(e.id.as_str()));
    baseline.extend(after.iter().filter(|e| touched.contains(e.id.as_str())).cloned());
    sort_canonical(baseline);
}

fn import_room_key(secret: Option<&str>) -> (Option<RoomKey>, EncryptionStatus) {
    let Some(secret) = secret else {
        return (None, EncryptionStatus::Unencrypted);
    };
    match crypto::import_key(secret) {
        Ok(key) => (Some(key), EncryptionStatus::Encrypted),
        Err(e) => {
            log::warn!("Room key import failed, continuing unencrypted: {}", e);
            (None, EncryptionStatus::Degraded(e.to_string()))
        }
    }
}

/// Open a session against the configured relay.
///
/// The relay URL comes from `TANDEM_SERVER_URL` when set. Owners keep their
/// history under the user data directory, falling back to memory.
#[cfg(not(target_arch = "wasm32"))]
pub fn open(
    room_id: &str,
    display_name: &str,
    encryption_key: Option<&str>,
    options: SessionOptions,
) -> Session<crate::sync::PlatformWebSocket> {
    let mut builder = SessionBuilder::new(room_id, display_name)
        .options(options)
        .config(SyncConfig::from_env());
    if let Some(secret) = encryption_key {
        builder = builder.encryption_key(secret);
    }
    if options.is_owner {
        match crate::storage::create_default_storage() {
            Ok(storage) => builder = builder.history_storage(storage),
            Err(e) => log::warn!("History storage unavailable, keeping history in memory: {}", e),
        }
    }
    builder.open(crate::sync::PlatformWebSocket::new())
}

pub struct Session<T: Transport> {
    store: ElementStore,
    undo: UndoRedoStack,
    room: RoomSession<T>,
    awareness: AwarenessTracker,
    /// Guests only.
    liveness: Option<OwnerLivenessMonitor>,
    liveness_observers: Observers<LivenessEvent>,
    /// Owner only.
    history: Option<HistoryManager>,
    gate: PermissionGate,
    encryption: EncryptionStatus,
    config: SyncConfig,
    clock: Rc<dyn Clock>,
    /// Board state at the start of the gesture in progress.
    gesture: Option<Vec<Element>>,
    joined_at: Option<u64>,
    /// An owner record was seen since the last join.
    owner_seen: bool,
    ended: bool,
    destroyed: bool,
}

impl<T: Transport> Session<T> {
    pub fn builder(room_id: impl Into<String>, display_name: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(room_id, display_name)
    }

    // --- Element mutations ---

    /// Whether mutating calls are accepted right now.
    pub fn can_mutate(&self) -> bool {
        self.gate.can_mutate() && !self.ended && !self.destroyed
    }

    /// Add an element. Returns false if rejected or the id already exists.
    pub fn add_element(&mut self, element: Element) -> bool {
        if !self.can_mutate() || self.store.contains(&element.id) {
            return false;
        }
        self.apply_local(|store| store.add(&element))
    }

    /// Merge `patch` into an existing element.
    pub fn update_element(&mut self, id: &str, patch: ElementPatch) -> bool {
        if !self.can_mutate() || patch.is_empty() || !self.store.contains(id) {
            return false;
        }
        self.apply_local(|store| store.update(id, &patch))
    }

    pub fn delete_element(&mut self, id: &str) -> bool {
        if !self.can_mutate() || !self.store.contains(id) {
            return false;
        }
        self.apply_local(|store| store.delete(id))
    }

    pub fn clear_all(&mut self) -> bool {
        if !self.can_mutate() || self.store.is_empty() {
            return false;
        }
        self.apply_local(|store| store.clear_all().map(|()| true))
    }

    /// Replace the whole board. False if nothing would change.
    pub fn set_elements(&mut self, elements: Vec<Element>) -> bool {
        if !self.can_mutate() {
            return false;
        }
        self.replace_board(&elements)
    }

    fn replace_board(&mut self, target: &[Element]) -> bool {
        if diff_elements(&self.store.elements(), target).is_empty() {
            return false;
        }
        self.apply_local(|store| store.replace_all(target).map(|()| true))
    }

    /// Apply a local change: snapshot for undo, mutate, broadcast the delta,
    /// and log it to history.
    fn apply_local(&mut self, op: impl FnOnce(&mut ElementStore) -> StoreResult<bool>) -> bool {
        let before = self.store.elements();
        let version = self.store.version();
        match op(&mut self.store) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                log::warn!("Local change rejected: {}", e);
                return false;
            }
        }
        // Gestures saved once up front; snapshots applied by undo/redo are
        // refused by the stack itself.
        if self.gesture.is_none() {
            self.undo.save(&before);
        }
        self.awareness.touch(self.clock.now_ms());
        self.broadcast_since(&version);
        self.record_history(&before, None);
        true
    }

    fn broadcast_since(&mut self, version: &crate::crdt::VersionVector) {
        let update = self.store.export_updates(version);
        if !update.is_empty() {
            self.room.send(Envelope::Update(update));
        }
    }

    fn record_history(&mut self, before: &[Element], actor: Option<&str>) {
        if self.gesture.is_some() {
            return;
        }
        if let Some(history) = &mut self.history {
            let after = self.store.elements();
            history.record_diff(before, &after, actor);
        }
    }

    // --- Undo / redo ---

    pub fn undo(&mut self) -> bool {
        if !self.can_mutate() || self.gesture.is_some() {
            return false;
        }
        match self.undo.take_undo(self.store.elements()) {
            Some(target) => self.apply_snapshot(&target),
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        if !self.can_mutate() || self.gesture.is_some() {
            return false;
        }
        match self.undo.take_redo(self.store.elements()) {
            Some(target) => self.apply_snapshot(&target),
            None => false,
        }
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// Full replace through the regular local path with the re-entrancy
    /// guard held: the change is broadcast and logged, but the undo stack
    /// only moves through `take_undo`/`take_redo`.
    fn apply_snapshot(&mut self, target: &[Element]) -> bool {
        self.undo.begin_apply();
        let applied = self.apply_local(|store| store.replace_all(target).map(|()| true));
        self.undo.end_apply();
        applied
    }

    // --- Gestures ---

    /// Start a drag/resize/rotate: one undo snapshot for the whole gesture,
    /// history diffing deferred to [`Session::end_gesture`].
    pub fn begin_gesture(&mut self) -> bool {
        if !self.can_mutate() || self.gesture.is_some() {
            return false;
        }
        let before = self.store.elements();
        self.undo.save(&before);
        self.gesture = Some(before);
        true
    }

    pub fn end_gesture(&mut self) {
        if let Some(before) = self.gesture.take() {
            self.record_history(&before, None);
        }
    }

    pub fn in_gesture(&self) -> bool {
        self.gesture.is_some()
    }

    // --- History ---

    pub fn history(&self) -> Option<&HistoryManager> {
        self.history.as_ref()
    }

    pub fn history_mut(&mut self) -> Option<&mut HistoryManager> {
        self.history.as_mut()
    }

    /// Load prior history (owner only). [`SessionBuilder::open`] already
    /// does this, so it is a no-op on an opened session's manager unless
    /// the manager was swapped out.
    pub async fn initialize_history(&mut self) {
        if let Some(history) = &mut self.history {
            history.initialize().await;
        }
    }

    /// Restore the board to the state right after a history entry. A new,
    /// undoable action; false if the entry is unknown or unreadable.
    pub fn restore_to_entry(&mut self, entry_id: &str) -> bool {
        if !self.can_mutate() {
            return false;
        }
        let Some(target) = self.history.as_ref().and_then(|h| h.restore_to_entry(entry_id)) else {
            return false;
        };
        self.replace_board(&target)
    }

    // --- Reads ---

    pub fn elements(&self) -> Vec<Element> {
        self.store.elements()
    }

    pub fn element(&self, id: &str) -> Option<Element> {
        self.store.get(id)
    }

    pub fn store(&self) -> &ElementStore {
        &self.store
    }

    pub fn permission(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn encryption_status(&self) -> &EncryptionStatus {
        &self.encryption
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.room.status()
    }

    pub fn peer_count(&self) -> usize {
        self.room.peer_count()
    }

    /// Relay id of this session's connection.
    pub fn connection_id(&self) -> Option<&str> {
        self.room.connection_id()
    }

    pub fn transport(&self) -> &T {
        self.room.transport()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Guest session ended by owner absence.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    // --- Presence ---

    pub fn get_user_info(&self) -> UserInfo {
        let local = self.awareness.local();
        UserInfo {
            id: local.peer_id.clone(),
            name: local.display_name.clone(),
            color: local.color.clone(),
        }
    }

    pub fn update_following_user(&mut self, peer_id: Option<String>) {
        self.awareness.set_following(peer_id);
        self.publish_awareness();
    }

    pub fn update_selected_elements(&mut self, ids: Vec<ElementId>) {
        self.awareness.set_selection(ids);
        self.publish_awareness();
    }

    pub fn update_user_name(&mut self, name: impl Into<String>) {
        self.awareness.set_display_name(name.into());
        self.publish_awareness();
    }

    pub fn update_viewport(&mut self, pan: Vec2, zoom: f64) {
        self.awareness.set_viewport(Viewport { pan, zoom });
        self.publish_awareness();
    }

    pub fn update_cursor(&mut self, cursor: Option<Point>) {
        self.awareness.set_cursor(cursor);
        self.publish_awareness();
    }

    /// Known peers inside the staleness window.
    pub fn active_collaborators(&self) -> Vec<AwarenessState> {
        self.awareness.active_records(self.clock.now_ms())
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn is_being_watched(&self) -> bool {
        self.awareness.is_being_watched()
    }

    fn publish_awareness(&mut self) {
        if self.destroyed || self.room.status() != ConnectionStatus::Connected {
            return;
        }
        let state = self.awareness.take_outgoing(self.clock.now_ms());
        self.room.send(Envelope::Awareness(state));
    }

    // --- Observers ---

    pub fn subscribe_elements(&mut self, callback: impl FnMut(&[Element]) + 'static) -> SubscriptionId {
        self.store.subscribe(callback)
    }

    pub fn on_awareness_change(&mut self, callback: impl FnMut(&[AwarenessState]) + 'static) -> SubscriptionId {
        self.awareness.on_change(callback)
    }

    pub fn on_connection_change(&mut self, callback: impl FnMut(&ConnectionChange) + 'static) -> SubscriptionId {
        self.room.on_connection_change(callback)
    }

    pub fn on_liveness_change(&mut self, callback: impl FnMut(&LivenessEvent) + 'static) -> SubscriptionId {
        self.liveness_observers.subscribe(callback)
    }

    // --- Event loop ---

    /// Process inbound traffic and due timers. Call regularly (every frame
    /// or on a short interval).
    pub fn poll(&mut self) {
        if self.destroyed {
            return;
        }
        let now = self.clock.now_ms();

        for event in self.room.poll(now) {
            self.handle_room_event(event, now);
        }

        if self.room.status() == ConnectionStatus::Connected
            && self.awareness.needs_publish(now, self.config.awareness_heartbeat_ms)
        {
            self.publish_awareness();
        }

        self.check_owner_liveness(now);

        if let Some(history) = &mut self.history {
            if history.should_persist(now) {
                if let Err(e) = pollster::block_on(history.persist()) {
                    log::warn!("History write failed, will retry: {}", e);
                }
            }
        }
    }

    fn handle_room_event(&mut self, event: RoomEvent, now: u64) {
        match event {
            RoomEvent::Joined { peer_id, backlog } => {
                log::debug!("Merging {} backlog payloads as {}", backlog.len(), peer_id);
                for data in backlog {
                    self.merge_remote(None, &data);
                }
                self.joined_at = Some(now);
                self.owner_seen = false;
                self.publish_snapshot();
                self.awareness.mark_dirty();
            }
            RoomEvent::PeerJoined { peer_id } => {
                log::debug!("Peer {} joined", peer_id);
                self.publish_snapshot();
                self.awareness.mark_dirty();
            }
            RoomEvent::PeerLeft { peer_id } => {
                self.awareness.remove_connection(&peer_id);
            }
            RoomEvent::Document { from, data } => self.merge_remote(Some(&from), &data),
            RoomEvent::Awareness { from, state } => self.awareness.receive(&from, state, now),
            RoomEvent::Disconnected => self.awareness.clear_peers(),
        }
    }

    /// Send the full document so peers that missed updates catch up.
    fn publish_snapshot(&mut self) {
        if !self.gate.can_mutate() {
            return;
        }
        self.room.send(Envelope::Snapshot(self.store.export_snapshot()));
    }

    fn merge_remote(&mut self, connection_id: Option<&str>, data: &[u8]) {
        let before = (self.history.is_some() || self.gesture.is_some()).then(|| self.store.elements());
        if let Err(e) = self.store.merge(data) {
            log::warn!("Dropping remote update: {}", e);
            return;
        }
        let Some(before) = before else {
            return;
        };
        let actor = connection_id.map(|conn| {
            self.awareness
                .peer_for_connection(conn)
                .unwrap_or(conn)
                .to_string()
        });
        let after = self.store.elements();
        if let Some(history) = &mut self.history {
            history.record_diff(&before, &after, actor.as_deref());
        }
        // Logged under the remote author now, so keep it out of the
        // gesture's own diff.
        if let Some(baseline) = &mut self.gesture {
            rebase_gesture(baseline, &before, &after);
        }
    }

    fn check_owner_liveness(&mut self, now: u64) {
        let Some(joined_at) = self.joined_at else {
            return;
        };
        let Some(monitor) = &mut self.liveness else {
            return;
        };
        let present = self.awareness.owner_present(now);
        self.owner_seen |= present;
        // Give the owner one staleness window after joining to show up.
        let assumed = !self.owner_seen && now.saturating_sub(joined_at) <= self.config.stale_after_ms;

        let mut events: Vec<LivenessEvent> = monitor.observe(present || assumed, now).into_iter().collect();
        events.extend(monitor.tick(now));
        for event in events {
            if event == LivenessEvent::SessionEnded {
                self.ended = true;
                self.gesture = None;
            }
            self.liveness_observers.notify(&event);
        }
    }

    // --- Teardown ---

    /// Tear down: drop every listener and timer, leave the room, and flush
    /// buffered history. No callback fires after this returns.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.store.clear_subscribers();
        self.awareness.clear_subscribers();
        self.room.clear_subscribers();
        self.liveness_observers.clear();
        if let Some(monitor) = &mut self.liveness {
            monitor.cancel();
        }

        self.room.disconnect();

        if let Some(history) = &mut self.history {
            history.cancel_pending_timer();
            let current = self.store.elements();
            pollster::block_on(history.flush(&current));
        }
        log::info!("Session closed");
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}
