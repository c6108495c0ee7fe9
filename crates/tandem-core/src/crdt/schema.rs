//! Loro document schema and element operations.

use loro::{Container, ExportMode, LoroDoc, LoroMap, LoroValue, ValueOrContainer, VersionVector};

use super::convert::{element_from_loro, element_to_loro, patch_to_loro};
use super::{StoreError, StoreResult};
use crate::element::{Element, ElementPatch, sort_canonical};
use crate::observer::{Observers, SubscriptionId};

/// Key for the element map in the document.
pub const ELEMENTS_KEY: &str = "elements";

/// The shared, conflict-free element collection of one board.
///
/// Wraps a `LoroDoc` whose root map holds one child map per element id.
/// Every mutation commits immediately; the bytes to broadcast are obtained
/// with [`ElementStore::export_updates`] against the version captured before
/// the mutation.
pub struct ElementStore {
    doc: LoroDoc,
    observers: Observers<[Element]>,
}

impl ElementStore {
    /// Create an empty store with a random peer id.
    pub fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            observers: Observers::new(),
        }
    }

    /// Create an empty store with a fixed peer id.
    pub fn with_peer_id(peer_id: u64) -> StoreResult<Self> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer_id)?;
        Ok(Self {
            doc,
            observers: Observers::new(),
        })
    }

    /// Peer id used to tag this replica's operations.
    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    fn elements_map(&self) -> LoroMap {
        self.doc.get_map(ELEMENTS_KEY)
    }

    fn element_map(&self, id: &str) -> Option<LoroMap> {
        match self.elements_map().get(id)? {
            ValueOrContainer::Container(Container::Map(map)) => Some(map),
            _ => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.elements_map().get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.elements_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an element. Returns `Ok(false)` without touching the document if
    /// the id is already present.
    pub fn add(&mut self, element: &Element) -> StoreResult<bool> {
        if self.contains(&element.id) {
            return Ok(false);
        }
        self.insert_element(element)?;
        self.doc.commit();
        self.notify();
        Ok(true)
    }

    fn insert_element(&self, element: &Element) -> StoreResult<()> {
        let map = self
            .elements_map()
            .insert_container(&element.id, LoroMap::new())?;
        element_to_loro(element, &map)
    }

    /// Merge the supplied fields into an existing element. Fields not in the
    /// patch are left alone so concurrent edits to other fields survive.
    /// Returns `Ok(false)` if the element does not exist.
    pub fn update(&mut self, id: &str, patch: &ElementPatch) -> StoreResult<bool> {
        let Some(map) = self.element_map(id) else {
            return Ok(false);
        };
        if patch.is_empty() {
            return Ok(true);
        }
        if let Some(current) = self.get(id) {
            patch
                .apply_to(&current)
                .map_err(|e| StoreError::InvalidPatch {
                    id: id.to_string(),
                    reason: e.to_string(),
                })?;
        }
        patch_to_loro(patch, &map)?;
        self.doc.commit();
        self.notify();
        Ok(true)
    }

    /// Remove an element. Returns `Ok(false)` if it was not present.
    pub fn delete(&mut self, id: &str) -> StoreResult<bool> {
        if !self.contains(id) {
            return Ok(false);
        }
        self.elements_map().delete(id)?;
        self.doc.commit();
        self.notify();
        Ok(true)
    }

    fn remove_all(&self) -> StoreResult<()> {
        let map = self.elements_map();
        for key in self.keys() {
            map.delete(&key)?;
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        match self.elements_map().get_deep_value() {
            LoroValue::Map(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Remove every element.
    pub fn clear_all(&mut self) -> StoreResult<()> {
        self.remove_all()?;
        self.doc.commit();
        self.notify();
        Ok(())
    }

    /// Replace the whole collection: clear, then re-add every element, in a
    /// single commit so peers never observe the intermediate empty board.
    pub fn replace_all(&mut self, elements: &[Element]) -> StoreResult<()> {
        self.remove_all()?;
        for element in elements {
            self.insert_element(element)?;
        }
        self.doc.commit();
        self.notify();
        Ok(())
    }

    /// Get an element by id.
    pub fn get(&self, id: &str) -> Option<Element> {
        match self.element_map(id)?.get_deep_value() {
            LoroValue::Map(fields) => element_from_loro(&fields),
            _ => None,
        }
    }

    /// All decodable elements in canonical (z-index, id) order.
    pub fn elements(&self) -> Vec<Element> {
        let mut elements: Vec<Element> = match self.elements_map().get_deep_value() {
            LoroValue::Map(map) => map
                .iter()
                .filter_map(|(id, value)| match value {
                    LoroValue::Map(fields) => {
                        let element = element_from_loro(fields);
                        if element.is_none() {
                            log::debug!("Skipping undecodable element {}", id);
                        }
                        element
                    }
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        sort_canonical(&mut elements);
        elements
    }

    // --- Observers ---

    /// Register a callback that receives the full collection after every
    /// completed merge, local or remote.
    pub fn subscribe(&mut self, callback: impl FnMut(&[Element]) + 'static) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Drop every subscriber.
    pub fn clear_subscribers(&mut self) {
        self.observers.clear();
    }

    fn notify(&mut self) {
        if self.observers.is_empty() {
            return;
        }
        let elements = self.elements();
        self.observers.notify(&elements);
    }

    // --- Network sync ---

    /// Current version vector, captured before a mutation to export its delta.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    /// Export the document as a snapshot (full state).
    pub fn export_snapshot(&self) -> Vec<u8> {
        self.doc.export(ExportMode::Snapshot).unwrap_or_default()
    }

    /// Export incremental updates since a version.
    pub fn export_updates(&self, since: &VersionVector) -> Vec<u8> {
        self.doc.export(ExportMode::updates(since)).unwrap_or_default()
    }

    /// Merge bytes produced by any replica's `export_*`. Merging is
    /// commutative and idempotent, so order and duplicates do not matter.
    pub fn merge(&mut self, bytes: &[u8]) -> StoreResult<()> {
        self.doc.import(bytes)?;
        self.notify();
        Ok(())
    }
}

impl Default for ElementStore {
    fn default() -> Self {
        Self::new()
    }
}
