//! Conversion between elements and Loro maps.
//!
//! Each top-level element field is stored under its own key as JSON text.
//! Storing whole JSON values (rather than exploding nested arrays into
//! containers) keeps every field a single last-writer-wins register.

use loro::{LoroMap, LoroMapValue, LoroValue};
use serde_json::{Map, Value};

use super::StoreResult;
use crate::element::{Element, ElementPatch};

/// Write every field of an element into a fresh element map.
pub fn element_to_loro(element: &Element, map: &LoroMap) -> StoreResult<()> {
    for (key, value) in element.to_fields()? {
        map.insert(&key, value.to_string())?;
    }
    Ok(())
}

/// Write only the patched fields into an existing element map.
pub fn patch_to_loro(patch: &ElementPatch, map: &LoroMap) -> StoreResult<()> {
    for (key, value) in patch.fields() {
        map.insert(key, value.to_string())?;
    }
    Ok(())
}

/// Decode the field map of one element. Returns `None` for partial or
/// foreign records.
pub fn element_from_loro(map: &LoroMapValue) -> Option<Element> {
    let mut fields = Map::new();
    for (key, value) in map.iter() {
        let LoroValue::String(raw) = value else {
            return None;
        };
        let text = raw.to_string();
        let parsed: Value = serde_json::from_str(&text).ok()?;
        fields.insert(key.clone(), parsed);
    }
    Element::from_fields(fields).ok()
}
