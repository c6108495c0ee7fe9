//! Drawable element records shared across a board.
//!
//! Elements are flat records: every top-level field is stored as its own
//! CRDT key, so concurrent edits to different fields of the same element
//! merge instead of overwriting each other.

use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier for elements. Immutable once the element exists.
pub type ElementId = String;

/// Name of the id field, which patches may never touch.
pub const ID_FIELD: &str = "id";

/// Element variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Rectangle,
    Ellipse,
    Freehand,
    Line,
    Arrow,
    Text,
    /// Embedded content (rich text, code, diagram, image) edited elsewhere.
    Tile,
    Frame,
}

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SerializableColor {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    pub fn white() -> Self {
        Self::new(255, 255, 255, 255)
    }

    /// Format as `#rrggbb` (alpha dropped), the form used for peer colors.
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

fn default_stroke_width() -> f64 {
    2.0
}

fn default_opacity() -> f64 {
    1.0
}

/// A drawable element on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    /// Rotation in radians around the element center.
    #[serde(default)]
    pub angle: f64,
    /// Explicit stacking order; higher draws on top.
    #[serde(default)]
    pub z_index: i64,
    #[serde(default = "SerializableColor::black")]
    pub stroke_color: SerializableColor,
    #[serde(default)]
    pub fill_color: Option<SerializableColor>,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: f64,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub locked: bool,
    /// Points relative to (x, y), for freehand strokes and lines/arrows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    /// Frame that contains this element, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<ElementId>,
    /// Type-specific payload owned by an external editor (tiles).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl Element {
    /// Create an element with a fresh id at the given position.
    pub fn new(kind: ElementKind, x: f64, y: f64) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, x, y)
    }

    /// Create an element with a caller-chosen id.
    pub fn with_id(id: impl Into<ElementId>, kind: ElementKind, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            x,
            y,
            width: 0.0,
            height: 0.0,
            angle: 0.0,
            z_index: 0,
            stroke_color: SerializableColor::black(),
            fill_color: None,
            stroke_width: default_stroke_width(),
            opacity: default_opacity(),
            locked: false,
            points: Vec::new(),
            text: None,
            font_size: None,
            frame_id: None,
            content: None,
        }
    }

    /// Builder-style size setter.
    pub fn sized(mut self, width: f64, height: f64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Axis-aligned bounding box, ignoring rotation.
    pub fn bounds(&self) -> Rect {
        let frame = Rect::new(self.x, self.y, self.x + self.width, self.y + self.height);
        self.points.iter().fold(frame, |rect, p| {
            rect.union_pt(Point::new(self.x + p.x, self.y + p.y))
        })
    }

    /// Field map as stored in the CRDT (one entry per top-level field).
    pub fn to_fields(&self) -> serde_json::Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "element serialized to non-object: {other}"
            ))),
        }
    }

    /// Rebuild an element from its field map.
    pub fn from_fields(fields: Map<String, Value>) -> serde_json::Result<Self> {
        serde_json::from_value(Value::Object(fields))
    }

    /// Serialized form used for deep-equality diffing.
    pub fn content_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Sort a collection into canonical order: z-index, then id.
pub fn sort_canonical(elements: &mut [Element]) {
    elements.sort_by(|a, b| a.z_index.cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
}

/// A partial update: only the listed fields change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementPatch(Map<String, Value>);

impl ElementPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field. Writes to `id` are dropped.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Set a field in place. Writes to `id` are dropped.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        if field != ID_FIELD {
            self.0.insert(field.to_string(), value.into());
        }
    }

    /// Convenience for a move.
    pub fn position(x: f64, y: f64) -> Self {
        Self::new().with("x", x).with("y", y)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Apply onto an element, validating that the result is still well-formed.
    pub fn apply_to(&self, element: &Element) -> serde_json::Result<Element> {
        let mut fields = element.to_fields()?;
        for (key, value) in self.fields() {
            fields.insert(key.clone(), value.clone());
        }
        Element::from_fields(fields)
    }
}

impl From<Map<String, Value>> for ElementPatch {
    fn from(mut map: Map<String, Value>) -> Self {
        map.remove(ID_FIELD);
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_roundtrip_preserves_element() {
        let mut el = Element::new(ElementKind::Freehand, 10.0, 20.0);
        el.points = vec![Point::new(0.0, 0.0), Point::new(5.0, -3.0)];
        el.fill_color = Some(SerializableColor::new(10, 20, 30, 128));

        let fields = el.to_fields().unwrap();
        assert_eq!(fields.get("type"), Some(&Value::from("freehand")));
        assert!(!fields.contains_key("text"));

        let back = Element::from_fields(fields).unwrap();
        assert_eq!(back, el);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let json = serde_json::json!({"id": "a", "type": "rectangle", "x": 1, "y": 2});
        let el: Element = serde_json::from_value(json).unwrap();
        assert_eq!(el.stroke_width, 2.0);
        assert_eq!(el.opacity, 1.0);
        assert_eq!(el.stroke_color, SerializableColor::black());
    }

    #[test]
    fn test_patch_never_touches_id() {
        let patch = ElementPatch::new().with("id", "other").with("x", 5.0);
        assert_eq!(patch.len(), 1);

        let mut raw = Map::new();
        raw.insert("id".into(), Value::from("x"));
        raw.insert("y".into(), Value::from(3.0));
        assert_eq!(ElementPatch::from(raw).len(), 1);
    }

    #[test]
    fn test_patch_apply_rejects_bad_type() {
        let el = Element::with_id("a", ElementKind::Rectangle, 0.0, 0.0);
        let bad = ElementPatch::new().with("x", "not a number");
        assert!(bad.apply_to(&el).is_err());

        let good = ElementPatch::position(4.0, 8.0);
        let moved = good.apply_to(&el).unwrap();
        assert_eq!((moved.x, moved.y), (4.0, 8.0));
    }

    #[test]
    fn test_bounds_include_points() {
        let mut el = Element::with_id("l", ElementKind::Line, 10.0, 10.0);
        el.points = vec![Point::new(0.0, 0.0), Point::new(30.0, -5.0)];
        let b = el.bounds();
        assert_eq!(b.x0, 10.0);
        assert_eq!(b.y0, 5.0);
        assert_eq!(b.x1, 40.0);
    }

    #[test]
    fn test_canonical_sort() {
        let mut a = Element::with_id("b", ElementKind::Text, 0.0, 0.0);
        a.z_index = 1;
        let b = Element::with_id("c", ElementKind::Text, 0.0, 0.0);
        let c = Element::with_id("a", ElementKind::Text, 0.0, 0.0);
        let mut all = vec![a, b, c];
        sort_canonical(&mut all);
        let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["a", "c", "b"]);
    }

    #[test]
    fn test_color_hex() {
        assert_eq!(SerializableColor::new(255, 0, 16, 255).to_hex(), "#ff0010");
    }
}
