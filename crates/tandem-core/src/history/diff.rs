//! Collection diffing for history attribution.

use std::collections::HashMap;

use crate::element::{Element, ElementId};

/// Ids that changed between two element collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementDiff {
    /// Present after, absent before.
    pub added: Vec<ElementId>,
    /// Present before, absent after.
    pub deleted: Vec<ElementId>,
    /// Present in both with unequal serialized content.
    pub updated: Vec<ElementId>,
}

impl ElementDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.updated.is_empty()
    }
}

/// Compare two collections by id and serialized content.
pub fn diff_elements(before: &[Element], after: &[Element]) -> ElementDiff {
    let before_by_id: HashMap<&str, &Element> = before.iter().map(|e| (e.id.as_str(), e)).collect();
    let after_by_id: HashMap<&str, &Element> = after.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut diff = ElementDiff::default();
    for element in after {
        match before_by_id.get(element.id.as_str()) {
            None => diff.added.push(element.id.clone()),
            Some(old) if old.content_key() != element.content_key() => diff.updated.push(element.id.clone()),
            Some(_) => {}
        }
    }
    for element in before {
        if !after_by_id.contains_key(element.id.as_str()) {
            diff.deleted.push(element.id.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementKind;

    fn el(id: &str) -> Element {
        Element::with_id(id, ElementKind::Rectangle, 0.0, 0.0)
    }

    #[test]
    fn test_added_deleted_unchanged() {
        let diff = diff_elements(&[el("a"), el("b")], &[el("b"), el("c")]);
        assert_eq!(diff.added, ["c"]);
        assert_eq!(diff.deleted, ["a"]);
        assert!(diff.updated.is_empty());
    }

    #[test]
    fn test_updated_by_content() {
        let mut moved = el("a");
        moved.x = 10.0;
        let diff = diff_elements(&[el("a")], &[moved]);
        assert_eq!(diff.updated, ["a"]);
        assert!(diff.added.is_empty() && diff.deleted.is_empty());
    }

    #[test]
    fn test_identical_is_empty() {
        assert!(diff_elements(&[el("a")], &[el("a")]).is_empty());
    }
}
