use std::collections::BTreeSet;

use crate::model::DocumentKey;

/// Two-way index of (document key, id) references, where the id is a
/// target id or batch id.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<'a, I: IntoIterator<Item = &'a DocumentKey>>(&mut self, keys: I, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id));
    }

    pub fn remove_references<'a, I: IntoIterator<Item = &'a DocumentKey>>(&mut self, keys: I, id: i32) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the affected keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) {
        self.by_key.clear();
        self.by_id.clear();
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .iter()
            .skip_while(|(existing, _)| *existing < id)
            .take_while(|(existing, _)| *existing == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .is_some_and(|(existing, _)| existing == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::key;

    #[test]
    fn tracks_references_in_both_directions() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("rooms/a"), 1);
        refs.add_reference(key("rooms/a"), 2);
        refs.add_reference(key("rooms/b"), 2);

        assert!(refs.contains_key(&key("rooms/a")));
        assert_eq!(refs.references_for_id(2).len(), 2);

        let removed = refs.remove_references_for_id(2);
        assert_eq!(removed.len(), 2);
        assert!(refs.contains_key(&key("rooms/a")));
        assert!(!refs.contains_key(&key("rooms/b")));

        refs.remove_reference(&key("rooms/a"), 1);
        assert!(refs.is_empty());
    }
}
