use std::collections::BTreeMap;

use crate::core::DocumentComparator;
use crate::model::{Document, DocumentKey};

/// Documents kept sorted by a query's ordering, with lookup by key.
#[derive(Clone, Debug, Default)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    fn position(&self, document: &Document) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|probe| self.comparator.compare(probe, document))
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn add(&mut self, document: Document) {
        self.delete(document.key());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) -> Option<Document> {
        let existing = self.by_key.remove(key)?;
        match self.position(&existing) {
            Ok(index) => Some(self.sorted.remove(index)),
            Err(_) => {
                self.sorted.retain(|document| document.key() != key);
                Some(existing)
            }
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    pub fn to_vec(&self) -> Vec<Document> {
        self.sorted.clone()
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted.len() == other.sorted.len()
            && self.sorted.iter().zip(other.sorted.iter()).all(|(l, r)| l == r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Direction, Query};
    use crate::test_support::{doc, field, key, map, path};
    use crate::value::FirestoreValue;

    #[test]
    fn keeps_documents_sorted_and_replaces_by_key() {
        let comparator = Query::collection(path("rooms"))
            .order_by(field("n"), Direction::Ascending)
            .comparator();
        let mut set = DocumentSet::new(comparator);
        set.add(doc("rooms/a", 1, map(&[("n", FirestoreValue::from_integer(3))])));
        set.add(doc("rooms/b", 1, map(&[("n", FirestoreValue::from_integer(1))])));
        set.add(doc("rooms/c", 1, map(&[("n", FirestoreValue::from_integer(2))])));
        let ids: Vec<&str> = set.keys().map(DocumentKey::id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        set.add(doc("rooms/a", 2, map(&[("n", FirestoreValue::from_integer(0))])));
        let ids: Vec<&str> = set.keys().map(DocumentKey::id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.index_of(&key("rooms/c")), Some(2));

        assert!(set.delete(&key("rooms/b")).is_some());
        assert!(!set.contains(&key("rooms/b")));
        assert_eq!(set.first().map(|d| d.key().id()), Some("a"));
    }
}
