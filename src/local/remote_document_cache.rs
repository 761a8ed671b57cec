use std::collections::{BTreeMap, BTreeSet};

use crate::core::Query;
use crate::error::{internal_error, FirestoreResult};
use crate::local::persistence::PersistenceTransaction;
use crate::local::query_engine::QueryContext;
use crate::model::{Document, DocumentKey, SnapshotVersion};

/// Server-confirmed document state, keyed by document key.
///
/// Entries never contain local mutations; those live in overlays.
pub trait RemoteDocumentCache: Send + Sync {
    /// Stores `document` with the given read time, replacing any previous entry.
    fn add_entry(&mut self, document: Document, read_time: SnapshotVersion) -> FirestoreResult<()>;

    fn remove_entry(&mut self, key: &DocumentKey);

    /// The cached entry, or an invalid document if the key is unknown.
    fn get_entry(&self, key: &DocumentKey) -> Document;

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Document>;

    /// Documents directly inside the query's collection that were read after
    /// `since_read_time` and either match the query or appear in
    /// `mutated_keys`.
    fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, Document>;

    /// Every valid document whose parent collection id is `collection_group`.
    fn get_documents_in_collection_group(&self, collection_group: &str) -> Vec<Document>;

    fn keys(&self) -> Vec<DocumentKey>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    docs: BTreeMap<DocumentKey, Document>,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(&mut self, mut document: Document, read_time: SnapshotVersion) -> FirestoreResult<()> {
        if read_time.is_min() {
            return Err(internal_error(format!(
                "Cannot add document {} to the cache with a read time of zero",
                document.key()
            )));
        }
        document.set_read_time(read_time);
        self.docs.insert(document.key().clone(), document);
        Ok(())
    }

    fn remove_entry(&mut self, key: &DocumentKey) {
        self.docs.remove(key);
    }

    fn get_entry(&self, key: &DocumentKey) -> Document {
        self.docs
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::new_invalid_document(key.clone()))
    }

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Document> {
        keys.iter().map(|key| (key.clone(), self.get_entry(key))).collect()
    }

    fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, Document> {
        let collection = query.path();
        let start = DocumentKey::collection_scan_start(collection);
        let mut results = BTreeMap::new();

        for (key, document) in self.docs.range(start..) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() > collection.len() + 1 {
                continue;
            }
            context.documents_read_count += 1;
            if !since_read_time.is_min() && document.read_time() <= since_read_time {
                continue;
            }
            if !mutated_keys.contains(key) && !query.matches(document) {
                continue;
            }
            results.insert(key.clone(), document.clone());
        }
        results
    }

    fn get_documents_in_collection_group(&self, collection_group: &str) -> Vec<Document> {
        self.docs
            .values()
            .filter(|document| document.key().has_collection_id(collection_group) && document.is_valid_document())
            .cloned()
            .collect()
    }

    fn keys(&self) -> Vec<DocumentKey> {
        self.docs.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.docs.len()
    }
}

/// Collects remote document changes during a transaction and writes them,
/// along with the index updates they imply, in one step.
#[derive(Debug, Default)]
pub struct RemoteDocumentChangeBuffer {
    changes: BTreeMap<DocumentKey, Option<Document>>,
}

impl RemoteDocumentChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `document`; its read time must already be set.
    pub fn add_entry(&mut self, document: Document) {
        self.changes.insert(document.key().clone(), Some(document));
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) {
        self.changes.insert(key.clone(), None);
    }

    pub fn get_entry(&self, txn: &dyn PersistenceTransaction, key: &DocumentKey) -> Document {
        match self.changes.get(key) {
            Some(Some(document)) => document.clone(),
            Some(None) => Document::new_invalid_document(key.clone()),
            None => txn.remote_document_cache().get_entry(key),
        }
    }

    pub fn get_entries(
        &self,
        txn: &dyn PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Document> {
        keys.iter().map(|key| (key.clone(), self.get_entry(txn, key))).collect()
    }

    pub fn apply(self, txn: &mut dyn PersistenceTransaction) -> FirestoreResult<()> {
        let mut indexed = Vec::with_capacity(self.changes.len());
        for (key, change) in self.changes {
            match change {
                Some(document) => {
                    let read_time = document.read_time();
                    txn.index_manager_mut()?
                        .add_to_collection_parent_index(&key.collection_path());
                    indexed.push(document.clone());
                    txn.remote_document_cache_mut()?.add_entry(document, read_time)?;
                }
                None => {
                    txn.remote_document_cache_mut()?.remove_entry(&key);
                    indexed.push(Document::new_invalid_document(key));
                }
            }
        }
        txn.index_manager_mut()?.update_index_entries(&indexed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Filter, Operator};
    use crate::test_support::{doc, field, key, map, query, version};
    use crate::value::FirestoreValue;

    fn cache_with(docs: &[(&str, i64, i64)]) -> MemoryRemoteDocumentCache {
        let mut cache = MemoryRemoteDocumentCache::new();
        for (path, value, read_secs) in docs {
            let document = doc(path, 1, map(&[("v", FirestoreValue::from_integer(*value))]));
            cache.add_entry(document, version(*read_secs)).unwrap();
        }
        cache
    }

    #[test]
    fn missing_entries_are_invalid() {
        let cache = MemoryRemoteDocumentCache::new();
        assert!(!cache.get_entry(&key("rooms/a")).is_valid_document());
    }

    #[test]
    fn rejects_zero_read_time() {
        let mut cache = MemoryRemoteDocumentCache::new();
        let document = doc("rooms/a", 1, map(&[]));
        assert!(cache.add_entry(document, SnapshotVersion::min()).is_err());
    }

    #[test]
    fn query_scan_filters_by_collection_read_time_and_match() {
        let cache = cache_with(&[
            ("rooms/a", 1, 5),
            ("rooms/b", 2, 10),
            ("rooms/c", 3, 10),
            ("rooms/a/messages/m", 1, 10),
            ("other/x", 1, 10),
        ]);
        let filtered = query("rooms")
            .with_filter(Filter::field(field("v"), Operator::GreaterThan, FirestoreValue::from_integer(1)).unwrap());

        let mut context = QueryContext::default();
        let all = cache.get_documents_matching_query(&filtered, SnapshotVersion::min(), &BTreeSet::new(), &mut context);
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b"), key("rooms/c")]);
        assert_eq!(context.documents_read_count, 3);

        let mutated = BTreeSet::from([key("rooms/a")]);
        let recent = cache.get_documents_matching_query(&filtered, version(5), &mutated, &mut QueryContext::default());
        assert_eq!(recent.len(), 2);
        assert!(!recent.contains_key(&key("rooms/a")));
    }
}
