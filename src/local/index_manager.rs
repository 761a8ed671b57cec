use std::collections::{BTreeMap, BTreeSet};

use crate::core::{CompositeOperator, Direction, FieldFilter, Filter, Operator, Target};
use crate::error::FirestoreResult;
use crate::local::persistence::PersistenceTransaction;
use crate::model::{
    Document, DocumentKey, FieldIndex, FieldPath, IndexKind, IndexSegment, ResourcePath, SnapshotVersion,
};
use crate::value::{FirestoreValue, MapValue};

/// How well the configured indexes cover a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    None,
    /// An index narrows the candidate set but the query must be re-applied.
    Partial,
    /// An index covers every filter and ordering of the target.
    Full,
}

/// Collection-parent bookkeeping plus client-side field indexes.
pub trait IndexManager: Send + Sync {
    /// Records that documents exist in `collection_path`.
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath);

    /// Every parent path that holds a collection named `collection_id`.
    fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath>;

    /// Stores `index` under a fresh id and returns the stored copy.
    fn add_field_index(&mut self, index: FieldIndex) -> FieldIndex;

    fn delete_field_index(&mut self, index: &FieldIndex);

    fn get_field_indexes(&self, collection_group: Option<&str>) -> Vec<FieldIndex>;

    fn get_index_type(&self, target: &Target) -> IndexType;

    /// Keys of documents that may match `target`, or `None` when no index
    /// serves it.
    fn get_documents_matching_target(&self, target: &Target) -> Option<BTreeSet<DocumentKey>>;

    /// Re-indexes the given documents; documents that are not found remove
    /// their entries.
    fn update_index_entries(&mut self, documents: &[Document]);

    /// Creates an index able to serve `target` when none exists yet.
    fn create_target_indexes(&mut self, target: &Target) -> Option<FieldIndex>;
}

#[derive(Clone, Debug, PartialEq)]
struct IndexEntry {
    values: MapValue,
    array_element: Option<FirestoreValue>,
}

#[derive(Clone, Debug)]
pub struct MemoryIndexManager {
    collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
    indexes: BTreeMap<i32, FieldIndex>,
    entries: BTreeMap<i32, BTreeMap<DocumentKey, Vec<IndexEntry>>>,
    next_index_id: i32,
}

impl Default for MemoryIndexManager {
    fn default() -> Self {
        Self {
            collection_parents: BTreeMap::new(),
            indexes: BTreeMap::new(),
            entries: BTreeMap::new(),
            next_index_id: 1,
        }
    }
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn best_index(&self, target: &Target) -> Option<(&FieldIndex, IndexType)> {
        let group = collection_group_of(target)?;
        self.indexes
            .values()
            .filter(|index| index.collection_group == group)
            .filter_map(|index| match index_type_for(index, target) {
                IndexType::None => None,
                index_type => Some((index, index_type)),
            })
            .max_by_key(|(index, index_type)| (*index_type == IndexType::Full, index.segments.len()))
    }
}

impl IndexManager for MemoryIndexManager {
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        self.collection_parents
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.without_last());
    }

    fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn add_field_index(&mut self, index: FieldIndex) -> FieldIndex {
        let stored = FieldIndex {
            index_id: self.next_index_id,
            ..index
        };
        self.next_index_id += 1;
        self.indexes.insert(stored.index_id, stored.clone());
        self.entries.insert(stored.index_id, BTreeMap::new());
        log::debug!(
            "Added field index {} on collection group {}",
            stored.index_id,
            stored.collection_group
        );
        stored
    }

    fn delete_field_index(&mut self, index: &FieldIndex) {
        let ids: Vec<i32> = self
            .indexes
            .values()
            .filter(|existing| existing.index_id == index.index_id || existing.same_definition(index))
            .map(|existing| existing.index_id)
            .collect();
        for id in ids {
            self.indexes.remove(&id);
            self.entries.remove(&id);
        }
    }

    fn get_field_indexes(&self, collection_group: Option<&str>) -> Vec<FieldIndex> {
        self.indexes
            .values()
            .filter(|index| collection_group.map_or(true, |group| index.collection_group == group))
            .cloned()
            .collect()
    }

    fn get_index_type(&self, target: &Target) -> IndexType {
        self.best_index(target)
            .map(|(_, index_type)| index_type)
            .unwrap_or(IndexType::None)
    }

    fn get_documents_matching_target(&self, target: &Target) -> Option<BTreeSet<DocumentKey>> {
        let (index, _) = self.best_index(target)?;
        let entries = self.entries.get(&index.index_id)?;
        let filters = target.field_filters();
        let keys = entries
            .iter()
            .filter(|(key, entries)| {
                entries
                    .iter()
                    .any(|entry| entry_matches(index, entry, key, &filters))
            })
            .filter(|(key, _)| target.path.is_prefix_of(key.path()))
            .map(|(key, _)| key.clone())
            .collect();
        Some(keys)
    }

    fn update_index_entries(&mut self, documents: &[Document]) {
        for document in documents {
            let group = document.key().collection_group();
            for index in self.indexes.values() {
                if index.collection_group != group {
                    continue;
                }
                let Some(index_entries) = self.entries.get_mut(&index.index_id) else {
                    continue;
                };
                index_entries.remove(document.key());
                if document.is_found_document() {
                    let computed = compute_entries(index, document);
                    if !computed.is_empty() {
                        index_entries.insert(document.key().clone(), computed);
                    }
                }
            }
        }
    }

    fn create_target_indexes(&mut self, target: &Target) -> Option<FieldIndex> {
        if self.get_index_type(target) != IndexType::None {
            return None;
        }
        let index = build_target_index(target)?;
        Some(self.add_field_index(index))
    }
}

/// Indexes the current documents of the index's collection group.
pub(crate) fn backfill_index(txn: &mut dyn PersistenceTransaction, index: &FieldIndex) -> FirestoreResult<()> {
    let documents = txn
        .remote_document_cache()
        .get_documents_in_collection_group(&index.collection_group);
    txn.index_manager_mut()?.update_index_entries(&documents);
    Ok(())
}

fn collection_group_of(target: &Target) -> Option<&str> {
    match &target.collection_group {
        Some(group) => Some(group.as_str()),
        None => target.path.last_segment(),
    }
}

fn has_disjunction(filters: &[Filter]) -> bool {
    filters.iter().any(|filter| match filter {
        Filter::Field(_) => false,
        Filter::Composite(composite) => {
            composite.op() == CompositeOperator::Or || has_disjunction(composite.filters())
        }
    })
}

fn is_array_operator(op: Operator) -> bool {
    matches!(op, Operator::ArrayContains | Operator::ArrayContainsAny)
}

/// Every segment must name a field the target requires to exist; otherwise
/// documents missing that field would be dropped from the result.
fn index_type_for(index: &FieldIndex, target: &Target) -> IndexType {
    if index.segments.is_empty() || has_disjunction(&target.filters) || target.is_document_target() {
        return IndexType::None;
    }
    let filters = target.field_filters();
    let order_fields: Vec<&FieldPath> = target
        .order_by
        .iter()
        .map(|order| &order.field)
        .filter(|field| !field.is_key_field())
        .collect();

    for segment in &index.segments {
        let required = match segment.kind {
            IndexKind::Contains => filters
                .iter()
                .any(|filter| is_array_operator(filter.op()) && filter.field() == &segment.field_path),
            _ => {
                filters.iter().any(|filter| filter.field() == &segment.field_path)
                    || order_fields.contains(&&segment.field_path)
            }
        };
        if !required || segment.field_path.is_key_field() {
            return IndexType::None;
        }
    }

    let filters_covered = filters.iter().filter(|filter| !filter.field().is_key_field()).all(|filter| {
        if is_array_operator(filter.op()) {
            index
                .array_segment()
                .is_some_and(|segment| &segment.field_path == filter.field())
        } else {
            index
                .directional_segments()
                .any(|segment| &segment.field_path == filter.field())
        }
    });
    let order_covered = order_fields
        .iter()
        .all(|field| index.directional_segments().any(|segment| &segment.field_path == *field));

    if filters_covered && order_covered {
        IndexType::Full
    } else {
        IndexType::Partial
    }
}

fn compute_entries(index: &FieldIndex, document: &Document) -> Vec<IndexEntry> {
    let mut values = MapValue::empty();
    for segment in index.directional_segments() {
        match document.field(&segment.field_path) {
            Some(value) => values.set(&segment.field_path, value.clone()),
            None => return Vec::new(),
        }
    }

    match index.array_segment() {
        Some(segment) => {
            let Some(array) = document.field(&segment.field_path).and_then(FirestoreValue::as_array) else {
                return Vec::new();
            };
            array
                .values()
                .iter()
                .map(|element| IndexEntry {
                    values: values.clone(),
                    array_element: Some(element.clone()),
                })
                .collect()
        }
        None => vec![IndexEntry {
            values,
            array_element: None,
        }],
    }
}

fn entry_matches(index: &FieldIndex, entry: &IndexEntry, key: &DocumentKey, filters: &[&FieldFilter]) -> bool {
    let directional = Document::new_found_document(key.clone(), SnapshotVersion::min(), entry.values.clone());
    let contains = match (index.array_segment(), &entry.array_element) {
        (Some(segment), Some(element)) => {
            let mut data = MapValue::empty();
            data.set(&segment.field_path, FirestoreValue::from_array(vec![element.clone()]));
            Some((
                &segment.field_path,
                Document::new_found_document(key.clone(), SnapshotVersion::min(), data),
            ))
        }
        _ => None,
    };

    filters.iter().all(|filter| {
        if filter.field().is_key_field() {
            return true;
        }
        if is_array_operator(filter.op()) {
            match &contains {
                Some((field, document)) if *field == filter.field() => filter.matches(document),
                _ => true,
            }
        } else if index
            .directional_segments()
            .any(|segment| &segment.field_path == filter.field())
        {
            filter.matches(&directional)
        } else {
            true
        }
    })
}

/// Builds an index with array, equality, then ordering segments.
fn build_target_index(target: &Target) -> Option<FieldIndex> {
    if has_disjunction(&target.filters) || target.is_document_target() {
        return None;
    }
    let group = collection_group_of(target)?.to_string();
    let filters = target.field_filters();
    let mut segments: Vec<IndexSegment> = Vec::new();
    let mut seen: BTreeSet<FieldPath> = BTreeSet::new();

    if let Some(array_filter) = filters.iter().find(|filter| is_array_operator(filter.op())) {
        segments.push(IndexSegment::new(array_filter.field().clone(), IndexKind::Contains));
    }
    for filter in &filters {
        let is_equality = matches!(filter.op(), Operator::Equal | Operator::In);
        if is_equality && !filter.field().is_key_field() && seen.insert(filter.field().clone()) {
            segments.push(IndexSegment::new(filter.field().clone(), IndexKind::Ascending));
        }
    }
    for order in &target.order_by {
        if order.field.is_key_field() || !seen.insert(order.field.clone()) {
            continue;
        }
        let kind = match order.direction {
            Direction::Ascending => IndexKind::Ascending,
            Direction::Descending => IndexKind::Descending,
        };
        segments.push(IndexSegment::new(order.field.clone(), kind));
    }

    if segments.is_empty() {
        None
    } else {
        Some(FieldIndex::new(group, segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{doc, field, key, map, path, query};

    fn indexed_manager(index: FieldIndex, documents: &[Document]) -> MemoryIndexManager {
        let mut manager = MemoryIndexManager::new();
        manager.add_field_index(index);
        manager.update_index_entries(documents);
        manager
    }

    fn filter(name: &str, op: Operator, value: FirestoreValue) -> Filter {
        Filter::field(field(name), op, value).unwrap()
    }

    #[test]
    fn records_collection_parents() {
        let mut manager = MemoryIndexManager::new();
        manager.add_to_collection_parent_index(&path("rooms/a/messages"));
        manager.add_to_collection_parent_index(&path("rooms/b/messages"));
        manager.add_to_collection_parent_index(&path("messages"));
        assert_eq!(manager.get_collection_parents("messages").len(), 3);
        assert!(manager.get_collection_parents("rooms").is_empty());
    }

    #[test]
    fn equality_index_serves_matching_documents() {
        let index = FieldIndex::new("rooms", vec![IndexSegment::new(field("size"), IndexKind::Ascending)]);
        let documents = [
            doc("rooms/a", 1, map(&[("size", FirestoreValue::from_integer(1))])),
            doc("rooms/b", 1, map(&[("size", FirestoreValue::from_integer(2))])),
            doc("rooms/c", 1, map(&[("other", FirestoreValue::from_integer(2))])),
        ];
        let manager = indexed_manager(index, &documents);

        let target = query("rooms")
            .with_filter(filter("size", Operator::Equal, FirestoreValue::from_integer(2)))
            .to_target();
        assert_eq!(manager.get_index_type(&target), IndexType::Full);
        assert_eq!(
            manager.get_documents_matching_target(&target),
            Some(BTreeSet::from([key("rooms/b")]))
        );

        let unfiltered = query("rooms").to_target();
        assert_eq!(manager.get_index_type(&unfiltered), IndexType::None);
    }

    #[test]
    fn array_contains_uses_per_element_entries() {
        let index = FieldIndex::new("rooms", vec![IndexSegment::new(field("tags"), IndexKind::Contains)]);
        let tags = |values: &[&str]| {
            FirestoreValue::from_array(values.iter().map(|v| FirestoreValue::from_string(*v)).collect())
        };
        let documents = [
            doc("rooms/a", 1, map(&[("tags", tags(&["x", "y"]))])),
            doc("rooms/b", 1, map(&[("tags", tags(&["z"]))])),
        ];
        let manager = indexed_manager(index, &documents);
        let target = query("rooms")
            .with_filter(filter("tags", Operator::ArrayContains, FirestoreValue::from_string("y")))
            .to_target();
        assert_eq!(
            manager.get_documents_matching_target(&target),
            Some(BTreeSet::from([key("rooms/a")]))
        );
    }

    #[test]
    fn removed_documents_leave_the_index() {
        let index = FieldIndex::new("rooms", vec![IndexSegment::new(field("size"), IndexKind::Ascending)]);
        let found = doc("rooms/a", 1, map(&[("size", FirestoreValue::from_integer(1))]));
        let mut manager = indexed_manager(index, &[found]);
        manager.update_index_entries(&[Document::new_invalid_document(key("rooms/a"))]);

        let target = query("rooms")
            .with_filter(filter("size", Operator::Equal, FirestoreValue::from_integer(1)))
            .to_target();
        assert_eq!(manager.get_documents_matching_target(&target), Some(BTreeSet::new()));
    }

    #[test]
    fn partial_when_a_filter_is_not_indexed() {
        let index = FieldIndex::new("rooms", vec![IndexSegment::new(field("size"), IndexKind::Ascending)]);
        let manager = indexed_manager(index, &[]);
        let target = query("rooms")
            .with_filter(filter("size", Operator::Equal, FirestoreValue::from_integer(1)))
            .with_filter(filter("color", Operator::Equal, FirestoreValue::from_string("red")))
            .to_target();
        assert_eq!(manager.get_index_type(&target), IndexType::Partial);
    }

    #[test]
    fn builds_index_for_unserved_target() {
        let mut manager = MemoryIndexManager::new();
        let target = query("rooms")
            .with_filter(filter("size", Operator::Equal, FirestoreValue::from_integer(1)))
            .order_by(field("name"), Direction::Descending)
            .to_target();

        let created = manager.create_target_indexes(&target).unwrap();
        assert_eq!(
            created.segments,
            vec![
                IndexSegment::new(field("size"), IndexKind::Ascending),
                IndexSegment::new(field("name"), IndexKind::Descending),
            ]
        );
        assert_eq!(manager.get_index_type(&target), IndexType::Full);
        assert!(manager.create_target_indexes(&target).is_none());
    }
}
