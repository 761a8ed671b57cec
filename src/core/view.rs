use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::core::view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
use crate::core::{DocumentComparator, LimitType, OnlineState, Query};
use crate::local::QueryResult;
use crate::model::{Document, DocumentKey, DocumentSet};
use crate::remote::TargetChange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Results may not reflect the backend yet.
    Local,
    Synced,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Result of [`View::compute_doc_changes`], fed back into
/// [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A limit query lost documents at its edge and must be re-run against
    /// the full local result to backfill.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// The client-side result set of one query.
///
/// Tracks which documents the backend has confirmed for the target
/// (`synced_documents`) so that documents only present locally can be put
/// into limbo and resolved.
#[derive(Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    has_cached_results: bool,
    current: bool,
    document_set: DocumentSet,
    mutated_keys: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    synced_documents: BTreeSet<DocumentKey>,
    comparator: DocumentComparator,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            query,
            sync_state: None,
            has_cached_results: false,
            current: false,
            mutated_keys: BTreeSet::new(),
            limbo_documents: BTreeSet::new(),
            synced_documents,
            comparator,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn set_has_cached_results(&mut self, value: bool) {
        self.has_cached_results = value;
    }

    /// Diffs `doc_changes` against the current (or `previous`) result set.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &BTreeMap<DocumentKey, Document>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (DocumentChangeSet::new(), self.document_set.clone(), self.mutated_keys.clone()),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit.is_some_and(|limit| old_document_set.len() == limit);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);
            let old_had_pending = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations() || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if !old_doc.data().equals(new_doc.data()) {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new_doc.clone()));
                            change_applied = true;
                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| self.comparator.compare(new_doc, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| self.comparator.compare(new_doc, first) == Ordering::Less);
                            if past_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new_doc.clone()));
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.add(new_doc.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Commits `doc_changes` and produces a snapshot when anything visible
    /// changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| self.comparator.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let has_cached_results = target_change.is_some_and(|change| !change.resume_token.is_empty());
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: doc_changes.document_set,
                old_docs,
                doc_changes: changes,
                mutated_keys: doc_changes.mutated_keys,
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
                has_cached_results,
            }),
            limbo_changes,
        }
    }

    /// Going offline marks a current view as no longer synced.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    /// Resets synced keys from the local store's view of the target and
    /// recomputes the result.
    pub fn synchronize_with_persisted_state(&mut self, result: &QueryResult) -> ViewChange {
        self.synced_documents = result.remote_keys.clone();
        self.limbo_documents.clear();
        let changes = self.compute_doc_changes(&result.documents, None);
        self.apply_changes(changes, true, None, false)
    }

    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == Some(SyncState::Local),
            self.has_cached_results,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("modified document {key} was not synced for {}", self.query);
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&new_limbo)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(new_limbo.difference(&old_limbo).cloned().map(LimboDocumentChange::Added));
        self.limbo_documents = new_limbo;
        changes
    }
}

/// A locally modified document should not be replaced by the acknowledged
/// version until the backend reports the synced document.
fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Direction;
    use crate::model::Timestamp;
    use crate::test_support::{doc, field, key, map, query, set_mutation};
    use crate::value::FirestoreValue;

    fn docs(documents: Vec<Document>) -> BTreeMap<DocumentKey, Document> {
        documents.into_iter().map(|d| (d.key().clone(), d)).collect()
    }

    fn target_change(current: bool, added: &[&str]) -> TargetChange {
        TargetChange {
            resume_token: vec![1],
            current,
            added_documents: added.iter().map(|p| key(p)).collect(),
            modified_documents: BTreeSet::new(),
            removed_documents: BTreeSet::new(),
        }
    }

    #[test]
    fn first_snapshot_adds_matching_documents() {
        let mut view = View::new(query("rooms"), BTreeSet::new());
        let changes = view.compute_doc_changes(
            &docs(vec![doc("rooms/a", 1, map(&[])), doc("other/b", 1, map(&[]))]),
            None,
        );
        let snapshot = view.apply_changes(changes, true, None, false).snapshot.unwrap();
        assert_eq!(snapshot.docs.len(), 1);
        assert!(snapshot.from_cache);
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Added);
    }

    #[test]
    fn becomes_synced_when_target_is_current() {
        let mut view = View::new(query("rooms"), BTreeSet::new());
        let changes = view.compute_doc_changes(&docs(vec![doc("rooms/a", 1, map(&[]))]), None);
        view.apply_changes(changes, true, None, false);
        let changes = view.compute_doc_changes(&BTreeMap::new(), None);
        let change = view.apply_changes(changes, true, Some(&target_change(true, &["rooms/a"])), false);
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(snapshot.has_cached_results);
    }

    #[test]
    fn unsynced_documents_enter_limbo_once_current() {
        let mut view = View::new(query("rooms"), BTreeSet::new());
        let changes = view.compute_doc_changes(
            &docs(vec![doc("rooms/a", 1, map(&[])), doc("rooms/b", 1, map(&[]))]),
            None,
        );
        let change = view.apply_changes(changes, true, Some(&target_change(true, &["rooms/a"])), false);
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(change.snapshot.unwrap().from_cache);

        let mut removal = BTreeMap::new();
        let mut gone = doc("rooms/b", 2, map(&[]));
        gone.convert_to_no_document(gone.version());
        removal.insert(key("rooms/b"), gone);
        let changes = view.compute_doc_changes(&removal, None);
        let change = view.apply_changes(changes, true, None, false);
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        assert!(!change.snapshot.unwrap().from_cache);
    }

    #[test]
    fn locally_mutated_documents_are_never_in_limbo() {
        let mut view = View::new(query("rooms"), BTreeSet::new());
        let mut local = Document::new_invalid_document(key("rooms/a"));
        set_mutation("rooms/a", map(&[])).apply_to_local_view(&mut local, None, Timestamp::now());
        let changes = view.compute_doc_changes(&docs(vec![local]), None);
        let change = view.apply_changes(changes, true, Some(&target_change(true, &[])), false);
        assert!(change.limbo_changes.is_empty());
        assert!(change.snapshot.unwrap().has_pending_writes());
    }

    #[test]
    fn limit_queries_evict_and_request_refill() {
        let limited = query("rooms").order_by(field("n"), Direction::Ascending).limit_to_first(2);
        let mut view = View::new(limited, BTreeSet::new());
        let with_n = |id: &str, n: i64| doc(&format!("rooms/{id}"), 1, map(&[("n", FirestoreValue::from_integer(n))]));
        let changes = view.compute_doc_changes(&docs(vec![with_n("a", 1), with_n("b", 2), with_n("c", 3)]), None);
        assert_eq!(changes.document_set.len(), 2);
        assert!(!changes.needs_refill);
        view.apply_changes(changes, true, None, false);

        let changes = view.compute_doc_changes(&docs(vec![with_n("a", 10)]), None);
        assert!(changes.needs_refill);
    }

    #[test]
    fn going_offline_marks_snapshot_from_cache() {
        let mut view = View::new(query("rooms"), BTreeSet::new());
        let changes = view.compute_doc_changes(&BTreeMap::new(), None);
        view.apply_changes(changes, true, Some(&target_change(true, &[])), false);
        let change = view.apply_online_state_change(OnlineState::Offline);
        assert!(change.snapshot.unwrap().from_cache);
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }
}
