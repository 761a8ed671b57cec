use std::collections::{BTreeMap, BTreeSet};

use crate::core::Query;
use crate::error::FirestoreResult;
use crate::local::index_manager::{backfill_index, IndexType};
use crate::local::local_documents_view::{self, DocumentMap};
use crate::local::persistence::PersistenceTransaction;
use crate::model::{Document, DocumentKey, SnapshotVersion, BATCHID_UNKNOWN};
use crate::settings::IndexAutoCreationSettings;

/// Counts the documents a query had to read.
#[derive(Clone, Debug, Default)]
pub struct QueryContext {
    pub documents_read_count: usize,
}

/// Picks the cheapest way to answer a query from the local caches: a field
/// index, the previous result set plus recent changes, or a full scan.
#[derive(Clone, Debug)]
pub struct QueryEngine {
    index_auto_creation: IndexAutoCreationSettings,
}

impl QueryEngine {
    pub fn new(index_auto_creation: IndexAutoCreationSettings) -> Self {
        Self { index_auto_creation }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.index_auto_creation.enabled = enabled;
    }

    /// All documents matching `query`.
    ///
    /// `remote_keys` are the keys the server last reported for the query's
    /// target, valid as of `last_limbo_free_snapshot_version`.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut dyn PersistenceTransaction,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        if let Some(result) = self.perform_query_using_index(txn, query)? {
            return Ok(result);
        }
        if let Some(result) =
            self.perform_query_using_remote_keys(txn, query, remote_keys, last_limbo_free_snapshot_version)?
        {
            return Ok(result);
        }

        let mut context = QueryContext::default();
        let result =
            local_documents_view::get_documents_matching_query(txn, query, SnapshotVersion::min(), &mut context);
        if self.index_auto_creation.enabled && !txn.mode().is_read_only() {
            self.create_cache_indexes(txn, query, &context, result.len())?;
        }
        Ok(result)
    }

    fn perform_query_using_index(
        &self,
        txn: &mut dyn PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Option<DocumentMap>> {
        if query.matches_all_documents() {
            return Ok(None);
        }
        let target = query.to_target();
        if txn.index_manager().get_index_type(&target) == IndexType::None {
            return Ok(None);
        }
        let Some(mut keys) = txn.index_manager().get_documents_matching_target(&target) else {
            return Ok(None);
        };

        // The index only covers remote state; pending writes are merged in.
        keys.extend(overlay_keys(txn, query));
        log::debug!(
            "Using index for query {} ({} candidate documents)",
            query.canonical_id(),
            keys.len()
        );
        let documents = local_documents_view::get_documents(txn, &keys)?;
        Ok(Some(apply_query(query, documents)))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut dyn PersistenceTransaction,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<DocumentMap>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }

        let documents = local_documents_view::get_documents(txn, remote_keys)?;
        let previous_results = apply_query(query, documents);
        if needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version) {
            return Ok(None);
        }

        log::debug!(
            "Re-using previous result from {} to execute query: {}",
            last_limbo_free_snapshot_version,
            query.canonical_id()
        );
        let mut results = local_documents_view::get_documents_matching_query(
            txn,
            query,
            last_limbo_free_snapshot_version,
            &mut QueryContext::default(),
        );
        // Previous results hold the full local view and win over partial reads.
        results.extend(previous_results);
        Ok(Some(results))
    }

    fn create_cache_indexes(
        &self,
        txn: &mut dyn PersistenceTransaction,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        let settings = &self.index_auto_creation;
        if context.documents_read_count < settings.min_collection_size {
            return Ok(());
        }
        let threshold = settings.relative_index_read_cost_per_document * result_size as f64;
        if (context.documents_read_count as f64) <= threshold {
            return Ok(());
        }

        let target = query.to_target();
        if let Some(index) = txn.index_manager_mut()?.create_target_indexes(&target) {
            log::debug!(
                "Created client-side index {} for query {} after reading {} documents",
                index.index_id,
                query.canonical_id(),
                context.documents_read_count
            );
            backfill_index(txn, &index)?;
        }
        Ok(())
    }
}

fn overlay_keys(txn: &dyn PersistenceTransaction, query: &Query) -> BTreeSet<DocumentKey> {
    let overlays = txn.document_overlay_cache();
    match query.collection_group_id() {
        Some(group) => overlays
            .get_overlays_for_collection_group(group, BATCHID_UNKNOWN, usize::MAX)
            .into_keys()
            .filter(|key| query.path().is_prefix_of(key.path()))
            .collect(),
        None => overlays
            .get_overlays_for_collection(query.path(), BATCHID_UNKNOWN)
            .into_keys()
            .collect(),
    }
}

fn apply_query(query: &Query, documents: DocumentMap) -> DocumentMap {
    documents
        .into_iter()
        .filter(|(_, document)| query.matches(document))
        .collect()
}

/// A limit query can only reuse its previous results when the document at
/// the edge of the limit is unchanged.
fn needs_refill(
    query: &Query,
    previous_results: &BTreeMap<DocumentKey, Document>,
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != previous_results.len() {
        return true;
    }

    let comparator = query.comparator();
    let mut sorted: Vec<&Document> = previous_results.values().collect();
    sorted.sort_by(|left, right| comparator.compare(left, right));
    let edge = match query.limit_type() {
        crate::core::LimitType::First => sorted.last(),
        crate::core::LimitType::Last => sorted.first(),
    };
    match edge {
        Some(document) => document.has_pending_writes() || document.version() > limbo_free_snapshot_version,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Filter, Operator};
    use crate::local::memory_persistence::MemoryPersistence;
    use crate::local::persistence::{PersistenceExt, TransactionMode};
    use crate::model::User;
    use crate::test_support::{doc, field, key, map, query, version};
    use crate::value::FirestoreValue;

    fn seed(txn: &mut dyn PersistenceTransaction, path: &str, size: i64, read: i64) -> FirestoreResult<()> {
        txn.remote_document_cache_mut()?.add_entry(
            doc(path, read, map(&[("size", FirestoreValue::from_integer(size))])),
            version(read),
        )
    }

    fn sized(op: Operator, size: i64) -> Query {
        query("rooms").with_filter(Filter::field(field("size"), op, FirestoreValue::from_integer(size)).unwrap())
    }

    #[test]
    fn full_scan_matches_filters() {
        let persistence = MemoryPersistence::default();
        let engine = QueryEngine::new(IndexAutoCreationSettings::default());
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, &User::unauthenticated(), |txn| {
                seed(txn, "rooms/a", 1, 1)?;
                seed(txn, "rooms/b", 5, 1)?;
                let result = engine.get_documents_matching_query(
                    txn,
                    &sized(Operator::GreaterThan, 2),
                    SnapshotVersion::min(),
                    &BTreeSet::new(),
                )?;
                assert_eq!(result.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn previous_results_are_combined_with_recent_changes() {
        let persistence = MemoryPersistence::default();
        let engine = QueryEngine::new(IndexAutoCreationSettings::default());
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, &User::unauthenticated(), |txn| {
                seed(txn, "rooms/a", 5, 1)?;
                // Read after the limbo-free version, so it is picked up incrementally.
                seed(txn, "rooms/b", 5, 10)?;
                // Not in the remote keys and read before the limbo-free version.
                seed(txn, "rooms/c", 5, 2)?;

                let remote_keys = BTreeSet::from([key("rooms/a")]);
                let result = engine.get_documents_matching_query(
                    txn,
                    &sized(Operator::GreaterThan, 2),
                    version(5),
                    &remote_keys,
                )?;
                assert_eq!(
                    result.keys().cloned().collect::<Vec<_>>(),
                    vec![key("rooms/a"), key("rooms/b")]
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn limit_query_refills_when_edge_changed() {
        let persistence = MemoryPersistence::default();
        let engine = QueryEngine::new(IndexAutoCreationSettings::default());
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, &User::unauthenticated(), |txn| {
                seed(txn, "rooms/a", 5, 1)?;
                seed(txn, "rooms/b", 5, 2)?;
                let limited = sized(Operator::GreaterThan, 2).limit_to_first(1);
                // The remote key set no longer matches the cached results.
                let remote_keys = BTreeSet::from([key("rooms/a"), key("rooms/x")]);
                let result = engine.get_documents_matching_query(txn, &limited, version(5), &remote_keys)?;
                assert_eq!(result.len(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn auto_creates_index_for_selective_queries() {
        let persistence = MemoryPersistence::default();
        let settings = IndexAutoCreationSettings {
            enabled: true,
            min_collection_size: 3,
            relative_index_read_cost_per_document: 2.0,
        };
        let engine = QueryEngine::new(settings);
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, &User::unauthenticated(), |txn| {
                for (i, path) in ["rooms/a", "rooms/b", "rooms/c", "rooms/d"].iter().enumerate() {
                    seed(txn, path, i as i64, 1)?;
                }
                let selective = sized(Operator::Equal, 3);
                let target = selective.to_target();
                assert_eq!(txn.index_manager().get_index_type(&target), IndexType::None);

                let first =
                    engine.get_documents_matching_query(txn, &selective, SnapshotVersion::min(), &BTreeSet::new())?;
                assert_eq!(first.len(), 1);
                assert_eq!(txn.index_manager().get_index_type(&target), IndexType::Full);

                let second =
                    engine.get_documents_matching_query(txn, &selective, SnapshotVersion::min(), &BTreeSet::new())?;
                assert_eq!(first, second);
                Ok(())
            })
            .unwrap();
    }
}
