//! Local view of documents: remote state with pending overlays applied.
//!
//! Everything here reads through the caches of a running transaction, so the
//! functions take the transaction instead of holding cache handles.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::Query;
use crate::error::FirestoreResult;
use crate::local::persistence::PersistenceTransaction;
use crate::local::query_engine::QueryContext;
use crate::model::mutation::calculate_overlay_mutation;
use crate::model::{
    BatchId, Document, DocumentKey, FieldMask, Mutation, Overlay, OverlayedDocument, SnapshotVersion, Timestamp,
};

pub type DocumentMap = BTreeMap<DocumentKey, Document>;

/// Local view of one document; invalid if nothing is known about it.
pub fn get_document(txn: &dyn PersistenceTransaction, key: &DocumentKey) -> Document {
    let mut document = txn.remote_document_cache().get_entry(key);
    if let Some(overlay) = txn.document_overlay_cache().get_overlay(key) {
        overlay
            .mutation
            .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
    }
    document
}

pub fn get_documents(txn: &mut dyn PersistenceTransaction, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<DocumentMap> {
    let documents = txn.remote_document_cache().get_entries(keys);
    get_local_view_of_documents(txn, documents, &BTreeSet::new())
}

/// Applies overlays to `documents`.
///
/// Keys in `existence_changed` whose overlay is a patch (or missing) have
/// their overlays recalculated, since a patch applied to a document that
/// just appeared or vanished yields a different result.
pub fn get_local_view_of_documents(
    txn: &mut dyn PersistenceTransaction,
    documents: DocumentMap,
    existence_changed: &BTreeSet<DocumentKey>,
) -> FirestoreResult<DocumentMap> {
    let overlays = txn
        .document_overlay_cache()
        .get_overlays(&documents.keys().cloned().collect());
    let views = compute_views(txn, documents, &overlays, existence_changed)?;
    Ok(views
        .into_iter()
        .map(|(key, overlayed)| (key, overlayed.document))
        .collect())
}

/// Like [`get_local_view_of_documents`] but keeps the mutated field masks.
pub fn get_overlayed_documents(
    txn: &mut dyn PersistenceTransaction,
    documents: DocumentMap,
) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
    let overlays = txn
        .document_overlay_cache()
        .get_overlays(&documents.keys().cloned().collect());
    compute_views(txn, documents, &overlays, &BTreeSet::new())
}

fn compute_views(
    txn: &mut dyn PersistenceTransaction,
    documents: DocumentMap,
    overlays: &BTreeMap<DocumentKey, Overlay>,
    existence_changed: &BTreeSet<DocumentKey>,
) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
    let mut recalculate = DocumentMap::new();
    let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
    let mut results = BTreeMap::new();

    for (key, mut document) in documents {
        let overlay = overlays.get(&key);
        let is_patch = overlay.is_some_and(|overlay| matches!(overlay.mutation, Mutation::Patch(_)));
        if existence_changed.contains(&key) && (overlay.is_none() || is_patch) {
            recalculate.insert(key, document);
        } else if let Some(overlay) = overlay {
            let mask = overlay.mutation.field_mask();
            overlay
                .mutation
                .apply_to_local_view(&mut document, mask.clone(), Timestamp::now());
            mutated_fields.insert(key.clone(), mask);
            results.insert(key, document);
        } else {
            mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            results.insert(key, document);
        }
    }

    let recalculated_masks = recalculate_and_save_overlays(txn, &mut recalculate)?;
    mutated_fields.extend(recalculated_masks);
    results.extend(recalculate);

    Ok(results
        .into_iter()
        .map(|(key, document)| {
            let mask = mutated_fields.remove(&key).unwrap_or(None);
            (key, OverlayedDocument::new(document, mask))
        })
        .collect())
}

/// Re-applies all pending batches on top of `documents` (modified in place)
/// and stores fresh overlays. Returns the mutated field mask per key.
pub fn recalculate_and_save_overlays(
    txn: &mut dyn PersistenceTransaction,
    documents: &mut DocumentMap,
) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
    let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
    let batches = txn
        .mutation_queue()
        .all_mutation_batches_affecting_document_keys(&keys);

    let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
    let mut documents_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
    for batch in &batches {
        for key in batch.keys() {
            let Some(base) = documents.get_mut(&key) else {
                continue;
            };
            let previous = masks.get(&key).cloned().unwrap_or_else(|| Some(FieldMask::empty()));
            let mask = batch.apply_to_local_view(base, previous);
            masks.insert(key.clone(), mask);
            documents_by_batch_id.entry(batch.batch_id).or_default().insert(key);
        }
    }

    // Newest batch first: each key's overlay is tagged with the last batch touching it.
    let mut processed = BTreeSet::new();
    for (batch_id, keys) in documents_by_batch_id.into_iter().rev() {
        let mut overlays = BTreeMap::new();
        for key in keys {
            if !processed.insert(key.clone()) {
                continue;
            }
            let (Some(document), Some(mask)) = (documents.get(&key), masks.get(&key)) else {
                continue;
            };
            if let Some(overlay) = calculate_overlay_mutation(document, mask.as_ref()) {
                overlays.insert(key, overlay);
            }
        }
        txn.document_overlay_cache_mut()?.save_overlays(batch_id, &overlays);
    }
    Ok(masks)
}

/// Rebuilds overlays for `keys` from the remote documents and the queue.
pub fn recalculate_and_save_overlays_for_document_keys(
    txn: &mut dyn PersistenceTransaction,
    keys: &BTreeSet<DocumentKey>,
) -> FirestoreResult<()> {
    let mut documents = txn.remote_document_cache().get_entries(keys);
    recalculate_and_save_overlays(txn, &mut documents)?;
    Ok(())
}

/// Documents matching `query` in the local view.
///
/// With a non-min `since_read_time` only remote documents read after it are
/// considered, plus every document with an overlay.
pub fn get_documents_matching_query(
    txn: &dyn PersistenceTransaction,
    query: &Query,
    since_read_time: SnapshotVersion,
    context: &mut QueryContext,
) -> DocumentMap {
    if query.is_document_query() {
        get_documents_matching_document_query(txn, query)
    } else if let Some(collection_id) = query.collection_group_id() {
        let mut results = DocumentMap::new();
        for parent in txn.index_manager().get_collection_parents(collection_id) {
            let collection_query = query.as_collection_query_at_path(parent.child([collection_id]));
            results.extend(get_documents_matching_collection_query(
                txn,
                &collection_query,
                since_read_time,
                context,
            ));
        }
        results
    } else {
        get_documents_matching_collection_query(txn, query, since_read_time, context)
    }
}

fn get_documents_matching_document_query(txn: &dyn PersistenceTransaction, query: &Query) -> DocumentMap {
    let mut results = DocumentMap::new();
    let Ok(key) = DocumentKey::from_path(query.path().clone()) else {
        return results;
    };
    let document = get_document(txn, &key);
    if document.is_found_document() {
        results.insert(key, document);
    }
    results
}

fn get_documents_matching_collection_query(
    txn: &dyn PersistenceTransaction,
    query: &Query,
    since_read_time: SnapshotVersion,
    context: &mut QueryContext,
) -> DocumentMap {
    let overlays = txn
        .document_overlay_cache()
        .get_overlays_for_collection(query.path(), crate::model::BATCHID_UNKNOWN);
    let mutated: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
    let mut documents =
        txn.remote_document_cache()
            .get_documents_matching_query(query, since_read_time, &mutated, context);

    // Documents can start matching because of their overlay.
    for key in overlays.keys() {
        if !documents.contains_key(key) {
            documents.insert(key.clone(), txn.remote_document_cache().get_entry(key));
        }
    }

    documents
        .into_iter()
        .filter_map(|(key, mut document)| {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
            }
            query.matches(&document).then_some((key, document))
        })
        .collect()
}
