use std::collections::{BTreeMap, BTreeSet};

use crate::error::{internal_error, FirestoreResult};
use crate::model::mutation::calculate_overlay_mutation;
use crate::model::{
    BatchId, Document, DocumentKey, FieldMask, Mutation, MutationResult, OverlayedDocument, SnapshotVersion,
    Timestamp,
};

/// Mutations written together by one local write, applied atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|mutation| mutation.key().clone()).collect()
    }

    pub fn affects(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| mutation.key() == key)
    }

    /// Applies the acknowledged results of this batch to `document`.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationBatchResult) {
        for (mutation, mutation_result) in self.mutations.iter().zip(result.mutation_results.iter()) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    /// Applies every mutation for `document`'s key in batch order.
    pub fn apply_to_local_view(&self, document: &mut Document, mask: Option<FieldMask>) -> Option<FieldMask> {
        let mut mask = mask;
        for mutation in &self.mutations {
            if mutation.key() == document.key() {
                mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies this batch to each affected document in `documents` and
    /// returns the overlay mutation to persist per key.
    ///
    /// Keys in `documents_without_remote_version` get whole-document overlays
    /// since no base exists to patch.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mask = self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.clone());
            let mask = if documents_without_remote_version.contains(&key) {
                None
            } else {
                mask
            };
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mask.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            if !overlayed.document.is_valid_document() {
                overlayed.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// A batch together with the server's response to it.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version the server reported for each written key.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{doc, field, key, map, patch_mutation, set_mutation, version};
    use crate::value::{FirestoreValue, MapValue};

    #[test]
    fn batch_result_requires_one_result_per_mutation() {
        let batch = MutationBatch::new(1, Timestamp::now(), vec![Mutation::delete(key("rooms/a"))]);
        let err = MutationBatchResult::from(batch.clone(), version(3), vec![], vec![]).unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");

        let result = MutationBatchResult::from(
            batch,
            version(3),
            vec![MutationResult {
                version: version(3),
                transform_results: vec![],
            }],
            vec![1],
        )
        .unwrap();
        assert_eq!(result.doc_versions.get(&key("rooms/a")), Some(&version(3)));
    }

    #[test]
    fn local_view_applies_mutations_in_order() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            vec![
                set_mutation("rooms/a", map(&[("n", FirestoreValue::from_integer(1))])),
                patch_mutation("rooms/a", map(&[("m", FirestoreValue::from_integer(2))]), &["m"]),
                set_mutation("rooms/b", MapValue::empty()),
            ],
        );
        let mut document = Document::new_invalid_document(key("rooms/a"));
        let mask = batch.apply_to_local_view(&mut document, Some(FieldMask::empty()));
        assert!(mask.is_none());
        assert_eq!(document.field(&field("n")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(document.field(&field("m")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn document_set_overlays_use_whole_document_without_remote_version() {
        let batch = MutationBatch::new(
            4,
            Timestamp::now(),
            vec![patch_mutation("rooms/a", map(&[("m", FirestoreValue::from_integer(2))]), &["m"])
                .with_precondition(crate::model::Precondition::None)],
        );
        let mut documents = BTreeMap::new();
        documents.insert(
            key("rooms/a"),
            OverlayedDocument::new(doc("rooms/a", 1, MapValue::empty()), Some(FieldMask::empty())),
        );
        let without_version = BTreeSet::from([key("rooms/a")]);
        let overlays = batch.apply_to_local_document_set(&mut documents, &without_version);
        assert!(matches!(overlays.get(&key("rooms/a")), Some(Mutation::Set(_))));
    }
}
