use crate::model::{BatchId, Document, DocumentKey, FieldMask, Mutation};

/// Net effect of all unacknowledged batches touching one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    /// Highest batch id that contributed to `mutation`.
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// A document with overlays applied and the fields they touched.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: Document,
    /// `None` when the whole document was replaced or deleted locally.
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    pub fn new(document: Document, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            document,
            mutated_fields,
        }
    }
}
