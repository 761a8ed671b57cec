use crate::model::FieldPath;

/// Id assigned to indexes that have not been persisted yet.
pub const UNKNOWN_INDEX_ID: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKind {
    Ascending,
    Descending,
    /// Array-contains index over the elements of an array field.
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// A client-side index over the documents of one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
}

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: UNKNOWN_INDEX_ID,
            collection_group: collection_group.into(),
            segments,
        }
    }

    /// The array segment, if the index has one.
    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments.iter().find(|segment| segment.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments.iter().filter(|segment| segment.kind != IndexKind::Contains)
    }

    /// Two indexes are equivalent when they cover the same group and segments.
    pub fn same_definition(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }
}
