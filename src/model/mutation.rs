use std::collections::BTreeSet;

use crate::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::value::{FirestoreValue, MapValue, ValueKind};

/// Condition the target document must satisfy for a mutation to apply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I: IntoIterator<Item = FieldPath>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when `path` or one of its parents is in the mask.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    pub fn union_with(mut self, other: &FieldMask) -> Self {
        self.fields.extend(other.fields.iter().cloned());
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Value the field takes in the local view before the server responds.
    pub fn apply_to_local_view(&self, previous: Option<&FirestoreValue>, local_write_time: Timestamp) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::pending_server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => apply_array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => apply_array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => apply_numeric_increment(previous, operand),
        }
    }

    /// Value the field takes once the write is acknowledged with `transform_result`.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: Option<FirestoreValue>,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(elements) => apply_array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => apply_array_remove(previous, elements),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                transform_result.unwrap_or_else(FirestoreValue::null)
            }
        }
    }
}

fn existing_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn apply_array_union(previous: Option<&FirestoreValue>, elements: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing_array(previous);
    for element in elements {
        if !values.iter().any(|value| crate::value::values_equal(value, element)) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn apply_array_remove(previous: Option<&FirestoreValue>, elements: &[FirestoreValue]) -> FirestoreValue {
    let values = existing_array(previous)
        .into_iter()
        .filter(|value| !elements.iter().any(|element| crate::value::values_equal(value, element)))
        .collect();
    FirestoreValue::from_array(values)
}

fn apply_numeric_increment(previous: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = match previous.map(FirestoreValue::kind) {
        Some(ValueKind::Integer(value)) => ValueKind::Integer(*value),
        Some(ValueKind::Double(value)) => ValueKind::Double(*value),
        _ => ValueKind::Integer(0),
    };
    match (base, operand.kind()) {
        (ValueKind::Integer(base), ValueKind::Integer(operand)) => {
            FirestoreValue::from_integer(base.saturating_add(*operand))
        }
        (base, operand) => FirestoreValue::from_double(as_f64(&base) + as_f64(operand)),
    }
}

fn as_f64(kind: &ValueKind) -> f64 {
    match kind {
        ValueKind::Integer(value) => *value as f64,
        ValueKind::Double(value) => *value,
        _ => 0.0,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

/// Outcome of one acknowledged mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    /// One entry per field transform, in declaration order.
    pub transform_results: Vec<FirestoreValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SetMutation {
    pub key: DocumentKey,
    pub value: MapValue,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatchMutation {
    pub key: DocumentKey,
    pub data: MapValue,
    pub field_mask: FieldMask,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteMutation {
    pub key: DocumentKey,
    pub precondition: Precondition,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VerifyMutation {
    pub key: DocumentKey,
    pub precondition: Precondition,
}

/// A write to a single document.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set(SetMutation),
    Patch(PatchMutation),
    Delete(DeleteMutation),
    Verify(VerifyMutation),
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set(SetMutation {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        })
    }

    /// Patch that requires the document to exist, like an update call.
    pub fn patch(key: DocumentKey, data: MapValue, field_mask: FieldMask) -> Self {
        Mutation::Patch(PatchMutation {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        })
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete(DeleteMutation {
            key,
            precondition: Precondition::None,
        })
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify(VerifyMutation { key, precondition })
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set(m) => m.precondition = precondition,
            Mutation::Patch(m) => m.precondition = precondition,
            Mutation::Delete(m) => m.precondition = precondition,
            Mutation::Verify(m) => m.precondition = precondition,
        }
        self
    }

    /// Adds field transforms; ignored for deletes and verifies.
    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set(m) => m.field_transforms.extend(transforms),
            Mutation::Patch(m) => m.field_transforms.extend(transforms),
            Mutation::Delete(_) | Mutation::Verify(_) => {}
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set(m) => &m.key,
            Mutation::Patch(m) => &m.key,
            Mutation::Delete(m) => &m.key,
            Mutation::Verify(m) => &m.key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set(m) => m.precondition,
            Mutation::Patch(m) => m.precondition,
            Mutation::Delete(m) => m.precondition,
            Mutation::Verify(m) => m.precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set(m) => &m.field_transforms,
            Mutation::Patch(m) => &m.field_transforms,
            Mutation::Delete(_) | Mutation::Verify(_) => &[],
        }
    }

    /// Fields a patch touches; `None` for mutations that replace the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match self {
            Mutation::Patch(m) => Some(m.field_mask.clone()),
            _ => None,
        }
    }

    /// Applies the acknowledged result of this mutation to `document`.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationResult) {
        match self {
            Mutation::Set(m) => {
                let transform_results =
                    server_transform_results(document.data(), &m.field_transforms, &result.transform_results);
                let mut data = m.value.clone();
                apply_transform_results(&mut data, transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch(m) => {
                if !m.precondition.is_valid_for(document) {
                    // The server applied the patch to a document we have not seen.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results =
                    server_transform_results(document.data(), &m.field_transforms, &result.transform_results);
                let mut data = document.data().clone();
                apply_patch(&mut data, &m.data, &m.field_mask);
                apply_transform_results(&mut data, transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete(_) => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify(_) => {}
        }
    }

    /// Applies this mutation optimistically.
    ///
    /// `previous_mask` holds the fields changed by earlier mutations (`None`
    /// meaning the whole document); the returned mask adds the fields this
    /// mutation changed.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(document) {
            return previous_mask;
        }
        match self {
            Mutation::Set(m) => {
                let transform_results = local_transform_results(document.data(), &m.field_transforms, local_write_time);
                let mut data = m.value.clone();
                apply_transform_results(&mut data, transform_results);
                let version = document.version();
                document.convert_to_found_document(version, data).set_has_local_mutations();
                None
            }
            Mutation::Patch(m) => {
                let transform_results = local_transform_results(document.data(), &m.field_transforms, local_write_time);
                let mut data = document.data().clone();
                apply_patch(&mut data, &m.data, &m.field_mask);
                apply_transform_results(&mut data, transform_results);
                let version = document.version();
                document.convert_to_found_document(version, data).set_has_local_mutations();
                previous_mask.map(|mask| {
                    let mut mask = mask.union_with(&m.field_mask);
                    for transform in &m.field_transforms {
                        mask.insert(transform.field.clone());
                    }
                    mask
                })
            }
            Mutation::Delete(_) => {
                let version = document.version();
                document.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            Mutation::Verify(_) => previous_mask,
        }
    }
}

fn apply_patch(data: &mut MapValue, patch: &MapValue, mask: &FieldMask) {
    for path in mask.fields() {
        match patch.get(path) {
            Some(value) => data.set(path, value.clone()),
            None => data.delete(path),
        }
    }
}

fn apply_transform_results(data: &mut MapValue, results: Vec<(FieldPath, FirestoreValue)>) {
    for (path, value) in results {
        data.set(&path, value);
    }
}

fn local_transform_results(
    data: &MapValue,
    transforms: &[FieldTransform],
    local_write_time: Timestamp,
) -> Vec<(FieldPath, FirestoreValue)> {
    transforms
        .iter()
        .map(|transform| {
            let previous = data.get(&transform.field);
            (
                transform.field.clone(),
                transform.operation.apply_to_local_view(previous, local_write_time),
            )
        })
        .collect()
}

fn server_transform_results(
    data: &MapValue,
    transforms: &[FieldTransform],
    server_results: &[FirestoreValue],
) -> Vec<(FieldPath, FirestoreValue)> {
    if server_results.len() != transforms.len() && !server_results.is_empty() {
        log::warn!(
            "server returned {} transform results for {} transforms",
            server_results.len(),
            transforms.len()
        );
    }
    transforms
        .iter()
        .enumerate()
        .map(|(index, transform)| {
            let previous = data.get(&transform.field);
            (
                transform.field.clone(),
                transform
                    .operation
                    .apply_to_remote_document(previous, server_results.get(index).cloned()),
            )
        })
        .collect()
}

/// Builds the single mutation that turns the remote document into `document`.
///
/// `mask` lists the fields changed locally (`None` for the whole document).
/// Returns `None` when the document carries no local changes.
pub fn calculate_overlay_mutation(document: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() || mask.is_some_and(FieldMask::is_empty) {
        return None;
    }

    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };

    let data = document.data();
    let mut patch = MapValue::empty();
    let mut mask_set = FieldMask::empty();
    for original in mask.fields() {
        if mask_set.fields().contains(original) {
            continue;
        }
        let mut path = original.clone();
        let mut value = data.get(&path);
        // A deleted nested field is expressed through its parent.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = data.get(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch.set(&path, value.clone()),
            None => patch.delete(&path),
        }
        mask_set.insert(path);
    }

    Some(Mutation::Patch(PatchMutation {
        key: document.key().clone(),
        data: patch,
        field_mask: mask_set,
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{doc, field, key, map, patch_mutation, set_mutation, version};

    #[test]
    fn set_replaces_local_view_and_reports_whole_document() {
        let mut document = doc("rooms/a", 1, map(&[("old", FirestoreValue::from_integer(1))]));
        let mutation = set_mutation("rooms/a", map(&[("new", FirestoreValue::from_integer(2))]));
        let mask = mutation.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert!(mask.is_none());
        assert!(document.has_local_mutations());
        assert!(document.field(&field("old")).is_none());
        assert_eq!(document.field(&field("new")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut missing = Document::new_no_document(key("rooms/a"), version(1));
        let mutation = patch_mutation("rooms/a", map(&[("a", FirestoreValue::from_integer(1))]), &["a"]);
        let mask = mutation.apply_to_local_view(&mut missing, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(missing.is_no_document());
    }

    #[test]
    fn patch_merges_fields_and_deletes_masked_absent_ones() {
        let mut document = doc(
            "rooms/a",
            1,
            map(&[("a", FirestoreValue::from_integer(1)), ("b", FirestoreValue::from_integer(2))]),
        );
        let mutation = patch_mutation("rooms/a", map(&[("c", FirestoreValue::from_integer(3))]), &["b", "c"]);
        let mask = mutation
            .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now())
            .unwrap();
        assert_eq!(mask.fields().len(), 2);
        assert_eq!(document.field(&field("a")), Some(&FirestoreValue::from_integer(1)));
        assert!(document.field(&field("b")).is_none());
        assert_eq!(document.field(&field("c")), Some(&FirestoreValue::from_integer(3)));
    }

    #[test]
    fn failed_patch_precondition_on_ack_yields_unknown_document() {
        let mut document = Document::new_invalid_document(key("rooms/a"));
        let mutation = patch_mutation("rooms/a", map(&[("a", FirestoreValue::from_integer(1))]), &["a"]);
        mutation.apply_to_remote_document(
            &mut document,
            &MutationResult {
                version: version(7),
                transform_results: vec![],
            },
        );
        assert!(document.is_unknown_document());
        assert_eq!(document.version(), version(7));
    }

    #[test]
    fn server_timestamp_is_pending_locally_and_resolved_on_ack() {
        let mut document = doc("rooms/a", 1, MapValue::empty());
        let mutation = set_mutation("rooms/a", MapValue::empty()).with_transforms(vec![FieldTransform::new(
            field("at"),
            TransformOperation::ServerTimestamp,
        )]);
        let write_time = Timestamp::new(100, 0);
        mutation.apply_to_local_view(&mut document, None, write_time);
        assert!(matches!(
            document.field(&field("at")).map(FirestoreValue::kind),
            Some(ValueKind::ServerTimestamp(_))
        ));

        let server_time = FirestoreValue::from_timestamp(Timestamp::new(101, 0));
        mutation.apply_to_remote_document(
            &mut document,
            &MutationResult {
                version: version(2),
                transform_results: vec![server_time.clone()],
            },
        );
        assert_eq!(document.field(&field("at")), Some(&server_time));
        assert!(document.has_committed_mutations());
    }

    #[test]
    fn array_transforms_and_increment() {
        let previous = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1), FirestoreValue::from_integer(2)]);
        let union = TransformOperation::ArrayUnion(vec![FirestoreValue::from_integer(2), FirestoreValue::from_integer(3)]);
        assert_eq!(
            union.apply_to_local_view(Some(&previous), Timestamp::now()),
            FirestoreValue::from_array(vec![
                FirestoreValue::from_integer(1),
                FirestoreValue::from_integer(2),
                FirestoreValue::from_integer(3)
            ])
        );
        let remove = TransformOperation::ArrayRemove(vec![FirestoreValue::from_integer(1)]);
        assert_eq!(
            remove.apply_to_local_view(Some(&previous), Timestamp::now()),
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(2)])
        );

        let increment = TransformOperation::NumericIncrement(FirestoreValue::from_integer(5));
        assert_eq!(
            increment.apply_to_local_view(Some(&FirestoreValue::from_string("x")), Timestamp::now()),
            FirestoreValue::from_integer(5)
        );
        assert_eq!(
            increment.apply_to_local_view(Some(&FirestoreValue::from_integer(i64::MAX)), Timestamp::now()),
            FirestoreValue::from_integer(i64::MAX)
        );
        assert_eq!(
            increment.apply_to_local_view(Some(&FirestoreValue::from_double(0.5)), Timestamp::now()),
            FirestoreValue::from_double(5.5)
        );
    }

    #[test]
    fn overlay_for_whole_document_changes() {
        let mut document = Document::new_invalid_document(key("rooms/a"));
        Mutation::delete(key("rooms/a")).apply_to_local_view(&mut document, None, Timestamp::now());
        assert_eq!(
            calculate_overlay_mutation(&document, None),
            Some(Mutation::delete(key("rooms/a")))
        );

        let synced = doc("rooms/b", 1, MapValue::empty());
        assert_eq!(calculate_overlay_mutation(&synced, None), None);
    }

    #[test]
    fn overlay_for_nested_delete_uses_parent_path() {
        let mut document = doc(
            "rooms/a",
            1,
            map(&[(
                "nested",
                FirestoreValue::from_map_value(map(&[
                    ("keep", FirestoreValue::from_integer(1)),
                    ("drop", FirestoreValue::from_integer(2)),
                ])),
            )]),
        );
        let mask = patch_mutation("rooms/a", MapValue::empty(), &["nested.drop"]).apply_to_local_view(
            &mut document,
            Some(FieldMask::empty()),
            Timestamp::now(),
        );
        let overlay = calculate_overlay_mutation(&document, mask.as_ref()).unwrap();
        match overlay {
            Mutation::Patch(patch) => {
                assert!(patch.field_mask.fields().contains(&field("nested")));
                assert!(!patch.field_mask.fields().contains(&field("nested.drop")));
                assert!(patch.data.get(&field("nested.keep")).is_some());
                assert!(patch.data.get(&field("nested.drop")).is_none());
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }
}
