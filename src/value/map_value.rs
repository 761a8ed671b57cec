use std::collections::BTreeMap;

use crate::model::FieldPath;
use crate::value::{FirestoreValue, ValueKind};

/// Field data of a document or of a nested map value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value at `path`, following nested maps.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = self;
        for segment in parents {
            current = current.fields.get(segment)?.as_map()?;
        }
        current.fields.get(last)
    }

    /// Writes `value` at `path`, creating or replacing intermediate maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            let entry = current
                .fields
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map_value(MapValue::empty()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map_value(MapValue::empty());
            }
            current = match entry.as_map_mut() {
                Some(map) => map,
                None => return,
            };
        }
        current.fields.insert(last.clone(), value);
    }

    /// Removes the value at `path`; missing parents are left untouched.
    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            current = match current.fields.get_mut(segment).and_then(FirestoreValue::as_map_mut) {
                Some(map) => map,
                None => return,
            };
        }
        current.fields.remove(last);
    }

    /// Field-by-field equality with [`values_equal`](crate::value::values_equal) semantics.
    pub fn equals(&self, other: &MapValue) -> bool {
        self.fields.len() == other.fields.len()
            && self.fields.iter().all(|(key, value)| {
                other
                    .fields
                    .get(key)
                    .is_some_and(|other| crate::value::values_equal(value, other))
            })
    }

    /// Leaf paths of this map; non-empty nested maps are descended into.
    pub fn field_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(self, &[], &mut paths);
        paths
    }
}

fn collect_leaf_paths(map: &MapValue, prefix: &[String], out: &mut Vec<FieldPath>) {
    for (key, value) in &map.fields {
        let mut segments = prefix.to_vec();
        segments.push(key.clone());
        match value.kind() {
            ValueKind::Map(nested) if !nested.is_empty() => collect_leaf_paths(nested, &segments, out),
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    out.push(path);
                }
            }
        }
    }
}
