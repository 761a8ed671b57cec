use std::cmp::Ordering;

use crate::value::{FirestoreValue, ValueKind};

/// Position of a value's type in the cross-type sort order.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp(_) => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
    }
}

/// Total order over values used by queries, cursors and indexes.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (l, r) if left_type == 2 => compare_numbers(number(l), number(r)),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::ServerTimestamp(l), ValueKind::ServerTimestamp(r)) => {
            l.local_write_time.cmp(&r.local_write_time)
        }
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_reference_paths(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (lv, rv) in l.values().iter().zip(r.values().iter()) {
                let ordering = compare_values(lv, rv);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.values().len().cmp(&r.values().len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            for ((lk, lv), (rk, rv)) in l.fields().iter().zip(r.fields().iter()) {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.fields().len().cmp(&r.fields().len())
        }
        _ => Ordering::Equal,
    }
}

/// Strict equality: numbers of different representations are not equal,
/// NaN equals NaN.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits() || (l == r && *l != 0.0)
        }
        (ValueKind::Integer(_), ValueKind::Double(_)) | (ValueKind::Double(_), ValueKind::Integer(_)) => false,
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l.values().iter().zip(r.values().iter()).all(|(a, b)| values_equal(a, b))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields().iter().all(|(key, value)| {
                    r.fields().get(key).is_some_and(|other| values_equal(value, other))
                })
        }
        _ => type_order(left) == type_order(right) && compare_values(left, right) == Ordering::Equal,
    }
}

/// Stable textual form used to build query and target canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => {
            if value.fract() == 0.0 && value.is_finite() {
                format!("{value:.1}")
            } else {
                value.to_string()
            }
        }
        ValueKind::Timestamp(ts) => format!("time({},{})", ts.seconds, ts.nanos),
        ValueKind::ServerTimestamp(pending) => format!(
            "serverTimestamp({},{})",
            pending.local_write_time.seconds, pending.local_write_time.nanos
        ),
        ValueKind::String(value) => value.clone(),
        ValueKind::Bytes(bytes) => bytes.to_base64(),
        ValueKind::Reference(path) => path.clone(),
        ValueKind::GeoPoint(point) => format!("geo({},{})", point.latitude(), point.longitude()),
        ValueKind::Array(array) => {
            let parts: Vec<String> = array.values().iter().map(canonical_id).collect();
            format!("[{}]", parts.join(","))
        }
        ValueKind::Map(map) => {
            let parts: Vec<String> = map
                .fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_id(value)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

fn number(kind: &ValueKind) -> f64 {
    match kind {
        ValueKind::Integer(value) => *value as f64,
        ValueKind::Double(value) => *value,
        _ => f64::NAN,
    }
}

fn compare_numbers(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_reference_paths(left: &str, right: &str) -> Ordering {
    let left_segments = left.split('/').filter(|segment| !segment.is_empty());
    let right_segments = right.split('/').filter(|segment| !segment.is_empty());
    left_segments.cmp(right_segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-5),
            FirestoreValue::from_double(2.5),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::pending_server_timestamp(Timestamp::new(0, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_reference("rooms/a"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(Default::default()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(compare_values(&window[0], &window[1]), Ordering::Less, "{window:?}");
        }
    }

    #[test]
    fn mixed_numbers_compare_by_value_but_are_not_strictly_equal() {
        let int = FirestoreValue::from_integer(1);
        let double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&int, &double), Ordering::Equal);
        assert!(!values_equal(&int, &double));
        assert!(values_equal(&FirestoreValue::from_double(f64::NAN), &FirestoreValue::from_double(f64::NAN)));
    }

    #[test]
    fn canonical_ids_are_stable() {
        let value = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_double(2.0),
            FirestoreValue::from_string("x"),
        ]);
        assert_eq!(canonical_id(&value), "[1,2.0,x]");
    }
}
