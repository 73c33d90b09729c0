use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Cross-type ordering of Firestore values: null, booleans, numbers,
/// timestamps, strings, bytes, references, geo points, arrays, maps.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::String(_) => 4,
        ValueKind::Bytes(_) => 5,
        ValueKind::Reference(_) => 6,
        ValueKind::GeoPoint(_) => 7,
        ValueKind::Array(_) => 8,
        ValueKind::Map(_) => 9,
    }
}

/// Total order over values. NaN sorts before every other number and
/// integers compare numerically against doubles.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => compare_arrays(a.values(), b.values()),
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

/// Strict equality: integers and doubles never equal each other, but NaN
/// equals NaN.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Double(a), ValueKind::Double(b)) => {
            (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits() || a == b
        }
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.values().len() == b.values().len()
                && a
                    .values()
                    .iter()
                    .zip(b.values())
                    .all(|(l, r)| values_equal(l, r))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => maps_equal(a, b),
        _ => left == right,
    }
}

pub fn maps_equal(left: &MapValue, right: &MapValue) -> bool {
    left.fields().len() == right.fields().len()
        && left.fields().iter().all(|(key, value)| {
            right
                .fields()
                .get(key)
                .map(|other| values_equal(value, other))
                .unwrap_or(false)
        })
}

pub fn array_contains(values: &[FirestoreValue], needle: &FirestoreValue) -> bool {
    values.iter().any(|value| values_equal(value, needle))
}

/// Approximate in-memory footprint, used for cache-size accounting.
pub fn estimate_byte_size(value: &FirestoreValue) -> usize {
    match value.kind() {
        ValueKind::Null => 4,
        ValueKind::Boolean(_) => 4,
        ValueKind::Integer(_) | ValueKind::Double(_) => 8,
        ValueKind::Timestamp(_) => 16,
        ValueKind::String(value) => value.len() * 2,
        ValueKind::Bytes(bytes) => bytes.len(),
        ValueKind::Reference(path) => path.len(),
        ValueKind::GeoPoint(_) => 16,
        ValueKind::Array(array) => array.values().iter().map(estimate_byte_size).sum(),
        ValueKind::Map(map) => estimate_map_byte_size(map),
    }
}

pub fn estimate_map_byte_size(map: &MapValue) -> usize {
    map.fields()
        .iter()
        .map(|(key, value)| key.len() * 2 + estimate_byte_size(value))
        .sum()
}

/// Stable textual form used inside query canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => format!("{value:?}"),
        ValueKind::Timestamp(ts) => format!("time({},{})", ts.seconds, ts.nanos),
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

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    compare_doubles(integer as f64, double)
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments = left.split('/');
    let right_segments = right.split('/');
    for (l, r) in left_segments.clone().zip(right_segments.clone()) {
        match l.cmp(r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left_segments.count().cmp(&right_segments.count())
}

fn compare_arrays(left: &[FirestoreValue], right: &[FirestoreValue]) -> Ordering {
    for (l, r) in left.iter().zip(right) {
        match compare_values(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left.len().cmp(&right.len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((left_key, left_value), (right_key, right_value)) in
        left.fields().iter().zip(right.fields())
    {
        match left_key.cmp(right_key) {
            Ordering::Equal => {}
            other => return other,
        }
        match compare_values(left_value, right_value) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    left.fields().len().cmp(&right.fields().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    #[test]
    fn orders_across_types() {
        let ordered = [
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(1),
            FirestoreValue::from_double(1.5),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_array(vec![]),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn integers_and_doubles_compare_numerically_but_are_not_equal() {
        let one = FirestoreValue::from_integer(1);
        let one_double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&one, &one_double), Ordering::Equal);
        assert!(!values_equal(&one, &one_double));
    }

    #[test]
    fn nan_equals_nan() {
        let nan = FirestoreValue::from_double(f64::NAN);
        assert!(values_equal(&nan, &nan.clone()));
    }

    #[test]
    fn array_membership() {
        let values = vec![FirestoreValue::from_string("x"), FirestoreValue::from_integer(2)];
        assert!(array_contains(&values, &FirestoreValue::from_integer(2)));
        assert!(!array_contains(&values, &FirestoreValue::from_double(2.0)));
    }
}
