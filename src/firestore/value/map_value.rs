use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Document payload. Field-path accessors treat nested maps as the only
/// traversable containers.
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

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            match current.kind() {
                ValueKind::Map(child) => current = child.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing any non-map intermediate value
    /// with an empty map.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Leaf field paths of this map. Empty nested maps count as leaves.
    pub fn field_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_paths(&self.fields, &mut Vec::new(), &mut paths);
        paths
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));
    let mut child = match entry.kind() {
        ValueKind::Map(map) => map.fields.clone(),
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child, rest, value);
    *entry = FirestoreValue::from_map(child);
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    if let Some(entry) = fields.get_mut(first) {
        if let ValueKind::Map(map) = entry.kind() {
            let mut child = map.fields.clone();
            delete_at_segments(&mut child, rest);
            *entry = FirestoreValue::from_map(child);
        }
    }
}

fn collect_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        prefix.push(key.clone());
        match value.kind() {
            ValueKind::Map(map) if !map.fields.is_empty() => {
                collect_paths(&map.fields, prefix, out);
            }
            _ => {
                if let Ok(path) = FieldPath::new(prefix.iter().cloned()) {
                    out.push(path);
                }
            }
        }
        prefix.pop();
    }
}
