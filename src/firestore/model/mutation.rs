use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::firestore::value::value_util::array_contains;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Condition the stored document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
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
    /// Optimistic value shown before the server has resolved the transform.
    fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
        }
    }

    fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: Option<FirestoreValue>,
    ) -> FirestoreValue {
        match (self, server_result) {
            // Array transforms come back as null; recompute them from the committed base.
            (TransformOperation::ArrayUnion(_), _) | (TransformOperation::ArrayRemove(_), _) => {
                self.apply_to_local_view(previous, Timestamp::now())
            }
            (_, Some(result)) => result,
            (_, None) => self.apply_to_local_view(previous, Timestamp::now()),
        }
    }

    /// Value that must be pinned before a non-idempotent transform so the
    /// local view stays stable while the write is pending.
    fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => Some(value.clone()),
                _ => Some(FirestoreValue::from_integer(0)),
            },
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    Set { value: MapValue },
    Patch { value: MapValue, mask: FieldMask },
    Delete,
    Verify,
}

/// Server acknowledgement for a single mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self {
            key,
            kind: MutationKind::Set { value },
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Patches only the masked fields. Defaults to requiring the document to exist.
    pub fn patch(key: DocumentKey, value: MapValue, mask: FieldMask) -> Self {
        Self {
            key,
            kind: MutationKind::Patch { value, mask },
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn verify(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            kind: MutationKind::Verify,
            precondition: Precondition::UpdateTime(version),
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transform(mut self, field: FieldPath, operation: TransformOperation) -> Self {
        self.field_transforms.push(FieldTransform::new(field, operation));
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Fields this mutation touches; `None` means the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Set { .. } | MutationKind::Delete => None,
            MutationKind::Verify => Some(FieldMask::empty()),
            MutationKind::Patch { mask, .. } => {
                let mut mask = mask.clone();
                for transform in &self.field_transforms {
                    mask.insert(transform.field.clone());
                }
                Some(mask)
            }
        }
    }

    /// Applies the mutation to the locally cached view. Returns the updated
    /// set of mutated fields, `None` once the whole document was replaced.
    /// A failed precondition leaves the document and mask untouched.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }

        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                for (path, result) in transform_results {
                    data.set(&path, result);
                }
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { value, mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = document.data().clone();
                apply_patch(&mut data, value, mask);
                for (path, result) in transform_results {
                    data.set(&path, result);
                }
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                previous_mask.map(|previous| {
                    let mut merged = previous.union(mask);
                    for transform in &self.field_transforms {
                        merged.insert(transform.field.clone());
                    }
                    merged
                })
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Applies the acknowledged mutation to the remote document using the
    /// server-assigned version and transform results.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<()> {
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(document, result)?;
                let mut data = value.clone();
                for (path, value) in transform_results {
                    data.set(&path, value);
                }
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(document) {
                    document.convert_to_unknown_document(result.version);
                    return Ok(());
                }
                let transform_results = self.server_transform_results(document, result)?;
                let mut data = document.data().clone();
                apply_patch(&mut data, value, mask);
                for (path, value) in transform_results {
                    data.set(&path, value);
                }
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {
                return Err(internal_error(
                    "Verify mutations are never applied to remote documents",
                ));
            }
        }
        Ok(())
    }

    /// Patch pinning the current values of non-idempotent transform targets,
    /// or `None` when the mutation has no such transforms.
    pub fn extract_base_value(&self, document: &MutableDocument) -> Option<Mutation> {
        let mut base = MapValue::empty();
        let mut mask = FieldMask::empty();
        for transform in &self.field_transforms {
            let existing = document.field(&transform.field);
            if let Some(value) = transform.operation.compute_base_value(existing) {
                base.set(&transform.field, value);
                mask.insert(transform.field.clone());
            }
        }
        if mask.is_empty() {
            return None;
        }
        Some(
            Mutation::patch(self.key.clone(), base, mask)
                .with_precondition(Precondition::Exists(true)),
        )
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> Vec<(FieldPath, FirestoreValue)> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(&transform.field);
                (
                    transform.field.clone(),
                    transform
                        .operation
                        .apply_to_local_view(previous, local_write_time),
                )
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<Vec<(FieldPath, FirestoreValue)>> {
        if !result.transform_results.is_empty()
            && result.transform_results.len() != self.field_transforms.len()
        {
            return Err(internal_error(format!(
                "server transform result count ({}) should match field transform count ({})",
                result.transform_results.len(),
                self.field_transforms.len()
            )));
        }
        Ok(self
            .field_transforms
            .iter()
            .enumerate()
            .map(|(index, transform)| {
                let previous = document.field(&transform.field);
                let server_result = result.transform_results.get(index).cloned();
                (
                    transform.field.clone(),
                    transform
                        .operation
                        .apply_to_remote_document(previous, server_result),
                )
            })
            .collect())
    }
}

fn apply_patch(data: &mut MapValue, value: &MapValue, mask: &FieldMask) {
    for path in mask.fields() {
        match value.get(path) {
            Some(new_value) => data.set(path, new_value.clone()),
            None => data.delete(path),
        }
    }
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing
        .and_then(FirestoreValue::as_array)
        .map(<[FirestoreValue]>::to_vec)
        .unwrap_or_default();
    for element in additions {
        if !array_contains(&values, element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing
        .and_then(FirestoreValue::as_array)
        .map(<[FirestoreValue]>::to_vec)
        .unwrap_or_default();
    let filtered = values
        .into_iter()
        .filter(|candidate| !array_contains(removals, candidate))
        .collect();
    FirestoreValue::from_array(filtered)
}

fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = match existing.map(FirestoreValue::kind) {
        Some(ValueKind::Integer(value)) => FirestoreValue::from_integer(*value),
        Some(ValueKind::Double(value)) => FirestoreValue::from_double(*value),
        _ => FirestoreValue::from_integer(0),
    };
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => match current.checked_add(*delta) {
            Some(sum) => FirestoreValue::from_integer(sum),
            None => FirestoreValue::from_double(*current as f64 + *delta as f64),
        },
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*current as f64 + delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + delta)
        }
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("coll/doc").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut fields = BTreeMap::new();
        for (key, value) in entries {
            fields.insert(key.to_string(), value.clone());
        }
        MapValue::new(fields)
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn set_replaces_document_and_clears_mask() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("a", FirestoreValue::from_integer(1))]),
        );
        let mutation = Mutation::set(key(), map(&[("b", FirestoreValue::from_integer(2))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.data(), &map(&[("b", FirestoreValue::from_integer(2))]));
    }

    #[test]
    fn patch_merges_and_extends_mask() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("a", FirestoreValue::from_integer(1))]),
        );
        let mutation = Mutation::patch(
            key(),
            map(&[("b", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("b")]),
        );
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now())
            .expect("patch keeps a mask");
        assert!(mask.covers(&path("b")));
        assert_eq!(doc.field(&path("a")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(doc.field(&path("b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn failed_precondition_leaves_document_untouched() {
        let mut doc = MutableDocument::new_no_document(key(), version(1));
        let mutation = Mutation::patch(
            key(),
            map(&[("b", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("b")]),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(doc.is_no_document());
        assert!(!doc.has_local_mutations());
    }

    #[test]
    fn server_timestamp_uses_local_time_then_server_value() {
        let local_time = Timestamp::new(100, 0);
        let server_time = Timestamp::new(105, 0);
        let mutation = Mutation::set(key(), MapValue::empty())
            .with_transform(path("at"), TransformOperation::ServerTimestamp);

        let mut local = MutableDocument::new_invalid_document(key());
        mutation.apply_to_local_view(&mut local, None, local_time);
        assert_eq!(
            local.field(&path("at")),
            Some(&FirestoreValue::from_timestamp(local_time))
        );

        let mut remote = MutableDocument::new_invalid_document(key());
        let result = MutationResult {
            version: version(105),
            transform_results: vec![FirestoreValue::from_timestamp(server_time)],
        };
        mutation.apply_to_remote_document(&mut remote, &result).unwrap();
        assert_eq!(
            remote.field(&path("at")),
            Some(&FirestoreValue::from_timestamp(server_time))
        );
        assert!(remote.has_committed_mutations());
        assert_eq!(remote.version(), version(105));
    }

    #[test]
    fn increment_overflow_falls_back_to_double() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("n", FirestoreValue::from_integer(i64::MAX))]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty())
            .with_transform(path("n"), TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)));
        mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert!(matches!(doc.field(&path("n")).map(FirestoreValue::kind), Some(ValueKind::Double(_))));
    }

    #[test]
    fn array_union_skips_existing_elements() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("tags", FirestoreValue::from_array(vec![FirestoreValue::from_string("a")]))]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty()).with_transform(
            path("tags"),
            TransformOperation::ArrayUnion(vec![
                FirestoreValue::from_string("a"),
                FirestoreValue::from_string("b"),
            ]),
        );
        mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(
            doc.field(&path("tags")).and_then(FirestoreValue::as_array).map(<[_]>::len),
            Some(2)
        );
    }

    #[test]
    fn extracts_increment_base_value() {
        let doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("n", FirestoreValue::from_string("text"))]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty())
            .with_transform(path("n"), TransformOperation::NumericIncrement(FirestoreValue::from_integer(5)));
        let base = mutation.extract_base_value(&doc).expect("base mutation");
        match base.kind() {
            MutationKind::Patch { value, .. } => {
                assert_eq!(value.get(&path("n")), Some(&FirestoreValue::from_integer(0)));
            }
            other => panic!("unexpected base mutation: {other:?}"),
        }
    }

    #[test]
    fn patch_of_missing_document_acknowledged_as_unknown() {
        let mut doc = MutableDocument::new_invalid_document(key());
        let mutation = Mutation::patch(
            key(),
            map(&[("b", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("b")]),
        );
        let result = MutationResult {
            version: version(7),
            transform_results: Vec::new(),
        };
        mutation.apply_to_remote_document(&mut doc, &result).unwrap();
        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), version(7));
    }
}
