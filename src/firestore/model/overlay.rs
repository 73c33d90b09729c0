use crate::firestore::model::{
    BatchId, DocumentKey, FieldMask, MutableDocument, Mutation, Precondition,
};
use crate::firestore::value::MapValue;

/// Locally computed mutation that turns the remote document into the view
/// that includes every pending batch up to `largest_batch_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    largest_batch_id: BatchId,
    mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn largest_batch_id(&self) -> BatchId {
        self.largest_batch_id
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// Document plus the fields touched by the mutations already applied to it.
/// `mutated_fields == None` means the whole document was replaced.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    pub fn new(document: MutableDocument, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            document,
            mutated_fields,
        }
    }
}

/// Computes the single mutation that reproduces `document`'s local changes
/// relative to its remote state, or `None` when there is nothing to overlay.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }

    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };

    if mask.is_empty() {
        return None;
    }

    let mut patch_value = MapValue::empty();
    let mut patch_mask = FieldMask::empty();
    for field in mask.fields() {
        if patch_mask.fields().any(|existing| existing == field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = document.field(&path);
        // A deleted nested field is expressed by rewriting its parent.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = document.field(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value.clone()),
            None => patch_value.delete(&path),
        }
        patch_mask.insert(path);
    }

    Some(
        Mutation::patch(document.key().clone(), patch_value, patch_mask)
            .with_precondition(Precondition::None),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, MutationKind, SnapshotVersion, Timestamp};
    use crate::firestore::value::FirestoreValue;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("drinks/tea").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn synced_documents_have_no_overlay() {
        let doc = MutableDocument::new_found_document(
            key(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            MapValue::empty(),
        );
        assert!(calculate_overlay_mutation(&doc, None).is_none());
    }

    #[test]
    fn whole_document_changes_become_set_or_delete() {
        let mut doc = MutableDocument::new_invalid_document(key());
        doc.convert_to_found_document(SnapshotVersion::min(), MapValue::empty())
            .set_has_local_mutations();
        let overlay = calculate_overlay_mutation(&doc, None).unwrap();
        assert!(matches!(overlay.kind(), MutationKind::Set { .. }));

        doc.convert_to_no_document(SnapshotVersion::min())
            .set_has_local_mutations();
        let overlay = calculate_overlay_mutation(&doc, None).unwrap();
        assert!(matches!(overlay.kind(), MutationKind::Delete));
    }

    #[test]
    fn deleted_nested_field_patches_parent() {
        let mut inner = BTreeMap::new();
        inner.insert("kept".to_string(), FirestoreValue::from_integer(1));
        let mut fields = BTreeMap::new();
        fields.insert("outer".to_string(), FirestoreValue::from_map(inner));
        let mut doc = MutableDocument::new_found_document(
            key(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            MapValue::new(fields),
        );
        doc.set_has_local_mutations();

        let mask = FieldMask::new([path("outer.removed")]);
        let overlay = calculate_overlay_mutation(&doc, Some(&mask)).unwrap();
        let overlay_mask = overlay.field_mask().unwrap();
        assert!(overlay_mask.fields().any(|field| field == &path("outer")));
        assert!(overlay.precondition().is_none());
    }
}
