use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{Direction, FilterOperator, Target};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, FieldPath, MutableDocument, ResourcePath,
};
use crate::firestore::value::MapValue;

/// How well the configured indexes serve a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexType {
    /// No index covers any field of the target.
    None,
    /// An index narrows the candidates but does not cover every filter and
    /// ordering, so results must be re-filtered and limits can't be trusted.
    Partial,
    /// An index covers every filter and ordering of the target.
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Ascending,
    Descending,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: SegmentKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
}

impl FieldIndex {
    pub fn covers(&self, field: &FieldPath) -> bool {
        field.is_key_field() || self.segments.iter().any(|segment| &segment.field_path == field)
    }
}

/// Collection-parent index and memory-resident field indexes.
///
/// Each index entry is the projection of a remote document onto the
/// index's fields. Lookups evaluate the target's filters against these
/// projections, so a `Partial` index returns a superset of the matches.
#[derive(Clone, Debug, Default)]
pub struct MemoryIndexManager {
    collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
    indexes: BTreeMap<String, Vec<FieldIndex>>,
    entries: BTreeMap<i32, BTreeMap<DocumentKey, MapValue>>,
    next_index_id: i32,
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `collection_path` so collection-group queries can find it.
    pub fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        self.collection_parents
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.without_last());
    }

    pub fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_field_index<'a>(
        &mut self,
        collection_group: impl Into<String>,
        segments: Vec<IndexSegment>,
        documents: impl IntoIterator<Item = &'a MutableDocument>,
    ) -> FieldIndex {
        self.next_index_id += 1;
        let index = FieldIndex {
            index_id: self.next_index_id,
            collection_group: collection_group.into(),
            segments,
        };
        let mut entries = BTreeMap::new();
        for document in documents {
            if document.key().has_collection_id(&index.collection_group) {
                if let Some(projection) = project(&index, document) {
                    entries.insert(document.key().clone(), projection);
                }
            }
        }
        log::debug!(
            "IndexManager: created index {} on {} with {} entries",
            index.index_id,
            index.collection_group,
            entries.len()
        );
        self.entries.insert(index.index_id, entries);
        self.indexes
            .entry(index.collection_group.clone())
            .or_default()
            .push(index.clone());
        index
    }

    pub fn delete_field_index(&mut self, index: &FieldIndex) {
        if let Some(indexes) = self.indexes.get_mut(&index.collection_group) {
            indexes.retain(|candidate| candidate.index_id != index.index_id);
        }
        self.entries.remove(&index.index_id);
    }

    pub fn get_field_indexes(&self, collection_group: &str) -> &[FieldIndex] {
        self.indexes
            .get(collection_group)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Creates an index serving `target` unless one already covers it.
    pub fn create_target_indexes<'a>(
        &mut self,
        target: &Target,
        documents: impl IntoIterator<Item = &'a MutableDocument>,
    ) {
        if self.get_index_type(target) == IndexType::Full {
            return;
        }
        let Some(collection_group) = collection_group_of(target) else {
            return;
        };
        let segments = target_segments(target);
        if segments.is_empty() {
            return;
        }
        self.add_field_index(collection_group, segments, documents);
    }

    pub fn get_index_type(&self, target: &Target) -> IndexType {
        match self.best_index(target) {
            Some((_, index_type)) => index_type,
            None => IndexType::None,
        }
    }

    /// Keys of remote documents that may match `target`, or `None` when no
    /// index applies.
    pub fn get_documents_matching_target(&self, target: &Target) -> Option<DocumentKeySet> {
        let (index, _) = self.best_index(target)?;
        let entries = self.entries.get(&index.index_id)?;
        let filters: Vec<_> = target
            .field_filters()
            .into_iter()
            .filter(|filter| !filter.field().is_key_field() && index.covers(filter.field()))
            .collect();
        let keys = entries
            .iter()
            .filter(|(key, projection)| {
                let stub = MutableDocument::new_found_document(
                    (*key).clone(),
                    Default::default(),
                    (*projection).clone(),
                );
                filters.iter().all(|filter| filter.matches(&stub))
            })
            .map(|(key, _)| key.clone())
            .collect();
        Some(keys)
    }

    /// Refreshes index entries after remote documents changed.
    pub fn update_index_entries<'a>(
        &mut self,
        documents: impl IntoIterator<Item = &'a MutableDocument>,
    ) {
        for document in documents {
            let group = document.key().collection_group().to_string();
            let Some(indexes) = self.indexes.get(&group) else {
                continue;
            };
            for index in indexes {
                let Some(entries) = self.entries.get_mut(&index.index_id) else {
                    continue;
                };
                match project(index, document) {
                    Some(projection) => {
                        entries.insert(document.key().clone(), projection);
                    }
                    None => {
                        entries.remove(document.key());
                    }
                }
            }
        }
    }

    pub fn remove_index_entries(&mut self, key: &DocumentKey) {
        for entries in self.entries.values_mut() {
            entries.remove(key);
        }
    }

    fn best_index(&self, target: &Target) -> Option<(&FieldIndex, IndexType)> {
        let group = collection_group_of(target)?;
        let fields = target_fields(target);
        if fields.is_empty() {
            return None;
        }
        self.get_field_indexes(&group)
            .iter()
            .filter_map(|index| {
                let covered = fields.iter().filter(|field| index.covers(field)).count();
                if covered == 0 {
                    None
                } else if covered == fields.len() {
                    Some((index, IndexType::Full))
                } else {
                    Some((index, IndexType::Partial))
                }
            })
            .max_by_key(|(index, index_type)| (*index_type, index.segments.len()))
    }
}

fn collection_group_of(target: &Target) -> Option<String> {
    if target.is_document_target() {
        return None;
    }
    match &target.collection_group {
        Some(group) => Some(group.clone()),
        None => target.path.last_segment().map(str::to_string),
    }
}

/// Filter and ordering fields of `target`, excluding the document key.
fn target_fields(target: &Target) -> Vec<FieldPath> {
    let mut fields = BTreeSet::new();
    for filter in target.field_filters() {
        if !filter.field().is_key_field() {
            fields.insert(filter.field().clone());
        }
    }
    for order in &target.order_by {
        if !order.field().is_key_field() {
            fields.insert(order.field().clone());
        }
    }
    fields.into_iter().collect()
}

/// Equality filters first, then array filters, then the ordering.
fn target_segments(target: &Target) -> Vec<IndexSegment> {
    let mut segments: Vec<IndexSegment> = Vec::new();
    let push = |segments: &mut Vec<IndexSegment>, field: &FieldPath, kind: SegmentKind| {
        if field.is_key_field() || segments.iter().any(|segment| &segment.field_path == field) {
            return;
        }
        segments.push(IndexSegment {
            field_path: field.clone(),
            kind,
        });
    };
    for filter in target.field_filters() {
        if filter.op() == FilterOperator::Equal || filter.op() == FilterOperator::In {
            push(&mut segments, filter.field(), SegmentKind::Ascending);
        }
    }
    for filter in target.field_filters() {
        if matches!(
            filter.op(),
            FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
        ) {
            push(&mut segments, filter.field(), SegmentKind::Contains);
        }
    }
    for order in &target.order_by {
        let kind = match order.direction() {
            Direction::Ascending => SegmentKind::Ascending,
            Direction::Descending => SegmentKind::Descending,
        };
        push(&mut segments, order.field(), kind);
    }
    segments
}

/// Projection of `document` onto the index fields. Documents missing any
/// indexed field are not part of the index.
fn project(index: &FieldIndex, document: &MutableDocument) -> Option<MapValue> {
    if !document.is_found_document() {
        return None;
    }
    let mut projection = MapValue::empty();
    for segment in &index.segments {
        let value = document.field(&segment.field_path)?;
        projection.set(&segment.field_path, value.clone());
    }
    Some(projection)
}
