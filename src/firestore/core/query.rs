use std::cmp::Ordering;
use std::sync::Arc;

use crate::firestore::core::target::{
    Bound, Direction, FieldFilter, Filter, FilterOperator, OrderBy, Target,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentComparator, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// User-level query. Converted into a [`Target`] for the server, with
/// `limit_to_last` queries flipped so the server can apply the limit.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<Filter>,
    limit: Option<i32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the documents directly under `path`, or over the single
    /// document at `path` when it names a document.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.is_empty() || path.is_document_path() {
            return Err(invalid_argument(format!(
                "Invalid collection path '{}': must have an odd number of segments",
                path.canonical_string()
            )));
        }
        Ok(Self::new(path))
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<i32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn where_field(
        self,
        field: &str,
        op: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        let field = FieldPath::from_dot_separated(field)?;
        Ok(self.with_filter(Filter::Field(FieldFilter::new(field, op, value))))
    }

    pub fn order_by(mut self, field: FieldPath, direction: Direction) -> Self {
        self.explicit_order_by.push(OrderBy::new(field, direction));
        self
    }

    pub fn limit_to_first(mut self, limit: i32) -> FirestoreResult<Self> {
        if limit <= 0 {
            return Err(invalid_argument("limit must be a positive number"));
        }
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        Ok(self)
    }

    pub fn limit_to_last(mut self, limit: i32) -> FirestoreResult<Self> {
        if limit <= 0 {
            return Err(invalid_argument("limitToLast must be a positive number"));
        }
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        Ok(self)
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Same query without a limit, used when the view has to widen its
    /// local lookup.
    pub fn without_limit(&self) -> Self {
        let mut query = self.clone();
        query.limit = None;
        query
    }

    /// Collection query over `path` keeping every other constraint. Used to
    /// split a collection-group query into per-collection scans.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True for plain collection scans that return every document.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_key_field()))
    }

    /// Explicit orderings, then inequality fields not already ordered, then
    /// the document key in the direction of the last explicit ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut inequality_fields: Vec<FieldPath> = self
            .filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter| filter.op().is_inequality())
            .map(|filter| filter.field().clone())
            .collect();
        inequality_fields.sort();
        inequality_fields.dedup();

        let last_direction = result
            .last()
            .map(OrderBy::direction)
            .unwrap_or(Direction::Ascending);

        for field in inequality_fields {
            if field.is_key_field() {
                continue;
            }
            if !result.iter().any(|order| order.field() == &field) {
                result.push(OrderBy::new(field, last_direction));
            }
        }

        if !result.iter().any(|order| order.field().is_key_field()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by.iter().map(OrderBy::flipped).collect(),
                limit: self.limit,
                start_at: self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position().to_vec(), bound.inclusive())),
                end_at: self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position().to_vec(), bound.inclusive())),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let suffix = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{suffix}", self.to_target().canonical_id())
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        let path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(path)
        } else if self.path.is_document_path() {
            &self.path == path
        } else {
            self.path.is_immediate_parent_of(path)
        }
    }

    fn matches_order_by(&self, document: &Document) -> bool {
        self.explicit_order_by.iter().all(|order| {
            order.field().is_key_field() || document.field(order.field()).is_some()
        })
    }

    fn matches_bounds(&self, document: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Result ordering for this query; always total thanks to the key
    /// tie-break.
    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &Document, right: &Document| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeMap;

    fn doc(path: &str, fields: &[(&str, FirestoreValue)]) -> Document {
        let mut map = BTreeMap::new();
        for (key, value) in fields {
            map.insert(key.to_string(), value.clone());
        }
        Document::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            MapValue::new(map),
        )
    }

    fn field(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn collection_query_matches_direct_children_only() {
        let query = Query::collection("beverages").unwrap();
        assert!(query.matches(&doc("beverages/a", &[])));
        assert!(!query.matches(&doc("beverages/a/sips/b", &[])));
        assert!(!query.matches(&doc("bases/a", &[])));
    }

    #[test]
    fn collection_group_matches_nested_collections() {
        let query = Query::collection_group("sips");
        assert!(query.matches(&doc("beverages/a/sips/b", &[])));
        assert!(!query.matches(&doc("beverages/a", &[])));
    }

    #[test]
    fn explicit_order_by_requires_field() {
        let query = Query::collection("c")
            .unwrap()
            .order_by(field("rank"), Direction::Ascending);
        assert!(!query.matches(&doc("c/a", &[])));
        assert!(query.matches(&doc("c/a", &[("rank", FirestoreValue::from_integer(1))])));
    }

    #[test]
    fn normalized_order_by_appends_inequality_and_key() {
        let query = Query::collection("c")
            .unwrap()
            .where_field("size", FilterOperator::GreaterThan, FirestoreValue::from_integer(1))
            .unwrap();
        let order = query.normalized_order_by();
        assert_eq!(order.len(), 2);
        assert_eq!(order[0].field(), &field("size"));
        assert!(order[1].field().is_key_field());
    }

    #[test]
    fn limit_to_last_flips_target_ordering() {
        let query = Query::collection("c")
            .unwrap()
            .order_by(field("rank"), Direction::Ascending)
            .limit_to_last(2)
            .unwrap();
        let target = query.to_target();
        assert!(target
            .order_by
            .iter()
            .all(|order| order.direction() == Direction::Descending));
        assert_ne!(
            query.canonical_id(),
            Query::collection("c")
                .unwrap()
                .order_by(field("rank"), Direction::Ascending)
                .limit_to_first(2)
                .unwrap()
                .canonical_id()
        );
    }

    #[test]
    fn comparator_breaks_ties_by_key() {
        let query = Query::collection("c")
            .unwrap()
            .order_by(field("rank"), Direction::Descending);
        let compare = query.comparator();
        let a = doc("c/a", &[("rank", FirestoreValue::from_integer(1))]);
        let b = doc("c/b", &[("rank", FirestoreValue::from_integer(1))]);
        let c = doc("c/c", &[("rank", FirestoreValue::from_integer(2))]);
        assert_eq!(compare(&c, &a), Ordering::Less);
        assert_eq!(compare(&a, &b), Ordering::Greater);
    }
}
