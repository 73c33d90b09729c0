use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::value_util::{array_contains, canonical_id, type_order};
use crate::firestore::value::{compare_values, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &Document) -> bool {
        let key_value;
        let other = if self.field.is_key_field() {
            key_value = key_reference(document.key());
            Some(&key_value)
        } else {
            document.field(&self.field)
        };

        match self.op {
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .is_some_and(|values| array_contains(values, &self.value)),
            FilterOperator::ArrayContainsAny => {
                let (Some(values), Some(needles)) =
                    (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                needles.iter().any(|needle| array_contains(values, needle))
            }
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => array_contains(candidates, other),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if array_contains(candidates, &FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(other) => !other.is_null() && !array_contains(candidates, other),
                    None => false,
                }
            }
            FilterOperator::NotEqual => match other {
                Some(other) => {
                    !other.is_null()
                        && self
                            .op
                            .matches_comparison(compare_values(other, &self.value))
                }
                None => false,
            },
            _ => match other {
                Some(other) => {
                    type_order(other) == type_order(&self.value)
                        && self
                            .op
                            .matches_comparison(compare_values(other, &self.value))
                }
                None => false,
            },
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_id(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite {
        op: CompositeOperator,
        filters: Vec<Filter>,
    },
}

impl Filter {
    pub fn field(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> Self {
        Filter::Field(FieldFilter::new(field, op, value))
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::And,
            filters,
        }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::Or,
            filters,
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite {
                op: CompositeOperator::And,
                filters,
            } => filters.iter().all(|filter| filter.matches(document)),
            Filter::Composite {
                op: CompositeOperator::Or,
                filters,
            } => filters.iter().any(|filter| filter.matches(document)),
        }
    }

    /// Every field filter nested in this filter, depth first.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite { filters, .. } => {
                filters.iter().flat_map(Filter::flattened).collect()
            }
        }
    }

    fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite { op, filters } => {
                let prefix = match op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                let inner: Vec<String> = filters.iter().map(Filter::canonical_id).collect();
                format!("{prefix}({})", inner.join(","))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn flipped(&self) -> Self {
        let direction = match self.direction {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        };
        Self::new(self.field.clone(), direction)
    }

    /// Compares two documents on this ordering. Missing fields sort as null.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            let null = FirestoreValue::null();
            let left_value = left.field(&self.field).unwrap_or(&null);
            let right_value = right.field(&self.field).unwrap_or(&null);
            compare_values(left_value, right_value)
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        let suffix = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), suffix)
    }
}

/// Cursor position. Key components are reference values holding the
/// document path.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &Document) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                match component.kind() {
                    ValueKind::Reference(path) => match DocumentKey::from_string(path) {
                        Ok(key) => key.cmp(document.key()),
                        Err(_) => Ordering::Equal,
                    },
                    _ => Ordering::Equal,
                }
            } else {
                let null = FirestoreValue::null();
                compare_values(component, document.field(&order.field).unwrap_or(&null))
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Whether the bound sorts before (or at, if inclusive) the document.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    fn canonical_id(&self) -> String {
        let prefix = if self.inclusive { "b:" } else { "a:" };
        let values: Vec<String> = self.position.iter().map(canonical_id).collect();
        format!("{prefix}{}", values.join(","))
    }
}

/// Reference value used when the document key takes part in comparisons.
pub fn key_reference(key: &DocumentKey) -> FirestoreValue {
    FirestoreValue::from_reference(key.path().canonical_string())
}

/// What the server is asked to watch: a normalized query with a total order.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<i32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Single document listen used by limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn field_filters(&self) -> Vec<&FieldFilter> {
        self.filters.iter().flat_map(Filter::flattened).collect()
    }

    /// Stable string identity. Equal targets share the same canonical id.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
        }
        if let Some(bound) = &self.start_at {
            let _ = write!(id, "|lb:{}", bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            let _ = write!(id, "|ub:{}", bound.canonical_id());
        }
        id
    }
}
