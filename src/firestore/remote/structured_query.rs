use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{
    Bound, CompositeOperator, Direction, FieldFilter, Filter, FilterOperator, OrderBy, Target,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, ResourcePath};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::FirestoreValue;

/// Encodes the `documents` or `query` member of a listen `Target`.
pub fn encode_target(serializer: &JsonProtoSerializer, target: &Target) -> JsonValue {
    if target.is_document_target() {
        return json!({
            "documents": { "documents": [serializer.resource_name(&target.path)] }
        });
    }

    let (parent, collection_id, all_descendants) = match &target.collection_group {
        Some(group) => (target.path.clone(), group.clone(), true),
        None => (
            target.path.without_last(),
            target.path.last_segment().unwrap_or_default().to_string(),
            false,
        ),
    };

    let mut structured = serde_json::Map::new();
    structured.insert(
        "from".into(),
        json!([{ "collectionId": collection_id, "allDescendants": all_descendants }]),
    );
    if !target.filters.is_empty() {
        let filter = if target.filters.len() == 1 {
            encode_filter(serializer, &target.filters[0])
        } else {
            encode_composite(serializer, CompositeOperator::And, &target.filters)
        };
        structured.insert("where".into(), filter);
    }
    if !target.order_by.is_empty() {
        let orders: Vec<JsonValue> = target
            .order_by
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field().canonical_string() },
                    "direction": match order.direction() {
                        Direction::Ascending => "ASCENDING",
                        Direction::Descending => "DESCENDING",
                    },
                })
            })
            .collect();
        structured.insert("orderBy".into(), JsonValue::Array(orders));
    }
    if let Some(limit) = target.limit {
        structured.insert("limit".into(), json!(limit));
    }
    if let Some(bound) = &target.start_at {
        structured.insert("startAt".into(), encode_cursor(serializer, bound, true));
    }
    if let Some(bound) = &target.end_at {
        structured.insert("endAt".into(), encode_cursor(serializer, bound, false));
    }

    json!({
        "query": {
            "parent": serializer.resource_name(&parent),
            "structuredQuery": structured,
        }
    })
}

/// Inverse of [`encode_target`]. Accepts the listen `Target` message (or
/// just its `documents`/`query` member).
pub fn decode_target(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Target> {
    if let Some(documents) = value.get("documents") {
        let names = documents
            .get("documents")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("documents target has no names"))?;
        if names.len() != 1 {
            return Err(invalid_argument(format!(
                "documents target must name exactly one document, got {}",
                names.len()
            )));
        }
        let name = names[0]
            .as_str()
            .ok_or_else(|| invalid_argument("document name must be a string"))?;
        let key = serializer.document_key_from_name(name)?;
        return Ok(Target::for_document(&key));
    }

    let query = value
        .get("query")
        .ok_or_else(|| invalid_argument("target has neither documents nor query"))?;
    let parent = query
        .get("parent")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("query target has no parent"))?;
    let parent = decode_resource_path(serializer, parent)?;
    let structured = query
        .get("structuredQuery")
        .ok_or_else(|| invalid_argument("query target has no structuredQuery"))?;

    let from = structured
        .get("from")
        .and_then(JsonValue::as_array)
        .and_then(|entries| entries.first())
        .ok_or_else(|| invalid_argument("structured query has no collection selector"))?;
    let collection_id = from
        .get("collectionId")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    let all_descendants = from
        .get("allDescendants")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    let (path, collection_group) = if all_descendants {
        (parent, Some(collection_id))
    } else {
        (parent.child([collection_id]), None)
    };

    let filters = match structured.get("where") {
        Some(filter) => match decode_filter(serializer, filter)? {
            Filter::Composite {
                op: CompositeOperator::And,
                filters,
            } => filters,
            other => vec![other],
        },
        None => Vec::new(),
    };

    let mut order_by = Vec::new();
    if let Some(orders) = structured.get("orderBy").and_then(JsonValue::as_array) {
        for order in orders {
            let field = decode_field_reference(order.get("field"))?;
            let direction = match order.get("direction").and_then(JsonValue::as_str) {
                Some("DESCENDING") => Direction::Descending,
                _ => Direction::Ascending,
            };
            order_by.push(OrderBy::new(field, direction));
        }
    }

    let limit = match structured.get("limit") {
        // Either a bare number or an `Int32Value` wrapper.
        Some(JsonValue::Object(wrapper)) => wrapper.get("value").and_then(JsonValue::as_i64),
        Some(limit) => limit.as_i64(),
        None => None,
    }
    .map(|limit| limit as i32);

    let start_at = structured
        .get("startAt")
        .map(|cursor| decode_cursor(serializer, cursor, true))
        .transpose()?;
    let end_at = structured
        .get("endAt")
        .map(|cursor| decode_cursor(serializer, cursor, false))
        .transpose()?;

    Ok(Target {
        path,
        collection_group,
        filters,
        order_by,
        limit,
        start_at,
        end_at,
    })
}

fn decode_resource_path(serializer: &JsonProtoSerializer, name: &str) -> FirestoreResult<ResourcePath> {
    let documents_root = serializer.resource_name(&ResourcePath::root());
    if name == documents_root {
        return Ok(ResourcePath::root());
    }
    let relative = name
        .strip_prefix(&documents_root)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| invalid_argument(format!("resource name {name} is outside this database")))?;
    ResourcePath::from_string(relative)
}

fn encode_filter(serializer: &JsonProtoSerializer, filter: &Filter) -> JsonValue {
    match filter {
        Filter::Field(filter) => encode_field_filter(serializer, filter),
        Filter::Composite { op, filters } => encode_composite(serializer, *op, filters),
    }
}

fn encode_composite(
    serializer: &JsonProtoSerializer,
    op: CompositeOperator,
    filters: &[Filter],
) -> JsonValue {
    let nested: Vec<JsonValue> = filters
        .iter()
        .map(|filter| encode_filter(serializer, filter))
        .collect();
    json!({
        "compositeFilter": {
            "op": match op {
                CompositeOperator::And => "AND",
                CompositeOperator::Or => "OR",
            },
            "filters": nested,
        }
    })
}

fn encode_field_filter(serializer: &JsonProtoSerializer, filter: &FieldFilter) -> JsonValue {
    let field = json!({ "fieldPath": filter.field().canonical_string() });
    let unary = match filter.op() {
        FilterOperator::Equal if filter.value().is_nan() => Some("IS_NAN"),
        FilterOperator::Equal if filter.value().is_null() => Some("IS_NULL"),
        FilterOperator::NotEqual if filter.value().is_nan() => Some("IS_NOT_NAN"),
        FilterOperator::NotEqual if filter.value().is_null() => Some("IS_NOT_NULL"),
        _ => None,
    };
    if let Some(op) = unary {
        return json!({ "unaryFilter": { "op": op, "field": field } });
    }
    json!({
        "fieldFilter": {
            "field": field,
            "op": operator_name(filter.op()),
            "value": serializer.encode_value(filter.value()),
        }
    })
}

fn decode_filter(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Filter> {
    if let Some(composite) = value.get("compositeFilter") {
        let op = match composite.get("op").and_then(JsonValue::as_str) {
            Some("OR") => CompositeOperator::Or,
            _ => CompositeOperator::And,
        };
        let filters = composite
            .get("filters")
            .and_then(JsonValue::as_array)
            .map(|filters| {
                filters
                    .iter()
                    .map(|filter| decode_filter(serializer, filter))
                    .collect::<FirestoreResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        return Ok(Filter::Composite { op, filters });
    }

    if let Some(unary) = value.get("unaryFilter") {
        let field = decode_field_reference(unary.get("field"))?;
        let (op, value) = match unary.get("op").and_then(JsonValue::as_str) {
            Some("IS_NAN") => (FilterOperator::Equal, FirestoreValue::from_double(f64::NAN)),
            Some("IS_NULL") => (FilterOperator::Equal, FirestoreValue::null()),
            Some("IS_NOT_NAN") => (FilterOperator::NotEqual, FirestoreValue::from_double(f64::NAN)),
            Some("IS_NOT_NULL") => (FilterOperator::NotEqual, FirestoreValue::null()),
            other => {
                return Err(invalid_argument(format!("unknown unary filter {other:?}")));
            }
        };
        return Ok(Filter::field(field, op, value));
    }

    let field_filter = value
        .get("fieldFilter")
        .ok_or_else(|| invalid_argument("unknown filter type"))?;
    let field = decode_field_reference(field_filter.get("field"))?;
    let op = field_filter
        .get("op")
        .and_then(JsonValue::as_str)
        .and_then(operator_from_name)
        .ok_or_else(|| invalid_argument("unknown field filter operator"))?;
    let value = field_filter
        .get("value")
        .map(|value| serializer.decode_value(value))
        .transpose()?
        .unwrap_or_else(FirestoreValue::null);
    Ok(Filter::field(field, op, value))
}

fn decode_field_reference(value: Option<&JsonValue>) -> FirestoreResult<FieldPath> {
    let path = value
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("field reference has no fieldPath"))?;
    FieldPath::from_dot_separated(path)
}

fn encode_cursor(serializer: &JsonProtoSerializer, bound: &Bound, start: bool) -> JsonValue {
    let values: Vec<JsonValue> = bound
        .position()
        .iter()
        .map(|value| serializer.encode_value(value))
        .collect();
    // `before` positions the cursor ahead of the values: inclusive for a
    // start bound, exclusive for an end bound.
    let before = if start {
        bound.inclusive()
    } else {
        !bound.inclusive()
    };
    json!({ "values": values, "before": before })
}

fn decode_cursor(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    start: bool,
) -> FirestoreResult<Bound> {
    let position = value
        .get("values")
        .and_then(JsonValue::as_array)
        .map(|values| {
            values
                .iter()
                .map(|value| serializer.decode_value(value))
                .collect::<FirestoreResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    let before = value.get("before").and_then(JsonValue::as_bool).unwrap_or(false);
    let inclusive = if start { before } else { !before };
    Ok(Bound::new(position, inclusive))
}

fn operator_name(op: FilterOperator) -> &'static str {
    match op {
        FilterOperator::LessThan => "LESS_THAN",
        FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        FilterOperator::Equal => "EQUAL",
        FilterOperator::NotEqual => "NOT_EQUAL",
        FilterOperator::GreaterThan => "GREATER_THAN",
        FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        FilterOperator::ArrayContains => "ARRAY_CONTAINS",
        FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        FilterOperator::In => "IN",
        FilterOperator::NotIn => "NOT_IN",
    }
}

fn operator_from_name(name: &str) -> Option<FilterOperator> {
    Some(match name {
        "LESS_THAN" => FilterOperator::LessThan,
        "LESS_THAN_OR_EQUAL" => FilterOperator::LessThanOrEqual,
        "EQUAL" => FilterOperator::Equal,
        "NOT_EQUAL" => FilterOperator::NotEqual,
        "GREATER_THAN" => FilterOperator::GreaterThan,
        "GREATER_THAN_OR_EQUAL" => FilterOperator::GreaterThanOrEqual,
        "ARRAY_CONTAINS" => FilterOperator::ArrayContains,
        "ARRAY_CONTAINS_ANY" => FilterOperator::ArrayContainsAny,
        "IN" => FilterOperator::In,
        "NOT_IN" => FilterOperator::NotIn,
        _ => return None,
    })
}

/// Document key named by a documents target, if `target` is one.
pub(crate) fn document_target_key(target: &Target) -> Option<DocumentKey> {
    if target.is_document_target() {
        DocumentKey::from_path(target.path.clone()).ok()
    } else {
        None
    }
}
