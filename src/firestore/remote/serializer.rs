use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldTransform, GeoPoint, Mutation, MutationKind, MutationResult,
    MutableDocument, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Converts between model types and the JSON mapping of the Firestore v1
/// protos.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    fn documents_prefix(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// Fully qualified name of a collection or document path. The root maps
    /// to the `documents` parent itself.
    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_prefix()
        } else {
            format!("{}/{}", self.documents_prefix(), path.canonical_string())
        }
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let prefix = self.documents_prefix();
        let relative = name
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                invalid_argument(format!(
                    "Document name '{name}' does not belong to database {}",
                    self.database_name()
                ))
            })?;
        DocumentKey::from_string(relative)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_fields(&self, map: &MapValue) -> JsonValue {
        encode_map_fields(map)
    }

    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        decode_map_value(value)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> JsonValue {
        JsonValue::String(encode_timestamp(&version.timestamp()))
    }

    pub fn decode_version(&self, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
        let text = value
            .as_str()
            .ok_or_else(|| invalid_argument("timestamp must be an RFC 3339 string"))?;
        Ok(SnapshotVersion::new(parse_timestamp(text)?))
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> JsonValue {
        JsonValue::String(BASE64_STANDARD.encode(bytes))
    }

    pub fn decode_bytes(&self, value: &JsonValue) -> FirestoreResult<Vec<u8>> {
        let text = value
            .as_str()
            .ok_or_else(|| invalid_argument("bytes must be a base64 string"))?;
        BASE64_STANDARD
            .decode(text)
            .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}")))
    }

    /// Decodes a `Document` message into a found document.
    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("document is missing 'name'"))?;
        let key = self.document_key_from_name(name)?;
        let version = match value.get("updateTime") {
            Some(update_time) => self.decode_version(update_time)?,
            None => return Err(invalid_argument("document is missing 'updateTime'")),
        };
        let data = decode_map_value(value)?;
        Ok(MutableDocument::new_found_document(key, version, data))
    }

    pub fn encode_document(&self, document: &MutableDocument) -> JsonValue {
        json!({
            "name": self.document_name(document.key()),
            "fields": encode_map_fields(document.data()),
            "updateTime": self.encode_version(document.version()),
        })
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        let name = self.document_name(mutation.key());
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert("update".into(), json!({ "name": name, "fields": encode_map_fields(value) }));
            }
            MutationKind::Patch { value, mask } => {
                write.insert("update".into(), json!({ "name": name, "fields": encode_map_fields(value) }));
                let paths: Vec<String> = mask.fields().map(|path| path.canonical_string()).collect();
                write.insert("updateMask".into(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert("delete".into(), JsonValue::String(name));
            }
            MutationKind::Verify => {
                write.insert("verify".into(), JsonValue::String(name));
            }
        }
        if !mutation.field_transforms().is_empty() {
            let transforms = mutation
                .field_transforms()
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".into(), JsonValue::Array(transforms));
        }
        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".into(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".into(),
                    json!({ "updateTime": self.encode_version(*version) }),
                );
            }
        }
        JsonValue::Object(write)
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field().canonical_string();
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand)
            }),
        }
    }

    /// Decodes one `WriteResult`. Deletes come back without an update time
    /// and take the commit version instead.
    pub fn decode_write_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let version = match value.get("updateTime") {
            Some(update_time) if !update_time.is_null() => self.decode_version(update_time)?,
            _ => commit_version,
        };
        let transform_results = match value.get("transformResults").and_then(JsonValue::as_array) {
            Some(results) => results
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(MutationResult {
            version,
            transform_results,
        })
    }
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => {
            if double.is_finite() {
                json!({ "doubleValue": double })
            } else {
                // JSON numbers cannot carry NaN or infinities.
                json!({ "doubleValue": double.to_string() })
            }
        }
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => {
            json!({ "bytesValue": BASE64_STANDARD.encode(bytes.as_slice()) })
        }
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::new(BTreeMap::new())),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(timestamp_str)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BASE64_STANDARD
            .decode(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(BytesValue::new(decoded)));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(FirestoreValue::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    match Utc
        .timestamp_opt(timestamp.seconds, timestamp.nanos.max(0) as u32)
        .single()
    {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => "1970-01-01T00:00:00.000000000Z".to_string(),
    }
}

fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}
