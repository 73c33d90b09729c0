use serde_json::{json, Value as JsonValue};

use crate::firestore::core::TargetId;
use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::rpc_error::{decode_status, encode_status};
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded `ListenResponse`.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

impl WatchTargetChangeState {
    fn from_wire(value: &str) -> Self {
        match value {
            "ADD" => Self::Added,
            "REMOVE" => Self::Removed,
            "CURRENT" => Self::Current,
            "RESET" => Self::Reset,
            _ => Self::NoChange,
        }
    }

    fn as_wire(&self) -> &'static str {
        match self {
            Self::NoChange => "NO_CHANGE",
            Self::Added => "ADD",
            Self::Removed => "REMOVE",
            Self::Current => "CURRENT",
            Self::Reset => "RESET",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means the change applies to every target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    /// Only set on a global `NoChange`: everything before it is consistent
    /// as of this version.
    pub read_time: Option<SnapshotVersion>,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: None,
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = Some(read_time);
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }

    /// A global no-change that marks a consistent point.
    pub fn consistent_snapshot_version(&self) -> Option<SnapshotVersion> {
        match (self.state, self.target_ids.is_empty(), self.read_time) {
            (WatchTargetChangeState::NoChange, true, Some(read_time)) => Some(read_time),
            _ => None,
        }
    }
}

/// A document entering, changing, or leaving targets.
///
/// `new_document` is a found document for `documentChange`, a no-document
/// for `documentDelete` and `None` for `documentRemove`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_document: Option<MutableDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilterPayload>,
}

/// Raw bloom filter fields as sent by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilterPayload {
    pub bitmap: Vec<u8>,
    pub padding: u8,
    pub hash_count: u32,
}

impl BloomFilterPayload {
    pub fn from_filter(filter: &BloomFilter) -> Self {
        Self {
            bitmap: filter.bitmap().to_vec(),
            padding: filter.padding(),
            hash_count: filter.hash_count(),
        }
    }

    pub fn to_filter(&self) -> FirestoreResult<BloomFilter> {
        BloomFilter::new(self.bitmap.clone(), self.padding, self.hash_count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub existence_filter: ExistenceFilter,
}

fn target_ids(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|id| id as TargetId))
                .collect()
        })
        .unwrap_or_default()
}

fn document_name<'a>(value: &'a JsonValue, field: &str) -> FirestoreResult<&'a str> {
    value
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("watch change is missing '{field}'")))
}

fn read_time(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<SnapshotVersion> {
    match value.get("readTime") {
        Some(read_time) => serializer.decode_version(read_time),
        None => Ok(SnapshotVersion::min()),
    }
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    if let Some(change) = value.get("targetChange") {
        let state = change
            .get("targetChangeType")
            .and_then(JsonValue::as_str)
            .map(WatchTargetChangeState::from_wire)
            .unwrap_or(WatchTargetChangeState::NoChange);
        let mut decoded = WatchTargetChange::new(state, target_ids(change.get("targetIds")));
        if let Some(token) = change.get("resumeToken") {
            decoded.resume_token = serializer.decode_bytes(token)?;
        }
        if decoded.target_ids.is_empty() {
            if let Some(time) = change.get("readTime") {
                decoded.read_time = Some(serializer.decode_version(time)?);
            }
        }
        decoded.cause = change.get("cause").map(decode_status);
        return Ok(WatchChange::TargetChange(decoded));
    }

    if let Some(change) = value.get("documentChange") {
        let document = change
            .get("document")
            .ok_or_else(|| invalid_argument("documentChange is missing 'document'"))?;
        let new_document = serializer.decode_document(document)?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: target_ids(change.get("targetIds")),
            removed_target_ids: target_ids(change.get("removedTargetIds")),
            key: new_document.key().clone(),
            new_document: Some(new_document),
        }));
    }

    if let Some(change) = value.get("documentDelete") {
        let key = serializer.document_key_from_name(document_name(change, "document")?)?;
        let version = read_time(serializer, change)?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: target_ids(change.get("removedTargetIds")),
            new_document: Some(MutableDocument::new_no_document(key.clone(), version)),
            key,
        }));
    }

    if let Some(change) = value.get("documentRemove") {
        let key = serializer.document_key_from_name(document_name(change, "document")?)?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: target_ids(change.get("removedTargetIds")),
            key,
            new_document: None,
        }));
    }

    if let Some(filter) = value.get("filter") {
        let target_id = filter
            .get("targetId")
            .and_then(JsonValue::as_i64)
            .unwrap_or_default() as TargetId;
        let count = filter
            .get("count")
            .and_then(JsonValue::as_i64)
            .unwrap_or_default() as i32;
        let unchanged_names = match filter.get("unchangedNames") {
            Some(names) => decode_bloom_filter(serializer, names),
            None => None,
        };
        return Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
            target_id,
            existence_filter: ExistenceFilter {
                count,
                unchanged_names,
            },
        }));
    }

    Err(invalid_argument("Unknown listen response type"))
}

/// A malformed bloom filter is dropped; the mismatch then falls back to a
/// plain reset.
fn decode_bloom_filter(serializer: &JsonProtoSerializer, value: &JsonValue) -> Option<BloomFilterPayload> {
    let bits = value.get("bits")?;
    let bitmap = match bits.get("bitmap") {
        Some(bitmap) => match serializer.decode_bytes(bitmap) {
            Ok(bitmap) => bitmap,
            Err(err) => {
                log::warn!("ignoring bloom filter with undecodable bitmap: {err}");
                return None;
            }
        },
        None => Vec::new(),
    };
    let padding = bits.get("padding").and_then(JsonValue::as_u64).unwrap_or(0);
    let hash_count = value.get("hashCount").and_then(JsonValue::as_u64).unwrap_or(0);
    Some(BloomFilterPayload {
        bitmap,
        padding: u8::try_from(padding).unwrap_or(u8::MAX),
        hash_count: u32::try_from(hash_count).unwrap_or(u32::MAX),
    })
}

/// Encodes `change` the way the backend sends it.
pub fn encode_watch_change(serializer: &JsonProtoSerializer, change: &WatchChange) -> JsonValue {
    match change {
        WatchChange::TargetChange(change) => {
            let mut body = serde_json::Map::new();
            body.insert("targetChangeType".into(), json!(change.state.as_wire()));
            body.insert("targetIds".into(), json!(change.target_ids));
            if !change.resume_token.is_empty() {
                body.insert("resumeToken".into(), serializer.encode_bytes(&change.resume_token));
            }
            if let Some(read_time) = change.read_time {
                body.insert("readTime".into(), serializer.encode_version(read_time));
            }
            if let Some(cause) = &change.cause {
                body.insert("cause".into(), encode_status(cause));
            }
            json!({ "targetChange": body })
        }
        WatchChange::Document(change) => match &change.new_document {
            Some(document) if document.is_found_document() => json!({
                "documentChange": {
                    "document": serializer.encode_document(document),
                    "targetIds": change.updated_target_ids,
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
            Some(document) => json!({
                "documentDelete": {
                    "document": serializer.document_name(&change.key),
                    "readTime": serializer.encode_version(document.version()),
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
            None => json!({
                "documentRemove": {
                    "document": serializer.document_name(&change.key),
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
        },
        WatchChange::ExistenceFilter(change) => {
            let mut filter = serde_json::Map::new();
            filter.insert("targetId".into(), json!(change.target_id));
            filter.insert("count".into(), json!(change.existence_filter.count));
            if let Some(bloom) = &change.existence_filter.unchanged_names {
                filter.insert(
                    "unchangedNames".into(),
                    json!({
                        "bits": {
                            "bitmap": serializer.encode_bytes(&bloom.bitmap),
                            "padding": bloom.padding,
                        },
                        "hashCount": bloom.hash_count,
                    }),
                );
            }
            json!({ "filter": filter })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{DatabaseId, Timestamp};

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("p"))
    }

    #[test]
    fn decodes_target_change_with_cause() {
        let change = decode_watch_change(
            &serializer(),
            &json!({
                "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [2],
                    "cause": { "code": 7, "message": "denied" }
                }
            }),
        )
        .unwrap();
        let WatchChange::TargetChange(change) = change else {
            panic!("expected target change");
        };
        assert_eq!(change.state, WatchTargetChangeState::Removed);
        assert_eq!(change.target_ids, vec![2]);
        assert_eq!(change.cause.unwrap().code, FirestoreErrorCode::PermissionDenied);
    }

    #[test]
    fn read_time_only_counts_for_global_no_change() {
        let global = decode_watch_change(
            &serializer(),
            &json!({ "targetChange": { "readTime": "1970-01-01T00:00:03Z" } }),
        )
        .unwrap();
        let WatchChange::TargetChange(global) = global else {
            panic!("expected target change");
        };
        assert_eq!(
            global.consistent_snapshot_version(),
            Some(SnapshotVersion::new(Timestamp::new(3, 0)))
        );

        let targeted = decode_watch_change(
            &serializer(),
            &json!({ "targetChange": { "targetIds": [4], "readTime": "1970-01-01T00:00:03Z" } }),
        )
        .unwrap();
        let WatchChange::TargetChange(targeted) = targeted else {
            panic!("expected target change");
        };
        assert_eq!(targeted.consistent_snapshot_version(), None);
    }

    #[test]
    fn document_delete_becomes_no_document_at_read_time() {
        let change = decode_watch_change(
            &serializer(),
            &json!({
                "documentDelete": {
                    "document": "projects/p/databases/(default)/documents/beverages/b1",
                    "readTime": "1970-01-01T00:00:09Z",
                    "removedTargetIds": [2]
                }
            }),
        )
        .unwrap();
        let WatchChange::Document(change) = change else {
            panic!("expected document change");
        };
        let document = change.new_document.unwrap();
        assert!(document.is_no_document());
        assert_eq!(document.version(), SnapshotVersion::new(Timestamp::new(9, 0)));
        assert_eq!(change.removed_target_ids, vec![2]);
    }

    #[test]
    fn existence_filter_carries_bloom_filter() {
        let mut bloom = BloomFilter::with_false_positive_rate(3, 0.01).unwrap();
        bloom.insert("projects/p/databases/(default)/documents/beverages/a");
        let change = WatchChange::ExistenceFilter(ExistenceFilterChange {
            target_id: 2,
            existence_filter: ExistenceFilter {
                count: 1,
                unchanged_names: Some(BloomFilterPayload::from_filter(&bloom)),
            },
        });
        let serializer = serializer();
        let decoded =
            decode_watch_change(&serializer, &encode_watch_change(&serializer, &change)).unwrap();
        assert_eq!(decoded, change);
    }

    #[test]
    fn unknown_messages_are_rejected() {
        assert!(decode_watch_change(&serializer(), &json!({ "other": {} })).is_err());
    }
}
