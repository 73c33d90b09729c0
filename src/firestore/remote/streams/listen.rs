use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{Target, TargetId};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::SnapshotVersion;
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::remote_syncer::RemoteStoreEventSink;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, StreamKind, StreamState};
use crate::firestore::remote::structured_query::{decode_target, encode_target};
use crate::firestore::remote::watch_change::{decode_watch_change, WatchChange};
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffSettings;

/// Label key the backend uses to tag why a target is listened to.
pub const LISTEN_TAGS_LABEL: &str = "goog-listen-tags";

/// A decoded `ListenRequest`, as seen by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenRequest {
    AddTarget {
        target_id: TargetId,
        target: Target,
        resume_token: Vec<u8>,
        read_time: Option<SnapshotVersion>,
        expected_count: Option<i32>,
        labels: BTreeMap<String, String>,
    },
    RemoveTarget(TargetId),
}

pub fn encode_watch_request(serializer: &JsonProtoSerializer, target_data: &TargetData) -> JsonValue {
    let mut target = match encode_target(serializer, &target_data.target) {
        JsonValue::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    target.insert("targetId".into(), json!(target_data.target_id));
    if !target_data.resume_token.is_empty() {
        target.insert(
            "resumeToken".into(),
            serializer.encode_bytes(&target_data.resume_token),
        );
    } else if !target_data.snapshot_version.is_min() {
        target.insert(
            "readTime".into(),
            serializer.encode_version(target_data.snapshot_version),
        );
    }
    if let Some(expected_count) = target_data.expected_count {
        target.insert("expectedCount".into(), json!(expected_count));
    }

    let mut request = serde_json::Map::new();
    request.insert("database".into(), json!(serializer.database_name()));
    request.insert("addTarget".into(), JsonValue::Object(target));
    if let Some(tag) = target_data.purpose.listen_tag() {
        request.insert("labels".into(), json!({ LISTEN_TAGS_LABEL: tag }));
    }
    JsonValue::Object(request)
}

pub fn encode_unwatch_request(serializer: &JsonProtoSerializer, target_id: TargetId) -> JsonValue {
    json!({
        "database": serializer.database_name(),
        "removeTarget": target_id,
    })
}

pub fn decode_listen_request(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<ListenRequest> {
    if let Some(target_id) = value.get("removeTarget").and_then(JsonValue::as_i64) {
        return Ok(ListenRequest::RemoveTarget(target_id as TargetId));
    }
    let add = value
        .get("addTarget")
        .ok_or_else(|| invalid_argument("listen request has neither addTarget nor removeTarget"))?;
    let target_id = add
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("addTarget is missing targetId"))? as TargetId;
    let resume_token = add
        .get("resumeToken")
        .map(|token| serializer.decode_bytes(token))
        .transpose()?
        .unwrap_or_default();
    let read_time = add
        .get("readTime")
        .map(|time| serializer.decode_version(time))
        .transpose()?;
    let expected_count = add
        .get("expectedCount")
        .and_then(JsonValue::as_i64)
        .map(|count| count as i32);
    let labels = value
        .get("labels")
        .and_then(JsonValue::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|value| (key.clone(), value.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Ok(ListenRequest::AddTarget {
        target_id,
        target: decode_target(serializer, add)?,
        resume_token,
        read_time,
        expected_count,
        labels,
    })
}

/// The `Listen` RPC: sends target requests and decodes watch changes on
/// top of a [`PersistentStream`].
pub struct WatchStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
}

impl WatchStream {
    pub fn new(
        network: NetworkLayer,
        queue: AsyncQueue,
        sink: Arc<dyn RemoteStoreEventSink>,
        backoff: BackoffSettings,
        serializer: JsonProtoSerializer,
    ) -> Self {
        Self {
            stream: PersistentStream::new(StreamKind::Listen, network, queue, sink, backoff),
            serializer,
        }
    }

    pub fn stream(&self) -> &PersistentStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut PersistentStream {
        &mut self.stream
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn start(&mut self) {
        self.stream.start();
    }

    pub async fn stop(&mut self) {
        self.stream.stop().await;
    }

    pub fn mark_idle(&mut self) {
        self.stream.mark_idle();
    }

    pub async fn watch(&mut self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = encode_watch_request(&self.serializer, target_data);
        log::debug!("watch stream: watching target {}", target_data.target_id);
        self.stream.send(request.to_string().into_bytes()).await
    }

    pub async fn unwatch(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        let request = encode_unwatch_request(&self.serializer, target_id);
        log::debug!("watch stream: unwatching target {target_id}");
        self.stream.send(request.to_string().into_bytes()).await
    }

    pub fn decode_message(&self, payload: &[u8]) -> FirestoreResult<WatchChange> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| invalid_argument(format!("malformed listen response: {err}")))?;
        decode_watch_change(&self.serializer, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::{DatabaseId, Timestamp};
    use crate::firestore::value::FirestoreValue;
    use crate::firestore::core::FilterOperator;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("p"))
    }

    fn target_data(purpose: TargetPurpose) -> TargetData {
        let target = Query::collection("beverages")
            .unwrap()
            .where_field("uid", FilterOperator::Equal, FirestoreValue::from_string("u1"))
            .unwrap()
            .to_target();
        TargetData::new(target, 2, purpose, 1)
    }

    #[test]
    fn resumed_watch_carries_token_and_expected_count() {
        let data = target_data(TargetPurpose::Listen)
            .with_resume_token(b"resume".to_vec(), SnapshotVersion::new(Timestamp::new(5, 0)))
            .with_expected_count(3);
        let request = encode_watch_request(&serializer(), &data);
        assert_eq!(request["database"], json!("projects/p/databases/(default)"));
        assert!(request.get("labels").is_none());

        let decoded = decode_listen_request(&serializer(), &request).unwrap();
        let ListenRequest::AddTarget {
            target_id,
            target,
            resume_token,
            read_time,
            expected_count,
            ..
        } = decoded
        else {
            panic!("expected addTarget");
        };
        assert_eq!(target_id, 2);
        assert_eq!(target, data.target);
        assert_eq!(resume_token, b"resume".to_vec());
        assert_eq!(read_time, None);
        assert_eq!(expected_count, Some(3));
    }

    #[test]
    fn non_listen_purposes_are_labelled() {
        let request = encode_watch_request(
            &serializer(),
            &target_data(TargetPurpose::ExistenceFilterMismatchBloom),
        );
        assert_eq!(
            request["labels"][LISTEN_TAGS_LABEL],
            json!("existence-filter-mismatch-bloom")
        );
    }

    #[test]
    fn unwatch_decodes_to_remove_target() {
        let request = encode_unwatch_request(&serializer(), 4);
        assert_eq!(
            decode_listen_request(&serializer(), &request).unwrap(),
            ListenRequest::RemoveTarget(4)
        );
    }
}
