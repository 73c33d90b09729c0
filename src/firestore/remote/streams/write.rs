use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::remote_syncer::RemoteStoreEventSink;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, StreamKind, StreamState};
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffSettings;

/// One decoded `WriteResponse`. The handshake response has no results.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

/// A decoded `WriteRequest`, as seen by the backend. `writes` stay in their
/// JSON form.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub database: Option<String>,
    pub stream_token: Vec<u8>,
    pub writes: Vec<JsonValue>,
}

impl WriteRequest {
    pub fn is_handshake(&self) -> bool {
        self.database.is_some() && self.writes.is_empty() && self.stream_token.is_empty()
    }
}

pub fn encode_handshake(serializer: &JsonProtoSerializer) -> JsonValue {
    json!({ "database": serializer.database_name() })
}

pub fn encode_write_request(
    serializer: &JsonProtoSerializer,
    stream_token: &[u8],
    mutations: &[Mutation],
) -> JsonValue {
    let writes: Vec<JsonValue> = mutations
        .iter()
        .map(|mutation| serializer.encode_mutation(mutation))
        .collect();
    json!({
        "streamToken": serializer.encode_bytes(stream_token),
        "writes": writes,
    })
}

pub fn decode_write_request(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WriteRequest> {
    Ok(WriteRequest {
        database: value
            .get("database")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        stream_token: value
            .get("streamToken")
            .map(|token| serializer.decode_bytes(token))
            .transpose()?
            .unwrap_or_default(),
        writes: value
            .get("writes")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default(),
    })
}

pub fn encode_write_response(serializer: &JsonProtoSerializer, response: &WriteResponse) -> JsonValue {
    let results: Vec<JsonValue> = response
        .mutation_results
        .iter()
        .map(|result| {
            let transforms: Vec<JsonValue> = result
                .transform_results
                .iter()
                .map(|value| serializer.encode_value(value))
                .collect();
            json!({
                "updateTime": serializer.encode_version(result.version),
                "transformResults": transforms,
            })
        })
        .collect();
    json!({
        "streamToken": serializer.encode_bytes(&response.stream_token),
        "commitTime": serializer.encode_version(response.commit_version),
        "writeResults": results,
    })
}

pub fn decode_write_response(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WriteResponse> {
    let stream_token = value
        .get("streamToken")
        .map(|token| serializer.decode_bytes(token))
        .transpose()?
        .unwrap_or_default();
    let commit_version = match value.get("commitTime") {
        Some(time) if !time.is_null() => serializer.decode_version(time)?,
        _ => SnapshotVersion::min(),
    };
    let mutation_results = value
        .get("writeResults")
        .and_then(JsonValue::as_array)
        .map(|results| {
            results
                .iter()
                .map(|result| serializer.decode_write_result(result, commit_version))
                .collect::<FirestoreResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    Ok(WriteResponse {
        stream_token,
        commit_version,
        mutation_results,
    })
}

/// The `Write` RPC on top of a [`PersistentStream`].
///
/// Every connection starts with a handshake. Its response carries the
/// stream token that later write requests echo back.
pub struct WriteStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

impl WriteStream {
    pub fn new(
        network: NetworkLayer,
        queue: AsyncQueue,
        sink: Arc<dyn RemoteStoreEventSink>,
        backoff: BackoffSettings,
        serializer: JsonProtoSerializer,
    ) -> Self {
        Self {
            stream: PersistentStream::new(StreamKind::Write, network, queue, sink, backoff),
            serializer,
            handshake_complete: false,
            last_stream_token: Vec::new(),
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

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    /// Token restored from the local store before the first connection.
    pub fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.last_stream_token = token;
    }

    pub fn start(&mut self) {
        self.handshake_complete = false;
        self.stream.start();
    }

    pub async fn stop(&mut self) {
        self.handshake_complete = false;
        self.stream.stop().await;
    }

    pub fn mark_idle(&mut self) {
        self.stream.mark_idle();
    }

    /// Handles the transport ending the stream. Returns whether the
    /// handshake had completed on the closed connection.
    pub async fn handle_close(&mut self, error: Option<&FirestoreError>) -> bool {
        let handshake_complete = std::mem::replace(&mut self.handshake_complete, false);
        self.stream.handle_close(error).await;
        handshake_complete
    }

    pub fn inhibit_backoff(&mut self) {
        self.stream.inhibit_backoff();
    }

    pub async fn write_handshake(&mut self) -> FirestoreResult<()> {
        debug_assert!(!self.handshake_complete, "handshake already completed");
        let request = encode_handshake(&self.serializer);
        self.stream.send(request.to_string().into_bytes()).await
    }

    pub async fn write_mutations(&mut self, mutations: &[Mutation]) -> FirestoreResult<()> {
        if !self.handshake_complete {
            return Err(invalid_argument(
                "write stream handshake must complete before writing mutations",
            ));
        }
        let request = encode_write_request(&self.serializer, &self.last_stream_token, mutations);
        self.stream.send(request.to_string().into_bytes()).await
    }

    /// Decodes a response and records its stream token. The first response
    /// on a connection completes the handshake.
    pub fn handle_response(&mut self, payload: &[u8]) -> FirestoreResult<WriteResponse> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| invalid_argument(format!("malformed write response: {err}")))?;
        let response = decode_write_response(&self.serializer, &value)?;
        self.last_stream_token = response.stream_token.clone();
        if !self.handshake_complete {
            self.handshake_complete = true;
        } else {
            // A write response, so the connection is healthy.
            self.stream.handle_message();
        }
        Ok(response)
    }
}
