use std::sync::Arc;

mod streaming;

pub use streaming::{StreamingDatastoreImpl, StreamingHandleImpl};

use crate::firestore::error::FirestoreResult;
use crate::firestore::remote::stream::StreamHeaders;

pub const LISTEN_METHOD: &str = "google.firestore.v1.Firestore/Listen";
pub const WRITE_METHOD: &str = "google.firestore.v1.Firestore/Write";

#[cfg(target_arch = "wasm32")]
pub type StreamingFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type StreamingFuture<'a, T> = futures::future::BoxFuture<'a, T>;

/// One open bidirectional RPC stream carrying JSON encoded messages.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Next message. `None` once the server ended the stream without error.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the two streaming RPCs the remote store drives.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_stream(
        &self,
        method: &'static str,
        headers: StreamHeaders,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}
