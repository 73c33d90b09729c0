use std::sync::Arc;

use super::{StreamHandle, StreamingDatastore, StreamingFuture};
use crate::firestore::error::FirestoreResult;
use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamHeaders};

use futures::FutureExt;

#[cfg(target_arch = "wasm32")]
fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Datastore backed by a [`MultiplexedConnection`]; every RPC is a logical
/// stream on the shared connection.
pub struct StreamingDatastoreImpl {
    connection: Arc<MultiplexedConnection>,
}

impl StreamingDatastoreImpl {
    pub fn new(connection: Arc<MultiplexedConnection>) -> Self {
        Self { connection }
    }
}

impl StreamingDatastore for StreamingDatastoreImpl {
    fn open_stream(
        &self,
        method: &'static str,
        headers: StreamHeaders,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        box_stream_future(async move {
            let stream = connection.open_stream(method, headers).await?;
            Ok(Arc::new(StreamingHandleImpl::new(stream)) as Arc<dyn StreamHandle>)
        })
    }
}

pub struct StreamingHandleImpl {
    stream: MultiplexedStream,
}

impl StreamingHandleImpl {
    pub fn new(stream: MultiplexedStream) -> Self {
        Self { stream }
    }
}

impl StreamHandle for StreamingHandleImpl {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.send(payload).await })
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.next().await })
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.close().await })
    }
}
