use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

mod persistent;

pub use persistent::{PersistentStream, StreamEvent, StreamKind, StreamState};

/// Request metadata sent along with an open frame.
pub type StreamHeaders = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    /// Opens a stream for the named RPC method.
    Open {
        method: String,
        headers: StreamHeaders,
    },
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, method: impl Into<String>, headers: StreamHeaders) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open {
                method: method.into(),
                headers,
            },
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamTable = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

fn lock_table(streams: &StreamTable) -> MutexGuard<'_, HashMap<StreamId, Sender<FrameKind>>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Many logical RPC streams over one frame transport.
///
/// Streams opened locally carry the RPC method name in their open frame. The
/// peer receives them through [`MultiplexedConnection::accept_stream`] and
/// routes on [`MultiplexedStream::method`].
pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamTable,
    accepted: Receiver<MultiplexedStream>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));

        Self::start_outbound_loop(Arc::clone(&transport), outbound_rx);
        Self::start_inbound_loop(
            transport,
            Arc::clone(&streams),
            outbound_tx.clone(),
            accepted_tx,
        );

        Self {
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams,
            accepted: accepted_rx,
        }
    }

    fn start_outbound_loop(transport: Arc<dyn StreamTransport>, outbound_rx: Receiver<TransportFrame>) {
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(
        transport: Arc<dyn StreamTransport>,
        streams: StreamTable,
        outbound_tx: Sender<TransportFrame>,
        accepted_tx: Sender<MultiplexedStream>,
    ) {
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::debug!("multiplexed inbound loop terminated: {err}");
                        // Every stream still open sees the connection drop.
                        let senders: Vec<_> = lock_table(&streams).drain().map(|(_, tx)| tx).collect();
                        for sender in senders {
                            let _ = sender
                                .send(FrameKind::Error(unavailable("connection closed")))
                                .await;
                        }
                        break;
                    }
                };
                let stream_id = frame.stream_id();
                match frame.kind {
                    FrameKind::Open { method, headers } => {
                        let (inbound_tx, inbound_rx) = async_channel::unbounded();
                        {
                            let mut table = lock_table(&streams);
                            if table.contains_key(&stream_id) {
                                log::warn!("ignoring duplicate open for stream {}", stream_id.value());
                                continue;
                            }
                            table.insert(stream_id, inbound_tx);
                        }
                        let stream = MultiplexedStream {
                            id: stream_id,
                            method,
                            headers,
                            outbound: outbound_tx.clone(),
                            inbound: inbound_rx,
                            streams: Arc::clone(&streams),
                        };
                        if accepted_tx.send(stream).await.is_err() {
                            log::debug!("no acceptor for stream {}", stream_id.value());
                        }
                    }
                    event => {
                        let terminal = matches!(event, FrameKind::Close | FrameKind::Error(_));
                        let sender = {
                            let mut table = lock_table(&streams);
                            if terminal {
                                table.remove(&stream_id)
                            } else {
                                table.get(&stream_id).cloned()
                            }
                        };
                        match sender {
                            Some(sender) => {
                                if sender.send(event).await.is_err() {
                                    log::debug!(
                                        "dropping inbound frame for closed stream {}",
                                        stream_id.value()
                                    );
                                }
                            }
                            None => {
                                log::debug!("dropping frame for unknown stream {}", stream_id.value());
                            }
                        }
                    }
                }
            }
        });
    }

    /// Opens a stream for `method`. The open frame is queued before this
    /// returns, so data sent afterwards always follows it.
    pub async fn open_stream(
        &self,
        method: &str,
        headers: StreamHeaders,
    ) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        lock_table(&self.streams).insert(stream_id, inbound_tx);
        if let Err(err) = self
            .outbound_tx
            .send(TransportFrame::open(stream_id, method, headers.clone()))
            .await
        {
            lock_table(&self.streams).remove(&stream_id);
            return Err(unavailable(format!("failed to queue open frame: {err}")));
        }
        Ok(MultiplexedStream {
            id: stream_id,
            method: method.to_string(),
            headers,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            streams: Arc::clone(&self.streams),
        })
    }

    /// Waits for the peer to open a stream.
    pub async fn accept_stream(&self) -> FirestoreResult<MultiplexedStream> {
        self.accepted
            .recv()
            .await
            .map_err(|_| unavailable("connection closed"))
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    method: String,
    headers: StreamHeaders,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    streams: StreamTable,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Fully qualified RPC method this stream was opened for.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &StreamHeaders {
        &self.headers
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    /// Next payload. `None` once the peer closed the stream cleanly.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open { .. } => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        lock_table(&self.streams).remove(&self.id);
        self.outbound
            .send(TransportFrame::close(self.id))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue close frame: {err}")))
    }

    /// Terminates the stream with `error` on the peer's side.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        lock_table(&self.streams).remove(&self.id);
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        if lock_table(&self.streams).remove(&self.id).is_some() {
            let _ = self.outbound.try_send(TransportFrame::close(self.id));
        }
    }
}

pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }

    /// Drops both directions; the peer's inbound loop ends with an error.
    pub fn disconnect(&self) {
        self.outbound.close();
        self.inbound.close();
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};

    fn connections() -> (MultiplexedConnection, MultiplexedConnection) {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        (
            MultiplexedConnection::new(left_transport),
            MultiplexedConnection::new(right_transport),
        )
    }

    #[tokio::test]
    async fn accepted_streams_carry_method_and_headers() {
        let (client, server) = connections();
        let mut headers = StreamHeaders::new();
        headers.insert("authorization".into(), "Bearer t".into());

        let client_stream = client.open_stream("svc/Listen", headers).await.unwrap();
        let server_stream = server.accept_stream().await.unwrap();
        assert_eq!(server_stream.method(), "svc/Listen");
        assert_eq!(
            server_stream.headers().get("authorization").map(String::as_str),
            Some("Bearer t")
        );

        client_stream.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(server_stream.next().await.unwrap().unwrap(), b"hello");

        server_stream.send(b"world".to_vec()).await.unwrap();
        assert_eq!(client_stream.next().await.unwrap().unwrap(), b"world");
    }

    #[tokio::test]
    async fn streams_are_routed_independently() {
        let (client, server) = connections();
        let listen = client.open_stream("svc/Listen", StreamHeaders::new()).await.unwrap();
        let write = client.open_stream("svc/Write", StreamHeaders::new()).await.unwrap();
        let first = server.accept_stream().await.unwrap();
        let second = server.accept_stream().await.unwrap();
        assert_eq!(first.method(), "svc/Listen");
        assert_eq!(second.method(), "svc/Write");

        second.send(b"w".to_vec()).await.unwrap();
        first.send(b"l".to_vec()).await.unwrap();
        assert_eq!(write.next().await.unwrap().unwrap(), b"w");
        assert_eq!(listen.next().await.unwrap().unwrap(), b"l");
    }

    #[tokio::test]
    async fn closing_stream_notifies_peer() {
        let (client, server) = connections();
        let client_stream = client.open_stream("svc/Write", StreamHeaders::new()).await.unwrap();
        let server_stream = server.accept_stream().await.unwrap();

        client_stream.close().await.unwrap();
        assert!(server_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failing_stream_delivers_error_to_peer() {
        let (client, server) = connections();
        let client_stream = client.open_stream("svc/Write", StreamHeaders::new()).await.unwrap();
        let server_stream = server.accept_stream().await.unwrap();

        server_stream.fail(permission_denied("nope")).await.unwrap();
        let err = client_stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert!(client_stream.next().await.is_none());
    }
}
