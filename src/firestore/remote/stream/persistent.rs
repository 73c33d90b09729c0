use std::sync::Arc;
use std::time::Duration;

use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::datastore::{StreamHandle, LISTEN_METHOD, WRITE_METHOD};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::remote_syncer::{RemoteStoreEvent, RemoteStoreEventSink};
use crate::platform::runtime;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::{BackoffSettings, ExponentialBackoff};

/// How long an open stream may sit without work before it is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn method(&self) -> &'static str {
        match self {
            StreamKind::Listen => LISTEN_METHOD,
            StreamKind::Write => WRITE_METHOD,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }

    fn idle_timer(&self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn backoff_timer(&self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Never started, or stopped locally. Starting connects immediately.
    Initial,
    /// Waiting for the transport to open.
    Starting,
    Open,
    /// Closed by the transport. Starting again waits out the backoff.
    Error,
    /// A reconnect is scheduled on the backoff timer.
    Backoff,
}

/// What happened on a stream, delivered through the async queue.
pub enum StreamEvent {
    Opened(Arc<dyn StreamHandle>),
    Message(Vec<u8>),
    /// The transport ended the stream; `None` for a clean end.
    Closed(Option<FirestoreError>),
    BackoffElapsed,
    IdleTimeout,
}

impl StreamEvent {
    pub fn label(&self) -> &'static str {
        match self {
            StreamEvent::Opened(_) => "opened",
            StreamEvent::Message(_) => "message",
            StreamEvent::Closed(_) => "closed",
            StreamEvent::BackoffElapsed => "backoff-elapsed",
            StreamEvent::IdleTimeout => "idle-timeout",
        }
    }
}

fn dispatch(
    queue: &AsyncQueue,
    sink: &Arc<dyn RemoteStoreEventSink>,
    kind: StreamKind,
    generation: u64,
    event: StreamEvent,
) {
    let sink = Arc::clone(sink);
    queue.enqueue_and_forget(async move {
        sink.deliver(RemoteStoreEvent::Stream {
            kind,
            generation,
            event,
        })
        .await;
    });
}

/// A stream that reconnects with exponential backoff and closes itself after
/// [`IDLE_TIMEOUT`] without work.
///
/// The stream does not interpret payloads. Transport activity is forwarded as
/// [`StreamEvent`]s tagged with a generation number; every start and close
/// bumps the generation so events from an earlier connection are ignored.
pub struct PersistentStream {
    kind: StreamKind,
    network: NetworkLayer,
    queue: AsyncQueue,
    sink: Arc<dyn RemoteStoreEventSink>,
    backoff: ExponentialBackoff,
    state: StreamState,
    generation: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    idle_timer: Option<DelayedOperation>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        network: NetworkLayer,
        queue: AsyncQueue,
        sink: Arc<dyn RemoteStoreEventSink>,
        backoff: BackoffSettings,
    ) -> Self {
        Self {
            kind,
            network,
            queue,
            sink,
            backoff: ExponentialBackoff::new(backoff, kind.backoff_timer()),
            state: StreamState::Initial,
            generation: 0,
            handle: None,
            idle_timer: None,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn current_backoff(&self) -> Duration {
        self.backoff.current_base()
    }

    pub fn start(&mut self) {
        match self.state {
            StreamState::Initial => self.connect(),
            StreamState::Error => self.perform_backoff(),
            state => log::debug!("{} stream already started ({state:?})", self.kind.label()),
        }
    }

    /// Reconnects once the backoff timer fired. Returns false when the timer
    /// was stale.
    pub fn handle_backoff_elapsed(&mut self) -> bool {
        if self.state != StreamState::Backoff {
            return false;
        }
        self.state = StreamState::Initial;
        self.connect();
        true
    }

    pub fn handle_open(&mut self, handle: Arc<dyn StreamHandle>) {
        log::debug!("{} stream opened", self.kind.label());
        self.state = StreamState::Open;
        self.handle = Some(handle);
    }

    /// A message arrived, so the connection is healthy.
    pub fn handle_message(&mut self) {
        self.backoff.reset();
    }

    /// Handles the transport ending the stream. The next start backs off.
    pub async fn handle_close(&mut self, error: Option<&FirestoreError>) {
        match error {
            Some(err) => log::debug!("{} stream closed with error: {err}", self.kind.label()),
            None => log::debug!("{} stream closed by the backend", self.kind.label()),
        }
        self.close(StreamState::Error, error).await;
    }

    /// Closes the stream locally. The next start connects without delay.
    pub async fn stop(&mut self) {
        if self.is_started() {
            self.close(StreamState::Initial, None).await;
        }
    }

    /// Lets the next start skip the backoff after an error.
    pub fn inhibit_backoff(&mut self) {
        debug_assert!(!self.is_started(), "backoff can only be inhibited while stopped");
        self.state = StreamState::Initial;
        self.backoff.reset();
    }

    pub async fn send(&mut self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.cancel_idle_timer();
        match (&self.handle, self.state) {
            (Some(handle), StreamState::Open) => handle.send(payload).await,
            _ => Err(failed_precondition(format!(
                "{} stream is not open",
                self.kind.label()
            ))),
        }
    }

    /// Schedules the idle close unless one is already pending.
    pub fn mark_idle(&mut self) {
        if !self.is_open() || self.idle_timer.is_some() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        let (kind, generation) = (self.kind, self.generation);
        self.idle_timer = Some(self.queue.enqueue_after_delay(
            kind.idle_timer(),
            IDLE_TIMEOUT,
            move || async move {
                sink.deliver(RemoteStoreEvent::Stream {
                    kind,
                    generation,
                    event: StreamEvent::IdleTimeout,
                })
                .await;
            },
        ));
    }

    /// Closes the stream if the idle timer that fired is still current.
    pub async fn handle_idle_timeout(&mut self) -> bool {
        if self.idle_timer.take().is_none() || !self.is_open() {
            return false;
        }
        log::debug!("{} stream idle, closing", self.kind.label());
        self.close(StreamState::Initial, None).await;
        true
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }

    fn perform_backoff(&mut self) {
        self.state = StreamState::Backoff;
        let sink = Arc::clone(&self.sink);
        let (kind, generation) = (self.kind, self.generation);
        // Delayed operations already run on the queue.
        self.backoff.backoff_and_run(&self.queue, move || async move {
            sink.deliver(RemoteStoreEvent::Stream {
                kind,
                generation,
                event: StreamEvent::BackoffElapsed,
            })
            .await;
        });
    }

    fn connect(&mut self) {
        self.generation += 1;
        self.state = StreamState::Starting;

        let network = self.network.clone();
        let queue = self.queue.clone();
        let sink = Arc::clone(&self.sink);
        let (kind, generation) = (self.kind, self.generation);
        runtime::spawn_detached(async move {
            let handle = match network.open(kind).await {
                Ok(handle) => handle,
                Err(err) => {
                    dispatch(&queue, &sink, kind, generation, StreamEvent::Closed(Some(err)));
                    return;
                }
            };
            dispatch(
                &queue,
                &sink,
                kind,
                generation,
                StreamEvent::Opened(Arc::clone(&handle)),
            );
            loop {
                match handle.next().await {
                    Some(Ok(payload)) => {
                        dispatch(&queue, &sink, kind, generation, StreamEvent::Message(payload));
                    }
                    Some(Err(err)) => {
                        dispatch(&queue, &sink, kind, generation, StreamEvent::Closed(Some(err)));
                        break;
                    }
                    None => {
                        dispatch(&queue, &sink, kind, generation, StreamEvent::Closed(None));
                        break;
                    }
                }
            }
        });
    }

    async fn close(&mut self, final_state: StreamState, error: Option<&FirestoreError>) {
        self.cancel_idle_timer();
        self.backoff.cancel();
        self.generation += 1;

        if final_state != StreamState::Error {
            self.backoff.reset();
        } else if let Some(err) = error {
            match err.code {
                FirestoreErrorCode::ResourceExhausted => {
                    log::debug!(
                        "{} stream hit a quota limit, using the maximum backoff",
                        self.kind.label()
                    );
                    self.backoff.reset_to_max();
                }
                FirestoreErrorCode::Unauthenticated => self.network.invalidate_credentials(),
                _ => {}
            }
        }

        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.close().await {
                log::debug!("closing {} stream failed: {err}", self.kind.label());
            }
        }
        self.state = final_state;
    }
}
