use std::sync::Arc;
use std::time::Duration;

use crate::firestore::core::OnlineState;
use crate::firestore::remote::remote_syncer::{RemoteStoreEvent, RemoteStoreEventSink};
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Failed watch connection attempts tolerated before reporting `Offline`.
pub const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long a first connection attempt may stay unresolved before the
/// client reports `Offline`.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Derives the client's [`OnlineState`] from watch stream health.
///
/// Every method returns the new state when it changed so the caller can
/// raise it once its own locks are released.
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<DelayedOperation>,
    timeout: Duration,
    queue: AsyncQueue,
    sink: Arc<dyn RemoteStoreEventSink>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, sink: Arc<dyn RemoteStoreEventSink>, timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            timer: None,
            timeout,
            queue,
            sink,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called when the watch stream starts connecting. The first attempt
    /// arms the timeout.
    pub fn handle_watch_stream_start(&mut self) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.apply(OnlineState::Unknown);
        if self.timer.is_none() {
            let sink = Arc::clone(&self.sink);
            self.timer = Some(self.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                self.timeout,
                move || async move {
                    sink.deliver(RemoteStoreEvent::OnlineStateTimeout).await;
                },
            ));
        }
        changed
    }

    /// The online-state timer fired. Stale timers are ignored.
    pub fn handle_timeout(&mut self) -> Option<OnlineState> {
        if self.timer.take().is_none() {
            return None;
        }
        log::warn!(
            "Could not reach the backend within {} seconds. Operating in offline mode until a connection succeeds.",
            self.timeout.as_secs()
        );
        self.apply(OnlineState::Offline)
    }

    /// The watch stream failed to connect or dropped.
    pub fn handle_watch_stream_failure(&mut self) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // A healthy connection broke; try again before giving up.
            return self.apply(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.clear_timer();
            log::debug!(
                "OnlineStateTracker: watch stream failed {} time(s), reporting offline",
                self.watch_stream_failures
            );
            return self.apply(OnlineState::Offline);
        }
        None
    }

    /// Explicit transition, used for messages, network toggles and
    /// credential changes. Resets the failure count.
    pub fn set(&mut self, new_state: OnlineState) -> Option<OnlineState> {
        self.clear_timer();
        self.watch_stream_failures = 0;
        self.apply(new_state)
    }

    fn apply(&mut self, new_state: OnlineState) -> Option<OnlineState> {
        if self.state == new_state {
            return None;
        }
        self.state = new_state;
        Some(new_state)
    }

    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
