use std::time::{Duration, Instant};

use futures::channel::oneshot;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Each delay is randomized by up to this fraction of the base delay in
    /// either direction.
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Exponential backoff whose waits are delayed operations on an
/// [`AsyncQueue`]. The first attempt after a reset runs immediately.
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    timer_id: TimerId,
    current_base: Duration,
    last_attempt: Option<Instant>,
    pending: Option<DelayedOperation>,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings, timer_id: TimerId) -> Self {
        Self::with_rng(settings, timer_id, StdRng::from_entropy())
    }

    pub fn with_rng(settings: BackoffSettings, timer_id: TimerId, rng: StdRng) -> Self {
        Self {
            settings,
            timer_id,
            current_base: Duration::ZERO,
            last_attempt: None,
            pending: None,
            rng,
        }
    }

    /// Next attempt runs without delay.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Next attempt waits the maximum delay. Used after `ResourceExhausted`.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Delay before the next attempt, accounting for time already spent
    /// since the previous one, and advances the base delay.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = self.jitter();
        let desired = (self.current_base.as_secs_f64() * 1000.0 + jitter).max(0.0);
        let elapsed = self
            .last_attempt
            .map(|last| last.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        let remaining = (desired - elapsed).max(0.0);

        if !self.current_base.is_zero() {
            log::debug!(
                "Backoff: waiting {remaining:.0} ms (base {} ms, {elapsed:.0} ms elapsed)",
                self.current_base.as_millis()
            );
        }

        let next = self.current_base.mul_f64(self.settings.backoff_factor);
        self.current_base = next.clamp(self.settings.initial_delay, self.settings.max_delay);
        self.last_attempt = Some(Instant::now() + Duration::from_secs_f64(remaining / 1000.0));
        Duration::from_secs_f64(remaining / 1000.0)
    }

    /// Schedules `op` on `queue` after the next backoff delay, replacing any
    /// attempt still pending.
    pub fn backoff_and_run<F, Fut>(&mut self, queue: &AsyncQueue, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let delay = self.next_delay();
        self.pending = Some(queue.enqueue_after_delay(self.timer_id, delay, op));
    }

    /// Waits out the next backoff delay.
    pub async fn wait(&mut self, queue: &AsyncQueue) {
        let (sender, receiver) = oneshot::channel();
        self.backoff_and_run(queue, move || async move {
            let _ = sender.send(());
        });
        let _ = receiver.await;
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }

    fn jitter(&mut self) -> f64 {
        let base = self.current_base.as_secs_f64() * 1000.0;
        self.settings.jitter_factor * base * self.rng.gen_range(-1.0..=1.0)
    }
}
