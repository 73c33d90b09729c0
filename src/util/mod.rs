pub mod async_queue;
pub mod backoff;
pub mod subscribe;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use backoff::{BackoffSettings, ExponentialBackoff};
pub use subscribe::Observer;
