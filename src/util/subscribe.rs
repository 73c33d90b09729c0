use std::sync::Arc;

use crate::firestore::error::FirestoreError;

pub type NextFn<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;
pub type ErrorFn = Arc<dyn Fn(&FirestoreError) + Send + Sync + 'static>;

/// Callback pair handed to listeners. `error` is optional; errors without a
/// handler are logged and dropped.
pub struct Observer<T> {
    pub next: NextFn<T>,
    pub error: Option<ErrorFn>,
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            next: Arc::clone(&self.next),
            error: self.error.clone(),
        }
    }
}

impl<T> Observer<T> {
    pub fn new<F>(next: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            next: Arc::new(next),
            error: None,
        }
    }

    pub fn with_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FirestoreError) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(callback));
        self
    }

    pub fn notify(&self, value: &T) {
        (self.next)(value);
    }

    pub fn notify_error(&self, error: &FirestoreError) {
        match &self.error {
            Some(callback) => callback(error),
            None => log::warn!("Unhandled listener error: {error}"),
        }
    }
}
