//! Offline-first Firestore client cache.
//!
//! [`firestore::FirestoreClient`] keeps a local document cache in sync with
//! the backend over the Listen and Write streams. Listeners see local writes
//! immediately, keep working while offline and converge once the backend
//! answers. [`beverage`] is a small app built on top of it.

pub mod beverage;
pub mod firestore;
pub mod platform;
pub mod util;
