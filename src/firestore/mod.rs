//! Offline-first document cache that stays in sync with a Firestore-style
//! backend over the Listen and Write streaming RPCs.

pub mod client;
pub mod core;
pub mod credentials;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use client::{FirestoreClient, FirestoreSettings};
pub use core::{ListenOptions, ListenerId, Query, ViewSnapshot};
pub use credentials::{CredentialsProvider, CredentialsProviderArc, User};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use local::CACHE_SIZE_UNLIMITED;
pub use model::{DatabaseId, DocumentKey, Mutation};
pub use value::{FirestoreValue, MapValue};

/// Sets the most verbose level the client logs at. The library installs no
/// logger; pick one in the binary.
pub fn set_log_level(level: log::LevelFilter) {
    log::set_max_level(level);
}
