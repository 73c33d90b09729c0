pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

/// Sequence number meaning "not yet assigned".
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Client-visible connectivity, derived from watch stream health.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// Still trying to connect. Listeners keep waiting for server results.
    Unknown,
    /// The watch stream delivered a message.
    Online,
    /// Connecting failed or timed out. Views fall back to cached results.
    Offline,
}

/// Whether a document sits in a view's result set only because of local
/// writes or because the server confirmed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}
