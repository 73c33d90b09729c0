use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Logical version assigned by the backend to documents and consistent
/// snapshots. `SnapshotVersion::min()` means "never seen".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn min() -> Self {
        Self(Timestamp::new(0, 0))
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn to_micros(&self) -> i64 {
        self.0.seconds * 1_000_000 + i64::from(self.0.nanos / 1_000)
    }
}

impl From<Timestamp> for SnapshotVersion {
    fn from(value: Timestamp) -> Self {
        Self(value)
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({}.{:09})", self.0.seconds, self.0.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_sorts_first() {
        let version = SnapshotVersion::new(Timestamp::new(5, 0));
        assert!(SnapshotVersion::min() < version);
        assert!(SnapshotVersion::min().is_min());
        assert_eq!(version.to_micros(), 5_000_000);
    }
}
