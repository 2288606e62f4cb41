//! Coalesced filesystem change events.

use crate::asset::AssetKey;
use std::time::SystemTime;

/// Type of change observed for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// The file appeared.
    Created,
    /// The file's content or metadata changed.
    Modified,
    /// The file disappeared.
    Removed,
}

impl ChangeKind {
    /// Returns true for removals.
    pub fn is_removal(&self) -> bool {
        matches!(self, ChangeKind::Removed)
    }
}

/// A single change notification for one asset key.
///
/// Several raw notifications for the same key inside the debounce window
/// are folded into one event carrying the latest kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Affected key.
    pub key: AssetKey,
    /// Latest observed kind.
    pub kind: ChangeKind,
    /// When the latest raw notification was observed.
    pub observed_at: SystemTime,
}

impl ChangeEvent {
    /// Creates an event stamped with the current time.
    pub fn new(key: AssetKey, kind: ChangeKind) -> Self {
        Self::at(key, kind, SystemTime::now())
    }

    /// Creates an event with an explicit timestamp.
    pub fn at(key: AssetKey, kind: ChangeKind, observed_at: SystemTime) -> Self {
        Self {
            key,
            kind,
            observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removal_flag() {
        assert!(ChangeKind::Removed.is_removal());
        assert!(!ChangeKind::Created.is_removal());
        assert!(!ChangeKind::Modified.is_removal());
    }

    #[test]
    fn explicit_timestamp() {
        let key = AssetKey::new("sections/header.liquid").unwrap();
        let event = ChangeEvent::at(key.clone(), ChangeKind::Modified, SystemTime::UNIX_EPOCH);
        assert_eq!(event.key, key);
        assert_eq!(event.observed_at, SystemTime::UNIX_EPOCH);
    }
}
