//! Sync operations and directions.

use crate::asset::{AssetKey, Checksum};
use crate::conflict::BaselinePolicy;
use std::fmt;

/// Type of sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Write the local file to the remote theme.
    Upload,
    /// Write the remote asset to the local directory.
    Download,
    /// Delete the remote asset.
    Remove,
    /// Delete the local file.
    RemoveLocal,
}

impl OperationKind {
    /// Returns true for the two deleting kinds.
    pub fn is_removal(&self) -> bool {
        matches!(self, OperationKind::Remove | OperationKind::RemoveLocal)
    }

    /// Returns true if executing this kind calls the remote API.
    pub fn touches_remote(&self) -> bool {
        !matches!(self, OperationKind::RemoveLocal)
    }

    /// Short lowercase label used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::Remove => "remove",
            OperationKind::RemoveLocal => "remove-local",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of directions a reconciliation can run in.
///
/// The direction decides which side is authoritative and whether keys
/// present on one side only are created on the other or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    /// Upload local changes; never delete.
    Push,
    /// Download remote changes; never delete.
    Pull,
    /// Upload local changes and delete remote-only assets.
    PushAndRemove,
    /// Download remote changes and delete local-only files.
    PullAndRemove,
}

impl SyncDirection {
    /// Returns true if local content is written to the remote.
    pub fn pushes(&self) -> bool {
        matches!(self, SyncDirection::Push | SyncDirection::PushAndRemove)
    }

    /// Returns true if remote content is written locally.
    pub fn pulls(&self) -> bool {
        !self.pushes()
    }

    /// Returns true if keys missing on the authoritative side are deleted.
    pub fn removes(&self) -> bool {
        matches!(
            self,
            SyncDirection::PushAndRemove | SyncDirection::PullAndRemove
        )
    }
}

/// A single unit of sync work for one asset key.
///
/// Operations are self-contained: executing one needs only the key, the
/// kind and the theme root. The checksum is the one observed when the
/// operation was planned and is informational.
///
/// A guarded operation re-reads the store right before it touches it and
/// backs off when the store no longer holds the last synced content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Target asset key.
    pub key: AssetKey,
    /// What to do with it.
    pub kind: OperationKind,
    /// Checksum of the source side at planning time.
    pub checksum: Option<Checksum>,
    /// Enqueue sequence, assigned by the worker pool.
    pub sequence: u64,
    /// Store check applied before executing; the policy settles keys that
    /// were never synced.
    pub guard: Option<BaselinePolicy>,
}

impl Operation {
    fn new(key: AssetKey, kind: OperationKind, checksum: Option<Checksum>) -> Self {
        Self {
            key,
            kind,
            checksum,
            sequence: 0,
            guard: None,
        }
    }

    /// Creates an upload operation.
    pub fn upload(key: AssetKey, checksum: Option<Checksum>) -> Self {
        Self::new(key, OperationKind::Upload, checksum)
    }

    /// Creates a download operation.
    pub fn download(key: AssetKey, checksum: Option<Checksum>) -> Self {
        Self::new(key, OperationKind::Download, checksum)
    }

    /// Creates a remote delete operation.
    pub fn remove(key: AssetKey) -> Self {
        Self::new(key, OperationKind::Remove, None)
    }

    /// Creates a local delete operation.
    pub fn remove_local(key: AssetKey) -> Self {
        Self::new(key, OperationKind::RemoveLocal, None)
    }

    /// Checks the store against the last synced checksum before executing.
    pub fn guarded(mut self, policy: BaselinePolicy) -> Self {
        self.guard = Some(policy);
        self
    }

    /// Sets the enqueue sequence.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert!(OperationKind::Remove.is_removal());
        assert!(OperationKind::RemoveLocal.is_removal());
        assert!(!OperationKind::Upload.is_removal());

        assert!(OperationKind::Download.touches_remote());
        assert!(!OperationKind::RemoveLocal.touches_remote());
    }

    #[test]
    fn direction_flags() {
        assert!(SyncDirection::Push.pushes());
        assert!(!SyncDirection::Push.removes());
        assert!(SyncDirection::PushAndRemove.pushes());
        assert!(SyncDirection::PushAndRemove.removes());
        assert!(SyncDirection::Pull.pulls());
        assert!(SyncDirection::PullAndRemove.pulls());
        assert!(SyncDirection::PullAndRemove.removes());
    }

    #[test]
    fn operation_display() {
        let key = AssetKey::new("assets/app.js").unwrap();
        let op = Operation::upload(key.clone(), None).with_sequence(7);
        assert_eq!(op.to_string(), "upload assets/app.js");
        assert_eq!(op.sequence, 7);

        assert_eq!(Operation::remove_local(key.clone()).to_string(), "remove-local assets/app.js");

        let guarded = Operation::remove(key).guarded(BaselinePolicy::Report);
        assert_eq!(guarded.guard, Some(BaselinePolicy::Report));
        assert_eq!(guarded.to_string(), "remove assets/app.js");
    }
}
