//! Conflict detection and the baseline tie-break policy.

use crate::asset::{AssetKey, Checksum};
use crate::operation::SyncDirection;
use std::fmt;

/// A key whose two sides diverged in a way the engine will not settle alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Asset key.
    pub key: AssetKey,
    /// Local checksum, `None` if the file is absent locally.
    pub local: Option<Checksum>,
    /// Remote checksum, `None` if the asset is absent remotely.
    pub remote: Option<Checksum>,
    /// Checksum last known to be identical on both sides.
    pub baseline: Option<Checksum>,
    /// Direction of the pass that found it.
    pub direction: SyncDirection,
}

impl Conflict {
    /// Creates a new conflict.
    pub fn new(
        key: AssetKey,
        local: Option<Checksum>,
        remote: Option<Checksum>,
        baseline: Option<Checksum>,
        direction: SyncDirection,
    ) -> Self {
        Self {
            key,
            local,
            remote,
            baseline,
            direction,
        }
    }

    /// Returns true if there is no record of a previous sync for this key.
    pub fn is_unbaselined(&self) -> bool {
        self.baseline.is_none()
    }

    /// Returns true if the local side moved away from the baseline.
    pub fn local_changed(&self) -> bool {
        self.baseline.is_none() || self.local != self.baseline
    }

    /// Returns true if the remote side moved away from the baseline.
    pub fn remote_changed(&self) -> bool {
        self.baseline.is_none() || self.remote != self.baseline
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |c: &Option<Checksum>| {
            c.as_ref()
                .map(|c| c.as_str().to_string())
                .unwrap_or_else(|| "absent".to_string())
        };
        write!(
            f,
            "conflict on {}: local {} / remote {}",
            self.key,
            side(&self.local),
            side(&self.remote)
        )?;
        match &self.baseline {
            Some(baseline) => write!(f, " (last synced {})", baseline),
            None => write!(f, " (never synced)"),
        }
    }
}

/// What to do with a diverged key when no last-synced checksum exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaselinePolicy {
    /// Leave both sides alone and report a conflict.
    #[default]
    Report,
    /// Treat the remote copy as the truth: download when pulling, skip when pushing.
    PreferRemote,
    /// Treat the local copy as the truth: upload when pushing, skip when pulling.
    PreferLocal,
}

impl BaselinePolicy {
    /// Returns true if this policy settles unbaselined keys without reporting.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, BaselinePolicy::Report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AssetKey {
        AssetKey::new("config/settings.json").unwrap()
    }

    #[test]
    fn change_detection_against_baseline() {
        let a = Checksum::of(b"a");
        let b = Checksum::of(b"b");

        let conflict = Conflict::new(
            key(),
            Some(a.clone()),
            Some(b.clone()),
            Some(a.clone()),
            SyncDirection::Push,
        );
        assert!(!conflict.local_changed());
        assert!(conflict.remote_changed());

        let unbaselined = Conflict::new(key(), Some(a), Some(b), None, SyncDirection::Pull);
        assert!(unbaselined.is_unbaselined());
        assert!(unbaselined.local_changed());
        assert!(unbaselined.remote_changed());
    }

    #[test]
    fn conflict_display() {
        let conflict = Conflict::new(
            key(),
            Some(Checksum::of(b"c")),
            None,
            None,
            SyncDirection::Push,
        );
        let msg = conflict.to_string();
        assert!(msg.contains("config/settings.json"));
        assert!(msg.contains("remote absent"));
        assert!(msg.contains("never synced"));
    }

    #[test]
    fn policy_defaults_to_report() {
        assert_eq!(BaselinePolicy::default(), BaselinePolicy::Report);
        assert!(!BaselinePolicy::Report.auto_resolves());
        assert!(BaselinePolicy::PreferRemote.auto_resolves());
        assert!(BaselinePolicy::PreferLocal.auto_resolves());
    }
}
