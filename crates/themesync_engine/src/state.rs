//! Session state machine and run summary.

use crate::pool::{OperationOutcome, OperationReport};
use std::fmt;
use std::time::Duration;
use themesync_protocol::{AssetKey, Conflict, OperationKind};

/// The current state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opening the ledger, building the filter and the client.
    Initializing,
    /// Comparing inventories and executing the resulting batch.
    Reconciling,
    /// Watching with nothing outstanding.
    Idle,
    /// Watching with operations outstanding.
    Processing,
    /// Draining in-flight operations after cancellation.
    ShuttingDown,
    /// Finished.
    Terminated,
    /// Aborted by a fatal error.
    Failed,
}

impl SessionState {
    /// Returns true while work may still be executed.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Reconciling | SessionState::Processing | SessionState::ShuttingDown
        )
    }

    /// Returns true for `Terminated` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Failed)
    }

    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initializing, Reconciling)
                | (Initializing, Failed)
                | (Reconciling, Idle)
                | (Reconciling, Processing)
                | (Reconciling, ShuttingDown)
                | (Reconciling, Terminated)
                | (Reconciling, Failed)
                | (Idle, Processing)
                | (Processing, Idle)
                | (Processing, Terminated)
                | (Idle, ShuttingDown)
                | (Processing, ShuttingDown)
                | (Idle, Failed)
                | (Processing, Failed)
                | (ShuttingDown, Terminated)
                | (ShuttingDown, Failed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initializing => "initializing",
            SessionState::Reconciling => "reconciling",
            SessionState::Idle => "idle",
            SessionState::Processing => "processing",
            SessionState::ShuttingDown => "shutting-down",
            SessionState::Terminated => "terminated",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Overall result of a session that did not fail fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Every operation applied or had nothing to do; no conflicts.
    Success,
    /// Some operations failed or conflicts were left for the user.
    PartialSuccess,
}

/// One failed operation, as shown in the summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    /// Target key.
    pub key: AssetKey,
    /// Operation kind.
    pub kind: OperationKind,
    /// Rendered error.
    pub message: String,
}

/// Counters and failures of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    /// Environment name.
    pub environment: String,
    /// Successful uploads.
    pub uploaded: u64,
    /// Successful downloads.
    pub downloaded: u64,
    /// Successful removals, on either side.
    pub removed: u64,
    /// Operations with nothing to do.
    pub skipped: u64,
    /// Operations replaced by newer ones.
    pub superseded: u64,
    /// Operations dropped by shutdown.
    pub cancelled: u64,
    /// Failed operations.
    pub failures: Vec<OperationFailure>,
    /// Divergences that were not resolved.
    pub conflicts: Vec<Conflict>,
    /// Wall time.
    pub duration: Duration,
}

impl SessionSummary {
    /// Creates an empty summary.
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Default::default()
        }
    }

    /// Folds one report into the counters.
    pub fn record(&mut self, report: &OperationReport) {
        match &report.outcome {
            OperationOutcome::Succeeded => match report.kind {
                OperationKind::Upload => self.uploaded += 1,
                OperationKind::Download => self.downloaded += 1,
                OperationKind::Remove | OperationKind::RemoveLocal => self.removed += 1,
            },
            OperationOutcome::Skipped => self.skipped += 1,
            OperationOutcome::Superseded => self.superseded += 1,
            OperationOutcome::Cancelled => self.cancelled += 1,
            OperationOutcome::Conflicted(conflict) => self.conflicts.push(conflict.clone()),
            OperationOutcome::Failed(error) => self.failures.push(OperationFailure {
                key: report.key.clone(),
                kind: report.kind,
                message: error.to_string(),
            }),
        }
    }

    /// Number of operations applied.
    pub fn applied(&self) -> u64 {
        self.uploaded + self.downloaded + self.removed
    }

    /// Returns [`SessionStatus::Success`] only without failures or conflicts.
    pub fn status(&self) -> SessionStatus {
        if self.failures.is_empty() && self.conflicts.is_empty() {
            SessionStatus::Success
        } else {
            SessionStatus::PartialSuccess
        }
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] uploaded {}, downloaded {}, removed {}, skipped {}, failed {}, conflicts {}",
            self.environment,
            self.uploaded,
            self.downloaded,
            self.removed,
            self.skipped,
            self.failures.len(),
            self.conflicts.len()
        )
    }
}

/// Progress notifications emitted by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged {
        /// Environment name.
        environment: String,
        /// New state.
        state: SessionState,
    },
    /// An operation finished.
    Operation(OperationReport),
    /// A divergence was left unresolved.
    Conflict(Conflict),
    /// Watch mode drained every outstanding operation.
    Idle {
        /// Environment name.
        environment: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::Arc;

    fn report(kind: OperationKind, outcome: OperationOutcome) -> OperationReport {
        OperationReport {
            key: AssetKey::new("layout/theme.liquid").unwrap(),
            kind,
            sequence: 1,
            outcome,
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn state_checks() {
        assert!(SessionState::Processing.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Initializing.can_transition_to(SessionState::Failed));
        assert!(SessionState::Idle.can_transition_to(SessionState::Processing));
        assert!(SessionState::Processing.can_transition_to(SessionState::Idle));
        assert!(!SessionState::Initializing.can_transition_to(SessionState::Idle));
        assert!(!SessionState::Terminated.can_transition_to(SessionState::Reconciling));
        assert_eq!(SessionState::ShuttingDown.to_string(), "shutting-down");
    }

    #[test]
    fn summary_counts() {
        let mut summary = SessionSummary::new("production");
        summary.record(&report(OperationKind::Upload, OperationOutcome::Succeeded));
        summary.record(&report(OperationKind::Download, OperationOutcome::Succeeded));
        summary.record(&report(OperationKind::RemoveLocal, OperationOutcome::Succeeded));
        summary.record(&report(OperationKind::Upload, OperationOutcome::Skipped));
        summary.record(&report(OperationKind::Upload, OperationOutcome::Superseded));
        assert_eq!(summary.applied(), 3);
        assert_eq!(summary.status(), SessionStatus::Success);

        summary.record(&report(
            OperationKind::Upload,
            OperationOutcome::Failed(Arc::new(SyncError::Http {
                status: 422,
                message: "Liquid syntax error".into(),
            })),
        ));
        assert_eq!(summary.status(), SessionStatus::PartialSuccess);
        assert_eq!(summary.failures[0].kind, OperationKind::Upload);
        assert!(summary.failures[0].message.contains("Liquid syntax error"));
        assert_eq!(
            summary.to_string(),
            "[production] uploaded 1, downloaded 1, removed 1, skipped 1, failed 1, conflicts 0"
        );
    }

    #[test]
    fn held_back_writes_count_as_conflicts() {
        let mut summary = SessionSummary::new("production");
        let conflict = Conflict::new(
            AssetKey::new("config/settings_data.json").unwrap(),
            Some(themesync_protocol::Checksum::of(b"local")),
            Some(themesync_protocol::Checksum::of(b"remote")),
            None,
            themesync_protocol::SyncDirection::Push,
        );
        summary.record(&report(
            OperationKind::Upload,
            OperationOutcome::Conflicted(conflict.clone()),
        ));
        assert_eq!(summary.applied(), 0);
        assert_eq!(summary.conflicts, vec![conflict]);
        assert_eq!(summary.status(), SessionStatus::PartialSuccess);
    }
}
