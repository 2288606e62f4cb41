//! Bounded worker pool executing sync operations.
//!
//! The pool admits operations through a bounded queue (callers block when it
//! is full) and runs them on a fixed number of workers. An in-flight
//! registry keeps at most one operation per key executing; a newer
//! operation for a busy key waits in the key's slot, and a still newer one
//! replaces it, reporting the replaced one as superseded.
//!
//! Guarded operations read the store's copy right before writing, once any
//! earlier operation on the key has finished, and back off if it changed
//! since the last sync.

use crate::config::PoolConfig;
use crate::differ::{check_guard, Guard, Reconciliation};
use crate::error::{SyncError, SyncResult};
use crate::ledger::Ledger;
use crate::transport::RemoteClient;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use themesync_protocol::{AssetKey, Checksum, Conflict, Operation, OperationKind};
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How an operation ended.
#[derive(Debug, Clone)]
pub enum OperationOutcome {
    /// Applied.
    Succeeded,
    /// Nothing to do when it ran.
    Skipped,
    /// Replaced by a newer operation for the same key before it started.
    Superseded,
    /// Dropped because the pool was shut down before it started.
    Cancelled,
    /// Held back because the store changed since the last sync.
    Conflicted(Conflict),
    /// Failed after retries.
    Failed(Arc<SyncError>),
}

impl OperationOutcome {
    /// Returns true for [`OperationOutcome::Failed`].
    pub fn is_failure(&self) -> bool {
        matches!(self, OperationOutcome::Failed(_))
    }
}

/// Result record of one operation.
#[derive(Debug, Clone)]
pub struct OperationReport {
    /// Target key.
    pub key: AssetKey,
    /// Operation kind.
    pub kind: OperationKind,
    /// Enqueue sequence.
    pub sequence: u64,
    /// Outcome.
    pub outcome: OperationOutcome,
    /// Time from admission to completion.
    pub duration: Duration,
}

struct Queued {
    op: Operation,
    reply: oneshot::Sender<OperationReport>,
    admitted: Instant,
    waited: bool,
    _permit: OwnedSemaphorePermit,
}

/// A key with an operation running; `pending` runs next.
struct Slot {
    pending: Option<Queued>,
}

struct PoolInner {
    remote: Arc<dyn RemoteClient>,
    root: PathBuf,
    ledger: Arc<Ledger>,
    config: PoolConfig,
    queue: Arc<Semaphore>,
    workers: Semaphore,
    slots: Mutex<HashMap<AssetKey, Slot>>,
    outstanding: watch::Sender<usize>,
    sequence: AtomicU64,
    auth_failures: AtomicU32,
    escalated: Mutex<Option<u32>>,
    reports: Mutex<Option<mpsc::UnboundedSender<OperationReport>>>,
    token: CancellationToken,
}

/// Executes operations against the remote store and the theme directory.
///
/// Cloning is cheap; clones share the same workers and registry.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates a pool. Cancelling `token` stops admitting work and cancels
    /// operations that have not started.
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        root: impl Into<PathBuf>,
        ledger: Arc<Ledger>,
        config: PoolConfig,
        token: CancellationToken,
    ) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(PoolInner {
                remote,
                root: root.into(),
                ledger,
                queue: Arc::new(Semaphore::new(config.queue_capacity.max(1))),
                workers: Semaphore::new(config.concurrency.max(1)),
                config,
                slots: Mutex::new(HashMap::new()),
                outstanding,
                sequence: AtomicU64::new(0),
                auth_failures: AtomicU32::new(0),
                escalated: Mutex::new(None),
                reports: Mutex::new(None),
                token,
            }),
        }
    }

    /// Sends a copy of every report to `tx`.
    pub fn with_reports(self, tx: mpsc::UnboundedSender<OperationReport>) -> Self {
        *self.inner.reports.lock() = Some(tx);
        self
    }

    /// Admits `op`, waiting while the queue is full.
    ///
    /// The returned receiver resolves when the operation finishes, is
    /// superseded or is cancelled.
    pub async fn submit(&self, op: Operation) -> SyncResult<oneshot::Receiver<OperationReport>> {
        let inner = &self.inner;
        if inner.token.is_cancelled() {
            return Err(self.stop_reason());
        }
        let permit = tokio::select! {
            biased;
            _ = inner.token.cancelled() => return Err(self.stop_reason()),
            permit = Arc::clone(&inner.queue).acquire_owned() => {
                permit.map_err(|_| SyncError::Cancelled)?
            }
        };

        let sequence = inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let op = op.with_sequence(sequence);
        let (reply, rx) = oneshot::channel();
        let mut queued = Queued {
            op,
            reply,
            admitted: Instant::now(),
            waited: false,
            _permit: permit,
        };
        debug!(op = %queued.op, sequence, "operation admitted");

        let (start, superseded) = {
            let mut slots = inner.slots.lock();
            inner.outstanding.send_modify(|n| *n += 1);
            match slots.get_mut(&queued.op.key) {
                Some(slot) => {
                    queued.waited = true;
                    (None, slot.pending.replace(queued))
                }
                None => {
                    slots.insert(queued.op.key.clone(), Slot { pending: None });
                    (Some(queued), None)
                }
            }
        };

        if let Some(old) = superseded {
            debug!(op = %old.op, sequence = old.op.sequence, "operation superseded");
            inner.finish(old, OperationOutcome::Superseded);
        }
        if let Some(queued) = start {
            tokio::spawn(run_key(Arc::clone(inner), queued));
        }
        Ok(rx)
    }

    /// Submits every operation and waits for all of them.
    ///
    /// Operations that could not be admitted are reported as cancelled.
    pub async fn run_all<I>(&self, ops: I) -> Vec<OperationReport>
    where
        I: IntoIterator<Item = Operation>,
    {
        let mut waiting = Vec::new();
        let mut reports = Vec::new();
        for op in ops {
            let key = op.key.clone();
            let kind = op.kind;
            match self.submit(op).await {
                Ok(rx) => waiting.push((key, kind, rx)),
                Err(_) => reports.push(self.inner.cancelled(key, kind)),
            }
        }
        for (key, kind, rx) in waiting {
            match rx.await {
                Ok(report) => reports.push(report),
                Err(_) => reports.push(self.inner.cancelled(key, kind)),
            }
        }
        reports
    }

    /// Runs a reconciliation: every transfer completes before any removal
    /// is dispatched.
    pub async fn run_batch(&self, plan: &Reconciliation) -> Vec<OperationReport> {
        let mut reports = self.run_all(plan.transfers.iter().cloned()).await;
        if !plan.removals.is_empty() {
            debug!(removals = plan.removals.len(), "transfers done, dispatching removals");
            reports.extend(self.run_all(plan.removals.iter().cloned()).await);
        }
        reports
    }

    /// Operations admitted and not yet reported.
    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.borrow()
    }

    /// Watches the outstanding count.
    pub fn subscribe_outstanding(&self) -> watch::Receiver<usize> {
        self.inner.outstanding.subscribe()
    }

    /// Waits until every admitted operation has been reported.
    pub async fn drain(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        // The sender lives in `inner`, so this cannot fail while we hold it.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stops admitting work, cancels what has not started and waits up to
    /// `timeout` for in-flight operations. Returns false on timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.token.cancel();
        let drained = tokio::time::timeout(timeout, self.drain()).await.is_ok();
        if !drained {
            warn!(
                outstanding = self.outstanding(),
                timeout_ms = timeout.as_millis() as u64,
                "shutdown timed out with operations in flight"
            );
        }
        drained
    }

    /// The error that stopped the pool, if any.
    pub fn fatal_error(&self) -> Option<SyncError> {
        self.inner
            .escalated
            .lock()
            .map(|failures| SyncError::AuthEscalation { failures })
    }

    /// Returns true once the pool stops admitting work.
    pub fn is_stopped(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    fn stop_reason(&self) -> SyncError {
        self.fatal_error().unwrap_or(SyncError::Cancelled)
    }
}

/// Runs the operations of one key back to back until its slot is empty.
async fn run_key(inner: Arc<PoolInner>, mut queued: Queued) {
    loop {
        let key = queued.op.key.clone();
        let outcome = inner.execute(&queued.op, queued.waited).await;
        inner.finish(queued, outcome);

        let next = {
            let mut slots = inner.slots.lock();
            match slots.get_mut(&key).and_then(|slot| slot.pending.take()) {
                Some(next) => Some(next),
                None => {
                    slots.remove(&key);
                    None
                }
            }
        };
        match next {
            Some(next) => queued = next,
            None => break,
        }
    }
}

impl PoolInner {
    async fn execute(&self, op: &Operation, waited: bool) -> OperationOutcome {
        let _worker = tokio::select! {
            biased;
            _ = self.token.cancelled() => return OperationOutcome::Cancelled,
            permit = self.workers.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return OperationOutcome::Cancelled,
            },
        };
        if self.token.is_cancelled() {
            return OperationOutcome::Cancelled;
        }

        match self.perform(op, waited).await {
            Ok(outcome) => {
                self.auth_failures.store(0, Ordering::SeqCst);
                outcome
            }
            Err(e) => {
                // Only an unbroken run of auth failures escalates.
                if e.is_auth() {
                    let failures = self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= self.config.auth_failure_cutoff {
                        self.escalate(failures);
                    }
                } else {
                    self.auth_failures.store(0, Ordering::SeqCst);
                }
                warn!(op = %op, error = %e, "operation failed");
                OperationOutcome::Failed(Arc::new(e))
            }
        }
    }

    fn escalate(&self, failures: u32) {
        let mut escalated = self.escalated.lock();
        if escalated.is_none() {
            error!(failures, "repeated authentication failures, stopping");
            *escalated = Some(failures);
        }
        self.token.cancel();
    }

    async fn perform(&self, op: &Operation, waited: bool) -> SyncResult<OperationOutcome> {
        let path = op.key.to_path(&self.root);
        match op.kind {
            OperationKind::Upload => {
                let content = match tokio::fs::read(&path).await {
                    Ok(content) => content,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!(key = %op.key, "file vanished before upload");
                        return Ok(OperationOutcome::Skipped);
                    }
                    Err(e) => return Err(e.into()),
                };
                let checksum = Checksum::of(&content);
                // Queued behind an upload that may already have sent this content.
                if waited && self.ledger.get(&op.key).as_ref() == Some(&checksum) {
                    return Ok(OperationOutcome::Skipped);
                }
                if let Some(outcome) = self.check_store(op, Some(&checksum)).await? {
                    return Ok(outcome);
                }
                self.remote.write(&op.key, &content).await?;
                self.ledger.record(op.key.clone(), checksum);
                info!(key = %op.key, bytes = content.len(), "uploaded");
            }
            OperationKind::Download => {
                let content = match self.remote.fetch(&op.key).await {
                    Ok(content) => content,
                    Err(SyncError::NotFound(_)) => {
                        debug!(key = %op.key, "asset vanished before download");
                        return Ok(OperationOutcome::Skipped);
                    }
                    Err(e) => return Err(e),
                };
                write_atomically(&path, &content).await?;
                self.ledger.record(op.key.clone(), Checksum::of(&content));
                info!(key = %op.key, bytes = content.len(), "downloaded");
            }
            OperationKind::Remove => {
                if let Some(outcome) = self.check_store(op, None).await? {
                    return Ok(outcome);
                }
                self.remote.delete(&op.key).await?;
                self.ledger.forget(&op.key);
                info!(key = %op.key, "removed from store");
            }
            OperationKind::RemoveLocal => {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.ledger.forget(&op.key);
                info!(key = %op.key, "removed locally");
            }
        }
        Ok(OperationOutcome::Succeeded)
    }

    /// Compares the store with the ledger for a guarded write. `Some` ends
    /// the operation without touching the store.
    async fn check_store(
        &self,
        op: &Operation,
        local: Option<&Checksum>,
    ) -> SyncResult<Option<OperationOutcome>> {
        let Some(policy) = op.guard else {
            return Ok(None);
        };
        let remote = match self.remote.fetch(&op.key).await {
            Ok(content) => Some(Checksum::of(&content)),
            Err(SyncError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let baseline = self.ledger.get(&op.key);

        let outcome = match check_guard(op, policy, local, remote.as_ref(), baseline.as_ref()) {
            Guard::Proceed => return Ok(None),
            Guard::Converged => {
                match local {
                    Some(checksum) => self.ledger.record(op.key.clone(), checksum.clone()),
                    None => self.ledger.forget(&op.key),
                }
                debug!(key = %op.key, "store already up to date");
                OperationOutcome::Skipped
            }
            Guard::Hold => {
                debug!(key = %op.key, "store copy kept");
                OperationOutcome::Skipped
            }
            Guard::Conflict(conflict) => {
                warn!(conflict = %conflict, "store changed since last sync");
                OperationOutcome::Conflicted(conflict)
            }
        };
        Ok(Some(outcome))
    }

    fn finish(&self, queued: Queued, outcome: OperationOutcome) {
        let report = OperationReport {
            key: queued.op.key,
            kind: queued.op.kind,
            sequence: queued.op.sequence,
            outcome,
            duration: queued.admitted.elapsed(),
        };
        self.publish(&report);
        let _ = queued.reply.send(report);
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Report for an operation that was never admitted.
    fn cancelled(&self, key: AssetKey, kind: OperationKind) -> OperationReport {
        let report = OperationReport {
            key,
            kind,
            sequence: 0,
            outcome: OperationOutcome::Cancelled,
            duration: Duration::ZERO,
        };
        self.publish(&report);
        report
    }

    fn publish(&self, report: &OperationReport) {
        if let Some(tx) = self.reports.lock().as_ref() {
            let _ = tx.send(report.clone());
        }
    }
}

/// Writes through a hidden sibling temp file so readers never see a
/// partial asset.
async fn write_atomically(path: &Path, content: &[u8]) -> SyncResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::config(format!("{} has no parent", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.themesync-tmp", name));
    tokio::fs::write(&tmp, content).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
