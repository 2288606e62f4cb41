//! Per-environment sync sessions.
//!
//! A session owns one configuration, one remote client and one worker pool.
//! One-shot commands reconcile once and terminate; watch mode reconciles,
//! then turns every settled filesystem change into an operation until the
//! session token is cancelled. Unless forced, watch-mode writes are guarded
//! so that a store edit made after the last sync is reported, not
//! overwritten.

use crate::config::Configuration;
use crate::differ::{plan_change, plan_removal, reconcile, DiffOptions, Reconciliation};
use crate::error::{SyncError, SyncResult};
use crate::http::ReqwestClient;
use crate::ignore::IgnoreFilter;
use crate::ledger::Ledger;
use crate::local;
use crate::policy::PolicyClient;
use crate::pool::{OperationOutcome, OperationReport, WorkerPool};
use crate::state::{SessionEvent, SessionState, SessionSummary};
use crate::transport::{HttpTransport, RemoteClient};
use crate::watcher::{self, WatchOptions};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use themesync_protocol::{
    AssetKey, BaselinePolicy, ChangeEvent, Checksum, Operation, SyncDirection,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What a session was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Push local content.
    Upload,
    /// Pull remote content.
    Download,
    /// Push everything and delete remote-only assets.
    Replace,
    /// Delete the named keys on both sides.
    Remove,
    /// Push, then keep pushing local changes until cancelled.
    Watch,
}

/// Options of one invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Command.
    pub command: Command,
    /// Reconciliation direction.
    pub direction: SyncDirection,
    /// Let the authoritative side win every divergence.
    pub force: bool,
    /// Keys or directory prefixes to restrict to; the keys to delete for
    /// [`Command::Remove`].
    pub files: Vec<String>,
    /// Touched whenever watch mode goes idle.
    pub notify_file: Option<PathBuf>,
    /// Tie-break for divergent keys that were never synced.
    pub baseline_policy: BaselinePolicy,
}

impl Invocation {
    fn new(command: Command, direction: SyncDirection) -> Self {
        Self {
            command,
            direction,
            force: false,
            files: Vec::new(),
            notify_file: None,
            baseline_policy: BaselinePolicy::default(),
        }
    }

    /// Pushes local content.
    pub fn upload() -> Self {
        Self::new(Command::Upload, SyncDirection::Push)
    }

    /// Pulls remote content.
    pub fn download() -> Self {
        Self::new(Command::Download, SyncDirection::Pull)
    }

    /// Makes the remote an exact copy of the local directory.
    pub fn replace() -> Self {
        Self::new(Command::Replace, SyncDirection::PushAndRemove)
    }

    /// Deletes `keys` remotely and locally.
    pub fn remove<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Command::Remove, SyncDirection::PushAndRemove)
            .with_files(keys.into_iter().map(Into::into).collect())
    }

    /// Pushes, then watches.
    pub fn watch() -> Self {
        Self::new(Command::Watch, SyncDirection::Push)
    }

    /// Overrides the direction, e.g. `PullAndRemove` for a mirroring download.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Sets `force`.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Restricts the invocation to `files`.
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    /// Sets the idle notification file.
    pub fn with_notify_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.notify_file = Some(path.into());
        self
    }

    /// Sets the baseline policy.
    pub fn with_baseline_policy(mut self, policy: BaselinePolicy) -> Self {
        self.baseline_policy = policy;
        self
    }

    /// Returns true for [`Command::Watch`].
    pub fn is_watch(&self) -> bool {
        self.command == Command::Watch
    }

    /// Differ options for this invocation.
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions::new(self.direction)
            .with_force(self.force)
            .with_policy(self.baseline_policy)
            .with_scope(self.files.clone())
    }
}

/// Everything a running session needs after initialization.
struct Context {
    filter: Arc<IgnoreFilter>,
    ledger: Arc<Ledger>,
    pool: WorkerPool,
    reports: mpsc::UnboundedReceiver<OperationReport>,
}

/// One environment's sync run.
pub struct Session {
    config: Arc<Configuration>,
    remote: Arc<dyn RemoteClient>,
    invocation: Invocation,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    state: RwLock<SessionState>,
}

impl Session {
    /// Creates a session over an existing remote client.
    pub fn new(
        config: Configuration,
        remote: Arc<dyn RemoteClient>,
        invocation: Invocation,
    ) -> Self {
        Self {
            config: Arc::new(config),
            remote,
            invocation,
            events: None,
            state: RwLock::new(SessionState::Initializing),
        }
    }

    /// Creates a session talking to the store over HTTPS.
    pub fn connect(config: Configuration, invocation: Invocation) -> SyncResult<Self> {
        let client = PolicyClient::from_config(ReqwestClient::new(&config)?, &config);
        let transport = HttpTransport::new(&config, client);
        Ok(Self::new(config, Arc::new(transport), invocation))
    }

    /// Sends progress events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Environment name.
    pub fn environment(&self) -> &str {
        &self.config.environment
    }

    /// The session's configuration.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, next: SessionState) {
        let previous = {
            let mut state = self.state.write();
            let previous = *state;
            if previous == next {
                return;
            }
            *state = next;
            previous
        };
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "unexpected state transition");
        }
        debug!(from = %previous, to = %next, "state changed");
        self.emit(SessionEvent::StateChanged {
            environment: self.config.environment.clone(),
            state: next,
        });
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Runs the session to completion.
    ///
    /// Returns the summary unless a fatal error aborted the run. Cancelling
    /// `token` ends watch mode and stops admitting work in one-shot mode.
    pub async fn run(&self, token: CancellationToken) -> SyncResult<SessionSummary> {
        let span = info_span!("session", environment = %self.config.environment);
        self.run_inner(token).instrument(span).await
    }

    async fn run_inner(&self, token: CancellationToken) -> SyncResult<SessionSummary> {
        let started = Instant::now();
        let mut summary = SessionSummary::new(self.config.environment.clone());

        let mut ctx = match self.initialize(&token) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "session failed to start");
                self.set_state(SessionState::Failed);
                return Err(e);
            }
        };

        let result = if self.invocation.is_watch() {
            self.run_watch(&mut ctx, &mut summary, &token).await
        } else {
            self.run_once(&mut ctx, &mut summary).await
        };

        while let Ok(report) = ctx.reports.try_recv() {
            self.on_report(&mut summary, report);
        }
        if let Err(e) = ctx.ledger.save() {
            warn!(error = %e, "could not save ledger");
        }
        summary.duration = started.elapsed();

        let result = result.and_then(|()| match ctx.pool.fatal_error() {
            Some(fatal) => Err(fatal),
            None => Ok(()),
        });
        match result {
            Ok(()) => {
                self.set_state(SessionState::Terminated);
                info!(summary = %summary, "session finished");
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "session aborted");
                self.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    fn initialize(&self, token: &CancellationToken) -> SyncResult<Context> {
        let filter = Arc::new(IgnoreFilter::from_config(&self.config)?);
        let ledger = Arc::new(Ledger::open(&self.config.ledger_path)?);
        let (tx, reports) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            Arc::clone(&self.remote),
            self.config.directory.clone(),
            Arc::clone(&ledger),
            self.config.pool.clone(),
            token.child_token(),
        )
        .with_reports(tx);
        info!(
            directory = %self.config.directory.display(),
            theme = %self.config.theme_id,
            rules = filter.len(),
            synced = ledger.len(),
            "session initialized"
        );
        Ok(Context {
            filter,
            ledger,
            pool,
            reports,
        })
    }

    async fn plan(&self, ctx: &Context) -> SyncResult<Reconciliation> {
        if self.invocation.command == Command::Remove {
            if self.invocation.files.is_empty() {
                return Err(SyncError::config("no files to remove"));
            }
            let keys = self
                .invocation
                .files
                .iter()
                .map(AssetKey::new)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(plan_removal(&keys, &ctx.filter));
        }

        let (local, remote) = tokio::try_join!(
            local::scan(self.config.directory.clone(), Arc::clone(&ctx.filter)),
            self.remote.list(),
        )?;
        let plan = reconcile(
            &local,
            &remote,
            &ctx.filter,
            &ctx.ledger,
            &self.invocation.diff_options(),
        );
        // Keys already identical on both sides count as synced from here on.
        let adopted = ctx.ledger.adopt(&local, &remote);
        info!(
            local = local.len(),
            remote = remote.len(),
            transfers = plan.transfers.len(),
            removals = plan.removals.len(),
            conflicts = plan.conflicts.len(),
            skipped = plan.skipped.len(),
            adopted,
            "reconciled"
        );
        Ok(plan)
    }

    /// Plans, then executes the plan while forwarding reports.
    async fn reconcile_and_apply(
        &self,
        ctx: &mut Context,
        summary: &mut SessionSummary,
        executing: SessionState,
    ) -> SyncResult<()> {
        self.set_state(SessionState::Reconciling);
        let plan = self.plan(ctx).await?;
        for conflict in &plan.conflicts {
            warn!(conflict = %conflict, "conflict left unresolved");
            self.emit(SessionEvent::Conflict(conflict.clone()));
        }
        summary.conflicts.extend(plan.conflicts.iter().cloned());

        self.set_state(executing);
        let pool = ctx.pool.clone();
        let batch = pool.run_batch(&plan);
        tokio::pin!(batch);
        loop {
            tokio::select! {
                _ = &mut batch => break,
                Some(report) = ctx.reports.recv() => self.on_report(summary, report),
            }
        }
        Ok(())
    }

    async fn run_once(&self, ctx: &mut Context, summary: &mut SessionSummary) -> SyncResult<()> {
        self.reconcile_and_apply(ctx, summary, SessionState::Processing)
            .await
    }

    async fn run_watch(
        &self,
        ctx: &mut Context,
        summary: &mut SessionSummary,
        token: &CancellationToken,
    ) -> SyncResult<()> {
        // Started first so that edits made during the initial pass are seen.
        let mut stream = watcher::watch(
            self.config.directory.clone(),
            Arc::clone(&ctx.filter),
            &WatchOptions::from_config(&self.config),
            token.child_token(),
        )?;

        let result = self.watch_loop(ctx, summary, token, &mut stream).await;

        self.set_state(SessionState::ShuttingDown);
        stream.shutdown().await;
        if !ctx.pool.shutdown(self.config.timeout).await {
            warn!("in-flight operations did not finish before the timeout");
        }
        result
    }

    async fn watch_loop(
        &self,
        ctx: &mut Context,
        summary: &mut SessionSummary,
        token: &CancellationToken,
        stream: &mut watcher::WatchStream,
    ) -> SyncResult<()> {
        self.reconcile_and_apply(ctx, summary, SessionState::Reconciling)
            .await?;
        self.go_idle(ctx);

        let mut outstanding = ctx.pool.subscribe_outstanding();
        loop {
            if ctx.pool.is_stopped() {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    info!("cancelled, shutting down");
                    break;
                }
                batch = stream.next_batch() => match batch {
                    Some(batch) => {
                        if let Err(e) = self.handle_batch(ctx, batch).await {
                            debug!(error = %e, "stopped admitting changes");
                            break;
                        }
                    }
                    None => {
                        warn!("watcher stopped");
                        break;
                    }
                },
                Some(report) = ctx.reports.recv() => self.on_report(summary, report),
                changed = outstanding.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let idle = *outstanding.borrow_and_update() == 0;
                    if idle && self.state() == SessionState::Processing {
                        while let Ok(report) = ctx.reports.try_recv() {
                            self.on_report(summary, report);
                        }
                        self.go_idle(ctx);
                    }
                }
            }
        }
        Ok(())
    }

    /// Submits the operations for keys that settled together.
    ///
    /// Remote deletions wait until the batch's uploads are reported, so a
    /// renamed asset exists in the store under one of its names throughout.
    async fn handle_batch(&self, ctx: &Context, batch: Vec<ChangeEvent>) -> SyncResult<()> {
        let mut uploads = Vec::new();
        let mut removals = Vec::new();
        for event in &batch {
            let Some(op) = self.plan_event(ctx, event).await else {
                continue;
            };
            debug!(op = %op, "change detected");
            if op.kind.is_removal() {
                removals.push(op);
            } else {
                uploads.push(op);
            }
        }
        if uploads.is_empty() && removals.is_empty() {
            return Ok(());
        }
        self.set_state(SessionState::Processing);

        let mut pending = Vec::with_capacity(uploads.len());
        for op in uploads {
            pending.push(ctx.pool.submit(op).await?);
        }
        if removals.is_empty() {
            return Ok(());
        }
        for rx in pending {
            // A dropped reply means the pool stopped; submit reports why.
            let _ = rx.await;
        }
        for op in removals {
            ctx.pool.submit(op).await?;
        }
        Ok(())
    }

    async fn plan_event(&self, ctx: &Context, event: &ChangeEvent) -> Option<Operation> {
        let path = event.key.to_path(&self.config.directory);
        let current = match tokio::fs::read(&path).await {
            Ok(content) => Some(Checksum::of(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(key = %event.key, error = %e, "could not read changed file");
                return None;
            }
        };
        let op = plan_change(event, current, &ctx.ledger)?;
        if self.invocation.force {
            Some(op)
        } else {
            Some(op.guarded(self.invocation.baseline_policy))
        }
    }

    fn go_idle(&self, ctx: &Context) {
        self.set_state(SessionState::Idle);
        if let Err(e) = ctx.ledger.save() {
            warn!(error = %e, "could not save ledger");
        }
        if let Some(path) = &self.invocation.notify_file {
            if let Err(e) = touch(path) {
                warn!(path = %path.display(), error = %e, "could not touch notify file");
            }
        }
        self.emit(SessionEvent::Idle {
            environment: self.config.environment.clone(),
        });
    }

    fn on_report(&self, summary: &mut SessionSummary, report: OperationReport) {
        summary.record(&report);
        if let OperationOutcome::Conflicted(conflict) = &report.outcome {
            self.emit(SessionEvent::Conflict(conflict.clone()));
        }
        self.emit(SessionEvent::Operation(report));
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.set_modified(SystemTime::now())
}

/// Runs one session per environment concurrently.
///
/// Each session gets a child of `token`, so cancelling it stops them all.
/// Results are sorted by environment name.
pub async fn run_all(
    sessions: Vec<Session>,
    token: CancellationToken,
) -> Vec<(String, SyncResult<SessionSummary>)> {
    let handles: Vec<_> = sessions
        .into_iter()
        .map(|session| {
            let environment = session.environment().to_string();
            let child = token.child_token();
            let handle = tokio::spawn(async move { session.run(child).await });
            (environment, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (environment, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Task(e.to_string())),
        };
        results.push((environment, result));
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}
