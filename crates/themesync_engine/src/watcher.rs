//! Filesystem watching with per-key debouncing.
//!
//! Raw notifications come from `notify` on its own thread and are pushed
//! into a bounded channel. A debounce task folds bursts for the same key
//! into one [`ChangeEvent`] and releases it once the key has been quiet for
//! the debounce window. Keys that settle together are delivered as one
//! batch. When native notifications are unavailable the watcher falls back
//! to stat polling.

use crate::config::Configuration;
use crate::error::{SyncError, SyncResult};
use crate::ignore::IgnoreFilter;
use notify::event::ModifyKind;
use notify::{EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use themesync_protocol::{AssetKey, ChangeEvent, ChangeKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One undebounced notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    /// Affected key.
    pub key: AssetKey,
    /// Observed kind.
    pub kind: ChangeKind,
}

impl RawChange {
    /// Creates a notification.
    pub fn new(key: AssetKey, kind: ChangeKind) -> Self {
        Self { key, kind }
    }
}

#[derive(Debug)]
struct Pending {
    kind: ChangeKind,
    first_seen: Instant,
    last_seen: Instant,
    observed_at: SystemTime,
}

/// Folds notifications per key until the key goes quiet.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<AssetKey, Pending>,
}

impl Debouncer {
    /// Creates a debouncer with the given quiet window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Records a notification; the latest kind wins.
    pub fn push(&mut self, change: RawChange, now: Instant) {
        let observed_at = SystemTime::now();
        self.pending
            .entry(change.key)
            .and_modify(|p| {
                p.kind = change.kind;
                p.last_seen = now;
                p.observed_at = observed_at;
            })
            .or_insert(Pending {
                kind: change.kind,
                first_seen: now,
                last_seen: now,
                observed_at,
            });
    }

    /// Removes and returns every key that has been quiet for the window.
    ///
    /// Removals come after everything else, so a rename yields the new key
    /// before the old one. Within each group the oldest key comes first.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let window = self.window;
        self.drain_where(|p| p.last_seen + window <= now)
    }

    /// Removes and returns everything pending.
    pub fn drain_all(&mut self) -> Vec<ChangeEvent> {
        self.drain_where(|_| true)
    }

    fn drain_where(&mut self, ready: impl Fn(&Pending) -> bool) -> Vec<ChangeEvent> {
        let keys: Vec<AssetKey> = self
            .pending
            .iter()
            .filter(|(_, p)| ready(p))
            .map(|(k, _)| k.clone())
            .collect();

        let mut drained: Vec<(Instant, ChangeEvent)> = keys
            .into_iter()
            .filter_map(|key| {
                let p = self.pending.remove(&key)?;
                Some((p.first_seen, ChangeEvent::at(key, p.kind, p.observed_at)))
            })
            .collect();
        drained.sort_by(|(a, ea), (b, eb)| {
            ea.kind
                .is_removal()
                .cmp(&eb.kind.is_removal())
                .then_with(|| a.cmp(b))
                .then_with(|| ea.key.cmp(&eb.key))
        });
        drained.into_iter().map(|(_, e)| e).collect()
    }

    /// When the next key becomes ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.last_seen + self.window)
            .min()
    }

    /// Number of keys waiting.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Settings for [`watch`].
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Quiet window per key.
    pub debounce: Duration,
    /// Stat interval of the polling fallback.
    pub poll_interval: Duration,
    /// Capacity of the raw and debounced channels.
    pub capacity: usize,
    /// Skips native notifications and polls.
    pub force_poll: bool,
}

impl WatchOptions {
    /// Takes the watch settings from `config`.
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            debounce: config.debounce,
            poll_interval: config.poll_interval,
            capacity: config.pool.queue_capacity,
            force_poll: false,
        }
    }

    /// Forces the polling watcher.
    pub fn with_force_poll(mut self, force_poll: bool) -> Self {
        self.force_poll = force_poll;
        self
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(400),
            poll_interval: Duration::from_secs(1),
            capacity: 512,
            force_poll: false,
        }
    }
}

/// Stream of debounced change events.
#[derive(Debug)]
pub struct WatchStream {
    batches: mpsc::Receiver<Vec<ChangeEvent>>,
    buffered: VecDeque<ChangeEvent>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchStream {
    /// Waits for the next event; `None` once the watcher has stopped.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            if let Some(event) = self.buffered.pop_front() {
                return Some(event);
            }
            self.buffered.extend(self.batches.recv().await?);
        }
    }

    /// Waits for the next batch of keys that settled together, in the
    /// debouncer's drain order; `None` once the watcher has stopped.
    pub async fn next_batch(&mut self) -> Option<Vec<ChangeEvent>> {
        if !self.buffered.is_empty() {
            return Some(self.buffered.drain(..).collect());
        }
        self.batches.recv().await
    }

    /// Stops watching and waits for the debounce task to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "debounce task failed");
        }
    }
}

/// Debounces `raw` into a [`WatchStream`].
///
/// Stops when `token` is cancelled or when `raw` closes; in the latter case
/// everything still pending is flushed first.
pub fn spawn_debounce(
    raw: mpsc::Receiver<RawChange>,
    debounce: Duration,
    capacity: usize,
    token: CancellationToken,
) -> WatchStream {
    spawn_with_source(raw, debounce, capacity, token, None)
}

fn spawn_with_source(
    mut raw: mpsc::Receiver<RawChange>,
    debounce: Duration,
    capacity: usize,
    token: CancellationToken,
    source: Option<Box<dyn Watcher + Send>>,
) -> WatchStream {
    let (tx, batches) = mpsc::channel::<Vec<ChangeEvent>>(capacity.max(1));
    let task_token = token.clone();

    let task = tokio::spawn(async move {
        // Dropping the watcher stops notifications.
        let _source = source;
        let mut debouncer = Debouncer::new(debounce);

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                _ = task_token.cancelled() => break,
                change = raw.recv() => match change {
                    Some(change) => debouncer.push(change, Instant::now()),
                    None => {
                        let rest = debouncer.drain_all();
                        if !rest.is_empty() && tx.send(rest).await.is_err() {
                            return;
                        }
                        break;
                    }
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    let settled = debouncer.drain_ready(Instant::now());
                    if settled.is_empty() {
                        continue;
                    }
                    for event in &settled {
                        debug!(key = %event.key, kind = ?event.kind, "change settled");
                    }
                    if tx.send(settled).await.is_err() {
                        return;
                    }
                }
            }
        }
        debug!(pending = debouncer.len(), "debounce task stopped");
    });

    WatchStream {
        batches,
        buffered: VecDeque::new(),
        token,
        task,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Maps one notify event to per-key changes.
///
/// Renames are reported as a removal of the old path and a creation of the
/// new one, decided by whether the path still exists.
fn map_event(root: &Path, filter: &IgnoreFilter, event: &notify::Event) -> Vec<RawChange> {
    let mut changes = Vec::new();
    for path in &event.paths {
        let kind = match &event.kind {
            EventKind::Create(_) => ChangeKind::Created,
            EventKind::Remove(_) => ChangeKind::Removed,
            EventKind::Modify(ModifyKind::Name(_)) => {
                if path.exists() {
                    ChangeKind::Created
                } else {
                    ChangeKind::Removed
                }
            }
            EventKind::Modify(_) => ChangeKind::Modified,
            _ => continue,
        };
        if !kind.is_removal() && path.is_dir() {
            continue;
        }
        let Ok(key) = AssetKey::from_path(root, path) else {
            continue;
        };
        if filter.is_ignored(&key) {
            continue;
        }
        changes.push(RawChange::new(key, kind));
    }
    changes
}

/// Watches `root` recursively.
///
/// Ignored paths never reach the stream. The watcher runs until `token` is
/// cancelled or [`WatchStream::shutdown`] is called.
pub fn watch(
    root: impl Into<PathBuf>,
    filter: Arc<IgnoreFilter>,
    options: &WatchOptions,
    token: CancellationToken,
) -> SyncResult<WatchStream> {
    let root = root.into();
    let (raw_tx, raw_rx) = mpsc::channel::<RawChange>(options.capacity.max(1));

    let make_handler = || {
        let tx = raw_tx.clone();
        let root = root.clone();
        let filter = Arc::clone(&filter);
        move |result: notify::Result<notify::Event>| match result {
            Ok(event) => {
                for change in map_event(&root, &filter, &event) {
                    // Runs on the notify thread, outside the runtime.
                    if tx.blocking_send(change).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "watch error"),
        }
    };

    let native = if options.force_poll {
        None
    } else {
        match RecommendedWatcher::new(make_handler(), notify::Config::default()) {
            Ok(mut watcher) => match watcher.watch(&root, RecursiveMode::Recursive) {
                Ok(()) => Some(Box::new(watcher) as Box<dyn Watcher + Send>),
                Err(e) => {
                    warn!(error = %e, "native watch failed, falling back to polling");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "native watcher unavailable, falling back to polling");
                None
            }
        }
    };

    let source = match native {
        Some(watcher) => {
            info!(root = %root.display(), "watching for changes");
            watcher
        }
        None => {
            let config = notify::Config::default().with_poll_interval(options.poll_interval);
            let mut watcher = PollWatcher::new(make_handler(), config)
                .map_err(|e| SyncError::Watch(e.to_string()))?;
            watcher
                .watch(&root, RecursiveMode::Recursive)
                .map_err(|e| SyncError::Watch(format!("{}: {}", root.display(), e)))?;
            info!(
                root = %root.display(),
                interval_ms = options.poll_interval.as_millis() as u64,
                "polling for changes"
            );
            Box::new(watcher)
        }
    };
    drop(raw_tx);

    Ok(spawn_with_source(
        raw_rx,
        options.debounce,
        options.capacity,
        token,
        Some(source),
    ))
}
