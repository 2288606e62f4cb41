//! Last-synced checksums.
//!
//! The ledger remembers, per key, the checksum both sides last agreed on.
//! The differ uses it to tell which side changed when checksums diverge.

use crate::error::{SyncError, SyncResult};
use crate::local::Inventory;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use themesync_protocol::{AssetKey, Checksum};
use tracing::debug;

const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    updated_at: DateTime<Utc>,
    assets: BTreeMap<AssetKey, Checksum>,
}

/// Key to checksum map persisted as JSON.
#[derive(Debug)]
pub struct Ledger {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<AssetKey, Checksum>>,
}

impl Ledger {
    /// Opens the ledger at `path`; a missing file yields an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> SyncResult<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => {
                let file: LedgerFile = serde_json::from_slice(&bytes).map_err(|e| {
                    SyncError::Ledger(format!("{} is not a valid ledger: {}", path.display(), e))
                })?;
                if file.version != LEDGER_VERSION {
                    return Err(SyncError::Ledger(format!(
                        "{} has unsupported version {}",
                        path.display(),
                        file.version
                    )));
                }
                file.assets
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "ledger opened");
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// Creates a ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Location on disk, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Last-synced checksum of `key`.
    pub fn get(&self, key: &AssetKey) -> Option<Checksum> {
        self.entries.lock().get(key).cloned()
    }

    /// Records that both sides now hold `checksum` for `key`.
    pub fn record(&self, key: AssetKey, checksum: Checksum) {
        self.entries.lock().insert(key, checksum);
    }

    /// Forgets `key`, after it was removed from both sides.
    pub fn forget(&self, key: &AssetKey) {
        self.entries.lock().remove(key);
    }

    /// Records a baseline for every key both inventories hold with the
    /// same checksum and the ledger has no entry for. Returns the number
    /// of keys adopted.
    pub fn adopt(&self, local: &Inventory, remote: &Inventory) -> usize {
        let mut entries = self.entries.lock();
        let mut adopted = 0;
        for (key, asset) in local {
            if entries.contains_key(key) {
                continue;
            }
            let Some(checksum) = &asset.checksum else {
                continue;
            };
            if remote.get(key).is_some_and(|r| asset.in_sync_with(r)) {
                entries.insert(key.clone(), checksum.clone());
                adopted += 1;
            }
        }
        adopted
    }

    /// Copy of all entries.
    pub fn snapshot(&self) -> BTreeMap<AssetKey, Checksum> {
        self.entries.lock().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing has been synced yet.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Writes the ledger atomically (temp file, then rename).
    pub fn save(&self) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = LedgerFile {
            version: LEDGER_VERSION,
            updated_at: Utc::now(),
            assets: self.snapshot(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| SyncError::Ledger(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), entries = file.assets.len(), "ledger saved");
        Ok(())
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> AssetKey {
        AssetKey::new(s).unwrap()
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("nope.json")).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".themesync").join("development.json");

        let ledger = Ledger::open(&path).unwrap();
        ledger.record(key("layout/theme.liquid"), Checksum::of(b"a"));
        ledger.record(key("assets/app.js"), Checksum::of(b"b"));
        ledger.forget(&key("assets/app.js"));
        ledger.save().unwrap();

        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(
            reopened.get(&key("layout/theme.liquid")),
            Some(Checksum::of(b"a"))
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(Ledger::open(&path), Err(SyncError::Ledger(_))));
    }

    #[test]
    fn adopts_only_unrecorded_identical_keys() {
        use themesync_protocol::Asset;

        let inventory = |entries: &[(&str, &str)]| -> Inventory {
            entries
                .iter()
                .map(|(k, c)| (key(k), Asset::local(key(k), c.as_bytes(), None)))
                .collect()
        };
        let local = inventory(&[("a.liquid", "same"), ("b.liquid", "mine"), ("c.liquid", "new")]);
        let remote = inventory(&[("a.liquid", "same"), ("b.liquid", "theirs"), ("d.liquid", "x")]);

        let ledger = Ledger::in_memory();
        assert_eq!(ledger.adopt(&local, &remote), 1);
        assert_eq!(ledger.get(&key("a.liquid")), Some(Checksum::of(b"same")));
        assert!(ledger.get(&key("b.liquid")).is_none());

        // Existing baselines are kept.
        let ledger = Ledger::in_memory();
        ledger.record(key("a.liquid"), Checksum::of(b"older"));
        assert_eq!(ledger.adopt(&local, &remote), 0);
        assert_eq!(ledger.get(&key("a.liquid")), Some(Checksum::of(b"older")));
    }

    #[test]
    fn in_memory_save_is_noop() {
        let ledger = Ledger::in_memory();
        ledger.record(key("a.liquid"), Checksum::of(b""));
        ledger.save().unwrap();
        assert!(ledger.path().is_none());
        assert_eq!(ledger.snapshot().len(), 1);
    }
}
