//! Local inventory of the theme directory.

use crate::error::{SyncError, SyncResult};
use crate::ignore::IgnoreFilter;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use themesync_protocol::{Asset, AssetKey};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Local inventory keyed by asset key.
pub type Inventory = BTreeMap<AssetKey, Asset>;

/// Walks `root` and checksums every file the filter lets through.
///
/// Ignored directories are not descended into. Files that vanish during the
/// walk are skipped.
pub fn scan_blocking(root: &Path, filter: &IgnoreFilter) -> SyncResult<Inventory> {
    let mut inventory = Inventory::new();

    let walker = WalkDir::new(root)
        .follow_links(true)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| match AssetKey::from_path(root, entry.path()) {
            Ok(key) => !filter.is_ignored(&key),
            Err(_) => false,
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) => continue,
            Err(e) => return Err(SyncError::Io(std::io::Error::other(e))),
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let key = AssetKey::from_path(root, entry.path())?;
        match read_asset(root, &key)? {
            Some(asset) => {
                inventory.insert(key, asset);
            }
            None => warn!(key = %key, "file vanished during scan"),
        }
    }

    debug!(root = %root.display(), assets = inventory.len(), "local scan complete");
    Ok(inventory)
}

/// Runs [`scan_blocking`] on the blocking thread pool.
pub async fn scan(root: PathBuf, filter: Arc<IgnoreFilter>) -> SyncResult<Inventory> {
    tokio::task::spawn_blocking(move || scan_blocking(&root, &filter))
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
}

/// Reads one file and describes it; `None` if it does not exist.
pub fn read_asset(root: &Path, key: &AssetKey) -> SyncResult<Option<Asset>> {
    let path = key.to_path(root);
    let content = match std::fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        // A directory where a file was expected.
        Err(_) if path.is_dir() => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let modified = std::fs::metadata(&path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    Ok(Some(Asset::local(key.clone(), &content, modified)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use themesync_protocol::Checksum;

    fn write(root: &Path, key: &str, content: &[u8]) {
        let path = root.join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn scan_checksums_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "layout/theme.liquid", b"<html>");
        write(root, "assets/app.js", b"console.log(1)");

        let inventory = scan_blocking(root, &IgnoreFilter::default()).unwrap();
        assert_eq!(inventory.len(), 2);
        let theme = &inventory[&AssetKey::new("layout/theme.liquid").unwrap()];
        assert_eq!(theme.checksum, Some(Checksum::of(b"<html>")));
        assert_eq!(theme.size, 6);
        assert!(theme.updated_at.is_some());
    }

    #[test]
    fn scan_skips_ignored_and_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "assets/app.js", b"1");
        write(root, "assets/app.js.map", b"2");
        write(root, "node_modules/pkg/index.js", b"3");
        write(root, ".git/HEAD", b"ref");
        write(root, ".themesync/development.json", b"{}");

        let filter = IgnoreFilter::new(["*.map", "node_modules"]).unwrap();
        let inventory = scan_blocking(root, &filter).unwrap();
        let keys: Vec<&str> = inventory.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["assets/app.js"]);
    }

    #[test]
    fn read_missing_asset() {
        let dir = tempfile::tempdir().unwrap();
        let key = AssetKey::new("snippets/none.liquid").unwrap();
        assert!(read_asset(dir.path(), &key).unwrap().is_none());
    }

    #[tokio::test]
    async fn async_scan() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "config/settings_schema.json", b"[]");
        let inventory = scan(dir.path().to_path_buf(), Arc::new(IgnoreFilter::default()))
            .await
            .unwrap();
        assert_eq!(inventory.len(), 1);
    }
}
