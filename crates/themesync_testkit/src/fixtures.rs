//! Temporary theme directories and test configurations.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use themesync_engine::{Configuration, RetryConfig, ThemeId};

/// Password accepted by [`crate::FakeStore::new`] in most tests.
pub const TEST_PASSWORD: &str = "shpat_test";

/// Domain used by test configurations.
pub const TEST_DOMAIN: &str = "test-shop.myshopify.com";

/// Base URL routed to the loopback store.
pub const TEST_ENDPOINT: &str = "http://fake-store.test";

/// A theme directory with automatic cleanup.
pub struct ThemeDir {
    dir: TempDir,
    root: PathBuf,
}

impl ThemeDir {
    /// Creates an empty theme directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let root = dir
            .path()
            .canonicalize()
            .expect("Failed to canonicalize temp directory");
        Self { dir, root }
    }

    /// Adds a file.
    pub fn with_file(self, key: &str, content: impl AsRef<[u8]>) -> Self {
        self.write(key, content);
        self
    }

    /// Canonical root of the theme.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `key` under the root.
    pub fn path(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Writes `key`, creating parent directories.
    pub fn write(&self, key: &str, content: impl AsRef<[u8]>) {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(&path, content).expect("Failed to write theme file");
    }

    /// Reads `key` if it exists.
    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path(key)).ok()
    }

    /// Reads `key` as UTF-8 if it exists.
    pub fn read_string(&self, key: &str) -> Option<String> {
        self.read(key).and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Returns true if `key` exists.
    pub fn exists(&self, key: &str) -> bool {
        self.path(key).exists()
    }

    /// Deletes `key`.
    pub fn remove(&self, key: &str) {
        std::fs::remove_file(self.path(key)).expect("Failed to remove theme file");
    }

    /// Renames `from` to `to`.
    pub fn rename(&self, from: &str, to: &str) {
        let target = self.path(to);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::rename(self.path(from), target).expect("Failed to rename theme file");
    }

    /// Configuration for `environment` pointing at this directory and the
    /// loopback store, tuned for fast tests.
    pub fn config(&self, environment: &str) -> Configuration {
        test_config(&self.root, environment)
    }

    /// The temporary directory.
    pub fn temp_dir(&self) -> &TempDir {
        &self.dir
    }
}

impl Default for ThemeDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for theme 1 of the test store, rooted at `root`.
///
/// Retries are fast and jitter-free, debouncing is short and the
/// client-side rate limit is off unless a test enables it.
pub fn test_config(root: &Path, environment: &str) -> Configuration {
    Configuration::new(
        environment,
        TEST_PASSWORD,
        TEST_DOMAIN,
        ThemeId::Id(1),
        root,
    )
    .with_endpoint(TEST_ENDPOINT)
    .with_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false),
    )
    .without_rate_limit()
    .with_timeout(Duration::from_secs(5))
    .with_debounce(Duration::from_millis(50))
    .with_poll_interval(Duration::from_millis(50))
}
