//! Assets and content checksums.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A relative, forward-slash separated path identifying one theme file.
///
/// Keys are normalized on construction: backslashes become `/`, `.` and
/// empty segments are dropped. Absolute keys and keys containing `..` are
/// rejected so that a key can never address a file outside the theme root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetKey(String);

impl AssetKey {
    /// Creates a key from a relative path string.
    pub fn new(key: impl AsRef<str>) -> ProtocolResult<Self> {
        let raw = key.as_ref().replace('\\', "/");

        if raw.starts_with('/') {
            return Err(ProtocolError::invalid_key(raw, "absolute path"));
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(ProtocolError::invalid_key(raw, "parent directory segment")),
                other => segments.push(other),
            }
        }

        if segments.is_empty() {
            return Err(ProtocolError::invalid_key(raw, "empty key"));
        }

        Ok(Self(segments.join("/")))
    }

    /// Derives the key for `path`, which must live under `root`.
    pub fn from_path(root: &Path, path: &Path) -> ProtocolResult<Self> {
        let relative = path
            .strip_prefix(root)
            .map_err(|_| ProtocolError::invalid_key(path.display().to_string(), "outside root"))?;

        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| {
                        ProtocolError::invalid_key(path.display().to_string(), "non UTF-8 path")
                    })?;
                    segments.push(part);
                }
                Component::CurDir => continue,
                _ => {
                    return Err(ProtocolError::invalid_key(
                        path.display().to_string(),
                        "unsupported path component",
                    ))
                }
            }
        }

        Self::new(segments.join("/"))
    }

    /// Resolves this key to a filesystem path under `root`.
    pub fn to_path(&self, root: &Path) -> PathBuf {
        self.segments().fold(root.to_path_buf(), |path, segment| path.join(segment))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the `/` separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Returns the final segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Returns true if any segment is a dotfile or dot-directory.
    pub fn is_hidden(&self) -> bool {
        self.segments().any(|segment| segment.starts_with('.'))
    }

    /// Returns true if this key equals `prefix` or lives under it.
    pub fn starts_with_dir(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_matches('/');
        self.0 == prefix
            || (self.0.len() > prefix.len()
                && self.0.starts_with(prefix)
                && self.0.as_bytes()[prefix.len()] == b'/')
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AssetKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for AssetKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AssetKey {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for AssetKey {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AssetKey> for String {
    fn from(key: AssetKey) -> Self {
        key.0
    }
}

/// Hex-encoded MD5 digest of an asset's content.
///
/// This is the fingerprint the remote store reports for every asset, so
/// local files are hashed the same way to compare without transferring bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    /// Computes the checksum of `content`.
    pub fn of(content: &[u8]) -> Self {
        Self(format!("{:x}", md5::compute(content)))
    }

    /// Parses a hex checksum, normalizing to lowercase.
    pub fn from_hex(hex: impl AsRef<str>) -> ProtocolResult<Self> {
        let hex = hex.as_ref().trim();
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidChecksum(hex.to_string()));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Returns the hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Checksum {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(value)
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        checksum.0
    }
}

/// Which side of the sync an asset record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetOrigin {
    /// A file in the local theme directory.
    Local,
    /// A record from the remote asset inventory.
    Remote,
}

/// One versioned theme file, local or remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Asset key.
    pub key: AssetKey,
    /// Content checksum, when known.
    pub checksum: Option<Checksum>,
    /// Content size in bytes.
    pub size: u64,
    /// Last modification time.
    pub updated_at: Option<DateTime<Utc>>,
    /// Local file or remote record.
    pub origin: AssetOrigin,
}

impl Asset {
    /// Describes a local file from its content.
    pub fn local(key: AssetKey, content: &[u8], updated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            key,
            checksum: Some(Checksum::of(content)),
            size: content.len() as u64,
            updated_at,
            origin: AssetOrigin::Local,
        }
    }

    /// Describes a remote record.
    pub fn remote(
        key: AssetKey,
        checksum: Option<Checksum>,
        size: u64,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key,
            checksum,
            size,
            updated_at,
            origin: AssetOrigin::Remote,
        }
    }

    /// Returns true if both assets share a key and a known, equal checksum.
    ///
    /// Timestamps and sizes are deliberately not consulted.
    pub fn in_sync_with(&self, other: &Asset) -> bool {
        self.key == other.key
            && matches!((&self.checksum, &other.checksum), (Some(a), Some(b)) if a == b)
    }
}
