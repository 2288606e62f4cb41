//! Ignore rules deciding which paths take part in a sync.
//!
//! Three entry forms are understood:
//!
//! - `/regex/`: a regular expression matched against the whole key.
//! - glob patterns (`*`, `?`, `[...]`, `**`): without a `/` the pattern is
//!   matched against every path segment, with a `/` against the key and each
//!   of its parent directories.
//! - anything else is a literal, either a name matching any segment, or a
//!   `dir/name` path matching that key or anything beneath it.
//!
//! Hidden files and directories are always ignored, as are the engine's own
//! files (ignore files, ledger directory).

use crate::config::{Configuration, LEDGER_DIR};
use crate::error::{SyncError, SyncResult};
use glob::{MatchOptions, Pattern};
use regex::Regex;
use std::path::Path;
use themesync_protocol::AssetKey;
use tracing::debug;

const SEGMENT_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
enum Rule {
    Regex(Regex),
    SegmentGlob(Pattern),
    PathGlob(Pattern),
    SegmentLiteral(String),
    PathLiteral(String),
}

impl Rule {
    fn parse(entry: &str) -> SyncResult<Self> {
        let invalid = |reason: String| SyncError::IgnoreRule {
            pattern: entry.to_string(),
            reason,
        };

        if entry.len() > 2 && entry.starts_with('/') && entry.ends_with('/') {
            let source = &entry[1..entry.len() - 1];
            return Regex::new(source)
                .map(Rule::Regex)
                .map_err(|e| invalid(e.to_string()));
        }

        let trimmed = entry.trim_matches('/');
        if trimmed.is_empty() {
            return Err(invalid("empty pattern".to_string()));
        }

        let is_glob = trimmed.contains(['*', '?', '[', ']']);
        let has_separator = trimmed.contains('/');
        match (is_glob, has_separator) {
            (true, false) => Pattern::new(trimmed)
                .map(Rule::SegmentGlob)
                .map_err(|e| invalid(e.msg.to_string())),
            (true, true) => Pattern::new(trimmed)
                .map(Rule::PathGlob)
                .map_err(|e| invalid(e.msg.to_string())),
            (false, false) => Ok(Rule::SegmentLiteral(trimmed.to_string())),
            (false, true) => Ok(Rule::PathLiteral(trimmed.to_string())),
        }
    }

    fn matches(&self, key: &AssetKey) -> bool {
        match self {
            Rule::Regex(regex) => regex.is_match(key.as_str()),
            Rule::SegmentGlob(pattern) => key
                .segments()
                .any(|segment| pattern.matches_with(segment, SEGMENT_MATCH)),
            Rule::PathGlob(pattern) => {
                prefixes(key.as_str()).any(|prefix| pattern.matches_with(prefix, PATH_MATCH))
            }
            Rule::SegmentLiteral(name) => key.segments().any(|segment| segment == name),
            Rule::PathLiteral(path) => key.starts_with_dir(path),
        }
    }
}

/// Yields `a`, `a/b`, `a/b/c` for key `a/b/c`.
fn prefixes(key: &str) -> impl Iterator<Item = &str> {
    key.match_indices('/')
        .map(move |(i, _)| &key[..i])
        .chain(std::iter::once(key))
}

/// Compiled, immutable set of ignore rules.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFilter {
    rules: Vec<Rule>,
    internal: Vec<String>,
}

impl IgnoreFilter {
    /// Compiles a list of entries. Blank lines and `#` comments are skipped.
    pub fn new<I, S>(entries: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        filter.extend(entries)?;
        Ok(filter)
    }

    /// Builds the filter for a session.
    ///
    /// Ignore file paths in the configuration are already absolute. With
    /// `no_ignore` only the built-in exclusions apply.
    pub fn from_config(config: &Configuration) -> SyncResult<Self> {
        let mut filter = Self::default().with_internal(LEDGER_DIR);

        for path in &config.ignores {
            if let Ok(relative) = path.strip_prefix(&config.directory) {
                if let Ok(key) = AssetKey::from_path(Path::new(""), relative) {
                    filter = filter.with_internal(key.as_str());
                }
            }
        }
        if let Ok(relative) = config.ledger_path.strip_prefix(&config.directory) {
            if let Ok(key) = AssetKey::from_path(Path::new(""), relative) {
                filter = filter.with_internal(key.as_str());
            }
        }

        if config.no_ignore {
            debug!(environment = %config.environment, "configured ignore rules disabled");
            return Ok(filter);
        }

        filter.extend(&config.ignored_files)?;
        for path in &config.ignores {
            let contents = std::fs::read_to_string(path).map_err(|e| SyncError::IgnoreRule {
                pattern: path.display().to_string(),
                reason: e.to_string(),
            })?;
            filter.extend(contents.lines())?;
        }
        debug!(
            environment = %config.environment,
            rules = filter.rules.len(),
            "ignore rules loaded"
        );
        Ok(filter)
    }

    fn extend<I, S>(&mut self, entries: I) -> SyncResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            self.rules.push(Rule::parse(entry)?);
        }
        Ok(())
    }

    /// Always ignores `key` and anything beneath it, regardless of `no_ignore`.
    pub fn with_internal(mut self, key: impl Into<String>) -> Self {
        let key = key.into().trim_matches('/').to_string();
        if !key.is_empty() && !self.internal.contains(&key) {
            self.internal.push(key);
        }
        self
    }

    /// Number of configured rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns true if `key` is excluded from sync.
    pub fn is_ignored(&self, key: &AssetKey) -> bool {
        key.is_hidden()
            || self.internal.iter().any(|internal| key.starts_with_dir(internal))
            || self.rules.iter().any(|rule| rule.matches(key))
    }

    /// Returns true if the relative `path` is excluded from sync.
    ///
    /// Paths that are not valid keys are ignored.
    pub fn should_ignore(&self, path: &str) -> bool {
        match AssetKey::new(path) {
            Ok(key) => self.is_ignored(&key),
            Err(_) => true,
        }
    }
}
