//! Property-based test generators using proptest.
//!
//! Provides strategies for generating theme keys, file contents and
//! two-sided sync scenarios.

use proptest::prelude::*;
use std::collections::BTreeMap;
use themesync_engine::{Inventory, Ledger};
use themesync_protocol::{Asset, AssetKey, Checksum};

const DIRECTORIES: &[&str] = &[
    "layout",
    "templates",
    "sections",
    "snippets",
    "assets",
    "config",
    "locales",
];

const EXTENSIONS: &[&str] = &["liquid", "js", "css", "json", "png", "svg"];

/// Strategy for generating valid asset keys such as `snippets/card-3.liquid`.
pub fn asset_key_strategy() -> impl Strategy<Value = AssetKey> {
    (
        prop::sample::select(DIRECTORIES),
        prop::string::string_regex("[a-z][a-z0-9_-]{0,11}").expect("Invalid regex"),
        prop::sample::select(EXTENSIONS),
    )
        .prop_map(|(dir, name, ext)| {
            AssetKey::new(format!("{}/{}.{}", dir, name, ext)).expect("Generated key is valid")
        })
}

/// Strategy for generating text content.
pub fn text_content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::string::string_regex("[ -~\n]{0,256}")
        .expect("Invalid regex")
        .prop_map(String::into_bytes)
}

/// Strategy for generating arbitrary bytes, usually not valid UTF-8.
pub fn binary_content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Strategy for generating file content, mostly text.
pub fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        4 => text_content_strategy(),
        1 => binary_content_strategy(),
    ]
}

/// Strategy for generating a theme as key to content.
pub fn theme_files_strategy(max_files: usize) -> impl Strategy<Value = BTreeMap<AssetKey, Vec<u8>>> {
    prop::collection::btree_map(asset_key_strategy(), content_strategy(), 0..max_files)
}

/// Local files, remote assets and last-synced contents for one set of keys.
#[derive(Debug, Clone)]
pub struct SyncScenario {
    /// Local files.
    pub local: BTreeMap<AssetKey, Vec<u8>>,
    /// Remote assets.
    pub remote: BTreeMap<AssetKey, Vec<u8>>,
    /// Content both sides last agreed on.
    pub baseline: BTreeMap<AssetKey, Vec<u8>>,
}

impl SyncScenario {
    /// The local side as an inventory.
    pub fn local_inventory(&self) -> Inventory {
        self.local
            .iter()
            .map(|(key, content)| (key.clone(), Asset::local(key.clone(), content, None)))
            .collect()
    }

    /// The remote side as an inventory.
    pub fn remote_inventory(&self) -> Inventory {
        self.remote
            .iter()
            .map(|(key, content)| {
                let asset = Asset::remote(
                    key.clone(),
                    Some(Checksum::of(content)),
                    content.len() as u64,
                    None,
                );
                (key.clone(), asset)
            })
            .collect()
    }

    /// An in-memory ledger holding the baseline.
    pub fn ledger(&self) -> Ledger {
        let ledger = Ledger::in_memory();
        for (key, content) in &self.baseline {
            ledger.record(key.clone(), Checksum::of(content));
        }
        ledger
    }
}

#[derive(Debug, Clone)]
struct KeyState {
    local: Option<u8>,
    remote: Option<u8>,
    baseline: Option<u8>,
}

/// Strategy for generating sync scenarios.
///
/// Contents are drawn from a small alphabet so that equal checksums on
/// both sides, and equality with the baseline, come up often.
pub fn sync_scenario_strategy(max_keys: usize) -> impl Strategy<Value = SyncScenario> {
    let version = || prop::option::weighted(0.8, 0u8..3);
    let state = (version(), version(), prop::option::weighted(0.5, 0u8..3)).prop_map(
        |(local, remote, baseline)| KeyState {
            local,
            remote,
            baseline,
        },
    );
    prop::collection::btree_map(asset_key_strategy(), state, 0..max_keys).prop_map(|keys| {
        let mut scenario = SyncScenario {
            local: BTreeMap::new(),
            remote: BTreeMap::new(),
            baseline: BTreeMap::new(),
        };
        for (key, state) in keys {
            let content = |v: u8| format!("{} v{}", key, v).into_bytes();
            if let Some(v) = state.local {
                scenario.local.insert(key.clone(), content(v));
            }
            if let Some(v) = state.remote {
                scenario.remote.insert(key.clone(), content(v));
            }
            if let Some(v) = state.baseline {
                scenario.baseline.insert(key.clone(), content(v));
            }
        }
        scenario
    })
}

/// Strategy for generating bursts of edits: each entry picks one of
/// `keys` keys and a new content.
pub fn edit_burst_strategy(
    keys: usize,
    max_edits: usize,
) -> impl Strategy<Value = Vec<(usize, Vec<u8>)>> {
    prop::collection::vec((0..keys.max(1), text_content_strategy()), 1..max_edits.max(2))
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
