//! Benchmark utilities.

use rand::Rng;
use themesync_engine::{Inventory, Ledger};
use themesync_protocol::{Asset, AssetKey, Checksum};

const DIRECTORIES: &[&str] = &["assets", "layout", "sections", "snippets", "templates"];

/// Generate random file content of the specified size.
pub fn random_content(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` keys spread over the usual theme directories.
pub fn theme_keys(count: usize) -> Vec<AssetKey> {
    (0..count)
        .filter_map(|i| {
            let dir = DIRECTORIES[i % DIRECTORIES.len()];
            AssetKey::new(format!("{}/file_{}.liquid", dir, i)).ok()
        })
        .collect()
}

/// Both sides of a theme of `count` assets in which every `every`th key
/// differs, plus a ledger matching the remote side.
pub fn diverged_theme(count: usize, every: usize) -> (Inventory, Inventory, Ledger) {
    let ledger = Ledger::in_memory();
    let mut local = Inventory::new();
    let mut remote = Inventory::new();
    for (i, key) in theme_keys(count).into_iter().enumerate() {
        let content = format!("{} v1", key).into_bytes();
        let edited = if every > 0 && i % every == 0 {
            format!("{} v2", key).into_bytes()
        } else {
            content.clone()
        };
        let checksum = Checksum::of(&content);
        ledger.record(key.clone(), checksum.clone());
        remote.insert(
            key.clone(),
            Asset::remote(key.clone(), Some(checksum), content.len() as u64, None),
        );
        local.insert(key.clone(), Asset::local(key, &edited, None));
    }
    (local, remote, ledger)
}
