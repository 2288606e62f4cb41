//! Reconciliation of local and remote inventories.
//!
//! The differ is pure: given both inventories, the ignore filter and the
//! ledger it returns the operations that make the non-authoritative side
//! match the authoritative one, plus any conflicts it refused to settle.

use crate::ignore::IgnoreFilter;
use crate::ledger::Ledger;
use crate::local::Inventory;
use std::collections::BTreeSet;
use themesync_protocol::{
    Asset, AssetKey, BaselinePolicy, ChangeEvent, Checksum, Conflict, Operation, OperationKind,
    SyncDirection,
};
use tracing::{debug, trace};

/// Knobs for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Which side is authoritative and whether one-sided keys are deleted.
    pub direction: SyncDirection,
    /// Let the authoritative side win every divergence.
    pub force: bool,
    /// Tie-break for divergent keys that were never synced.
    pub policy: BaselinePolicy,
    /// Restricts the pass to these keys or directory prefixes; empty means all.
    pub scope: Vec<String>,
}

impl DiffOptions {
    /// Options for `direction` with defaults for everything else.
    pub fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            force: false,
            policy: BaselinePolicy::default(),
            scope: Vec::new(),
        }
    }

    /// Sets `force`.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Sets the baseline policy.
    pub fn with_policy(mut self, policy: BaselinePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Restricts the pass to the given keys or prefixes.
    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    fn in_scope(&self, key: &AssetKey) -> bool {
        self.scope.is_empty() || self.scope.iter().any(|prefix| key.starts_with_dir(prefix))
    }
}

/// Output of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Uploads and downloads, sorted by key.
    pub transfers: Vec<Operation>,
    /// Deletions, sorted by key; dispatched after every transfer completed.
    pub removals: Vec<Operation>,
    /// Divergences left for the user.
    pub conflicts: Vec<Conflict>,
    /// Keys held back because the authoritative side is behind.
    pub skipped: Vec<AssetKey>,
}

impl Reconciliation {
    /// All operations in dispatch order.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.transfers.iter().chain(self.removals.iter())
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.transfers.len() + self.removals.len()
    }

    /// Returns true if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Decision {
    Nothing,
    Transfer(Operation),
    Remove(Operation),
    Conflict,
    Skip,
}

/// Computes the operations that reconcile `local` with `remote`.
pub fn reconcile(
    local: &Inventory,
    remote: &Inventory,
    filter: &IgnoreFilter,
    ledger: &Ledger,
    options: &DiffOptions,
) -> Reconciliation {
    let keys: BTreeSet<&AssetKey> = local.keys().chain(remote.keys()).collect();
    let mut result = Reconciliation::default();

    for key in keys {
        if filter.is_ignored(key) || !options.in_scope(key) {
            continue;
        }
        let l = local.get(key);
        let r = remote.get(key);
        let baseline = ledger.get(key);

        match decide(key, l, r, baseline.as_ref(), options) {
            Decision::Nothing => {}
            Decision::Transfer(op) => {
                trace!(key = %key, kind = %op.kind, "planned");
                result.transfers.push(op);
            }
            Decision::Remove(op) => {
                trace!(key = %key, kind = %op.kind, "planned");
                result.removals.push(op);
            }
            Decision::Conflict => result.conflicts.push(Conflict::new(
                key.clone(),
                checksum(l),
                checksum(r),
                baseline,
                options.direction,
            )),
            Decision::Skip => result.skipped.push(key.clone()),
        }
    }

    debug!(
        direction = ?options.direction,
        transfers = result.transfers.len(),
        removals = result.removals.len(),
        conflicts = result.conflicts.len(),
        "reconciled"
    );
    result
}

fn checksum(asset: Option<&Asset>) -> Option<Checksum> {
    asset.and_then(|a| a.checksum.clone())
}

fn decide(
    key: &AssetKey,
    local: Option<&Asset>,
    remote: Option<&Asset>,
    baseline: Option<&Checksum>,
    options: &DiffOptions,
) -> Decision {
    let direction = options.direction;
    let upload = || Operation::upload(key.clone(), checksum(local));
    let download = || Operation::download(key.clone(), checksum(remote));

    match (local, remote) {
        (None, None) => Decision::Nothing,

        (Some(l), None) => {
            if direction.pushes() {
                Decision::Transfer(upload())
            } else if direction.removes() {
                guarded_removal(l, baseline, options, Operation::remove_local(key.clone()))
            } else {
                Decision::Nothing
            }
        }

        (None, Some(r)) => {
            if direction.pulls() {
                Decision::Transfer(download())
            } else if direction.removes() {
                guarded_removal(r, baseline, options, Operation::remove(key.clone()))
            } else {
                Decision::Nothing
            }
        }

        (Some(l), Some(r)) => {
            if l.in_sync_with(r) {
                return Decision::Nothing;
            }
            let winner = || {
                if direction.pushes() {
                    Decision::Transfer(upload())
                } else {
                    Decision::Transfer(download())
                }
            };
            if options.force {
                return winner();
            }

            let (authoritative, other) = if direction.pushes() { (l, r) } else { (r, l) };
            match baseline {
                Some(b) => {
                    let other_unchanged = other.checksum.as_ref() == Some(b);
                    let authoritative_unchanged = authoritative.checksum.as_ref() == Some(b);
                    if other_unchanged {
                        winner()
                    } else if authoritative_unchanged {
                        // Only the other side moved; pushing or pulling would undo it.
                        Decision::Skip
                    } else {
                        Decision::Conflict
                    }
                }
                None => match options.policy {
                    BaselinePolicy::Report => Decision::Conflict,
                    BaselinePolicy::PreferRemote if direction.pulls() => winner(),
                    BaselinePolicy::PreferLocal if direction.pushes() => winner(),
                    _ => Decision::Skip,
                },
            }
        }
    }
}

/// Deletes `present` unless it was edited since it was last synced.
fn guarded_removal(
    present: &Asset,
    baseline: Option<&Checksum>,
    options: &DiffOptions,
    removal: Operation,
) -> Decision {
    match baseline {
        Some(b) if !options.force && present.checksum.as_ref() != Some(b) => Decision::Conflict,
        _ => Decision::Remove(removal),
    }
}

/// Plans the removal of `keys` from both sides.
///
/// Remote deletions come first in the list; the local ones follow.
pub fn plan_removal(keys: &[AssetKey], filter: &IgnoreFilter) -> Reconciliation {
    let keys: BTreeSet<&AssetKey> = keys.iter().filter(|k| !filter.is_ignored(k)).collect();
    let mut result = Reconciliation::default();
    result
        .removals
        .extend(keys.iter().map(|k| Operation::remove((*k).clone())));
    result
        .removals
        .extend(keys.iter().map(|k| Operation::remove_local((*k).clone())));
    result
}

/// Turns a watch event into an operation.
///
/// `current` is the key's checksum on disk now, `None` if the file is gone.
/// Events whose content matches the ledger are dropped, which is what keeps
/// the engine's own downloads from echoing back as uploads.
pub fn plan_change(
    event: &ChangeEvent,
    current: Option<Checksum>,
    ledger: &Ledger,
) -> Option<Operation> {
    match current {
        None => {
            if ledger.get(&event.key).is_none() && !event.kind.is_removal() {
                return None;
            }
            Some(Operation::remove(event.key.clone()))
        }
        Some(checksum) => {
            if ledger.get(&event.key).as_ref() == Some(&checksum) {
                trace!(key = %event.key, "unchanged since last sync");
                return None;
            }
            Some(Operation::upload(event.key.clone(), Some(checksum)))
        }
    }
}

/// Verdict on a guarded operation once the store's content is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// The store still holds the last synced content.
    Proceed,
    /// The store already holds what the operation would leave behind.
    Converged,
    /// The store moved on and the baseline policy keeps its copy.
    Hold,
    /// The store moved on since the last sync.
    Conflict(Conflict),
}

/// Checks a store write planned from a local change against the store.
///
/// `local` is the content the operation would leave in the store (`None`
/// for a removal), `remote` what the store holds now and `baseline` the
/// ledger's checksum. An upload to a key the store does not have proceeds,
/// as it does when reconciling with a pushing direction.
pub fn check_guard(
    op: &Operation,
    policy: BaselinePolicy,
    local: Option<&Checksum>,
    remote: Option<&Checksum>,
    baseline: Option<&Checksum>,
) -> Guard {
    if remote == local {
        return Guard::Converged;
    }
    if remote == baseline || (remote.is_none() && op.kind == OperationKind::Upload) {
        return Guard::Proceed;
    }
    let conflict = || {
        Guard::Conflict(Conflict::new(
            op.key.clone(),
            local.cloned(),
            remote.cloned(),
            baseline.cloned(),
            SyncDirection::Push,
        ))
    };
    match (baseline, policy) {
        (Some(_), _) | (None, BaselinePolicy::Report) => conflict(),
        (None, BaselinePolicy::PreferLocal) => Guard::Proceed,
        (None, BaselinePolicy::PreferRemote) => Guard::Hold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themesync_protocol::ChangeKind;

    fn key(s: &str) -> AssetKey {
        AssetKey::new(s).unwrap()
    }

    fn local(entries: &[(&str, &str)]) -> Inventory {
        entries
            .iter()
            .map(|(k, c)| (key(k), Asset::local(key(k), c.as_bytes(), None)))
            .collect()
    }

    fn remote(entries: &[(&str, &str)]) -> Inventory {
        entries
            .iter()
            .map(|(k, c)| {
                (
                    key(k),
                    Asset::remote(key(k), Some(Checksum::of(c.as_bytes())), c.len() as u64, None),
                )
            })
            .collect()
    }

    fn kinds(ops: &[Operation]) -> Vec<(String, OperationKind)> {
        ops.iter()
            .map(|op| (op.key.as_str().to_string(), op.kind))
            .collect()
    }

    fn run(l: &Inventory, r: &Inventory, ledger: &Ledger, options: DiffOptions) -> Reconciliation {
        reconcile(l, r, &IgnoreFilter::default(), ledger, &options)
    }

    #[test]
    fn initial_push() {
        let l = local(&[("layout/theme.liquid", "A"), ("assets/app.js", "B")]);
        let result = run(&l, &Inventory::new(), &Ledger::in_memory(), DiffOptions::new(SyncDirection::Push));

        assert_eq!(
            kinds(&result.transfers),
            vec![
                ("assets/app.js".to_string(), OperationKind::Upload),
                ("layout/theme.liquid".to_string(), OperationKind::Upload),
            ]
        );
        assert!(result.removals.is_empty());
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn equal_checksums_are_noops() {
        let l = local(&[("a.liquid", "same"), ("b.liquid", "same too")]);
        let r = remote(&[("a.liquid", "same"), ("b.liquid", "same too")]);
        for direction in [
            SyncDirection::Push,
            SyncDirection::Pull,
            SyncDirection::PushAndRemove,
            SyncDirection::PullAndRemove,
        ] {
            let result = run(&l, &r, &Ledger::in_memory(), DiffOptions::new(direction).with_force(true));
            assert!(result.is_empty());
            assert!(result.conflicts.is_empty());
        }
    }

    #[test]
    fn unbaselined_divergence_is_a_conflict() {
        let l = local(&[("config/settings.json", "C")]);
        let r = remote(&[("config/settings.json", "D")]);
        for direction in [SyncDirection::Push, SyncDirection::Pull] {
            let result = run(&l, &r, &Ledger::in_memory(), DiffOptions::new(direction));
            assert!(result.is_empty());
            assert_eq!(result.conflicts.len(), 1);
            let conflict = &result.conflicts[0];
            assert_eq!(conflict.key.as_str(), "config/settings.json");
            assert_eq!(conflict.local, Some(Checksum::of(b"C")));
            assert_eq!(conflict.remote, Some(Checksum::of(b"D")));
            assert!(conflict.is_unbaselined());
        }
    }

    #[test]
    fn baseline_policy_prefer_remote() {
        let l = local(&[("config/settings.json", "C")]);
        let r = remote(&[("config/settings.json", "D")]);
        let ledger = Ledger::in_memory();

        let pull = DiffOptions::new(SyncDirection::Pull).with_policy(BaselinePolicy::PreferRemote);
        let result = run(&l, &r, &ledger, pull);
        assert_eq!(kinds(&result.transfers)[0].1, OperationKind::Download);

        let push = DiffOptions::new(SyncDirection::Push).with_policy(BaselinePolicy::PreferRemote);
        let result = run(&l, &r, &ledger, push);
        assert!(result.is_empty());
        assert!(result.conflicts.is_empty());
        assert_eq!(result.skipped, vec![key("config/settings.json")]);
    }

    #[test]
    fn baseline_policy_prefer_local() {
        let l = local(&[("config/settings.json", "C")]);
        let r = remote(&[("config/settings.json", "D")]);
        let ledger = Ledger::in_memory();

        let push = DiffOptions::new(SyncDirection::Push).with_policy(BaselinePolicy::PreferLocal);
        let result = run(&l, &r, &ledger, push);
        assert_eq!(kinds(&result.transfers)[0].1, OperationKind::Upload);

        let pull = DiffOptions::new(SyncDirection::Pull).with_policy(BaselinePolicy::PreferLocal);
        let result = run(&l, &r, &ledger, pull);
        assert!(result.is_empty());
        assert_eq!(result.skipped.len(), 1);
    }

    #[test]
    fn authoritative_side_wins_when_other_unchanged() {
        let ledger = Ledger::in_memory();
        ledger.record(key("sections/header.liquid"), Checksum::of(b"v1"));

        // Local edited, remote still at baseline.
        let l = local(&[("sections/header.liquid", "v2")]);
        let r = remote(&[("sections/header.liquid", "v1")]);
        let result = run(&l, &r, &ledger, DiffOptions::new(SyncDirection::Push));
        assert_eq!(kinds(&result.transfers)[0].1, OperationKind::Upload);

        // Pulling the same state must not overwrite the local edit.
        let result = run(&l, &r, &ledger, DiffOptions::new(SyncDirection::Pull));
        assert!(result.is_empty());
        assert_eq!(result.skipped.len(), 1);
    }

    #[test]
    fn both_sides_edited_is_a_conflict_unless_forced() {
        let ledger = Ledger::in_memory();
        ledger.record(key("sections/header.liquid"), Checksum::of(b"v1"));
        let l = local(&[("sections/header.liquid", "local edit")]);
        let r = remote(&[("sections/header.liquid", "remote edit")]);

        let result = run(&l, &r, &ledger, DiffOptions::new(SyncDirection::Push));
        assert_eq!(result.conflicts.len(), 1);
        assert!(result.conflicts[0].local_changed());
        assert!(result.conflicts[0].remote_changed());

        let forced = DiffOptions::new(SyncDirection::Push).with_force(true);
        let result = run(&l, &r, &ledger, forced);
        assert_eq!(kinds(&result.transfers)[0].1, OperationKind::Upload);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn one_sided_keys_by_direction() {
        let l = local(&[("local-only.liquid", "L")]);
        let r = remote(&[("remote-only.liquid", "R")]);
        let ledger = Ledger::in_memory();

        let result = run(&l, &r, &ledger, DiffOptions::new(SyncDirection::Push));
        assert_eq!(kinds(&result.transfers), vec![("local-only.liquid".to_string(), OperationKind::Upload)]);
        assert!(result.removals.is_empty());

        let result = run(&l, &r, &ledger, DiffOptions::new(SyncDirection::Pull));
        assert_eq!(kinds(&result.transfers), vec![("remote-only.liquid".to_string(), OperationKind::Download)]);
        assert!(result.removals.is_empty());

        let result = run(&l, &r, &ledger, DiffOptions::new(SyncDirection::PushAndRemove));
        assert_eq!(kinds(&result.removals), vec![("remote-only.liquid".to_string(), OperationKind::Remove)]);

        let result = run(&l, &r, &ledger, DiffOptions::new(SyncDirection::PullAndRemove));
        assert_eq!(
            kinds(&result.removals),
            vec![("local-only.liquid".to_string(), OperationKind::RemoveLocal)]
        );
    }

    #[test]
    fn removal_of_edited_asset_is_a_conflict() {
        let ledger = Ledger::in_memory();
        ledger.record(key("a.liquid"), Checksum::of(b"old"));
        let r = remote(&[("a.liquid", "edited on the store")]);

        let result = run(&Inventory::new(), &r, &ledger, DiffOptions::new(SyncDirection::PushAndRemove));
        assert!(result.removals.is_empty());
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].local, None);

        let forced = DiffOptions::new(SyncDirection::PushAndRemove).with_force(true);
        let result = run(&Inventory::new(), &r, &ledger, forced);
        assert_eq!(result.removals.len(), 1);
    }

    #[test]
    fn rename_uploads_before_removing() {
        let ledger = Ledger::in_memory();
        ledger.record(key("a.liquid"), Checksum::of(b"body"));
        let l = local(&[("b.liquid", "body")]);
        let r = remote(&[("a.liquid", "body")]);

        let result = run(&l, &r, &ledger, DiffOptions::new(SyncDirection::PushAndRemove));
        let order: Vec<_> = result.operations().map(|op| (op.key.as_str(), op.kind)).collect();
        assert_eq!(
            order,
            vec![("b.liquid", OperationKind::Upload), ("a.liquid", OperationKind::Remove)]
        );
    }

    #[test]
    fn ignored_and_out_of_scope_keys_are_excluded() {
        let l = local(&[("assets/app.js", "1"), ("assets/app.js.map", "2"), ("templates/index.json", "3")]);
        let filter = IgnoreFilter::new(["*.map"]).unwrap();
        let options = DiffOptions::new(SyncDirection::Push).with_scope(vec!["assets".into()]);

        let result = reconcile(&l, &Inventory::new(), &filter, &Ledger::in_memory(), &options);
        assert_eq!(kinds(&result.transfers), vec![("assets/app.js".to_string(), OperationKind::Upload)]);
    }

    #[test]
    fn unknown_remote_checksum_is_treated_as_different() {
        let l = local(&[("assets/logo.png", "png")]);
        let mut r = Inventory::new();
        r.insert(key("assets/logo.png"), Asset::remote(key("assets/logo.png"), None, 3, None));
        let options = DiffOptions::new(SyncDirection::Push).with_force(true);
        let result = run(&l, &r, &Ledger::in_memory(), options);
        assert_eq!(result.transfers.len(), 1);
    }

    #[test]
    fn removal_plan_orders_remote_first() {
        let keys = vec![key("b.liquid"), key("a.liquid"), key(".hidden")];
        let result = plan_removal(&keys, &IgnoreFilter::default());
        let order: Vec<_> = result.removals.iter().map(|op| (op.key.as_str(), op.kind)).collect();
        assert_eq!(
            order,
            vec![
                ("a.liquid", OperationKind::Remove),
                ("b.liquid", OperationKind::Remove),
                ("a.liquid", OperationKind::RemoveLocal),
                ("b.liquid", OperationKind::RemoveLocal),
            ]
        );
    }

    #[test]
    fn change_planning() {
        let ledger = Ledger::in_memory();
        let k = key("snippets/price.liquid");
        ledger.record(k.clone(), Checksum::of(b"synced"));

        let modified = ChangeEvent::new(k.clone(), ChangeKind::Modified);
        assert!(plan_change(&modified, Some(Checksum::of(b"synced")), &ledger).is_none());

        let op = plan_change(&modified, Some(Checksum::of(b"edited")), &ledger).unwrap();
        assert_eq!(op.kind, OperationKind::Upload);

        let removed = ChangeEvent::new(k.clone(), ChangeKind::Removed);
        assert_eq!(plan_change(&removed, None, &ledger).unwrap().kind, OperationKind::Remove);

        // A file that appeared and vanished before being read, never synced.
        let fresh = ChangeEvent::new(key("tmp.liquid"), ChangeKind::Created);
        assert!(plan_change(&fresh, None, &ledger).is_none());
    }

    #[test]
    fn guarded_upload_against_store() {
        let k = key("config/settings_data.json");
        let op = Operation::upload(k.clone(), None);
        let base = Checksum::of(b"synced");
        let mine = Checksum::of(b"local edit");
        let theirs = Checksum::of(b"admin edit");
        let report = BaselinePolicy::Report;

        assert_eq!(
            check_guard(&op, report, Some(&mine), Some(&base), Some(&base)),
            Guard::Proceed
        );
        assert_eq!(
            check_guard(&op, report, Some(&mine), Some(&mine), Some(&base)),
            Guard::Converged
        );
        assert_eq!(check_guard(&op, report, Some(&mine), None, None), Guard::Proceed);
        assert_eq!(check_guard(&op, report, Some(&mine), None, Some(&base)), Guard::Proceed);

        let Guard::Conflict(conflict) = check_guard(&op, report, Some(&mine), Some(&theirs), Some(&base))
        else {
            panic!("edited store must conflict");
        };
        assert_eq!(conflict.key, k);
        assert_eq!(conflict.local, Some(mine.clone()));
        assert_eq!(conflict.remote, Some(theirs.clone()));
        assert_eq!(conflict.baseline, Some(base.clone()));
        assert_eq!(conflict.direction, SyncDirection::Push);

        // Never synced: the policy decides.
        assert!(matches!(
            check_guard(&op, report, Some(&mine), Some(&theirs), None),
            Guard::Conflict(_)
        ));
        assert_eq!(
            check_guard(&op, BaselinePolicy::PreferLocal, Some(&mine), Some(&theirs), None),
            Guard::Proceed
        );
        assert_eq!(
            check_guard(&op, BaselinePolicy::PreferRemote, Some(&mine), Some(&theirs), None),
            Guard::Hold
        );
        // A baseline outranks the policy.
        assert!(matches!(
            check_guard(&op, BaselinePolicy::PreferLocal, Some(&mine), Some(&theirs), Some(&base)),
            Guard::Conflict(_)
        ));
    }

    #[test]
    fn guarded_removal_against_store() {
        let op = Operation::remove(key("snippets/old.liquid"));
        let base = Checksum::of(b"synced");
        let theirs = Checksum::of(b"admin edit");
        let report = BaselinePolicy::Report;

        assert_eq!(check_guard(&op, report, None, Some(&base), Some(&base)), Guard::Proceed);
        assert_eq!(check_guard(&op, report, None, None, Some(&base)), Guard::Converged);
        assert!(matches!(
            check_guard(&op, report, None, Some(&theirs), Some(&base)),
            Guard::Conflict(_)
        ));
        assert!(matches!(
            check_guard(&op, report, None, Some(&theirs), None),
            Guard::Conflict(_)
        ));
    }
}
