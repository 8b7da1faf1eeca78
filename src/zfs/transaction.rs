// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reversible mutations over the dataset graph.
//!
//! Every mutating call appends its inverse to a LIFO stack. `done()` commits
//! by releasing the stack; `cancel()` (or dropping an unfinished
//! transaction) replays the inverses newest-first, logging and skipping
//! individual failures so the chain always runs to the end. A nested
//! transaction borrows the tail of the parent's stack: committing leaves its
//! actions with the parent, rolling back replays only its own tail.

use tracing;

use super::properties::{CanMount, PropSource, Property};
use super::{Zfs, rename_with_suffix};
use crate::ZsysError;

/// A compensating action, recorded at mutation time.
#[derive(Clone, Debug)]
enum Revert {
    /// Destroy a dataset or snapshot this transaction created.
    Destroy { name: String },
    /// Promote the named dataset to undo an earlier promote.
    Promote { name: String },
    /// Restore a property to its captured pre-change value and source.
    SetProperty {
        dataset: String,
        prop: Property,
        value: String,
        source: PropSource,
    },
}

pub struct Transaction<'a> {
    zfs: &'a mut Zfs,
    reverts: Vec<Revert>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(zfs: &'a mut Zfs) -> Self {
        Transaction {
            zfs,
            reverts: Vec::new(),
            finished: false,
        }
    }

    /// Read-only view of the graph mid-transaction.
    pub fn zfs(&self) -> &Zfs {
        self.zfs
    }

    /// Create a filesystem dataset. The parent must exist.
    pub fn create(
        &mut self,
        name: &str,
        mountpoint: &str,
        canmount: CanMount,
    ) -> Result<(), ZsysError> {
        self.zfs.apply_create(name, mountpoint, canmount)?;
        self.reverts.push(Revert::Destroy {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Snapshot `dataset` (and, recursively, its filesystem descendants)
    /// with `tag`. Fails up front if any target already carries the tag.
    pub fn snapshot(&mut self, tag: &str, dataset: &str, recursive: bool) -> Result<(), ZsysError> {
        validate_tag(tag)?;
        self.zfs.must_get(dataset)?;

        let mut targets = vec![dataset.to_string()];
        if recursive {
            targets.extend(self.zfs.descendants(dataset));
        }
        for target in &targets {
            let snap = format!("{target}@{tag}");
            if self.zfs.get(&snap).is_some() {
                return Err(ZsysError::already_exists(snap));
            }
        }
        for target in &targets {
            let created = self.zfs.apply_snapshot_one(target, tag)?;
            self.reverts.push(Revert::Destroy { name: created });
        }
        Ok(())
    }

    /// Clone `snapshot` under a new `_suffix` name, optionally recursing
    /// through the origin's filesystem children. Datasets flagged bootfs are
    /// skipped when `skip_bootfs` is set. Descendants without the snapshot
    /// tag are skipped when they are leaves; a missing intermediate snapshot
    /// is an integrity error.
    pub fn clone_from(
        &mut self,
        snapshot: &str,
        suffix: &str,
        skip_bootfs: bool,
        recursive: bool,
    ) -> Result<(), ZsysError> {
        if suffix.is_empty() {
            return Err(ZsysError::invalid_argument("clone suffix cannot be empty"));
        }
        let Some((base, tag)) = snapshot.split_once('@') else {
            return Err(ZsysError::invalid_argument(format!(
                "cannot clone '{snapshot}': not a snapshot"
            )));
        };
        let (base, tag) = (base.to_string(), tag.to_string());
        self.zfs.must_get(snapshot)?;
        if recursive {
            self.zfs.check_snapshot_hierarchy(&base, &tag)?;
        }
        let target = rename_with_suffix(&base, suffix);
        self.clone_node(&base, &target, &tag, skip_bootfs, recursive)
    }

    fn clone_node(
        &mut self,
        src: &str,
        dst: &str,
        tag: &str,
        skip_bootfs: bool,
        recursive: bool,
    ) -> Result<(), ZsysError> {
        let snap_name = format!("{src}@{tag}");
        let snap_bootfs = self.zfs.must_get(&snap_name)?.bootfs;
        if !(skip_bootfs && snap_bootfs) {
            self.zfs.apply_clone_one(&snap_name, dst)?;
            self.reverts.push(Revert::Destroy {
                name: dst.to_string(),
            });
        }
        if !recursive {
            return Ok(());
        }
        for child in self.zfs.children(src) {
            if self.zfs.get(&format!("{child}@{tag}")).is_none() {
                // A leaf without the tag; hierarchy was checked up front.
                tracing::debug!(dataset = %child, tag, "no snapshot on descendant, skipping");
                continue;
            }
            let rel = child.rsplit_once('/').map(|(_, rel)| rel).unwrap_or(&child);
            let dst_child = format!("{dst}/{rel}");
            self.clone_node(&child, &dst_child, tag, skip_bootfs, recursive)?;
        }
        Ok(())
    }

    /// Promote `dataset` and, recursively, its filesystem children that are
    /// clones, so no origin points out of the subtree anymore.
    pub fn promote(&mut self, dataset: &str) -> Result<(), ZsysError> {
        if let Some(donor) = self.zfs.apply_promote_one(dataset)? {
            self.reverts.push(Revert::Promote { name: donor });
        }
        for child in self.zfs.children(dataset) {
            if !self.zfs.must_get(&child)?.origin.is_empty() {
                self.promote(&child)?;
            }
        }
        Ok(())
    }

    /// Set a tracked property. Returns whether anything actually changed.
    pub fn set_property(
        &mut self,
        prop: Property,
        value: &str,
        dataset: &str,
        force: bool,
    ) -> Result<bool, ZsysError> {
        match self
            .zfs
            .apply_set_property(prop, value, PropSource::Local, dataset, force)?
        {
            Some((previous_value, previous_source)) => {
                self.reverts.push(Revert::SetProperty {
                    dataset: dataset.to_string(),
                    prop,
                    value: previous_value,
                    source: previous_source,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Open a nested transaction owning the tail of the revert stack.
    pub fn nested(&mut self) -> Nested<'_, 'a> {
        let mark = self.reverts.len();
        Nested {
            tx: self,
            mark,
            finished: false,
        }
    }

    /// Commit: keep every effect, release the compensating actions.
    pub fn done(mut self) {
        self.reverts.clear();
        self.finished = true;
    }

    /// Cancel: run every compensating action, newest first.
    pub fn cancel(mut self) {
        self.revert_to(0);
        self.finished = true;
    }

    fn revert_to(&mut self, mark: usize) {
        while self.reverts.len() > mark {
            let action = self.reverts.pop().unwrap();
            if let Err(err) = self.apply_revert(&action) {
                // A failed inverse never aborts the reversal chain.
                tracing::warn!(?action, %err, "compensating action failed");
            }
        }
    }

    fn apply_revert(&mut self, action: &Revert) -> Result<(), ZsysError> {
        match action {
            Revert::Destroy { name } => self.zfs.destroy(name),
            Revert::Promote { name } => self.zfs.apply_promote_one(name).map(|_| ()),
            Revert::SetProperty {
                dataset,
                prop,
                value,
                source,
            } => self
                .zfs
                .apply_set_property(*prop, value, *source, dataset, true)
                .map(|_| ()),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.reverts.is_empty() {
            tracing::warn!("transaction dropped without done(), reverting");
            self.revert_to(0);
        }
    }
}

/// A nested transaction: its mutations live on the parent's stack beyond
/// `mark` until committed or rolled back.
pub struct Nested<'t, 'a> {
    tx: &'t mut Transaction<'a>,
    mark: usize,
    finished: bool,
}

impl<'a> Nested<'_, 'a> {
    /// Keep the nested effects; the parent takes over their reversal.
    pub fn commit(mut self) {
        self.finished = true;
    }

    /// Revert only the nested effects; the parent keeps its own.
    pub fn rollback(mut self) {
        self.tx.revert_to(self.mark);
        self.finished = true;
    }
}

impl<'a> std::ops::Deref for Nested<'_, 'a> {
    type Target = Transaction<'a>;

    fn deref(&self) -> &Self::Target {
        self.tx
    }
}

impl std::ops::DerefMut for Nested<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tx
    }
}

impl Drop for Nested<'_, '_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tx.revert_to(self.mark);
        }
    }
}

fn validate_tag(tag: &str) -> Result<(), ZsysError> {
    if tag.is_empty() {
        return Err(ZsysError::invalid_argument("snapshot tag cannot be empty"));
    }
    if let Some(bad) = tag
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(ZsysError::invalid_argument(format!(
            "invalid character '{bad}' in snapshot tag '{tag}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libzfs::mock::MockPool;

    fn sample_zfs() -> Zfs {
        let pool = MockPool::new();
        pool.add_pool("rpool");
        pool.add_dataset("rpool/ROOT", Some("/"), Some("off"));
        pool.add_dataset("rpool/ROOT/ubuntu_abc", Some("/"), Some("on"));
        pool.add_dataset("rpool/ROOT/ubuntu_abc/var", None, None);
        pool.set_local_user_prop("rpool/ROOT/ubuntu_abc", "com.ubuntu.zsys:bootfs", "yes");
        Zfs::scan(Box::new(pool)).unwrap()
    }

    #[test]
    fn test_create_then_cancel_restores_scan() {
        let mut zfs = sample_zfs();
        let before = zfs.dataset_map();

        let mut tx = zfs.transaction();
        tx.create("rpool/ROOT/ubuntu_new", "/", CanMount::On).unwrap();
        tx.snapshot("s1", "rpool/ROOT/ubuntu_new", false).unwrap();
        tx.cancel();

        assert_eq!(before, zfs.dataset_map());
        zfs.rescan().unwrap();
        assert_eq!(before, zfs.dataset_map());
    }

    #[test]
    fn test_done_releases_reverts() {
        let mut zfs = sample_zfs();
        let mut tx = zfs.transaction();
        tx.snapshot("keep", "rpool/ROOT/ubuntu_abc", false).unwrap();
        tx.done();
        assert!(zfs.get("rpool/ROOT/ubuntu_abc@keep").is_some());
    }

    #[test]
    fn test_drop_without_done_reverts() {
        let mut zfs = sample_zfs();
        let before = zfs.dataset_map();
        {
            let mut tx = zfs.transaction();
            tx.snapshot("gone", "rpool/ROOT/ubuntu_abc", false).unwrap();
        }
        assert_eq!(before, zfs.dataset_map());
    }

    #[test]
    fn test_create_requires_parent_and_uniqueness() {
        let mut zfs = sample_zfs();
        let mut tx = zfs.transaction();
        assert!(matches!(
            tx.create("rpool/MISSING/child", "/", CanMount::On),
            Err(ZsysError::NotFound { .. })
        ));
        assert!(matches!(
            tx.create("rpool/ROOT/ubuntu_abc", "/", CanMount::On),
            Err(ZsysError::AlreadyExists { .. })
        ));
        tx.done();
    }

    #[test]
    fn test_recursive_snapshot_and_revert() {
        let mut zfs = sample_zfs();
        let before = zfs.dataset_map();

        let mut tx = zfs.transaction();
        tx.snapshot("s1", "rpool/ROOT/ubuntu_abc", true).unwrap();
        assert!(tx.zfs().get("rpool/ROOT/ubuntu_abc@s1").is_some());
        assert!(tx.zfs().get("rpool/ROOT/ubuntu_abc/var@s1").is_some());
        tx.cancel();

        assert_eq!(before, zfs.dataset_map());
    }

    #[test]
    fn test_snapshot_existing_tag_fails() {
        let mut zfs = sample_zfs();
        let mut tx = zfs.transaction();
        tx.snapshot("s1", "rpool/ROOT/ubuntu_abc", true).unwrap();
        tx.done();

        let mut tx = zfs.transaction();
        // The descendant already has the tag, so the recursive snapshot
        // fails before creating anything.
        let err = tx.snapshot("s1", "rpool/ROOT/ubuntu_abc", true).unwrap_err();
        assert!(matches!(err, ZsysError::AlreadyExists { .. }));
        tx.done();
    }

    #[test]
    fn test_clone_promote_cancel_round_trip() {
        let mut zfs = sample_zfs();
        let mut tx = zfs.transaction();
        tx.snapshot("s1", "rpool/ROOT/ubuntu_abc", true).unwrap();
        tx.done();
        let before = zfs.dataset_map();

        let mut tx = zfs.transaction();
        tx.clone_from("rpool/ROOT/ubuntu_abc@s1", "new1", false, true)
            .unwrap();
        tx.promote("rpool/ROOT/ubuntu_new1").unwrap();
        assert_eq!(
            tx.zfs().get("rpool/ROOT/ubuntu_abc").unwrap().origin,
            "rpool/ROOT/ubuntu_new1@s1"
        );
        tx.cancel();

        assert_eq!(before, zfs.dataset_map());
        zfs.rescan().unwrap();
        assert_eq!(before, zfs.dataset_map());
    }

    #[test]
    fn test_clone_recursion_names_children() {
        let mut zfs = sample_zfs();
        let mut tx = zfs.transaction();
        tx.snapshot("s1", "rpool/ROOT/ubuntu_abc", true).unwrap();
        tx.clone_from("rpool/ROOT/ubuntu_abc@s1", "new1", false, true)
            .unwrap();
        tx.done();

        assert!(zfs.get("rpool/ROOT/ubuntu_new1").is_some());
        assert!(zfs.get("rpool/ROOT/ubuntu_new1/var").is_some());
    }

    #[test]
    fn test_clone_skips_untagged_leaves() {
        let mut zfs = sample_zfs();
        let mut tx = zfs.transaction();
        // Tag only the root: var has no snapshot and is silently skipped.
        tx.snapshot("s1", "rpool/ROOT/ubuntu_abc", false).unwrap();
        tx.clone_from("rpool/ROOT/ubuntu_abc@s1", "new1", false, true)
            .unwrap();
        tx.done();

        assert!(zfs.get("rpool/ROOT/ubuntu_new1").is_some());
        assert!(zfs.get("rpool/ROOT/ubuntu_new1/var").is_none());
    }

    #[test]
    fn test_clone_missing_intermediate_fails() {
        let pool = MockPool::new();
        pool.add_pool("rpool");
        pool.add_dataset("rpool/a", None, None);
        pool.add_dataset("rpool/a/b", None, None);
        pool.add_dataset("rpool/a/b/c", None, None);
        pool.add_snapshot("rpool/a@t", &[]);
        pool.add_snapshot("rpool/a/b/c@t", &[]);
        let mut zfs = Zfs::scan(Box::new(pool)).unwrap();

        let mut tx = zfs.transaction();
        let err = tx.clone_from("rpool/a@t", "x", false, true).unwrap_err();
        assert!(matches!(err, ZsysError::IntegrityViolation(_)));
        tx.done();
    }

    #[test]
    fn test_clone_requires_snapshot_argument() {
        let mut zfs = sample_zfs();
        let mut tx = zfs.transaction();
        assert!(matches!(
            tx.clone_from("rpool/ROOT/ubuntu_abc", "new1", false, false),
            Err(ZsysError::InvalidArgument(_))
        ));
        tx.done();
    }

    #[test]
    fn test_set_property_revert_restores_inherited() {
        let mut zfs = sample_zfs();
        let before = zfs.dataset_map();

        let mut tx = zfs.transaction();
        // var inherits its mountpoint; force overrides and localizes it.
        let changed = tx
            .set_property(Property::Mountpoint, "/elsewhere", "rpool/ROOT/ubuntu_abc/var", true)
            .unwrap();
        assert!(changed);
        tx.cancel();

        assert_eq!(before, zfs.dataset_map());
        zfs.rescan().unwrap();
        assert_eq!(before, zfs.dataset_map());
    }

    #[test]
    fn test_set_property_reports_unchanged() {
        let mut zfs = sample_zfs();
        let mut tx = zfs.transaction();
        let first = tx
            .set_property(Property::LastUsed, "1000", "rpool/ROOT/ubuntu_abc", true)
            .unwrap();
        let second = tx
            .set_property(Property::LastUsed, "1000", "rpool/ROOT/ubuntu_abc", true)
            .unwrap();
        assert!(first);
        assert!(!second);
        tx.done();
    }

    #[test]
    fn test_nested_commit_hands_actions_to_parent() {
        let mut zfs = sample_zfs();
        let before = zfs.dataset_map();

        let mut tx = zfs.transaction();
        tx.snapshot("outer", "rpool/ROOT/ubuntu_abc", false).unwrap();
        let mut nested = tx.nested();
        nested.snapshot("inner", "rpool/ROOT/ubuntu_abc", false).unwrap();
        nested.commit();
        // Cancelling the parent now reverts both.
        tx.cancel();

        assert_eq!(before, zfs.dataset_map());
    }

    #[test]
    fn test_nested_rollback_keeps_parent_actions() {
        let mut zfs = sample_zfs();

        let mut tx = zfs.transaction();
        tx.snapshot("outer", "rpool/ROOT/ubuntu_abc", false).unwrap();
        let mut nested = tx.nested();
        nested.snapshot("inner", "rpool/ROOT/ubuntu_abc", false).unwrap();
        nested.rollback();

        assert!(tx.zfs().get("rpool/ROOT/ubuntu_abc@inner").is_none());
        assert!(tx.zfs().get("rpool/ROOT/ubuntu_abc@outer").is_some());
        tx.done();

        assert!(zfs.get("rpool/ROOT/ubuntu_abc@outer").is_some());
    }

    #[test]
    fn test_validate_tag() {
        assert!(validate_tag("autozsys_x1").is_ok());
        assert!(validate_tag("2021-06-10_12.00").is_ok());
        assert!(validate_tag("").is_err());
        assert!(validate_tag("with space").is_err());
        assert!(validate_tag("at@sign").is_err());
        assert!(validate_tag("slash/tag").is_err());
    }
}
