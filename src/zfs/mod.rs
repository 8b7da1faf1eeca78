// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The authoritative in-memory view of every dataset on every pool.
//!
//! Adjacency is computed from names rather than stored as owning references:
//! promote re-attaches snapshots to a different parent, and name-derived
//! adjacency sidesteps the cyclic ownership that would otherwise induce. The
//! flat name-to-node map is the single ownership root for the whole graph;
//! children and snapshots are prefix range scans over it.

use std::collections::BTreeMap;

use crate::ZsysError;
use crate::libzfs::{CreateOptions, RawDataset, ZfsPool};

pub mod properties;
pub mod transaction;

use properties::{
    CanMount, PropSource, Property, decode_with_source, encode_with_source, format_bool,
    parse_bool,
};
use transaction::Transaction;

/// Per-property sources, as cached at the last refresh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sources {
    pub mountpoint: PropSource,
    pub canmount: PropSource,
    pub bootfs: PropSource,
    pub last_used: PropSource,
    pub last_booted_kernel: PropSource,
    pub bootfs_datasets: PropSource,
}

/// One node in the graph: a filesystem dataset or a snapshot, with the
/// cached properties the machine layer works from.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    pub name: String,
    /// Creation time, unix seconds.
    pub creation: i64,
    pub mountpoint: String,
    pub canmount: CanMount,
    pub mounted: bool,
    /// Fully qualified origin snapshot for clones, empty otherwise.
    pub origin: String,
    pub bootfs: bool,
    pub last_used: i64,
    pub last_booted_kernel: String,
    /// Comma-separated list of system datasets this user dataset belongs to.
    pub bootfs_datasets: String,
    pub sources: Sources,
}

impl Dataset {
    pub fn is_snapshot(&self) -> bool {
        self.name.contains('@')
    }

    /// The filesystem part of the name: everything before the '@' for a
    /// snapshot, the whole name otherwise.
    pub fn base_name(&self) -> &str {
        match self.name.split_once('@') {
            Some((base, _)) => base,
            None => &self.name,
        }
    }

    pub fn snapshot_tag(&self) -> Option<&str> {
        self.name.split_once('@').map(|(_, tag)| tag)
    }

    /// Decode a raw adapter record into a cached node.
    ///
    /// Snapshots carry the tracked properties inside their values encoded as
    /// `value:source`; filesystems report them directly. An absent user
    /// property reads as unset; a `default` source on a user property is
    /// normalized to unset.
    fn from_raw(raw: &RawDataset) -> Dataset {
        let mut node = Dataset {
            name: raw.name.clone(),
            creation: raw.creation,
            mountpoint: String::new(),
            canmount: CanMount::Unset,
            mounted: raw.mounted,
            origin: raw.origin.clone(),
            bootfs: false,
            last_used: 0,
            last_booted_kernel: String::new(),
            bootfs_datasets: String::new(),
            sources: Sources::default(),
        };

        let user_prop = |prop: Property| -> Option<(String, PropSource)> {
            let raw_prop = raw.user_properties.get(prop.user_prop())?;
            if raw.is_snapshot() {
                Some(decode_with_source(&raw_prop.value))
            } else {
                match PropSource::parse(&raw_prop.source) {
                    // Normalized to unset.
                    PropSource::Default | PropSource::None => None,
                    source => Some((raw_prop.value.clone(), source)),
                }
            }
        };

        if raw.is_snapshot() {
            if let Some((value, source)) = user_prop(Property::Mountpoint) {
                node.mountpoint = value;
                node.sources.mountpoint = source;
            }
            if let Some((value, source)) = user_prop(Property::CanMount) {
                node.canmount = value.parse().unwrap_or(CanMount::Unset);
                node.sources.canmount = source;
            }
            // On a snapshot last-used is its creation time.
            node.last_used = raw.creation;
        } else {
            node.mountpoint = raw.mountpoint.clone();
            node.sources.mountpoint = PropSource::parse(&raw.mountpoint_source);
            node.canmount = raw.canmount.parse().unwrap_or(CanMount::Unset);
            node.sources.canmount = PropSource::parse(&raw.canmount_source);
            if let Some((value, source)) = user_prop(Property::LastUsed) {
                node.last_used = value.parse().unwrap_or(0);
                node.sources.last_used = source;
            }
        }

        if let Some((value, source)) = user_prop(Property::Bootfs) {
            node.bootfs = parse_bool(&value);
            node.sources.bootfs = source;
        }
        if let Some((value, source)) = user_prop(Property::BootfsDatasets) {
            node.bootfs_datasets = value;
            node.sources.bootfs_datasets = source;
        }
        if let Some((value, source)) = user_prop(Property::LastBootedKernel) {
            node.last_booted_kernel = value;
            node.sources.last_booted_kernel = source;
        }
        node
    }

    /// Current value of a tracked property, rendered the way set_property
    /// accepts it.
    pub fn property_value(&self, prop: Property) -> String {
        match prop {
            Property::Mountpoint => self.mountpoint.clone(),
            Property::CanMount => self.canmount.to_string(),
            Property::Bootfs => format_bool(self.bootfs).to_string(),
            Property::LastUsed => self.last_used.to_string(),
            Property::LastBootedKernel => self.last_booted_kernel.clone(),
            Property::BootfsDatasets => self.bootfs_datasets.clone(),
        }
    }

    pub fn property_source(&self, prop: Property) -> PropSource {
        match prop {
            Property::Mountpoint => self.sources.mountpoint,
            Property::CanMount => self.sources.canmount,
            Property::Bootfs => self.sources.bootfs,
            Property::LastUsed => self.sources.last_used,
            Property::LastBootedKernel => self.sources.last_booted_kernel,
            Property::BootfsDatasets => self.sources.bootfs_datasets,
        }
    }

    fn set_property_value(&mut self, prop: Property, value: &str) -> Result<(), ZsysError> {
        match prop {
            Property::Mountpoint => self.mountpoint = value.to_string(),
            Property::CanMount => self.canmount = value.parse()?,
            Property::Bootfs => self.bootfs = parse_bool(value),
            Property::LastUsed => {
                self.last_used = value.parse().map_err(|_| {
                    ZsysError::invalid_argument(format!("last-used must be unix seconds, got '{value}'"))
                })?;
            }
            Property::LastBootedKernel => self.last_booted_kernel = value.to_string(),
            Property::BootfsDatasets => self.bootfs_datasets = value.to_string(),
        }
        Ok(())
    }

    fn set_property_source(&mut self, prop: Property, source: PropSource) {
        match prop {
            Property::Mountpoint => self.sources.mountpoint = source,
            Property::CanMount => self.sources.canmount = source,
            Property::Bootfs => self.sources.bootfs = source,
            Property::LastUsed => self.sources.last_used = source,
            Property::LastBootedKernel => self.sources.last_booted_kernel = source,
            Property::BootfsDatasets => self.sources.bootfs_datasets = source,
        }
    }
}

/// Strip the trailing `_suffix` from the last path segment, leaving the
/// lineage name shared by a root and its promoted clones.
pub(crate) fn strip_suffix_name(base: &str) -> String {
    let (parent, last) = match base.rsplit_once('/') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, base),
    };
    let stem = last.rsplit_once('_').map(|(stem, _)| stem).unwrap_or(last);
    match parent {
        Some(parent) => format!("{parent}/{stem}"),
        None => stem.to_string(),
    }
}

/// Derive the clone target name: strip any trailing `_suffix` from the last
/// path segment and append the new one.
pub(crate) fn rename_with_suffix(base: &str, suffix: &str) -> String {
    format!("{}_{suffix}", strip_suffix_name(base))
}

/// The dataset graph plus the pool adapter that feeds it.
pub struct Zfs {
    pool: Box<dyn ZfsPool>,
    datasets: BTreeMap<String, Dataset>,
}

impl Zfs {
    /// Enumerate every dataset and build the graph.
    ///
    /// Children derive from name prefixes, never from adapter-reported
    /// relationships (those are unreliable after a promote).
    pub fn scan(pool: Box<dyn ZfsPool>) -> Result<Zfs, ZsysError> {
        let mut zfs = Zfs {
            pool,
            datasets: BTreeMap::new(),
        };
        zfs.rescan()?;
        Ok(zfs)
    }

    pub fn rescan(&mut self) -> Result<(), ZsysError> {
        let raws = self.pool.enumerate_all()?;
        let mut datasets = BTreeMap::new();
        for raw in &raws {
            datasets.insert(raw.name.clone(), Dataset::from_raw(raw));
        }
        // Hierarchy sanity: every snapshot's base and every non-pool
        // dataset's parent must be present.
        for name in datasets.keys() {
            let required = match name.split_once('@') {
                Some((base, _)) => Some(base.to_string()),
                None => name.rsplit_once('/').map(|(parent, _)| parent.to_string()),
            };
            if let Some(required) = required {
                if !datasets.contains_key(&required) {
                    return Err(ZsysError::integrity(format!(
                        "dataset '{name}' has no parent '{required}' in scan"
                    )));
                }
            }
        }
        self.datasets = datasets;
        Ok(())
    }

    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values()
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.datasets.get(name)
    }

    pub fn must_get(&self, name: &str) -> Result<&Dataset, ZsysError> {
        self.get(name)
            .ok_or_else(|| ZsysError::not_found("dataset", name))
    }

    /// Direct filesystem children, in name order.
    pub fn children(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}/");
        self.datasets
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| {
                let rest = &key[prefix.len()..];
                !rest.contains('/') && !rest.contains('@')
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Every filesystem dataset strictly below `name`, parents before
    /// children.
    pub fn descendants(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}/");
        self.datasets
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key.contains('@'))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Snapshot names on `base`, in name order.
    pub fn snapshots_of(&self, base: &str) -> Vec<String> {
        let prefix = format!("{base}@");
        self.datasets
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn pool_capacity(&self, pool: &str) -> Result<u64, ZsysError> {
        Ok(self.pool.pool_capacity(pool)?)
    }

    /// Open a transaction. Mutations go through it; cancellation (or drop
    /// without `done`) reverts everything it did, in LIFO order.
    pub fn transaction(&mut self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Destroy a dataset, its descendants and their snapshots — or, when a
    /// snapshot is named, the same-tag snapshots across the subtree.
    ///
    /// Destruction is irreversible, so it is only available outside a
    /// transaction. Refuses when any clone outside the subtree still
    /// originates from inside it.
    pub fn destroy(&mut self, name: &str) -> Result<(), ZsysError> {
        self.must_get(name)?;
        let doomed = self.destroy_set(name);
        for node in self.datasets.values() {
            if node.is_snapshot() || node.origin.is_empty() {
                continue;
            }
            if doomed.contains(&node.origin) && !doomed.contains(&node.name) {
                return Err(ZsysError::conflict(format!(
                    "cannot destroy '{name}': '{}' is a clone of '{}'",
                    node.name, node.origin
                )));
            }
        }
        // Deepest first, snapshots before their filesystem.
        for victim in doomed.iter().rev() {
            self.pool.destroy(victim, false)?;
            self.datasets.remove(victim);
        }
        Ok(())
    }

    /// The exact set of names `destroy(name)` would remove, parents first.
    fn destroy_set(&self, name: &str) -> Vec<String> {
        match name.split_once('@') {
            Some((base, tag)) => {
                let mut doomed = vec![name.to_string()];
                for descendant in self.descendants(base) {
                    let snap = format!("{descendant}@{tag}");
                    if self.datasets.contains_key(&snap) {
                        doomed.push(snap);
                    }
                }
                doomed
            }
            None => {
                let mut doomed = Vec::new();
                let mut bases = vec![name.to_string()];
                bases.extend(self.descendants(name));
                for base in bases {
                    doomed.push(base.clone());
                    doomed.extend(self.snapshots_of(&base));
                }
                doomed
            }
        }
    }

    /// Snapshot-hierarchy integrity for a recursive operation rooted at
    /// `base@tag`: any descendant carrying the tag requires every dataset
    /// between it and the base to carry the tag too.
    pub(crate) fn check_snapshot_hierarchy(&self, base: &str, tag: &str) -> Result<(), ZsysError> {
        for descendant in self.descendants(base) {
            if !self.datasets.contains_key(&format!("{descendant}@{tag}")) {
                continue;
            }
            let mut ancestor = descendant.as_str();
            while let Some(idx) = ancestor.rfind('/') {
                ancestor = &ancestor[..idx];
                if ancestor.len() <= base.len() {
                    break;
                }
                if !self.datasets.contains_key(&format!("{ancestor}@{tag}")) {
                    return Err(ZsysError::integrity(format!(
                        "'{descendant}@{tag}' exists but intermediate '{ancestor}' has no '@{tag}' snapshot"
                    )));
                }
            }
        }
        Ok(())
    }

    // Mutation primitives shared by the transaction engine and its revert
    // path. Each one keeps the adapter and the cache in step.

    pub(crate) fn apply_create(
        &mut self,
        name: &str,
        mountpoint: &str,
        canmount: CanMount,
    ) -> Result<(), ZsysError> {
        if name.contains('@') {
            return Err(ZsysError::invalid_argument(format!(
                "cannot create '{name}': snapshots are created with snapshot()"
            )));
        }
        if self.datasets.contains_key(name) {
            return Err(ZsysError::already_exists(name));
        }
        let Some((parent, _)) = name.rsplit_once('/') else {
            return Err(ZsysError::invalid_argument(format!(
                "cannot create pool-level dataset '{name}'"
            )));
        };
        self.must_get(parent).map_err(|_| {
            ZsysError::not_found("parent dataset of", name)
        })?;
        let raw = self.pool.create(
            name,
            &CreateOptions {
                mountpoint: Some(mountpoint.to_string()),
                canmount: Some(canmount.to_string()),
            },
        )?;
        self.datasets.insert(name.to_string(), Dataset::from_raw(&raw));
        Ok(())
    }

    /// Create `base@tag`, carrying the tracked properties into the snapshot
    /// as `value:source`.
    pub(crate) fn apply_snapshot_one(&mut self, base: &str, tag: &str) -> Result<String, ZsysError> {
        let node = self.must_get(base)?;
        if node.is_snapshot() {
            return Err(ZsysError::invalid_argument(format!(
                "cannot snapshot '{base}': it is itself a snapshot"
            )));
        }
        let snap_name = format!("{base}@{tag}");
        if self.datasets.contains_key(&snap_name) {
            return Err(ZsysError::already_exists(snap_name));
        }

        let mut props: Vec<(String, String)> = vec![
            (
                Property::Mountpoint.user_prop().to_string(),
                encode_with_source(&node.mountpoint, node.sources.mountpoint),
            ),
            (
                Property::CanMount.user_prop().to_string(),
                encode_with_source(&node.canmount.to_string(), node.sources.canmount),
            ),
        ];
        for prop in [
            Property::Bootfs,
            Property::BootfsDatasets,
            Property::LastBootedKernel,
        ] {
            let source = node.property_source(prop);
            if matches!(source, PropSource::Local | PropSource::Inherited) {
                props.push((
                    prop.user_prop().to_string(),
                    encode_with_source(&node.property_value(prop), source),
                ));
            }
        }

        let raw = self.pool.snapshot(&snap_name, &props)?;
        self.datasets.insert(snap_name.clone(), Dataset::from_raw(&raw));
        Ok(snap_name)
    }

    /// Clone one snapshot to `target`, rewriting canmount so the clone never
    /// auto-mounts over the live root and copying the mountpoint only when
    /// it was locally set. Link properties are not carried over: a fresh
    /// clone belongs to no system state yet.
    pub(crate) fn apply_clone_one(&mut self, snapshot: &str, target: &str) -> Result<(), ZsysError> {
        let snap = self.must_get(snapshot)?.clone();
        if self.datasets.contains_key(target) {
            return Err(ZsysError::already_exists(target));
        }
        let canmount = match snap.canmount {
            CanMount::On | CanMount::NoAuto => Some("noauto".to_string()),
            CanMount::Off => Some("off".to_string()),
            CanMount::Unset => None,
        };
        let mountpoint = snap
            .sources
            .mountpoint
            .is_local()
            .then(|| snap.mountpoint.clone());
        let raw = self.pool.clone_dataset(
            snapshot,
            target,
            &CreateOptions {
                mountpoint,
                canmount,
            },
        )?;
        let mut node = Dataset::from_raw(&raw);
        if snap.sources.bootfs.is_local() {
            self.pool.set_user_prop(
                target,
                Property::Bootfs.user_prop(),
                format_bool(snap.bootfs),
            )?;
            node.bootfs = snap.bootfs;
            node.sources.bootfs = PropSource::Local;
        }
        self.datasets.insert(target.to_string(), node);
        Ok(())
    }

    /// Promote `name`: migrate the donor's snapshots up to the origin onto
    /// the promoted dataset, redirect clones of the migrated snapshots, and
    /// swap origins. Returns the donor (the inverse promote target), or None
    /// when the dataset had no origin.
    pub(crate) fn apply_promote_one(&mut self, name: &str) -> Result<Option<String>, ZsysError> {
        let node = self.must_get(name)?;
        if node.is_snapshot() {
            return Err(ZsysError::invalid_argument(format!(
                "cannot promote snapshot '{name}'"
            )));
        }
        if node.origin.is_empty() {
            return Ok(None);
        }
        let origin = node.origin.clone();
        let (donor, origin_tag) = origin
            .split_once('@')
            .map(|(donor, tag)| (donor.to_string(), tag.to_string()))
            .ok_or_else(|| {
                ZsysError::integrity(format!("origin '{origin}' of '{name}' is not a snapshot"))
            })?;
        let origin_creation = self.must_get(&origin)?.creation;

        self.pool.promote(name)?;

        // Snapshots at or before the origin follow the promoted dataset.
        // Equal creation seconds order by tag.
        let moved: Vec<String> = self
            .snapshots_of(&donor)
            .into_iter()
            .filter(|snap| {
                let node = &self.datasets[snap];
                let tag = node.snapshot_tag().unwrap_or_default();
                (node.creation, tag) <= (origin_creation, origin_tag.as_str())
            })
            .collect();
        for old_name in &moved {
            let tag = old_name.split_once('@').unwrap().1.to_string();
            let mut snap = self.datasets.remove(old_name).unwrap();
            let new_name = format!("{name}@{tag}");
            snap.name = new_name.clone();
            self.datasets.insert(new_name.clone(), snap);
            for other in self.datasets.values_mut() {
                if !other.is_snapshot() && other.origin == *old_name {
                    other.origin = new_name.clone();
                }
            }
        }

        let donor_origin = self.datasets[&donor].origin.clone();
        self.datasets.get_mut(&donor).unwrap().origin = format!("{name}@{origin_tag}");
        self.datasets.get_mut(name).unwrap().origin = donor_origin;
        Ok(Some(donor))
    }

    /// Set one property, returning the previous value and source when a
    /// change was made (None when the dataset already held exactly that).
    ///
    /// `source` Local writes the value; any other source drops the local
    /// value so the dataset inherits again (the revert path restores
    /// captured pre-change state this way). A non-local current source
    /// refuses the change unless `force` is set. The new value is pushed to
    /// every descendant that inherits it, stopping at locally-set shields;
    /// mountpoints are rewritten by prefix.
    pub(crate) fn apply_set_property(
        &mut self,
        prop: Property,
        value: &str,
        source: PropSource,
        name: &str,
        force: bool,
    ) -> Result<Option<(String, PropSource)>, ZsysError> {
        let node = self.must_get(name)?;
        let is_snapshot = node.is_snapshot();
        let previous_value = node.property_value(prop);
        let previous_source = node.property_source(prop);

        if matches!(previous_source, PropSource::Inherited | PropSource::Default) && !force {
            return Err(ZsysError::conflict(format!(
                "cannot change {prop} on '{name}': value is {previous_source}, use force to override"
            )));
        }
        if previous_value == value && previous_source == source {
            return Ok(None);
        }

        // Validate before touching the pool.
        {
            let mut probe = node.clone();
            probe.set_property_value(prop, value)?;
        }

        if source == PropSource::Local {
            if is_snapshot {
                self.pool.set_user_prop(
                    name,
                    prop.user_prop(),
                    &encode_with_source(value, PropSource::Local),
                )?;
            } else if prop.is_native() {
                self.pool
                    .set_native_prop(name, &prop.to_string(), value)?;
            } else {
                self.pool.set_user_prop(name, prop.user_prop(), value)?;
            }
        } else {
            let key = if is_snapshot || !prop.is_native() {
                prop.user_prop().to_string()
            } else {
                prop.to_string()
            };
            self.pool.inherit_prop(name, &key)?;
        }

        let node = self.datasets.get_mut(name).unwrap();
        node.set_property_value(prop, value)?;
        node.set_property_source(prop, source);

        if !is_snapshot {
            self.propagate_property(prop, name, &previous_value, value)?;
        }
        Ok(Some((previous_value, previous_source)))
    }

    /// Push a changed property down to inheriting descendants. The walk is
    /// pre-order over filesystem children only and stops at any descendant
    /// holding the property locally.
    fn propagate_property(
        &mut self,
        prop: Property,
        name: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<(), ZsysError> {
        let mut frontier = self.children(name);
        while let Some(child) = frontier.pop() {
            let node = &self.datasets[&child];
            let source = node.property_source(prop);
            let inherits = match prop.is_native() {
                true => source == PropSource::Inherited,
                // User properties also propagate when simply unset.
                false => matches!(source, PropSource::Inherited | PropSource::None),
            };
            if !inherits {
                continue;
            }
            let updated = match prop {
                Property::Mountpoint => {
                    match node.mountpoint.strip_prefix(old_value) {
                        Some(suffix) => format!("{new_value}{suffix}"),
                        // Out-of-band mountpoint, leave it alone.
                        None => node.mountpoint.clone(),
                    }
                }
                _ => new_value.to_string(),
            };
            let node = self.datasets.get_mut(&child).unwrap();
            node.set_property_value(prop, &updated)?;
            node.set_property_source(prop, PropSource::Inherited);
            frontier.extend(self.children(&child));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn dataset_map(&self) -> BTreeMap<String, Dataset> {
        self.datasets.clone()
    }
}
