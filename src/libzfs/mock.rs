// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory pool that operates entirely without side effects.
//!
//! Property inheritance, clone origins and promote re-parenting follow the
//! real filesystem semantics closely enough that the engine's scan-equality
//! invariants hold when tests revert a transaction and rescan.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{CreateOptions, LibzfsError, RawDataset, RawProperty, ZfsPool};

/// One stored node. Only locally-set properties are recorded; effective
/// values and sources are computed on read, the way the pool itself does.
#[derive(Clone, Debug, Default)]
struct Node {
    creation: i64,
    mountpoint: Option<String>,
    canmount: Option<String>,
    mounted: bool,
    origin: String,
    user_props: HashMap<String, String>,
}

pub struct MockPool {
    nodes: RwLock<BTreeMap<String, Node>>,
    capacities: RwLock<HashMap<String, u64>>,
    clock: AtomicI64,
}

impl MockPool {
    pub fn new() -> Self {
        MockPool {
            nodes: RwLock::new(BTreeMap::new()),
            capacities: RwLock::new(HashMap::new()),
            clock: AtomicI64::new(1000),
        }
    }

    /// A small single-machine layout used by the `--backend mock` mode.
    pub fn sampled() -> Self {
        let pool = MockPool::new();
        pool.add_pool("rpool");
        pool.add_dataset("rpool/ROOT", Some("/"), Some("off"));
        pool.add_dataset("rpool/ROOT/ubuntu_e2wti1", Some("/"), Some("on"));
        pool.add_dataset("rpool/USERDATA", Some("/"), Some("off"));
        pool.add_dataset("rpool/USERDATA/alice_oiu4e6", Some("/home/alice"), Some("noauto"));
        {
            let mut nodes = pool.nodes.write().unwrap();
            let root = nodes.get_mut("rpool/ROOT/ubuntu_e2wti1").unwrap();
            root.mounted = true;
            root.user_props
                .insert("com.ubuntu.zsys:bootfs".to_string(), "yes".to_string());
            root.user_props.insert(
                "com.ubuntu.zsys:last-used".to_string(),
                "1623301740".to_string(),
            );
            let home = nodes.get_mut("rpool/USERDATA/alice_oiu4e6").unwrap();
            home.user_props.insert(
                "com.ubuntu.zsys:bootfs-datasets".to_string(),
                "rpool/ROOT/ubuntu_e2wti1".to_string(),
            );
        }
        pool
    }

    fn next_creation(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a pool root dataset.
    pub fn add_pool(&self, name: &str) {
        let creation = self.next_creation();
        self.nodes.write().unwrap().insert(
            name.to_string(),
            Node {
                creation,
                mountpoint: Some(format!("/{name}")),
                ..Node::default()
            },
        );
        self.capacities
            .write()
            .unwrap()
            .insert(name.to_string(), 50);
    }

    /// Register a filesystem dataset without going through `create`, for
    /// seeding test layouts.
    pub fn add_dataset(&self, name: &str, mountpoint: Option<&str>, canmount: Option<&str>) {
        let creation = self.next_creation();
        self.nodes.write().unwrap().insert(
            name.to_string(),
            Node {
                creation,
                mountpoint: mountpoint.map(str::to_string),
                canmount: canmount.map(str::to_string),
                ..Node::default()
            },
        );
    }

    /// Seed a snapshot directly, with locally-set user properties.
    pub fn add_snapshot(&self, name: &str, user_props: &[(&str, &str)]) {
        let creation = self.next_creation();
        self.nodes.write().unwrap().insert(
            name.to_string(),
            Node {
                creation,
                user_props: user_props
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Node::default()
            },
        );
    }

    pub fn set_local_user_prop(&self, name: &str, key: &str, value: &str) {
        let mut nodes = self.nodes.write().unwrap();
        if let Some(node) = nodes.get_mut(name) {
            node.user_props.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_mounted(&self, name: &str, mounted: bool) {
        let mut nodes = self.nodes.write().unwrap();
        if let Some(node) = nodes.get_mut(name) {
            node.mounted = mounted;
        }
    }

    pub fn set_capacity(&self, pool: &str, percent: u64) {
        self.capacities
            .write()
            .unwrap()
            .insert(pool.to_string(), percent);
    }

    /// The dataset (or snapshot base) chain above `name`, nearest first.
    fn ancestors(name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let base = match name.split_once('@') {
            Some((base, _)) => {
                chain.push(base.to_string());
                base
            }
            None => name,
        };
        let mut current = base;
        while let Some(idx) = current.rfind('/') {
            current = &current[..idx];
            chain.push(current.to_string());
        }
        chain
    }

    fn render(nodes: &BTreeMap<String, Node>, name: &str) -> RawDataset {
        let node = &nodes[name];
        let is_snapshot = name.contains('@');

        let (mountpoint, mountpoint_source) = if is_snapshot {
            (String::new(), "-".to_string())
        } else if let Some(mp) = &node.mountpoint {
            (mp.clone(), "local".to_string())
        } else {
            let mut found = None;
            for ancestor in Self::ancestors(name) {
                if let Some(mp) = nodes.get(&ancestor).and_then(|n| n.mountpoint.as_ref()) {
                    let rel = &name[ancestor.len() + 1..];
                    found = Some((
                        join_mountpoint(mp, rel),
                        format!("inherited from {ancestor}"),
                    ));
                    break;
                }
            }
            found.unwrap_or_else(|| (format!("/{name}"), "default".to_string()))
        };

        let (canmount, canmount_source) = if is_snapshot {
            ("-".to_string(), "-".to_string())
        } else if let Some(cm) = &node.canmount {
            (cm.clone(), "local".to_string())
        } else {
            // canmount does not inherit; unset means the default.
            ("on".to_string(), "default".to_string())
        };

        // User properties inherit through the snapshot base and the dataset
        // chain; the nearest locally-set value wins.
        let mut user_properties: HashMap<String, RawProperty> = node
            .user_props
            .iter()
            .map(|(k, v)| (k.clone(), RawProperty::local(v.clone())))
            .collect();
        for ancestor in Self::ancestors(name) {
            if let Some(holder) = nodes.get(&ancestor) {
                for (k, v) in &holder.user_props {
                    user_properties.entry(k.clone()).or_insert(RawProperty {
                        value: v.clone(),
                        source: format!("inherited from {ancestor}"),
                    });
                }
            }
        }

        RawDataset {
            name: name.to_string(),
            creation: node.creation,
            mountpoint,
            mountpoint_source,
            canmount,
            canmount_source,
            mounted: node.mounted,
            origin: node.origin.clone(),
            user_properties,
        }
    }
}

fn join_mountpoint(ancestor: &str, rel: &str) -> String {
    if ancestor == "/" {
        format!("/{rel}")
    } else {
        format!("{ancestor}/{rel}")
    }
}

impl ZfsPool for MockPool {
    fn enumerate_all(&self) -> Result<Vec<RawDataset>, LibzfsError> {
        let nodes = self.nodes.read().unwrap();
        Ok(nodes
            .keys()
            .map(|name| Self::render(&nodes, name))
            .collect())
    }

    fn reload_properties(&self, name: &str) -> Result<RawDataset, LibzfsError> {
        let nodes = self.nodes.read().unwrap();
        if !nodes.contains_key(name) {
            return Err(LibzfsError::not_found(name));
        }
        Ok(Self::render(&nodes, name))
    }

    fn create(&self, name: &str, options: &CreateOptions) -> Result<RawDataset, LibzfsError> {
        let creation = self.next_creation();
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(name) {
            return Err(LibzfsError::exists(name));
        }
        let parent = name.rsplit_once('/').map(|(parent, _)| parent);
        match parent {
            Some(parent) if nodes.contains_key(parent) => {}
            Some(parent) => return Err(LibzfsError::not_found(parent)),
            None => {
                return Err(LibzfsError::CommandFailed {
                    command: "create".to_string(),
                    stderr: format!("cannot create '{name}': missing pool"),
                });
            }
        }
        nodes.insert(
            name.to_string(),
            Node {
                creation,
                mountpoint: options.mountpoint.clone(),
                canmount: options.canmount.clone(),
                ..Node::default()
            },
        );
        Ok(Self::render(&nodes, name))
    }

    fn snapshot(
        &self,
        name: &str,
        user_properties: &[(String, String)],
    ) -> Result<RawDataset, LibzfsError> {
        let creation = self.next_creation();
        let mut nodes = self.nodes.write().unwrap();
        let Some((base, tag)) = name.split_once('@') else {
            return Err(LibzfsError::CommandFailed {
                command: "snapshot".to_string(),
                stderr: format!("'{name}' is not a snapshot name"),
            });
        };
        if tag.is_empty() {
            return Err(LibzfsError::CommandFailed {
                command: "snapshot".to_string(),
                stderr: "empty snapshot name".to_string(),
            });
        }
        if !nodes.contains_key(base) {
            return Err(LibzfsError::not_found(base));
        }
        if nodes.contains_key(name) {
            return Err(LibzfsError::exists(name));
        }
        nodes.insert(
            name.to_string(),
            Node {
                creation,
                user_props: user_properties.iter().cloned().collect(),
                ..Node::default()
            },
        );
        Ok(Self::render(&nodes, name))
    }

    fn clone_dataset(
        &self,
        snapshot: &str,
        target: &str,
        options: &CreateOptions,
    ) -> Result<RawDataset, LibzfsError> {
        let creation = self.next_creation();
        let mut nodes = self.nodes.write().unwrap();
        if !snapshot.contains('@') {
            return Err(LibzfsError::CommandFailed {
                command: "clone".to_string(),
                stderr: format!("'{snapshot}' is not a snapshot"),
            });
        }
        if !nodes.contains_key(snapshot) {
            return Err(LibzfsError::not_found(snapshot));
        }
        if nodes.contains_key(target) {
            return Err(LibzfsError::exists(target));
        }
        match target.rsplit_once('/') {
            Some((parent, _)) if nodes.contains_key(parent) => {}
            Some((parent, _)) => return Err(LibzfsError::not_found(parent)),
            None => {
                return Err(LibzfsError::CommandFailed {
                    command: "clone".to_string(),
                    stderr: format!("invalid clone target '{target}'"),
                });
            }
        }
        nodes.insert(
            target.to_string(),
            Node {
                creation,
                mountpoint: options.mountpoint.clone(),
                canmount: options.canmount.clone(),
                origin: snapshot.to_string(),
                ..Node::default()
            },
        );
        Ok(Self::render(&nodes, target))
    }

    fn promote(&self, name: &str) -> Result<(), LibzfsError> {
        let mut nodes = self.nodes.write().unwrap();
        let Some(node) = nodes.get(name) else {
            return Err(LibzfsError::not_found(name));
        };
        if node.origin.is_empty() {
            return Ok(());
        }
        let origin = node.origin.clone();
        let (donor, origin_tag) = origin.split_once('@').expect("origin is a snapshot");
        let donor = donor.to_string();
        let origin_tag = origin_tag.to_string();
        let origin_creation = nodes
            .get(&origin)
            .map(|n| n.creation)
            .ok_or_else(|| LibzfsError::not_found(&origin))?;

        // Snapshots up to and including the origin move to the promoted
        // dataset. Equal creation seconds order by tag.
        let moved: Vec<String> = nodes
            .iter()
            .filter(|(key, _)| key.starts_with(&format!("{donor}@")))
            .filter(|(key, n)| {
                let tag = key.split_once('@').unwrap().1;
                (n.creation, tag) <= (origin_creation, origin_tag.as_str())
            })
            .map(|(key, _)| key.clone())
            .collect();
        for old_name in &moved {
            let tag = old_name.split_once('@').unwrap().1.to_string();
            let snap = nodes.remove(old_name).unwrap();
            let new_name = format!("{name}@{tag}");
            nodes.insert(new_name.clone(), snap);
            for other in nodes.values_mut() {
                if other.origin == *old_name {
                    other.origin = new_name.clone();
                }
            }
        }

        // Swap the origin fields: the promoted dataset takes over the donor's
        // origin (usually empty) and the donor now depends on the promoted one.
        let donor_origin = nodes[&donor].origin.clone();
        nodes.get_mut(&donor).unwrap().origin = format!("{name}@{origin_tag}");
        nodes.get_mut(name).unwrap().origin = donor_origin;
        Ok(())
    }

    fn destroy(&self, name: &str, _defer: bool) -> Result<(), LibzfsError> {
        let mut nodes = self.nodes.write().unwrap();
        if !nodes.contains_key(name) {
            return Err(LibzfsError::not_found(name));
        }
        if name.contains('@') {
            if let Some(holder) = nodes
                .iter()
                .find(|(_, n)| n.origin == name)
                .map(|(k, _)| k.clone())
            {
                return Err(LibzfsError::CommandFailed {
                    command: "destroy".to_string(),
                    stderr: format!("snapshot '{name}' has dependent clone '{holder}'"),
                });
            }
        } else {
            let child_prefix = format!("{name}/");
            let snap_prefix = format!("{name}@");
            if nodes
                .keys()
                .any(|k| k.starts_with(&child_prefix) || k.starts_with(&snap_prefix))
            {
                return Err(LibzfsError::CommandFailed {
                    command: "destroy".to_string(),
                    stderr: format!("'{name}' has children"),
                });
            }
        }
        nodes.remove(name);
        Ok(())
    }

    fn set_user_prop(&self, name: &str, key: &str, value: &str) -> Result<(), LibzfsError> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| LibzfsError::not_found(name))?;
        node.user_props.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_native_prop(&self, name: &str, key: &str, value: &str) -> Result<(), LibzfsError> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| LibzfsError::not_found(name))?;
        if name.contains('@') {
            return Err(LibzfsError::CommandFailed {
                command: "set".to_string(),
                stderr: format!("cannot set '{key}' on snapshot '{name}'"),
            });
        }
        match key {
            "mountpoint" => node.mountpoint = Some(value.to_string()),
            "canmount" => node.canmount = Some(value.to_string()),
            other => {
                return Err(LibzfsError::CommandFailed {
                    command: "set".to_string(),
                    stderr: format!("unsupported native property '{other}'"),
                });
            }
        }
        Ok(())
    }

    fn inherit_prop(&self, name: &str, key: &str) -> Result<(), LibzfsError> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| LibzfsError::not_found(name))?;
        match key {
            "mountpoint" => node.mountpoint = None,
            "canmount" => node.canmount = None,
            user => {
                node.user_props.remove(user);
            }
        }
        Ok(())
    }

    fn pool_capacity(&self, pool: &str) -> Result<u64, LibzfsError> {
        self.capacities
            .read()
            .unwrap()
            .get(pool)
            .copied()
            .ok_or_else(|| LibzfsError::PoolNotFound {
                name: pool.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_root() -> MockPool {
        let pool = MockPool::new();
        pool.add_pool("rpool");
        pool.add_dataset("rpool/ROOT", Some("/"), Some("off"));
        pool.add_dataset("rpool/ROOT/ubuntu_abc", Some("/"), Some("on"));
        pool
    }

    #[test]
    fn test_mountpoint_inheritance() {
        let pool = pool_with_root();
        pool.add_dataset("rpool/ROOT/ubuntu_abc/var", None, None);
        let raw = pool.reload_properties("rpool/ROOT/ubuntu_abc/var").unwrap();
        assert_eq!(raw.mountpoint, "/var");
        assert_eq!(raw.mountpoint_source, "inherited from rpool/ROOT/ubuntu_abc");
        assert_eq!(raw.canmount, "on");
    }

    #[test]
    fn test_user_prop_inheritance_through_snapshot() {
        let pool = pool_with_root();
        pool.set_local_user_prop("rpool/ROOT/ubuntu_abc", "com.ubuntu.zsys:bootfs", "yes");
        pool.snapshot("rpool/ROOT/ubuntu_abc@s1", &[]).unwrap();
        let raw = pool.reload_properties("rpool/ROOT/ubuntu_abc@s1").unwrap();
        let prop = &raw.user_properties["com.ubuntu.zsys:bootfs"];
        assert_eq!(prop.value, "yes");
        assert!(prop.source.starts_with("inherited from"));
    }

    #[test]
    fn test_snapshot_conflicts_and_missing_base() {
        let pool = pool_with_root();
        pool.snapshot("rpool/ROOT/ubuntu_abc@s1", &[]).unwrap();
        assert!(matches!(
            pool.snapshot("rpool/ROOT/ubuntu_abc@s1", &[]),
            Err(LibzfsError::DatasetExists { .. })
        ));
        assert!(matches!(
            pool.snapshot("rpool/ROOT/missing@s1", &[]),
            Err(LibzfsError::DatasetNotFound { .. })
        ));
    }

    #[test]
    fn test_clone_and_promote_swaps_origins() {
        let pool = pool_with_root();
        pool.snapshot("rpool/ROOT/ubuntu_abc@s1", &[]).unwrap();
        pool.clone_dataset(
            "rpool/ROOT/ubuntu_abc@s1",
            "rpool/ROOT/ubuntu_new",
            &CreateOptions::default(),
        )
        .unwrap();

        pool.promote("rpool/ROOT/ubuntu_new").unwrap();
        let promoted = pool.reload_properties("rpool/ROOT/ubuntu_new").unwrap();
        assert_eq!(promoted.origin, "");
        let donor = pool.reload_properties("rpool/ROOT/ubuntu_abc").unwrap();
        assert_eq!(donor.origin, "rpool/ROOT/ubuntu_new@s1");
        // The snapshot itself moved.
        assert!(pool.reload_properties("rpool/ROOT/ubuntu_abc@s1").is_err());
        assert!(pool.reload_properties("rpool/ROOT/ubuntu_new@s1").is_ok());
    }

    #[test]
    fn test_promote_moves_older_snapshots_only() {
        let pool = pool_with_root();
        pool.snapshot("rpool/ROOT/ubuntu_abc@old", &[]).unwrap();
        pool.snapshot("rpool/ROOT/ubuntu_abc@s1", &[]).unwrap();
        pool.snapshot("rpool/ROOT/ubuntu_abc@newer", &[]).unwrap();
        pool.clone_dataset(
            "rpool/ROOT/ubuntu_abc@s1",
            "rpool/ROOT/ubuntu_new",
            &CreateOptions::default(),
        )
        .unwrap();
        pool.promote("rpool/ROOT/ubuntu_new").unwrap();

        assert!(pool.reload_properties("rpool/ROOT/ubuntu_new@old").is_ok());
        assert!(pool.reload_properties("rpool/ROOT/ubuntu_new@s1").is_ok());
        // Snapshots newer than the origin stay with the donor.
        assert!(pool.reload_properties("rpool/ROOT/ubuntu_abc@newer").is_ok());
        assert!(pool.reload_properties("rpool/ROOT/ubuntu_new@newer").is_err());
    }

    #[test]
    fn test_destroy_refuses_dependents() {
        let pool = pool_with_root();
        pool.snapshot("rpool/ROOT/ubuntu_abc@s1", &[]).unwrap();
        pool.clone_dataset(
            "rpool/ROOT/ubuntu_abc@s1",
            "rpool/ROOT/ubuntu_new",
            &CreateOptions::default(),
        )
        .unwrap();

        assert!(pool.destroy("rpool/ROOT/ubuntu_abc@s1", false).is_err());
        assert!(pool.destroy("rpool/ROOT/ubuntu_abc", false).is_err());
        pool.destroy("rpool/ROOT/ubuntu_new", false).unwrap();
        pool.destroy("rpool/ROOT/ubuntu_abc@s1", false).unwrap();
    }

    #[test]
    fn test_inherit_drops_local_value() {
        let pool = pool_with_root();
        pool.add_dataset("rpool/ROOT/ubuntu_abc/var", Some("/elsewhere"), None);
        pool.inherit_prop("rpool/ROOT/ubuntu_abc/var", "mountpoint")
            .unwrap();
        let raw = pool.reload_properties("rpool/ROOT/ubuntu_abc/var").unwrap();
        assert_eq!(raw.mountpoint, "/var");
    }
}
