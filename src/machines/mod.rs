// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The machine view: bootable system roots grouped into machines with their
//! history states and associated users.
//!
//! Machines exist only in memory; this module rebuilds them from the dataset
//! graph and the kernel command line on every scan. All state operations
//! (boot, save, remove, userdata, gc) live in the submodules and work on a
//! built [`Machines`] plus the graph it came from.

use std::collections::BTreeMap;

use crate::ZsysError;
use crate::cmdline::Cmdline;
use crate::zfs::{Dataset, Zfs};

pub mod boot;
pub mod gc;
pub mod states;
pub mod users;

/// One saved, possibly-bootable system state: a clone root or a snapshot of
/// a root.
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    /// Short identifier: the `_suffix` of a clone root, the tag of a
    /// snapshot.
    pub id: String,
    pub dataset_name: String,
    pub is_snapshot: bool,
    pub last_used: i64,
    /// Filesystem user datasets linked to this state (empty on snapshot
    /// states; their user snapshots associate by tag).
    pub user_datasets: Vec<String>,
}

/// One state of a user's home data, linked to system states through its
/// bootfs-datasets list.
#[derive(Clone, Debug, PartialEq)]
pub struct UserState {
    pub username: String,
    pub dataset_name: String,
    pub is_snapshot: bool,
    pub last_used: i64,
    pub bootfs_datasets: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Machine {
    /// The shared lineage name: the current root stripped of its `_suffix`.
    pub id: String,
    /// Whether the machine is managed by zsys (the bootfs flag on its
    /// current root).
    pub is_zsys: bool,
    pub current: Option<State>,
    /// Every non-current state, keyed by full dataset name (clone roots and
    /// snapshots alike).
    pub history: BTreeMap<String, State>,
    pub users: BTreeMap<String, Vec<UserState>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Machines {
    pub cmdline: Cmdline,
    pub all: BTreeMap<String, Machine>,
    /// Datasets that look user-owned but resolve to no machine.
    pub unmanaged: Vec<String>,
}

/// The lineage a root belongs to: its name with the trailing `_suffix`
/// stripped from the last path segment.
pub(crate) fn machine_id(name: &str) -> String {
    crate::zfs::strip_suffix_name(name)
}

/// The user a home dataset belongs to: last path segment without its
/// `_suffix`, e.g. `rpool/USERDATA/alice_xyz` -> `alice`.
pub(crate) fn username_of(base_name: &str) -> String {
    let last = base_name.rsplit_once('/').map(|(_, l)| l).unwrap_or(base_name);
    last.rsplit_once('_')
        .map(|(stem, _)| stem)
        .unwrap_or(last)
        .to_string()
}

/// Short suffix of a root name (`rpool/ROOT/ubuntu_abc` -> `abc`), or the
/// last segment when there is none.
fn suffix_of(name: &str) -> String {
    let last = name.rsplit_once('/').map(|(_, l)| l).unwrap_or(name);
    last.rsplit_once('_')
        .map(|(_, suffix)| suffix)
        .unwrap_or(last)
        .to_string()
}

/// User-state candidates: roots directly under a USERDATA container, plus
/// anything else carrying its own bootfs-datasets link. Deeper descendants
/// inherit the link and follow their root through recursion instead.
fn is_user_dataset(dataset: &Dataset) -> bool {
    let base = dataset.base_name();
    match base.rsplit_once('/') {
        Some((parent, _)) => {
            parent.ends_with("/USERDATA")
                || (!dataset.bootfs_datasets.is_empty()
                    && dataset.sources.bootfs_datasets.is_local())
        }
        None => false,
    }
}

fn is_system_candidate(dataset: &Dataset) -> bool {
    dataset.bootfs
        && !dataset.is_snapshot()
        && !dataset.name.split('/').any(|segment| segment == "USERDATA")
}

impl State {
    fn from_dataset(dataset: &Dataset) -> State {
        State {
            id: match dataset.snapshot_tag() {
                Some(tag) => tag.to_string(),
                None => suffix_of(&dataset.name),
            },
            dataset_name: dataset.name.clone(),
            is_snapshot: dataset.is_snapshot(),
            last_used: dataset.last_used,
            user_datasets: Vec::new(),
        }
    }
}

impl Machine {
    /// Whether `name` is one of this machine's system state datasets.
    fn owns_dataset(&self, name: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|state| state.dataset_name == name)
            || self.history.contains_key(name)
    }

    /// Find one state by dataset name, snapshot tag or clone suffix.
    pub fn find_state(&self, name: &str) -> Result<&State, ZsysError> {
        if let Some(state) = self.history.get(name) {
            return Ok(state);
        }
        let matches: Vec<&State> = self
            .history
            .values()
            .filter(|state| state.id == name)
            .collect();
        match matches.len() {
            0 => Err(ZsysError::not_found("state", name)),
            1 => Ok(matches[0]),
            _ => Err(ZsysError::invalid_argument(format!(
                "multiple states match '{name}': {}",
                matches
                    .iter()
                    .map(|state| state.dataset_name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// The user states recorded for `user`.
    pub fn user_states(&self, user: &str) -> Result<&[UserState], ZsysError> {
        self.users
            .get(user)
            .map(Vec::as_slice)
            .ok_or_else(|| ZsysError::not_found("user", user))
    }
}

impl Machines {
    /// Group the dataset graph into machines (§ the machine builder).
    pub fn build(zfs: &Zfs, cmdline: &Cmdline) -> Machines {
        let mut machines = Machines {
            cmdline: cmdline.clone(),
            all: BTreeMap::new(),
            unmanaged: Vec::new(),
        };

        // 1. System-root candidates, grouped by lineage.
        let mut groups: BTreeMap<String, Vec<&Dataset>> = BTreeMap::new();
        for dataset in zfs.datasets() {
            if is_system_candidate(dataset) {
                groups
                    .entry(machine_id(&dataset.name))
                    .or_default()
                    .push(dataset);
            }
        }

        // 2. Elect a current root per machine: the command-line root when it
        // is in the group, the single root mounted at / otherwise.
        for (id, group) in groups {
            let mut machine = Machine {
                id,
                ..Machine::default()
            };
            let from_cmdline = cmdline
                .root
                .as_ref()
                .and_then(|root| group.iter().find(|d| &d.name == root));
            let active: Vec<&&Dataset> = group
                .iter()
                .filter(|d| d.mounted && d.mountpoint == "/")
                .collect();
            let current = from_cmdline.or_else(|| {
                if active.len() == 1 {
                    Some(active[0])
                } else {
                    None
                }
            });
            if let Some(current) = current {
                machine.is_zsys = current.bootfs;
                machine.current = Some(State::from_dataset(current));
            }
            for root in &group {
                let is_current = machine
                    .current
                    .as_ref()
                    .is_some_and(|state| state.dataset_name == root.name);
                if !is_current {
                    machine
                        .history
                        .insert(root.name.clone(), State::from_dataset(root));
                }
                // 3. Snapshots of every root are states of the machine too.
                for snap in zfs.snapshots_of(&root.name) {
                    let snap = zfs.get(&snap).expect("snapshot listed but missing");
                    machine
                        .history
                        .insert(snap.name.clone(), State::from_dataset(snap));
                }
            }
            machines.all.insert(machine.id.clone(), machine);
        }

        // 4. Attach user datasets through their bootfs-datasets links.
        for dataset in zfs.datasets() {
            if !is_user_dataset(dataset) {
                continue;
            }
            let links: Vec<String> = dataset
                .bootfs_datasets
                .split(',')
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
            let user_state = UserState {
                username: username_of(dataset.base_name()),
                dataset_name: dataset.name.clone(),
                is_snapshot: dataset.is_snapshot(),
                last_used: dataset.last_used,
                bootfs_datasets: links.clone(),
            };

            let mut attached = false;
            for machine in machines.all.values_mut() {
                if !links.iter().any(|link| machine.owns_dataset(link)) {
                    continue;
                }
                attached = true;
                machine
                    .users
                    .entry(user_state.username.clone())
                    .or_default()
                    .push(user_state.clone());
                // Record filesystem user datasets on the states they serve.
                if !user_state.is_snapshot {
                    for link in &links {
                        if let Some(state) = machine.state_mut(link) {
                            state.user_datasets.push(user_state.dataset_name.clone());
                        }
                    }
                }
            }
            if !attached {
                machines.unmanaged.push(dataset.name.clone());
            }
        }
        machines
    }

    /// The machine currently booted, per the kernel command line.
    pub fn current_machine(&self) -> Result<&Machine, ZsysError> {
        let root = self
            .cmdline
            .root
            .as_deref()
            .ok_or_else(|| ZsysError::unavailable("no ZFS root on the kernel command line"))?;
        self.all
            .values()
            .find(|machine| {
                machine
                    .current
                    .as_ref()
                    .is_some_and(|state| state.dataset_name == root)
            })
            .ok_or_else(|| ZsysError::not_found("machine for root", root))
    }

    /// The current machine's current state.
    pub fn current_state(&self) -> Result<&State, ZsysError> {
        self.current_machine()?
            .current
            .as_ref()
            .ok_or_else(|| ZsysError::unavailable("no current state"))
    }
}

impl Machine {
    fn state_mut(&mut self, dataset_name: &str) -> Option<&mut State> {
        if let Some(state) = self
            .current
            .as_mut()
            .filter(|state| state.dataset_name == dataset_name)
        {
            return Some(state);
        }
        self.history.get_mut(dataset_name)
    }
}

/// A fresh 6-character lowercase alphanumeric identifier for state tags and
/// clone suffixes.
pub(crate) fn generate_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut raw = [0u8; 6];
    // Zeroes on the (never observed) error path still yield a valid id.
    let _ = getrandom::fill(&mut raw);
    raw.iter()
        .map(|b| CHARSET[(*b as usize) % CHARSET.len()] as char)
        .collect()
}

/// Whether a tag looks auto-generated (the GC only reaps those by default).
pub(crate) fn is_generated_id(tag: &str) -> bool {
    tag.len() == 6
        && tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::libzfs::mock::MockPool;

    /// One machine, one history root, one user, a couple of snapshots.
    pub fn two_state_pool() -> MockPool {
        let pool = MockPool::new();
        pool.add_pool("rpool");
        pool.add_dataset("rpool/ROOT", Some("/"), Some("off"));
        pool.add_dataset("rpool/ROOT/ubuntu_abc", Some("/"), Some("on"));
        pool.set_mounted("rpool/ROOT/ubuntu_abc", true);
        pool.set_local_user_prop("rpool/ROOT/ubuntu_abc", "com.ubuntu.zsys:bootfs", "yes");
        pool.set_local_user_prop("rpool/ROOT/ubuntu_abc", "com.ubuntu.zsys:last-used", "400");
        pool.add_dataset("rpool/ROOT/ubuntu_old1", Some("/"), Some("on"));
        pool.set_local_user_prop("rpool/ROOT/ubuntu_old1", "com.ubuntu.zsys:bootfs", "yes");
        pool.set_local_user_prop("rpool/ROOT/ubuntu_old1", "com.ubuntu.zsys:last-used", "300");
        pool.add_dataset("rpool/USERDATA", Some("/"), Some("off"));
        pool.add_dataset("rpool/USERDATA/alice_xyz", Some("/home/alice"), Some("on"));
        pool.set_local_user_prop(
            "rpool/USERDATA/alice_xyz",
            "com.ubuntu.zsys:bootfs-datasets",
            "rpool/ROOT/ubuntu_abc",
        );
        pool.set_local_user_prop("rpool/USERDATA/alice_xyz", "com.ubuntu.zsys:last-used", "400");
        pool
    }

    pub const CMDLINE: &str =
        "BOOT_IMAGE=/BOOT/ubuntu_abc@/vmlinuz-5.4.0 root=ZFS=rpool/ROOT/ubuntu_abc ro quiet";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libzfs::mock::MockPool;
    use testutil::{CMDLINE, two_state_pool};

    fn build() -> (Zfs, Machines) {
        let zfs = Zfs::scan(Box::new(two_state_pool())).unwrap();
        let machines = Machines::build(&zfs, &Cmdline::parse(CMDLINE));
        (zfs, machines)
    }

    #[test]
    fn test_build_groups_lineage() {
        let (_, machines) = build();
        assert_eq!(machines.all.len(), 1);
        let machine = &machines.all["rpool/ROOT/ubuntu"];
        assert!(machine.is_zsys);
        assert_eq!(
            machine.current.as_ref().unwrap().dataset_name,
            "rpool/ROOT/ubuntu_abc"
        );
        assert!(machine.history.contains_key("rpool/ROOT/ubuntu_old1"));
        assert_eq!(machine.history["rpool/ROOT/ubuntu_old1"].id, "old1");
    }

    #[test]
    fn test_build_attaches_users() {
        let (_, machines) = build();
        let machine = &machines.all["rpool/ROOT/ubuntu"];
        let alice = &machine.users["alice"];
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].dataset_name, "rpool/USERDATA/alice_xyz");
        assert_eq!(
            machine.current.as_ref().unwrap().user_datasets,
            vec!["rpool/USERDATA/alice_xyz"]
        );
        assert!(machines.unmanaged.is_empty());
    }

    #[test]
    fn test_build_snapshot_states() {
        let pool = two_state_pool();
        let mut zfs = Zfs::scan(Box::new(pool)).unwrap();
        let mut tx = zfs.transaction();
        tx.snapshot("s1", "rpool/ROOT/ubuntu_abc", true).unwrap();
        tx.done();

        let machines = Machines::build(&zfs, &Cmdline::parse(CMDLINE));
        let machine = &machines.all["rpool/ROOT/ubuntu"];
        let snap = &machine.history["rpool/ROOT/ubuntu_abc@s1"];
        assert!(snap.is_snapshot);
        assert_eq!(snap.id, "s1");
        // A snapshot's last-used is its creation time.
        assert!(snap.last_used > 0);
    }

    #[test]
    fn test_current_unique_or_absent() {
        // Without a command line root and nothing mounted at /, no machine
        // has a current state.
        let pool = two_state_pool();
        pool.set_mounted("rpool/ROOT/ubuntu_abc", false);
        let zfs = Zfs::scan(Box::new(pool)).unwrap();
        let machines = Machines::build(&zfs, &Cmdline::default());
        let machine = &machines.all["rpool/ROOT/ubuntu"];
        assert!(machine.current.is_none());
        assert_eq!(machine.history.len(), 2);
        assert!(machines.current_machine().is_err());
    }

    #[test]
    fn test_active_root_fallback_without_cmdline() {
        let pool = two_state_pool();
        let zfs = Zfs::scan(Box::new(pool)).unwrap();
        let machines = Machines::build(&zfs, &Cmdline::default());
        let machine = &machines.all["rpool/ROOT/ubuntu"];
        // ubuntu_abc is mounted at /, so it is elected without a cmdline.
        assert_eq!(
            machine.current.as_ref().unwrap().dataset_name,
            "rpool/ROOT/ubuntu_abc"
        );
    }

    #[test]
    fn test_unmanaged_user_dataset() {
        let pool = two_state_pool();
        pool.add_dataset("rpool/USERDATA/bob_zzz", Some("/home/bob"), Some("on"));
        pool.set_local_user_prop(
            "rpool/USERDATA/bob_zzz",
            "com.ubuntu.zsys:bootfs-datasets",
            "rpool/ROOT/ubuntu_gone",
        );
        let zfs = Zfs::scan(Box::new(pool)).unwrap();
        let machines = Machines::build(&zfs, &Cmdline::parse(CMDLINE));
        assert_eq!(machines.unmanaged, vec!["rpool/USERDATA/bob_zzz"]);
    }

    #[test]
    fn test_userdata_never_a_system_candidate() {
        let pool = two_state_pool();
        // Even flagged bootfs, a USERDATA dataset is not a system root.
        pool.set_local_user_prop("rpool/USERDATA/alice_xyz", "com.ubuntu.zsys:bootfs", "yes");
        let zfs = Zfs::scan(Box::new(pool)).unwrap();
        let machines = Machines::build(&zfs, &Cmdline::parse(CMDLINE));
        assert_eq!(machines.all.len(), 1);
        assert!(machines.all.contains_key("rpool/ROOT/ubuntu"));
    }

    #[test]
    fn test_find_state() {
        let pool = two_state_pool();
        let mut zfs = Zfs::scan(Box::new(pool)).unwrap();
        let mut tx = zfs.transaction();
        tx.snapshot("s1", "rpool/ROOT/ubuntu_abc", true).unwrap();
        tx.done();
        let machines = Machines::build(&zfs, &Cmdline::parse(CMDLINE));
        let machine = &machines.all["rpool/ROOT/ubuntu"];

        assert_eq!(
            machine.find_state("s1").unwrap().dataset_name,
            "rpool/ROOT/ubuntu_abc@s1"
        );
        assert_eq!(
            machine.find_state("old1").unwrap().dataset_name,
            "rpool/ROOT/ubuntu_old1"
        );
        assert!(matches!(
            machine.find_state("nope"),
            Err(ZsysError::NotFound { .. })
        ));
    }

    #[test]
    fn test_two_machines() {
        let pool = two_state_pool();
        pool.add_dataset("rpool/ROOT/fedora_q1", Some("/"), Some("noauto"));
        pool.set_local_user_prop("rpool/ROOT/fedora_q1", "com.ubuntu.zsys:bootfs", "yes");
        let zfs = Zfs::scan(Box::new(pool)).unwrap();
        let machines = Machines::build(&zfs, &Cmdline::parse(CMDLINE));
        assert_eq!(machines.all.len(), 2);
        assert!(machines.all["rpool/ROOT/fedora"].current.is_none());
        assert_eq!(
            machines.current_machine().unwrap().id,
            "rpool/ROOT/ubuntu"
        );
    }

    #[test]
    fn test_helpers() {
        assert_eq!(machine_id("rpool/ROOT/ubuntu_abc"), "rpool/ROOT/ubuntu");
        assert_eq!(username_of("rpool/USERDATA/alice_xyz"), "alice");
        assert_eq!(username_of("rpool/USERDATA/bob"), "bob");
        let id = generate_id();
        assert_eq!(id.len(), 6);
        assert!(is_generated_id(&id));
        assert!(!is_generated_id("mymanualstate"));
        assert!(!is_generated_id("ABCDEF"));
    }

    #[test]
    fn test_mock_pool_empty_graph() {
        let zfs = Zfs::scan(Box::new(MockPool::new())).unwrap();
        let machines = Machines::build(&zfs, &Cmdline::default());
        assert!(machines.all.is_empty());
        assert!(machines.unmanaged.is_empty());
    }
}
