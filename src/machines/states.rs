// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Saving and removing states.
//!
//! A system save snapshots the booted root recursively and every linked
//! user dataset under one shared tag, in one transaction. Removal unlinks
//! shared user states and destroys strictly-dependent ones; destruction runs
//! outside the transaction because it cannot be compensated.

use tracing;

use super::{Machine, Machines, UserState, generate_id};
use crate::ZsysError;
use crate::zfs::Zfs;
use crate::zfs::properties::Property;

/// Snapshot the current system state and its user datasets under one tag.
/// An empty `state_name` gets a generated 6-character tag. Returns the tag.
pub fn create_system_snapshot(
    machines: &Machines,
    zfs: &mut Zfs,
    state_name: Option<&str>,
) -> Result<String, ZsysError> {
    let current = machines.current_state()?.clone();
    let tag = resolve_tag(zfs, &current.dataset_name, state_name)?;

    let mut tx = zfs.transaction();
    tx.snapshot(&tag, &current.dataset_name, true)?;
    for user_dataset in &current.user_datasets {
        tx.snapshot(&tag, user_dataset, true)?;
    }
    tx.done();

    tracing::info!(state = %tag, root = %current.dataset_name, "system state saved");
    Ok(tag)
}

/// Snapshot every dataset belonging to `user` on the current machine.
pub fn create_user_snapshot(
    machines: &Machines,
    zfs: &mut Zfs,
    user: &str,
    state_name: Option<&str>,
) -> Result<String, ZsysError> {
    let machine = machines.current_machine()?;
    let datasets: Vec<String> = machine
        .user_states(user)?
        .iter()
        .filter(|state| !state.is_snapshot)
        .map(|state| state.dataset_name.clone())
        .collect();
    if datasets.is_empty() {
        return Err(ZsysError::not_found("user dataset for", user));
    }

    let tag = resolve_tag(zfs, &datasets[0], state_name)?;
    let mut tx = zfs.transaction();
    for dataset in &datasets {
        tx.snapshot(&tag, dataset, true)?;
    }
    tx.done();

    tracing::info!(state = %tag, user, "user state saved");
    Ok(tag)
}

fn resolve_tag(
    zfs: &Zfs,
    dataset: &str,
    state_name: Option<&str>,
) -> Result<String, ZsysError> {
    match state_name {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => {
            // Collisions are unlikely; re-roll rather than fail on one.
            loop {
                let tag = generate_id();
                if zfs.get(&format!("{dataset}@{tag}")).is_none() {
                    return Ok(tag);
                }
            }
        }
    }
}

/// What a removal will do, in execution order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemovePlan {
    /// Datasets whose bootfs-datasets list shrinks but survives.
    pub unlink: Vec<(String, String)>,
    /// Datasets destroyed outright (recursively).
    pub destroy: Vec<String>,
}

impl RemovePlan {
    /// The human-readable preview shown by dry runs and confirmations.
    pub fn preview(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (dataset, remaining) in &self.unlink {
            lines.push(format!("unlink {dataset} (still used by {remaining})"));
        }
        for dataset in &self.destroy {
            lines.push(format!("destroy {dataset}"));
        }
        lines
    }
}

/// Remove a system or user state.
///
/// Without `force`, any dependent state raises NeedsConfirmation carrying
/// the dependency list. With `dry_run`, the plan is returned without any
/// change. User states whose link list still references other system states
/// are unlinked, not destroyed.
pub fn remove_state(
    machines: &Machines,
    zfs: &mut Zfs,
    name: &str,
    user: Option<&str>,
    force: bool,
    dry_run: bool,
) -> Result<RemovePlan, ZsysError> {
    let machine = machines.current_machine()?;
    let plan = match user {
        Some(user) => plan_user_removal(machine, zfs, user, name)?,
        None => plan_system_removal(machine, zfs, name)?,
    };

    let dependencies = plan.preview();
    // Removing only the named dataset itself needs no confirmation.
    let nontrivial = plan.destroy.len() + plan.unlink.len() > 1;
    if !force && nontrivial {
        return Err(ZsysError::needs_confirmation(
            format!("removing '{name}' affects dependent states"),
            dependencies,
        ));
    }
    if dry_run {
        return Ok(plan);
    }

    if !plan.unlink.is_empty() {
        let mut tx = zfs.transaction();
        for (dataset, remaining) in &plan.unlink {
            tx.set_property(Property::BootfsDatasets, remaining, dataset, true)?;
        }
        tx.done();
    }
    for dataset in &plan.destroy {
        zfs.destroy(dataset)?;
        tracing::info!(dataset = %dataset, "state destroyed");
    }
    Ok(plan)
}

fn plan_system_removal(
    machine: &Machine,
    zfs: &Zfs,
    name: &str,
) -> Result<RemovePlan, ZsysError> {
    let state = machine.find_state(name)?.clone();
    let mut plan = RemovePlan::default();

    if state.is_snapshot {
        let root = state
            .dataset_name
            .split_once('@')
            .map(|(base, _)| base.to_string())
            .unwrap_or_default();
        for user_state in machine.users.values().flatten() {
            if user_state.dataset_name.ends_with(&format!("@{}", state.id))
                && user_state.bootfs_datasets.iter().any(|link| link == &root)
            {
                push_dependent(&mut plan, user_state, &root);
            }
        }
    } else {
        // A clone root takes its own snapshots with it; they are separate
        // states, so they count as dependencies.
        for snapshot in zfs.snapshots_of(&state.dataset_name) {
            for user_state in machine.users.values().flatten() {
                let tag = snapshot.split_once('@').map(|(_, tag)| tag).unwrap_or("");
                if user_state.dataset_name.ends_with(&format!("@{tag}"))
                    && user_state
                        .bootfs_datasets
                        .iter()
                        .any(|link| link == &state.dataset_name)
                {
                    push_dependent(&mut plan, user_state, &state.dataset_name);
                }
            }
        }
        for user_state in machine.users.values().flatten() {
            if !user_state.is_snapshot
                && user_state
                    .bootfs_datasets
                    .iter()
                    .any(|link| link == &state.dataset_name)
            {
                push_dependent(&mut plan, user_state, &state.dataset_name);
            }
        }
    }

    plan.destroy.push(state.dataset_name.clone());
    Ok(plan)
}

fn push_dependent(plan: &mut RemovePlan, user_state: &UserState, removed_link: &str) {
    let remaining: Vec<&String> = user_state
        .bootfs_datasets
        .iter()
        .filter(|link| link.as_str() != removed_link)
        .collect();
    if remaining.is_empty() {
        plan.destroy.push(user_state.dataset_name.clone());
    } else {
        let remaining = remaining
            .into_iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        plan.unlink.push((user_state.dataset_name.clone(), remaining));
    }
}

fn plan_user_removal(
    machine: &Machine,
    zfs: &Zfs,
    user: &str,
    name: &str,
) -> Result<RemovePlan, ZsysError> {
    let states = machine.user_states(user)?;
    let matches: Vec<&UserState> = states
        .iter()
        .filter(|state| {
            state.dataset_name == name
                || state
                    .dataset_name
                    .split_once('@')
                    .is_some_and(|(_, tag)| tag == name)
        })
        .collect();
    let target = match matches.len() {
        0 => return Err(ZsysError::not_found("user state", name)),
        1 => matches[0],
        _ => {
            return Err(ZsysError::invalid_argument(format!(
                "multiple user states match '{name}'"
            )));
        }
    };

    let mut plan = RemovePlan::default();
    // A filesystem user state is destroyed recursively, snapshots included;
    // those snapshots are states of their own and count as dependencies.
    if !target.is_snapshot {
        for snapshot in zfs.snapshots_of(&target.dataset_name) {
            plan.destroy.push(snapshot);
        }
    }
    plan.destroy.push(target.dataset_name.clone());
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::Cmdline;
    use crate::machines::testutil::{CMDLINE, two_state_pool};
    use crate::zfs::properties::PropSource;

    fn build() -> (Zfs, Machines) {
        let zfs = Zfs::scan(Box::new(two_state_pool())).unwrap();
        let machines = Machines::build(&zfs, &Cmdline::parse(CMDLINE));
        (zfs, machines)
    }

    fn rebuild(zfs: &Zfs) -> Machines {
        Machines::build(zfs, &Cmdline::parse(CMDLINE))
    }

    #[test]
    fn test_save_system_state_generates_shared_tag() {
        let (mut zfs, machines) = build();
        let tag = create_system_snapshot(&machines, &mut zfs, None).unwrap();
        assert_eq!(tag.len(), 6);

        let system = zfs.get(&format!("rpool/ROOT/ubuntu_abc@{tag}")).unwrap();
        let user = zfs.get(&format!("rpool/USERDATA/alice_xyz@{tag}")).unwrap();
        // last-used of both snapshots is their creation time.
        assert_eq!(system.last_used, system.creation);
        assert_eq!(user.last_used, user.creation);
        // The user snapshot keeps its association, with the source encoded.
        assert_eq!(user.bootfs_datasets, "rpool/ROOT/ubuntu_abc");
        assert_eq!(user.sources.bootfs_datasets, PropSource::Local);
    }

    #[test]
    fn test_save_with_fixed_tag_twice_fails() {
        let (mut zfs, machines) = build();
        create_system_snapshot(&machines, &mut zfs, Some("s1")).unwrap();
        let machines = rebuild(&zfs);
        let err = create_system_snapshot(&machines, &mut zfs, Some("s1")).unwrap_err();
        assert!(matches!(err, ZsysError::AlreadyExists { .. }));
        // The failed attempt reverted cleanly: no half-created user snapshot
        // from the second run.
        assert!(zfs.get("rpool/USERDATA/alice_xyz@s1").is_some());
    }

    #[test]
    fn test_save_user_state() {
        let (mut zfs, machines) = build();
        let tag = create_user_snapshot(&machines, &mut zfs, "alice", Some("mine")).unwrap();
        assert_eq!(tag, "mine");
        assert!(zfs.get("rpool/USERDATA/alice_xyz@mine").is_some());
        assert!(zfs.get("rpool/ROOT/ubuntu_abc@mine").is_none());

        let machines = rebuild(&zfs);
        assert!(matches!(
            create_user_snapshot(&machines, &mut zfs, "nobody", None),
            Err(ZsysError::NotFound { .. })
        ));
    }

    #[test]
    fn test_remove_snapshot_state_needs_confirmation() {
        let (mut zfs, machines) = build();
        create_system_snapshot(&machines, &mut zfs, Some("s1")).unwrap();
        let machines = rebuild(&zfs);

        let err = remove_state(&machines, &mut zfs, "s1", None, false, false).unwrap_err();
        let ZsysError::NeedsConfirmation { dependencies, .. } = &err else {
            panic!("expected NeedsConfirmation, got {err:?}");
        };
        assert!(
            dependencies
                .iter()
                .any(|line| line.contains("rpool/USERDATA/alice_xyz@s1")),
            "dependencies should mention the user snapshot: {dependencies:?}"
        );

        // Nothing was touched.
        assert!(zfs.get("rpool/ROOT/ubuntu_abc@s1").is_some());
        assert!(zfs.get("rpool/USERDATA/alice_xyz@s1").is_some());
    }

    #[test]
    fn test_remove_snapshot_state_with_force() {
        let (mut zfs, machines) = build();
        let count_before = zfs.datasets().count();
        create_system_snapshot(&machines, &mut zfs, Some("s1")).unwrap();
        let machines = rebuild(&zfs);

        remove_state(&machines, &mut zfs, "s1", None, true, false).unwrap();
        assert!(zfs.get("rpool/ROOT/ubuntu_abc@s1").is_none());
        assert!(zfs.get("rpool/USERDATA/alice_xyz@s1").is_none());
        // Save then force-remove restores the dataset count.
        assert_eq!(zfs.datasets().count(), count_before);
    }

    #[test]
    fn test_remove_dry_run_changes_nothing() {
        let (mut zfs, machines) = build();
        create_system_snapshot(&machines, &mut zfs, Some("s1")).unwrap();
        let machines = rebuild(&zfs);
        let before = zfs.dataset_map();

        let plan = remove_state(&machines, &mut zfs, "s1", None, true, true).unwrap();
        assert_eq!(before, zfs.dataset_map());
        let preview = plan.preview();
        assert!(preview.iter().any(|l| l.contains("rpool/ROOT/ubuntu_abc@s1")));
        assert!(preview.iter().any(|l| l.contains("rpool/USERDATA/alice_xyz@s1")));
    }

    #[test]
    fn test_remove_unlinks_shared_user_snapshot() {
        let (mut zfs, machines) = build();
        create_system_snapshot(&machines, &mut zfs, Some("s1")).unwrap();
        // The user snapshot also references the history root, so it must
        // survive the removal with a shorter list.
        zfs.apply_set_property(
            Property::BootfsDatasets,
            "rpool/ROOT/ubuntu_abc,rpool/ROOT/ubuntu_old1",
            PropSource::Local,
            "rpool/USERDATA/alice_xyz@s1",
            true,
        )
        .unwrap();
        let machines = rebuild(&zfs);

        remove_state(&machines, &mut zfs, "s1", None, true, false).unwrap();
        assert!(zfs.get("rpool/ROOT/ubuntu_abc@s1").is_none());
        let user_snap = zfs.get("rpool/USERDATA/alice_xyz@s1").unwrap();
        assert_eq!(user_snap.bootfs_datasets, "rpool/ROOT/ubuntu_old1");
    }

    #[test]
    fn test_remove_history_clone_state() {
        let (mut zfs, machines) = build();
        let plan = remove_state(&machines, &mut zfs, "old1", None, true, false).unwrap();
        assert_eq!(plan.destroy, vec!["rpool/ROOT/ubuntu_old1"]);
        assert!(zfs.get("rpool/ROOT/ubuntu_old1").is_none());
    }

    #[test]
    fn test_remove_current_state_is_refused() {
        let (mut zfs, machines) = build();
        assert!(matches!(
            remove_state(&machines, &mut zfs, "rpool/ROOT/ubuntu_abc", None, true, false),
            Err(ZsysError::NotFound { .. })
        ));
    }

    #[test]
    fn test_remove_user_state() {
        let (mut zfs, machines) = build();
        create_user_snapshot(&machines, &mut zfs, "alice", Some("mine")).unwrap();
        let machines = rebuild(&zfs);

        remove_state(&machines, &mut zfs, "mine", Some("alice"), false, false).unwrap();
        assert!(zfs.get("rpool/USERDATA/alice_xyz@mine").is_none());
        assert!(zfs.get("rpool/USERDATA/alice_xyz").is_some());
    }

    #[test]
    fn test_remove_user_dataset_with_snapshots_needs_force() {
        let (mut zfs, machines) = build();
        create_user_snapshot(&machines, &mut zfs, "alice", Some("mine")).unwrap();
        let machines = rebuild(&zfs);

        let err = remove_state(
            &machines,
            &mut zfs,
            "rpool/USERDATA/alice_xyz",
            Some("alice"),
            false,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ZsysError::NeedsConfirmation { .. }));

        remove_state(
            &machines,
            &mut zfs,
            "rpool/USERDATA/alice_xyz",
            Some("alice"),
            true,
            false,
        )
        .unwrap();
        assert!(zfs.get("rpool/USERDATA/alice_xyz").is_none());
        assert!(zfs.get("rpool/USERDATA/alice_xyz@mine").is_none());
    }
}
