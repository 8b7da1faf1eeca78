// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-data lifecycle: allocating a home dataset for a user, moving a home,
//! and detaching a user from the booted system state.

use tracing;

use super::Machines;
use crate::ZsysError;
use crate::zfs::Zfs;
use crate::zfs::properties::{CanMount, Property};

/// Give `user` a home dataset at `homepath` on the current machine.
///
/// An existing dataset is re-pointed at the new home; otherwise a fresh
/// `<pool>/USERDATA/<user>_<id>` is created and linked to the booted state.
pub fn create_user_data(
    machines: &Machines,
    zfs: &mut Zfs,
    user: &str,
    homepath: &str,
) -> Result<(), ZsysError> {
    if user.is_empty() {
        return Err(ZsysError::invalid_argument("user name cannot be empty"));
    }
    if !homepath.starts_with('/') {
        return Err(ZsysError::invalid_argument(format!(
            "home path '{homepath}' must be absolute"
        )));
    }
    let machine = machines.current_machine()?;
    let current = machines.current_state()?;

    if let Some(states) = machine.users.get(user) {
        if let Some(existing) = states.iter().find(|state| !state.is_snapshot) {
            let mut tx = zfs.transaction();
            tx.set_property(Property::Mountpoint, homepath, &existing.dataset_name, true)?;
            tx.done();
            tracing::info!(user, home = homepath, dataset = %existing.dataset_name, "home moved");
            return Ok(());
        }
    }

    let pool = current
        .dataset_name
        .split_once('/')
        .map(|(pool, _)| pool)
        .unwrap_or(&current.dataset_name);
    let container = format!("{pool}/USERDATA");
    let dataset = format!("{container}/{user}_{}", super::generate_id());

    let mut tx = zfs.transaction();
    if tx.zfs().get(&container).is_none() {
        tx.create(&container, "/", CanMount::Off)?;
    }
    tx.create(&dataset, homepath, CanMount::On)?;
    tx.set_property(
        Property::BootfsDatasets,
        &current.dataset_name,
        &dataset,
        true,
    )?;
    tx.done();
    tracing::info!(user, home = homepath, dataset = %dataset, "user data created");
    Ok(())
}

/// Re-point the user dataset mounted at `home` to `new_home`. Exactly one
/// dataset must match.
pub fn change_home_on_user_data(
    machines: &Machines,
    zfs: &mut Zfs,
    home: &str,
    new_home: &str,
) -> Result<(), ZsysError> {
    if !new_home.starts_with('/') {
        return Err(ZsysError::invalid_argument(format!(
            "home path '{new_home}' must be absolute"
        )));
    }
    let machine = machines.current_machine()?;
    let matches: Vec<String> = machine
        .users
        .values()
        .flatten()
        .filter(|state| !state.is_snapshot)
        .filter(|state| {
            zfs.get(&state.dataset_name)
                .is_some_and(|dataset| dataset.mountpoint == home)
        })
        .map(|state| state.dataset_name.clone())
        .collect();

    let dataset = match matches.len() {
        0 => return Err(ZsysError::not_found("user dataset mounted at", home)),
        1 => &matches[0],
        _ => {
            return Err(ZsysError::invalid_argument(format!(
                "several user datasets mounted at '{home}': {}",
                matches.join(", ")
            )));
        }
    };

    let mut tx = zfs.transaction();
    tx.set_property(Property::Mountpoint, new_home, dataset, true)?;
    tx.done();
    tracing::info!(from = home, to = new_home, dataset = %dataset, "home changed");
    Ok(())
}

/// Remove the booted state from every dataset of `user`. With `remove_home`,
/// datasets left with no association are destroyed.
pub fn dissociate_user(
    machines: &Machines,
    zfs: &mut Zfs,
    user: &str,
    remove_home: bool,
) -> Result<(), ZsysError> {
    let machine = machines.current_machine()?;
    let current = machines.current_state()?;
    let states: Vec<_> = machine
        .user_states(user)?
        .iter()
        .filter(|state| !state.is_snapshot)
        .cloned()
        .collect();

    let mut doomed = Vec::new();
    let mut tx = zfs.transaction();
    for state in &states {
        if !state
            .bootfs_datasets
            .iter()
            .any(|link| link == &current.dataset_name)
        {
            continue;
        }
        let remaining: Vec<&str> = state
            .bootfs_datasets
            .iter()
            .filter(|link| link.as_str() != current.dataset_name)
            .map(String::as_str)
            .collect();
        tx.set_property(
            Property::BootfsDatasets,
            &remaining.join(","),
            &state.dataset_name,
            true,
        )?;
        if remaining.is_empty() && remove_home {
            doomed.push(state.dataset_name.clone());
        }
    }
    tx.done();

    for dataset in doomed {
        zfs.destroy(&dataset)?;
        tracing::info!(user, dataset = %dataset, "home destroyed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::Cmdline;
    use crate::machines::testutil::{CMDLINE, two_state_pool};

    fn build() -> (Zfs, Machines) {
        let zfs = Zfs::scan(Box::new(two_state_pool())).unwrap();
        let machines = Machines::build(&zfs, &Cmdline::parse(CMDLINE));
        (zfs, machines)
    }

    fn rebuild(zfs: &Zfs) -> Machines {
        Machines::build(zfs, &Cmdline::parse(CMDLINE))
    }

    #[test]
    fn test_create_user_data_new_user() {
        let (mut zfs, machines) = build();
        create_user_data(&machines, &mut zfs, "bob", "/home/bob").unwrap();

        let bob = zfs
            .datasets()
            .find(|d| d.name.starts_with("rpool/USERDATA/bob_"))
            .expect("bob dataset created");
        assert_eq!(bob.mountpoint, "/home/bob");
        assert_eq!(bob.canmount, crate::zfs::properties::CanMount::On);
        assert_eq!(bob.bootfs_datasets, "rpool/ROOT/ubuntu_abc");

        let machines = rebuild(&zfs);
        let machine = machines.current_machine().unwrap();
        assert!(machine.users.contains_key("bob"));
    }

    #[test]
    fn test_create_user_data_existing_user_moves_home() {
        let (mut zfs, machines) = build();
        create_user_data(&machines, &mut zfs, "alice", "/srv/alice").unwrap();
        assert_eq!(
            zfs.get("rpool/USERDATA/alice_xyz").unwrap().mountpoint,
            "/srv/alice"
        );
        // No second dataset was allocated.
        assert_eq!(
            zfs.datasets()
                .filter(|d| d.name.starts_with("rpool/USERDATA/alice"))
                .count(),
            1
        );
    }

    #[test]
    fn test_create_user_data_creates_container() {
        let pool = two_state_pool();
        let mut zfs = Zfs::scan(Box::new(pool)).unwrap();
        zfs.destroy("rpool/USERDATA/alice_xyz").unwrap();
        zfs.destroy("rpool/USERDATA").unwrap();
        let machines = rebuild(&zfs);

        create_user_data(&machines, &mut zfs, "carol", "/home/carol").unwrap();
        let container = zfs.get("rpool/USERDATA").unwrap();
        assert_eq!(container.canmount, crate::zfs::properties::CanMount::Off);
    }

    #[test]
    fn test_create_user_data_validates_input() {
        let (mut zfs, machines) = build();
        assert!(matches!(
            create_user_data(&machines, &mut zfs, "", "/home/x"),
            Err(ZsysError::InvalidArgument(_))
        ));
        assert!(matches!(
            create_user_data(&machines, &mut zfs, "x", "relative/home"),
            Err(ZsysError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_change_home() {
        let (mut zfs, machines) = build();
        change_home_on_user_data(&machines, &mut zfs, "/home/alice", "/export/alice").unwrap();
        assert_eq!(
            zfs.get("rpool/USERDATA/alice_xyz").unwrap().mountpoint,
            "/export/alice"
        );
    }

    #[test]
    fn test_change_home_requires_unique_match() {
        let (mut zfs, machines) = build();
        assert!(matches!(
            change_home_on_user_data(&machines, &mut zfs, "/home/nobody", "/x"),
            Err(ZsysError::NotFound { .. })
        ));

        // A second dataset on the same mountpoint makes the match ambiguous.
        create_user_data(&machines, &mut zfs, "bob", "/home/alice").unwrap();
        let machines = rebuild(&zfs);
        assert!(matches!(
            change_home_on_user_data(&machines, &mut zfs, "/home/alice", "/x"),
            Err(ZsysError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_dissociate_keeps_home_by_default() {
        let (mut zfs, machines) = build();
        dissociate_user(&machines, &mut zfs, "alice", false).unwrap();
        let alice = zfs.get("rpool/USERDATA/alice_xyz").unwrap();
        assert_eq!(alice.bootfs_datasets, "");
    }

    #[test]
    fn test_dissociate_remove_home_destroys_orphan() {
        let (mut zfs, machines) = build();
        dissociate_user(&machines, &mut zfs, "alice", true).unwrap();
        assert!(zfs.get("rpool/USERDATA/alice_xyz").is_none());
    }

    #[test]
    fn test_dissociate_keeps_dataset_with_other_links() {
        let (mut zfs, machines) = build();
        let mut tx = zfs.transaction();
        tx.set_property(
            Property::BootfsDatasets,
            "rpool/ROOT/ubuntu_abc,rpool/ROOT/ubuntu_old1",
            "rpool/USERDATA/alice_xyz",
            true,
        )
        .unwrap();
        tx.done();
        let machines = rebuild(&zfs);

        dissociate_user(&machines, &mut zfs, "alice", true).unwrap();
        let alice = zfs.get("rpool/USERDATA/alice_xyz").unwrap();
        assert_eq!(alice.bootfs_datasets, "rpool/ROOT/ubuntu_old1");
    }
}
