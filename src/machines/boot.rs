// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot-time state machine: prepare the mount layout for the elected state
//! and confirm a successful boot.

use tracing;

use super::Machines;
use crate::ZsysError;
use crate::zfs::Zfs;
use crate::zfs::properties::Property;

/// The boot-menu generator, invoked after any boot-affecting change.
pub trait BootMenu: Send + Sync {
    fn update(&self) -> Result<(), ZsysError>;
}

/// Regenerates the menu through update-grub(8).
pub struct GrubMenu;

impl BootMenu for GrubMenu {
    fn update(&self) -> Result<(), ZsysError> {
        tracing::info!("refreshing boot menu");
        let status = std::process::Command::new("update-grub")
            .status()
            .map_err(|err| ZsysError::internal(format!("cannot run update-grub: {err}")))?;
        if !status.success() {
            return Err(ZsysError::internal(format!(
                "update-grub exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Menu stub for tests and the mock backend.
pub struct NoopMenu;

impl BootMenu for NoopMenu {
    fn update(&self) -> Result<(), ZsysError> {
        Ok(())
    }
}

/// Make the dataset layout match the boot choice: the current state's root
/// and user datasets auto-mount, every other history root does not.
///
/// Returns whether anything actually changed, so callers can skip the
/// boot-menu refresh on an already-consistent system. Only property writes;
/// never snapshots or destroys.
pub fn ensure_boot(machines: &Machines, zfs: &mut Zfs) -> Result<bool, ZsysError> {
    let mut tx = zfs.transaction();
    let mut changed = false;
    for machine in machines.all.values() {
        if let Some(current) = &machine.current {
            changed |= tx.set_property(Property::CanMount, "on", &current.dataset_name, true)?;
            for user_dataset in &current.user_datasets {
                changed |= tx.set_property(Property::CanMount, "on", user_dataset, true)?;
            }
        }
        for state in machine.history.values() {
            if state.is_snapshot {
                continue;
            }
            changed |=
                tx.set_property(Property::CanMount, "noauto", &state.dataset_name, true)?;
        }
    }
    tx.done();
    if changed {
        tracing::info!("boot layout updated");
    }
    Ok(changed)
}

/// Confirm the current boot: stamp last-used on the booted root and its user
/// datasets, record the booted kernel, and make sure every linked user
/// dataset lists the booted root in bootfs-datasets.
pub fn commit(machines: &Machines, zfs: &mut Zfs, now: i64) -> Result<bool, ZsysError> {
    let current = machines.current_state()?.clone();
    let mut tx = zfs.transaction();
    let mut changed = false;

    changed |= tx.set_property(Property::LastUsed, &now.to_string(), &current.dataset_name, true)?;
    if let Some(kernel) = &machines.cmdline.boot_image {
        changed |=
            tx.set_property(Property::LastBootedKernel, kernel, &current.dataset_name, true)?;
    }

    for user_dataset in &current.user_datasets {
        changed |= tx.set_property(Property::LastUsed, &now.to_string(), user_dataset, true)?;
        let list = tx.zfs().must_get(user_dataset)?.bootfs_datasets.clone();
        let mut entries: Vec<&str> = list.split(',').filter(|e| !e.is_empty()).collect();
        if !entries.contains(&current.dataset_name.as_str()) {
            entries.push(&current.dataset_name);
            let updated = entries.join(",");
            changed |=
                tx.set_property(Property::BootfsDatasets, &updated, user_dataset, true)?;
        }
    }
    tx.done();

    if changed {
        tracing::info!(root = %current.dataset_name, "boot committed");
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::Cmdline;
    use crate::machines::testutil::{CMDLINE, two_state_pool};
    use crate::zfs::properties::CanMount;

    fn build() -> (Zfs, Machines) {
        let zfs = Zfs::scan(Box::new(two_state_pool())).unwrap();
        let machines = Machines::build(&zfs, &Cmdline::parse(CMDLINE));
        (zfs, machines)
    }

    #[test]
    fn test_ensure_boot_sets_canmount() {
        let (mut zfs, machines) = build();
        // Start from a layout that needs fixing.
        let mut tx = zfs.transaction();
        tx.set_property(Property::CanMount, "noauto", "rpool/ROOT/ubuntu_abc", true)
            .unwrap();
        tx.set_property(Property::CanMount, "on", "rpool/ROOT/ubuntu_old1", true)
            .unwrap();
        tx.done();

        let changed = ensure_boot(&machines, &mut zfs).unwrap();
        assert!(changed);
        assert_eq!(
            zfs.get("rpool/ROOT/ubuntu_abc").unwrap().canmount,
            CanMount::On
        );
        assert_eq!(
            zfs.get("rpool/ROOT/ubuntu_old1").unwrap().canmount,
            CanMount::NoAuto
        );
        assert_eq!(
            zfs.get("rpool/USERDATA/alice_xyz").unwrap().canmount,
            CanMount::On
        );
    }

    #[test]
    fn test_ensure_boot_idempotent() {
        let (mut zfs, machines) = build();
        ensure_boot(&machines, &mut zfs).unwrap();
        let changed = ensure_boot(&machines, &mut zfs).unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_commit_stamps_and_links() {
        let (mut zfs, machines) = build();
        let changed = commit(&machines, &mut zfs, 123_456).unwrap();
        assert!(changed);

        let root = zfs.get("rpool/ROOT/ubuntu_abc").unwrap();
        assert_eq!(root.last_used, 123_456);
        assert_eq!(root.last_booted_kernel, "/BOOT/ubuntu_abc@/vmlinuz-5.4.0");
        assert_eq!(zfs.get("rpool/USERDATA/alice_xyz").unwrap().last_used, 123_456);
    }

    #[test]
    fn test_commit_idempotent_within_second() {
        let (mut zfs, machines) = build();
        commit(&machines, &mut zfs, 123_456).unwrap();
        let changed = commit(&machines, &mut zfs, 123_456).unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_commit_restores_missing_link() {
        let (mut zfs, machines) = build();
        // Simulate a user dataset that lost its association.
        let mut tx = zfs.transaction();
        tx.set_property(
            Property::BootfsDatasets,
            "rpool/ROOT/ubuntu_old1",
            "rpool/USERDATA/alice_xyz",
            true,
        )
        .unwrap();
        tx.done();

        commit(&machines, &mut zfs, 200_000).unwrap();
        assert_eq!(
            zfs.get("rpool/USERDATA/alice_xyz").unwrap().bootfs_datasets,
            "rpool/ROOT/ubuntu_old1,rpool/ROOT/ubuntu_abc"
        );
    }

    #[test]
    fn test_commit_requires_current_machine() {
        let (mut zfs, _) = build();
        let machines = Machines::build(&zfs, &Cmdline::default());
        // Something is mounted at /, so a current machine still resolves
        // only via the command line.
        assert!(matches!(
            commit(&machines, &mut zfs, 1),
            Err(ZsysError::Unavailable(_))
        ));
    }
}
