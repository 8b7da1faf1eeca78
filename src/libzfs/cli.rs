// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pool adapter backed by the zfs(8) and zpool(8) command-line tools.
//!
//! Machine-parsable output only (`-Hp`): no headers, tab-separated fields,
//! exact numeric values.

use std::collections::HashMap;
use std::ffi::OsString;
use std::process::Command;

use tracing;

use super::{CreateOptions, LibzfsError, RawDataset, RawProperty, ZfsPool};
use crate::zfs::properties::{
    BOOTFS_DATASETS_PROP, BOOTFS_PROP, LAST_BOOTED_KERNEL_PROP, LAST_USED_PROP,
    SNAPSHOT_CANMOUNT_PROP, SNAPSHOT_MOUNTPOINT_PROP,
};

const LIST_FIELDS: &str = "name,creation,mountpoint,canmount,mounted,origin";

pub struct CliPool {
    zfs_cmd: OsString,
    zpool_cmd: OsString,
}

impl CliPool {
    pub fn new() -> Self {
        CliPool {
            zfs_cmd: std::env::var_os("ZFS_CMD").unwrap_or_else(|| "zfs".into()),
            zpool_cmd: std::env::var_os("ZPOOL_CMD").unwrap_or_else(|| "zpool".into()),
        }
    }

    fn zfs(&self) -> Command {
        Command::new(&self.zfs_cmd)
    }

    fn zpool(&self) -> Command {
        Command::new(&self.zpool_cmd)
    }

    /// The user properties the engine caches, queried alongside mountpoint in
    /// one `zfs get` pass.
    fn tracked_props() -> String {
        [
            "mountpoint",
            "canmount",
            BOOTFS_PROP,
            LAST_USED_PROP,
            BOOTFS_DATASETS_PROP,
            LAST_BOOTED_KERNEL_PROP,
            SNAPSHOT_MOUNTPOINT_PROP,
            SNAPSHOT_CANMOUNT_PROP,
        ]
        .join(",")
    }

    fn run(&self, mut cmd: Command, what: &str) -> Result<String, LibzfsError> {
        tracing::debug!(cmd = ?cmd, "executing");
        let out = cmd.output()?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        Err(classify_failure(what, stderr))
    }

    /// List natives plus fetch tracked properties with sources, merged into
    /// raw records. With `target` set, scoped to that one dataset.
    fn list(&self, target: Option<&str>) -> Result<Vec<RawDataset>, LibzfsError> {
        let mut list = self.zfs();
        list.args(["list", "-Hp", "-t", "filesystem,snapshot", "-o", LIST_FIELDS]);
        if let Some(name) = target {
            list.arg(name);
        }
        let listed = self.run(list, "list")?;

        let mut records: Vec<RawDataset> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for line in listed.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            let [name, creation, mountpoint, canmount, mounted, origin] = fields[..] else {
                return Err(LibzfsError::ParseError {
                    command: "list".to_string(),
                    detail: format!("expected {LIST_FIELDS}, got '{line}'"),
                });
            };
            let record = RawDataset {
                name: name.to_string(),
                creation: creation.parse().map_err(|_| LibzfsError::ParseError {
                    command: "list".to_string(),
                    detail: format!("bad creation time '{creation}' for '{name}'"),
                })?,
                mountpoint: if mountpoint == "-" {
                    String::new()
                } else {
                    mountpoint.to_string()
                },
                mountpoint_source: "-".to_string(),
                canmount: canmount.to_string(),
                canmount_source: "-".to_string(),
                mounted: mounted == "yes",
                origin: if origin == "-" {
                    String::new()
                } else {
                    origin.to_string()
                },
                user_properties: HashMap::new(),
            };
            index.insert(record.name.clone(), records.len());
            records.push(record);
        }

        let mut get = self.zfs();
        get.args([
            "get",
            "-Hp",
            "-t",
            "filesystem,snapshot",
            "-o",
            "name,property,value,source",
            &Self::tracked_props(),
        ]);
        if let Some(name) = target {
            get.arg(name);
        }
        let fetched = self.run(get, "get")?;
        for line in fetched.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            let [name, property, value, source] = fields[..] else {
                return Err(LibzfsError::ParseError {
                    command: "get".to_string(),
                    detail: format!("expected name/property/value/source, got '{line}'"),
                });
            };
            let Some(&at) = index.get(name) else {
                continue;
            };
            if property == "mountpoint" {
                records[at].mountpoint_source = source.to_string();
            } else if property == "canmount" {
                records[at].canmount_source = source.to_string();
            } else if value != "-" || source != "-" {
                records[at].user_properties.insert(
                    property.to_string(),
                    RawProperty {
                        value: value.to_string(),
                        source: source.to_string(),
                    },
                );
            }
        }
        Ok(records)
    }
}

impl Default for CliPool {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_failure(command: &str, stderr: String) -> LibzfsError {
    let line = stderr.lines().next().unwrap_or("").to_string();
    if line.contains("dataset does not exist") || line.contains("no such") {
        if let Some(name) = quoted_name(&line) {
            return LibzfsError::DatasetNotFound { name };
        }
    }
    if line.contains("dataset already exists") || line.contains("already exists") {
        if let Some(name) = quoted_name(&line) {
            return LibzfsError::DatasetExists { name };
        }
    }
    if line.contains("permission denied") {
        return LibzfsError::PermissionDenied {
            name: quoted_name(&line).unwrap_or_default(),
        };
    }
    if line.contains("no such pool") {
        return LibzfsError::PoolNotFound {
            name: quoted_name(&line).unwrap_or_default(),
        };
    }
    LibzfsError::CommandFailed {
        command: command.to_string(),
        stderr,
    }
}

/// Pull the 'name' out of messages like `cannot open 'rpool/x': …`.
fn quoted_name(line: &str) -> Option<String> {
    let start = line.find('\'')? + 1;
    let end = start + line[start..].find('\'')?;
    Some(line[start..end].to_string())
}

impl ZfsPool for CliPool {
    fn enumerate_all(&self) -> Result<Vec<RawDataset>, LibzfsError> {
        self.list(None)
    }

    fn reload_properties(&self, name: &str) -> Result<RawDataset, LibzfsError> {
        self.list(Some(name))?
            .into_iter()
            .next()
            .ok_or_else(|| LibzfsError::not_found(name))
    }

    fn create(&self, name: &str, options: &CreateOptions) -> Result<RawDataset, LibzfsError> {
        let mut cmd = self.zfs();
        cmd.arg("create");
        if let Some(mountpoint) = &options.mountpoint {
            cmd.arg("-o").arg(format!("mountpoint={mountpoint}"));
        }
        if let Some(canmount) = &options.canmount {
            cmd.arg("-o").arg(format!("canmount={canmount}"));
        }
        cmd.arg(name);
        self.run(cmd, "create")?;
        self.reload_properties(name)
    }

    fn snapshot(
        &self,
        name: &str,
        user_properties: &[(String, String)],
    ) -> Result<RawDataset, LibzfsError> {
        let mut cmd = self.zfs();
        cmd.arg("snapshot");
        for (key, value) in user_properties {
            cmd.arg("-o").arg(format!("{key}={value}"));
        }
        cmd.arg(name);
        self.run(cmd, "snapshot")?;
        self.reload_properties(name)
    }

    fn clone_dataset(
        &self,
        snapshot: &str,
        target: &str,
        options: &CreateOptions,
    ) -> Result<RawDataset, LibzfsError> {
        let mut cmd = self.zfs();
        cmd.arg("clone");
        if let Some(mountpoint) = &options.mountpoint {
            cmd.arg("-o").arg(format!("mountpoint={mountpoint}"));
        }
        if let Some(canmount) = &options.canmount {
            cmd.arg("-o").arg(format!("canmount={canmount}"));
        }
        cmd.arg(snapshot).arg(target);
        self.run(cmd, "clone")?;
        self.reload_properties(target)
    }

    fn promote(&self, name: &str) -> Result<(), LibzfsError> {
        let mut cmd = self.zfs();
        cmd.arg("promote").arg(name);
        self.run(cmd, "promote").map(|_| ())
    }

    fn destroy(&self, name: &str, defer: bool) -> Result<(), LibzfsError> {
        let mut cmd = self.zfs();
        cmd.arg("destroy");
        if defer && name.contains('@') {
            cmd.arg("-d");
        }
        cmd.arg(name);
        self.run(cmd, "destroy").map(|_| ())
    }

    fn set_user_prop(&self, name: &str, key: &str, value: &str) -> Result<(), LibzfsError> {
        let mut cmd = self.zfs();
        cmd.arg("set").arg(format!("{key}={value}")).arg(name);
        self.run(cmd, "set").map(|_| ())
    }

    fn set_native_prop(&self, name: &str, key: &str, value: &str) -> Result<(), LibzfsError> {
        self.set_user_prop(name, key, value)
    }

    fn inherit_prop(&self, name: &str, key: &str) -> Result<(), LibzfsError> {
        let mut cmd = self.zfs();
        cmd.arg("inherit").arg(key).arg(name);
        self.run(cmd, "inherit").map(|_| ())
    }

    fn pool_capacity(&self, pool: &str) -> Result<u64, LibzfsError> {
        let mut cmd = self.zpool();
        cmd.args(["list", "-Hp", "-o", "capacity"]).arg(pool);
        let out = self.run(cmd, "zpool list")?;
        out.trim()
            .parse()
            .map_err(|_| LibzfsError::ParseError {
                command: "zpool list".to_string(),
                detail: format!("bad capacity '{}' for pool '{pool}'", out.trim()),
            })
    }
}
