// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed set of properties the engine tracks on every dataset, plus the
//! `com.ubuntu.zsys:` user-property names they persist under.
//!
//! Snapshots are immutable, so user properties written to a snapshot carry
//! their pre-snapshot source inside the value, encoded as `value:source`.
//! Both sides of that encoding live here.

use std::fmt;
use std::str::FromStr;

use crate::ZsysError;

// Everything zsys persists on disk lives in the reserved
// `com.ubuntu.zsys:` user-property namespace.
pub const BOOTFS_PROP: &str = "com.ubuntu.zsys:bootfs";
pub const LAST_USED_PROP: &str = "com.ubuntu.zsys:last-used";
pub const BOOTFS_DATASETS_PROP: &str = "com.ubuntu.zsys:bootfs-datasets";
pub const LAST_BOOTED_KERNEL_PROP: &str = "com.ubuntu.zsys:last-booted-kernel";
/// Snapshot-only copy of the native mountpoint, with its source encoded.
pub const SNAPSHOT_MOUNTPOINT_PROP: &str = "com.ubuntu.zsys:mountpoint";
/// Snapshot-only copy of the native canmount, with its source encoded.
pub const SNAPSHOT_CANMOUNT_PROP: &str = "com.ubuntu.zsys:canmount";

/// Whether and how a dataset may be mounted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanMount {
    /// Mounted automatically at boot.
    On,
    /// Never mountable.
    Off,
    /// Mountable, but only explicitly.
    NoAuto,
    /// Not applicable (snapshots report "-").
    Unset,
}

impl Default for CanMount {
    fn default() -> Self {
        CanMount::On
    }
}

impl FromStr for CanMount {
    type Err = ZsysError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(CanMount::On),
            "off" => Ok(CanMount::Off),
            "noauto" => Ok(CanMount::NoAuto),
            "-" | "" => Ok(CanMount::Unset),
            other => Err(ZsysError::invalid_argument(format!(
                "unknown canmount value '{other}'"
            ))),
        }
    }
}

impl fmt::Display for CanMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanMount::On => write!(f, "on"),
            CanMount::Off => write!(f, "off"),
            CanMount::NoAuto => write!(f, "noauto"),
            CanMount::Unset => write!(f, "-"),
        }
    }
}

/// Where a property value comes from, as reported by the pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PropSource {
    /// Set directly on the dataset.
    Local,
    /// Pulled from an ancestor.
    Inherited,
    /// The filesystem default.
    Default,
    /// Not set anywhere.
    None,
}

impl Default for PropSource {
    fn default() -> Self {
        PropSource::None
    }
}

impl PropSource {
    /// Parse an adapter-reported source string. `inherited from <ancestor>`
    /// variants collapse to [`PropSource::Inherited`]; unknown strings (the
    /// adapter reports "-" for properties without a source) collapse to
    /// [`PropSource::None`].
    pub fn parse(s: &str) -> PropSource {
        match s {
            "local" => PropSource::Local,
            "default" => PropSource::Default,
            "none" | "-" | "" => PropSource::None,
            s if s.starts_with("inherited") => PropSource::Inherited,
            _ => PropSource::None,
        }
    }

    pub fn is_local(self) -> bool {
        self == PropSource::Local
    }
}

impl fmt::Display for PropSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropSource::Local => write!(f, "local"),
            PropSource::Inherited => write!(f, "inherited"),
            PropSource::Default => write!(f, "default"),
            PropSource::None => write!(f, "none"),
        }
    }
}

/// A property the transaction engine knows how to change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Property {
    Mountpoint,
    CanMount,
    Bootfs,
    LastUsed,
    LastBootedKernel,
    BootfsDatasets,
}

impl Property {
    /// The user-property key this property persists under on snapshots (for
    /// mountpoint and canmount) or everywhere (for the zsys-owned ones).
    pub fn user_prop(self) -> &'static str {
        match self {
            Property::Mountpoint => SNAPSHOT_MOUNTPOINT_PROP,
            Property::CanMount => SNAPSHOT_CANMOUNT_PROP,
            Property::Bootfs => BOOTFS_PROP,
            Property::LastUsed => LAST_USED_PROP,
            Property::LastBootedKernel => LAST_BOOTED_KERNEL_PROP,
            Property::BootfsDatasets => BOOTFS_DATASETS_PROP,
        }
    }

    /// Whether this is a native filesystem property rather than one of ours.
    pub fn is_native(self) -> bool {
        matches!(self, Property::Mountpoint | Property::CanMount)
    }
}

impl FromStr for Property {
    type Err = ZsysError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mountpoint" => Ok(Property::Mountpoint),
            "canmount" => Ok(Property::CanMount),
            "bootfs" => Ok(Property::Bootfs),
            "last-used" => Ok(Property::LastUsed),
            "last-booted-kernel" => Ok(Property::LastBootedKernel),
            "bootfs-datasets" => Ok(Property::BootfsDatasets),
            other => Err(ZsysError::invalid_argument(format!(
                "unsupported property '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Property::Mountpoint => write!(f, "mountpoint"),
            Property::CanMount => write!(f, "canmount"),
            Property::Bootfs => write!(f, "bootfs"),
            Property::LastUsed => write!(f, "last-used"),
            Property::LastBootedKernel => write!(f, "last-booted-kernel"),
            Property::BootfsDatasets => write!(f, "bootfs-datasets"),
        }
    }
}

/// Encode a property value for storage on a snapshot, carrying its
/// pre-snapshot source. Only `local` and `inherited` survive a snapshot.
pub fn encode_with_source(value: &str, source: PropSource) -> String {
    let tag = match source {
        PropSource::Local => "local",
        _ => "inherited",
    };
    format!("{value}:{tag}")
}

/// Decode a snapshot-encoded property value back into value and source.
///
/// The source tag sits after the last colon so values containing colons
/// survive. A value with no colon at all predates the encoding; it is
/// reported as inherited.
pub fn decode_with_source(raw: &str) -> (String, PropSource) {
    match raw.rsplit_once(':') {
        Some((value, "local")) => (value.to_string(), PropSource::Local),
        Some((value, "inherited")) => (value.to_string(), PropSource::Inherited),
        _ => (raw.to_string(), PropSource::Inherited),
    }
}

/// Parse a boolean user-property value the way the on-disk format spells it.
pub fn parse_bool(value: &str) -> bool {
    matches!(value, "yes" | "on" | "true" | "1")
}

/// Render a boolean for the on-disk format.
pub fn format_bool(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canmount_round_trip() {
        for s in ["on", "off", "noauto", "-"] {
            assert_eq!(CanMount::from_str(s).unwrap().to_string(), s);
        }
        assert!(CanMount::from_str("maybe").is_err());
        assert_eq!(CanMount::from_str("").unwrap(), CanMount::Unset);
    }

    #[test]
    fn test_prop_source_parse() {
        assert_eq!(PropSource::parse("local"), PropSource::Local);
        assert_eq!(PropSource::parse("inherited"), PropSource::Inherited);
        assert_eq!(
            PropSource::parse("inherited from rpool/ROOT"),
            PropSource::Inherited
        );
        assert_eq!(PropSource::parse("default"), PropSource::Default);
        assert_eq!(PropSource::parse("-"), PropSource::None);
        assert_eq!(PropSource::parse(""), PropSource::None);
    }

    #[test]
    fn test_property_names() {
        assert_eq!(
            Property::from_str("last-used").unwrap(),
            Property::LastUsed
        );
        assert_eq!(
            Property::BootfsDatasets.user_prop(),
            "com.ubuntu.zsys:bootfs-datasets"
        );
        assert!(Property::from_str("compression").is_err());
        assert!(Property::Mountpoint.is_native());
        assert!(!Property::LastUsed.is_native());
    }

    #[test]
    fn test_encode_decode_with_source() {
        assert_eq!(
            encode_with_source("rpool/ROOT/ubuntu_abc", PropSource::Local),
            "rpool/ROOT/ubuntu_abc:local"
        );
        assert_eq!(
            decode_with_source("rpool/ROOT/ubuntu_abc:local"),
            ("rpool/ROOT/ubuntu_abc".to_string(), PropSource::Local)
        );
        assert_eq!(
            decode_with_source("/home/alice:inherited"),
            ("/home/alice".to_string(), PropSource::Inherited)
        );
        // No colon at all: pre-encoding value, reported inherited.
        assert_eq!(
            decode_with_source("yes"),
            ("yes".to_string(), PropSource::Inherited)
        );
        // The source tag is split off the last colon only.
        assert_eq!(
            decode_with_source("rpool/A,rpool/B:local"),
            ("rpool/A,rpool/B".to_string(), PropSource::Local)
        );
    }

    #[test]
    fn test_bool_format() {
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("no"));
        assert!(!parse_bool("-"));
        assert_eq!(format_bool(true), "yes");
        assert_eq!(format_bool(false), "no");
    }
}
