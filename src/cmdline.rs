// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel command line parsing.
//!
//! Two tokens matter: `root=ZFS=<dataset>` names the dataset mounted as `/`,
//! and `BOOT_IMAGE=<path>` names the kernel that booted it.

use std::fs;
use std::path::Path;

/// The parsed kernel command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cmdline {
    /// The system root dataset, from `root=ZFS=…`.
    pub root: Option<String>,
    /// The booted kernel image, from `BOOT_IMAGE=…`.
    pub boot_image: Option<String>,
}

impl Cmdline {
    pub fn parse(raw: &str) -> Cmdline {
        let mut cmdline = Cmdline::default();
        for token in raw.split_ascii_whitespace() {
            if let Some(root) = token.strip_prefix("root=ZFS=") {
                if !root.is_empty() {
                    cmdline.root = Some(root.to_string());
                }
            } else if let Some(image) = token.strip_prefix("BOOT_IMAGE=") {
                if !image.is_empty() {
                    cmdline.boot_image = Some(image.to_string());
                }
            }
        }
        cmdline
    }

    /// Read and parse `/proc/cmdline` (or a stand-in path for tests).
    pub fn from_proc(path: impl AsRef<Path>) -> std::io::Result<Cmdline> {
        Ok(Cmdline::parse(&fs::read_to_string(path)?))
    }
}
