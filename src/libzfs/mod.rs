// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin contract over the underlying filesystem tooling.
//!
//! The dataset graph is driven entirely through [`ZfsPool`], so the engine
//! and everything above it can run against [`mock::MockPool`] in tests and
//! against [`cli::CliPool`] (which shells out to zfs(8) and zpool(8)) in
//! production.

use std::collections::HashMap;

use thiserror::Error as ThisError;

pub mod cli;
pub mod mock;

#[derive(ThisError, Debug)]
pub enum LibzfsError {
    #[error("dataset '{name}' not found")]
    DatasetNotFound { name: String },

    #[error("dataset '{name}' already exists")]
    DatasetExists { name: String },

    #[error("pool '{name}' is not imported")]
    PoolNotFound { name: String },

    #[error("permission denied on '{name}'")]
    PermissionDenied { name: String },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unexpected {command} output: {detail}")]
    ParseError { command: String, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LibzfsError {
    pub fn not_found(name: impl Into<String>) -> Self {
        LibzfsError::DatasetNotFound { name: name.into() }
    }

    pub fn exists(name: impl Into<String>) -> Self {
        LibzfsError::DatasetExists { name: name.into() }
    }
}

/// One property value as observed on the pool, with its source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawProperty {
    pub value: String,
    /// "local", "inherited from <ancestor>", "default", "none" or "-".
    pub source: String,
}

impl RawProperty {
    pub fn local(value: impl Into<String>) -> Self {
        RawProperty {
            value: value.into(),
            source: "local".to_string(),
        }
    }
}

/// A dataset record as observed on the pool, before the engine decodes it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawDataset {
    pub name: String,
    /// Creation time, unix seconds.
    pub creation: i64,
    pub mountpoint: String,
    pub mountpoint_source: String,
    pub canmount: String,
    pub canmount_source: String,
    pub mounted: bool,
    /// Fully qualified origin snapshot for clones, empty otherwise.
    pub origin: String,
    /// User properties keyed by full property name.
    pub user_properties: HashMap<String, RawProperty>,
}

impl RawDataset {
    pub fn is_snapshot(&self) -> bool {
        self.name.contains('@')
    }
}

/// Native properties passed at dataset or clone creation.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    pub mountpoint: Option<String>,
    pub canmount: Option<String>,
}

/// Capabilities the engine needs from the pool. Implementations report every
/// mutation's outcome as the raw record observed afterwards so the engine can
/// refresh its cache without a second round trip.
pub trait ZfsPool: Send + Sync {
    /// Every dataset and snapshot in every imported pool, in no particular
    /// order.
    fn enumerate_all(&self) -> Result<Vec<RawDataset>, LibzfsError>;

    /// Re-read a single dataset's record.
    fn reload_properties(&self, name: &str) -> Result<RawDataset, LibzfsError>;

    fn create(&self, name: &str, options: &CreateOptions) -> Result<RawDataset, LibzfsError>;

    /// Create `base@tag`, setting the given user properties atomically.
    fn snapshot(
        &self,
        name: &str,
        user_properties: &[(String, String)],
    ) -> Result<RawDataset, LibzfsError>;

    fn clone_dataset(
        &self,
        snapshot: &str,
        target: &str,
        options: &CreateOptions,
    ) -> Result<RawDataset, LibzfsError>;

    fn promote(&self, name: &str) -> Result<(), LibzfsError>;

    /// Destroy one dataset or snapshot. `defer` maps to deferred snapshot
    /// destruction; callers sequence children themselves.
    fn destroy(&self, name: &str, defer: bool) -> Result<(), LibzfsError>;

    fn set_user_prop(&self, name: &str, key: &str, value: &str) -> Result<(), LibzfsError>;

    fn set_native_prop(&self, name: &str, key: &str, value: &str) -> Result<(), LibzfsError>;

    /// Drop a local property so the dataset inherits it again.
    fn inherit_prop(&self, name: &str, key: &str) -> Result<(), LibzfsError>;

    /// Used capacity of the pool, in percent.
    fn pool_capacity(&self, pool: &str) -> Result<u64, LibzfsError>;
}
