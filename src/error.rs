// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error as ThisError;

use crate::libzfs::LibzfsError;

/// Errors surfaced by the machine and dataset layers.
///
/// Every variant maps to a stable kind string on the wire so clients can
/// decide their retry and confirmation policy without parsing messages.
#[derive(ThisError, Debug)]
pub enum ZsysError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("'{name}' already exists")]
    AlreadyExists { name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{summary}")]
    NeedsConfirmation {
        summary: String,
        /// Human-readable list of dependent states, one entry per line of
        /// the confirmation prompt.
        dependencies: Vec<String>,
    },

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ZsysError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ZsysError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(name: impl Into<String>) -> Self {
        ZsysError::AlreadyExists { name: name.into() }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ZsysError::InvalidArgument(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        ZsysError::IntegrityViolation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ZsysError::Conflict(msg.into())
    }

    pub fn needs_confirmation(summary: impl Into<String>, dependencies: Vec<String>) -> Self {
        ZsysError::NeedsConfirmation {
            summary: summary.into(),
            dependencies,
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        ZsysError::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ZsysError::Internal(msg.into())
    }

    /// Stable identifier used on the wire and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ZsysError::NotFound { .. } => "not-found",
            ZsysError::AlreadyExists { .. } => "already-exists",
            ZsysError::InvalidArgument(_) => "invalid-argument",
            ZsysError::IntegrityViolation(_) => "integrity-violation",
            ZsysError::Conflict(_) => "conflict",
            ZsysError::NeedsConfirmation { .. } => "needs-confirmation",
            ZsysError::Unavailable(_) => "unavailable",
            ZsysError::Internal(_) => "internal",
        }
    }
}

impl From<LibzfsError> for ZsysError {
    fn from(err: LibzfsError) -> Self {
        match err {
            LibzfsError::DatasetNotFound { name } => ZsysError::not_found("dataset", name),
            LibzfsError::DatasetExists { name } => ZsysError::already_exists(name),
            LibzfsError::PoolNotFound { name } => {
                ZsysError::unavailable(format!("pool '{name}' is not imported"))
            }
            LibzfsError::PermissionDenied { name } => {
                ZsysError::conflict(format!("permission denied on '{name}'"))
            }
            other => ZsysError::internal(other.to_string()),
        }
    }
}
