// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Daemon configuration, loaded from `/etc/zsys.conf` (YAML). A missing
//! file falls back to the compiled-in defaults; a malformed one is an error
//! rather than a silent fallback.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::ZsysError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/zsys.conf";
pub const DEFAULT_SOCKET_PATH: &str = "/run/zsysd.sock";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub general: General,
    pub history: History,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct General {
    /// Idle seconds before the daemon exits on its own.
    pub timeout: u64,
    /// Keep at least this much of each pool free, in percent; the garbage
    /// collector turns aggressive below it.
    pub min_free_pool_space: u64,
    pub socket: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct History {
    /// Seconds a state must sit unused before the collector considers it.
    pub gc_start_after: i64,
    /// Newest states always kept, per machine, whatever the buckets say.
    pub keep_last: usize,
    pub gc_rules: Vec<GcRule>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct GcRule {
    pub name: String,
    /// How many windows this rule spans.
    pub buckets: u32,
    /// Window width, in seconds.
    pub bucket_length: i64,
    /// States retained per window.
    pub samples_per_bucket: usize,
}

impl Default for General {
    fn default() -> Self {
        General {
            timeout: 60,
            min_free_pool_space: 20,
            socket: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

impl Default for History {
    fn default() -> Self {
        History {
            gc_start_after: 86_400,
            keep_last: 3,
            gc_rules: vec![
                GcRule {
                    name: "hourly".to_string(),
                    buckets: 24,
                    bucket_length: 3_600,
                    samples_per_bucket: 1,
                },
                GcRule {
                    name: "daily".to_string(),
                    buckets: 30,
                    bucket_length: 86_400,
                    samples_per_bucket: 1,
                },
                GcRule {
                    name: "weekly".to_string(),
                    buckets: 8,
                    bucket_length: 604_800,
                    samples_per_bucket: 1,
                },
                GcRule {
                    name: "monthly".to_string(),
                    buckets: 12,
                    bucket_length: 2_592_000,
                    samples_per_bucket: 1,
                },
            ],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: General::default(),
            history: History::default(),
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ZsysError> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no configuration file, using defaults");
                return Ok(Config::default());
            }
            Err(err) => {
                return Err(ZsysError::internal(format!(
                    "cannot read '{}': {err}",
                    path.display()
                )));
            }
        };
        serde_yaml::from_str(&raw).map_err(|err| {
            ZsysError::invalid_argument(format!("cannot parse '{}': {err}", path.display()))
        })
    }

    /// The socket path, honouring the `ZSYS_SOCKET` override.
    pub fn socket_path(&self) -> PathBuf {
        match std::env::var_os("ZSYS_SOCKET") {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => self.general.socket.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load("/nonexistent/zsys.conf").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.history.keep_last, 3);
        assert_eq!(config.general.min_free_pool_space, 20);
        assert_eq!(config.history.gc_rules.len(), 4);
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "general:\n  timeout: 120\n  min-free-pool-space: 10\nhistory:\n  keep-last: 5\n  gc-start-after: 3600\n  gc-rules:\n    - name: hourly\n      buckets: 24\n      bucket-length: 3600\n      samples-per-bucket: 2"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.general.timeout, 120);
        assert_eq!(config.general.min_free_pool_space, 10);
        assert_eq!(config.history.keep_last, 5);
        assert_eq!(config.history.gc_rules.len(), 1);
        assert_eq!(config.history.gc_rules[0].samples_per_bucket, 2);
        // Unset sections keep their defaults.
        assert_eq!(config.general.socket, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "general:\n  timeout: 30").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.general.timeout, 30);
        assert_eq!(config.history, History::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "general: [not, a, mapping]").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ZsysError::InvalidArgument(_))
        ));
    }
}
