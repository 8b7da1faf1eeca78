// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Garbage collection over accumulated states.
//!
//! Retention is bucketed: consecutive rule windows walk back from now, each
//! keeping its most widely spaced samples. The newest `keep-last` states per
//! machine survive no matter what. When a pool runs low on free space the
//! bucket retention is waived and every eligible state goes.

use std::collections::HashSet;

use tracing;

use super::{Machines, is_generated_id, username_of};
use crate::ZsysError;
use crate::config::{Config, GcRule};
use crate::zfs::Zfs;

#[derive(Clone, Debug)]
struct Candidate {
    dataset_name: String,
    last_used: i64,
}

/// Run one collection pass. Returns the destroyed dataset names.
///
/// Eligible are non-current system history states and user states no longer
/// linked to any live system state; manually named states only join with
/// `all`. User states orphaned by a system removal in this pass are picked
/// up by the next one.
pub fn collect(
    machines: &Machines,
    zfs: &mut Zfs,
    config: &Config,
    all: bool,
    now: i64,
) -> Result<Vec<String>, ZsysError> {
    let mut marked: Vec<Candidate> = Vec::new();

    for machine in machines.all.values() {
        let candidates: Vec<Candidate> = machine
            .history
            .values()
            .filter(|state| all || is_generated_id(&state.id))
            .map(|state| Candidate {
                dataset_name: state.dataset_name.clone(),
                last_used: state.last_used,
            })
            .collect();
        marked.extend(plan_group(candidates, config, now));
    }

    // Unlinked user states, grouped per user.
    let mut user_groups: std::collections::BTreeMap<String, Vec<Candidate>> = Default::default();
    for name in &machines.unmanaged {
        let Some(dataset) = zfs.get(name) else {
            continue;
        };
        let id = dataset
            .snapshot_tag()
            .map(str::to_string)
            .unwrap_or_else(|| super::suffix_of(&dataset.name));
        if !all && !is_generated_id(&id) {
            continue;
        }
        user_groups
            .entry(username_of(dataset.base_name()))
            .or_default()
            .push(Candidate {
                dataset_name: dataset.name.clone(),
                last_used: dataset.last_used,
            });
    }
    for (_, group) in user_groups {
        marked.extend(plan_group(group, config, now));
    }

    // Low free space waives the bucket retention entirely.
    let mut pressured: HashSet<String> = HashSet::new();
    let pools: HashSet<String> = machines
        .all
        .keys()
        .filter_map(|id| id.split_once('/').map(|(pool, _)| pool.to_string()))
        .collect();
    for pool in pools {
        let capacity = zfs.pool_capacity(&pool)?;
        if capacity + config.general.min_free_pool_space > 100 {
            tracing::warn!(pool = %pool, capacity, "pool low on free space, collecting aggressively");
            pressured.insert(pool);
        }
    }
    if !pressured.is_empty() {
        for machine in machines.all.values() {
            let Some((pool, _)) = machine.id.split_once('/') else {
                continue;
            };
            if !pressured.contains(pool) {
                continue;
            }
            let candidates: Vec<Candidate> = machine
                .history
                .values()
                .filter(|state| all || is_generated_id(&state.id))
                .map(|state| Candidate {
                    dataset_name: state.dataset_name.clone(),
                    last_used: state.last_used,
                })
                .collect();
            marked.extend(plan_group_unbucketed(candidates, config, now));
        }
    }

    // Oldest first so space frees up as early as possible.
    marked.sort_by_key(|candidate| candidate.last_used);
    marked.dedup_by(|a, b| a.dataset_name == b.dataset_name);

    let mut removed = Vec::new();
    for candidate in marked {
        match zfs.destroy(&candidate.dataset_name) {
            Ok(()) => {
                tracing::info!(dataset = %candidate.dataset_name, "state collected");
                removed.push(candidate.dataset_name);
            }
            // A clone keeps its origin chain alive; skip, never abort the run.
            Err(err) => {
                tracing::warn!(dataset = %candidate.dataset_name, %err, "cannot collect state");
            }
        }
    }
    Ok(removed)
}

/// Decide removals for one group: protect the `keep-last` newest, ignore
/// anything still younger than `gc-start-after`, and let the bucket rules
/// choose among the rest.
fn plan_group(mut candidates: Vec<Candidate>, config: &Config, now: i64) -> Vec<Candidate> {
    candidates.sort_by_key(|candidate| -candidate.last_used);
    let eligible: Vec<Candidate> = candidates
        .split_off(candidates.len().min(config.history.keep_last))
        .into_iter()
        .filter(|candidate| now - candidate.last_used >= config.history.gc_start_after)
        .collect();
    let survivors = bucket_survivors(&eligible, &config.history.gc_rules, now);
    eligible
        .into_iter()
        .filter(|candidate| !survivors.contains(&candidate.dataset_name))
        .collect()
}

/// The low-space variant: everything eligible goes, only keep-last holds.
fn plan_group_unbucketed(
    mut candidates: Vec<Candidate>,
    config: &Config,
    now: i64,
) -> Vec<Candidate> {
    candidates.sort_by_key(|candidate| -candidate.last_used);
    candidates
        .split_off(candidates.len().min(config.history.keep_last))
        .into_iter()
        .filter(|candidate| now - candidate.last_used >= config.history.gc_start_after)
        .collect()
}

/// Which eligible states the bucket rules retain.
///
/// Rule windows are consecutive, walking back from now: the first rule
/// covers the most recent span, the next one continues where it ended.
/// Inside one window the retained samples are spread as widely as the
/// candidates allow; a single sample keeps the oldest, so a survivor is
/// stable as the window slides. States older than the whole horizon retain
/// nothing.
fn bucket_survivors(eligible: &[Candidate], rules: &[GcRule], now: i64) -> HashSet<String> {
    let mut survivors = HashSet::new();
    let mut offset: i64 = 0;
    for rule in rules {
        for i in 0..rule.buckets as i64 {
            let newest = now - offset - i * rule.bucket_length;
            let oldest = newest - rule.bucket_length;
            let mut inside: Vec<&Candidate> = eligible
                .iter()
                .filter(|candidate| candidate.last_used > oldest && candidate.last_used <= newest)
                .collect();
            if inside.is_empty() {
                continue;
            }
            inside.sort_by_key(|candidate| candidate.last_used);
            let samples = rule.samples_per_bucket;
            if samples == 0 {
                continue;
            }
            if inside.len() <= samples {
                survivors.extend(inside.iter().map(|c| c.dataset_name.clone()));
            } else if samples == 1 {
                survivors.insert(inside[0].dataset_name.clone());
            } else {
                for k in 0..samples {
                    let idx = k * (inside.len() - 1) / (samples - 1);
                    survivors.insert(inside[idx].dataset_name.clone());
                }
            }
        }
        offset += rule.buckets as i64 * rule.bucket_length;
    }
    survivors
}
