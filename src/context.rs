// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-tick snapshot the engine evaluates: one `CgroupContext` per
//! sampled cgroup, system-wide swap state, and the action bookkeeping that
//! tells action plugins which rule fired them.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

use glob::Pattern;
use log::debug;
use thiserror::Error;

use crate::cgroup_path::CgroupPath;
use crate::cgroupfs::ResourcePressure;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cgroup not present in context")]
    CgroupNotPresent,
}

/// Identifies the ruleset and detector group behind the currently running
/// action chain, for audit logging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionContext {
    pub ruleset: String,
    pub detector_group: String,
}

#[derive(Clone, Debug)]
pub struct CgroupContext {
    /// Memory PSI, `some` line.
    pub pressure: ResourcePressure,
    /// IO PSI, `some` line. NaN averages on kernels without io.pressure.
    pub io_pressure: ResourcePressure,
    pub current_usage: i64,
    /// Exponentially smoothed `current_usage` across ticks.
    pub average_usage: i64,
    pub memory_low: i64,
    pub memory_min: i64,
    pub memory_high: i64,
    pub memory_max: i64,
    pub swap_usage: i64,
    pub anon_usage: i64,
    pub file_usage: i64,
    pub shmem_usage: i64,
    pub nr_dying_descendants: i64,
    pub io_cost_cumulative: f64,
    pub io_cost_rate: f64,
    /// Effective low-memory protection credited against usage.
    pub memory_protection: i64,
    /// In-snapshot overrides applied by adjust_cgroup.
    pub memory_scale: f64,
    pub memory_adjust: i64,
}

impl Default for CgroupContext {
    fn default() -> Self {
        CgroupContext {
            pressure: ResourcePressure::default(),
            io_pressure: ResourcePressure::default(),
            current_usage: 0,
            average_usage: 0,
            memory_low: 0,
            memory_min: 0,
            memory_high: 0,
            memory_max: 0,
            swap_usage: 0,
            anon_usage: 0,
            file_usage: 0,
            shmem_usage: 0,
            nr_dying_descendants: 0,
            io_cost_cumulative: 0.0,
            io_cost_rate: 0.0,
            memory_protection: 0,
            memory_scale: 1.0,
            memory_adjust: 0,
        }
    }
}

impl CgroupContext {
    /// Usage as seen by victim selection: scaled, minus protection, plus the
    /// configured offset.
    pub fn effective_usage(&self) -> i64 {
        (self.current_usage as f64 * self.memory_scale) as i64 - self.memory_protection
            + self.memory_adjust
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemContext {
    pub swap_total: u64,
    pub swap_used: u64,
}

pub struct OomdContext {
    cgroups: HashMap<CgroupPath, CgroupContext>,
    pub system: SystemContext,
    action: ActionContext,
    now: Instant,
}

impl Default for OomdContext {
    fn default() -> Self {
        Self::new()
    }
}

impl OomdContext {
    pub fn new() -> Self {
        OomdContext {
            cgroups: HashMap::new(),
            system: SystemContext::default(),
            action: ActionContext::default(),
            now: Instant::now(),
        }
    }

    pub fn set(&mut self, path: CgroupPath, ctx: CgroupContext) {
        self.cgroups.insert(path, ctx);
    }

    pub fn get(&self, path: &CgroupPath) -> Result<&CgroupContext, Error> {
        self.cgroups.get(path).ok_or(Error::CgroupNotPresent)
    }

    pub fn get_mut(&mut self, path: &CgroupPath) -> Result<&mut CgroupContext, Error> {
        self.cgroups.get_mut(path).ok_or(Error::CgroupNotPresent)
    }

    pub fn contains(&self, path: &CgroupPath) -> bool {
        self.cgroups.contains_key(path)
    }

    pub fn cgroups(&self) -> impl Iterator<Item = &CgroupPath> {
        self.cgroups.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.cgroups.is_empty()
    }

    /// Entries whose relative path glob-matches at least one of `patterns`.
    pub fn matching_entries(
        &self,
        patterns: &[CgroupPath],
    ) -> Vec<(&CgroupPath, &CgroupContext)> {
        let compiled = compile_patterns(patterns);
        self.cgroups
            .iter()
            .filter(|(path, _)| matches_any(&compiled, &path.relative()))
            .collect()
    }

    pub fn matching_entries_mut(
        &mut self,
        patterns: &[CgroupPath],
    ) -> Vec<(&CgroupPath, &mut CgroupContext)> {
        let compiled = compile_patterns(patterns);
        self.cgroups
            .iter_mut()
            .filter(|(path, _)| matches_any(&compiled, &path.relative()))
            .collect()
    }

    /// Copies of all entries, sorted descending by `key`. The sort is stable,
    /// so entries with equal keys keep their relative order and are never
    /// shuffled past one another.
    pub fn reverse_sort<F>(&self, key: F) -> Vec<(CgroupPath, CgroupContext)>
    where
        F: Fn(&CgroupContext) -> f64,
    {
        let mut vec: Vec<(CgroupPath, CgroupContext)> = self
            .cgroups
            .iter()
            .map(|(path, ctx)| (path.clone(), ctx.clone()))
            .collect();
        // Deterministic input order before the stable sort; the map itself
        // iterates in arbitrary order.
        vec.sort_by(|a, b| a.0.relative().cmp(&b.0.relative()));
        Self::reverse_sort_vec(&mut vec, key);
        vec
    }

    pub fn reverse_sort_vec<F>(vec: &mut Vec<(CgroupPath, CgroupContext)>, key: F)
    where
        F: Fn(&CgroupContext) -> f64,
    {
        vec.sort_by(|a, b| {
            key(&b.1)
                .partial_cmp(&key(&a.1))
                .unwrap_or(Ordering::Equal)
        });
    }

    /// Retains only entries whose relative path matches one of `patterns`.
    /// Kill plugins use this to scope victim selection to their configured
    /// subtrees after sorting.
    pub fn remove_sibling_cgroups(
        patterns: &[CgroupPath],
        vec: &mut Vec<(CgroupPath, CgroupContext)>,
    ) {
        let compiled = compile_patterns(patterns);
        vec.retain(|(path, _)| matches_any(&compiled, &path.relative()));
    }

    pub fn action_context(&self) -> &ActionContext {
        &self.action
    }

    pub fn set_action_context(&mut self, action: ActionContext) {
        self.action = action;
    }

    /// The steady-clock instant captured when this snapshot was taken.
    /// Plugins tracking durations compare against this rather than reading
    /// the clock themselves.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn dump_candidates(vec: &[(CgroupPath, CgroupContext)]) {
        for (path, ctx) in vec {
            debug!(
                "  candidate cgroup={} pressure={:.2}:{:.2}:{:.2} mem={}MB mem_avg={}MB swap={}MB",
                path.relative(),
                ctx.pressure.avg10,
                ctx.pressure.avg60,
                ctx.pressure.avg300,
                ctx.current_usage >> 20,
                ctx.average_usage >> 20,
                ctx.swap_usage >> 20,
            );
        }
    }
}

fn compile_patterns(patterns: &[CgroupPath]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| Pattern::new(&p.relative()).ok())
        .collect()
}

fn matches_any(patterns: &[Pattern], relative: &str) -> bool {
    patterns.iter().any(|p| p.matches(relative))
}
