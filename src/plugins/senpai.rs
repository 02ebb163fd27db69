// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::warn;

use crate::cgroup_path::CgroupPath;
use crate::cgroupfs;
use crate::cgroupfs::PressureKind;
use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::optional_f64;
use crate::plugins::register_cgroup_patterns;

const DEFAULT_LIMIT_MIN_BYTES: i64 = 100 << 20;
const DEFAULT_PRESSURE_TARGET_MIN: f64 = 0.001;
const DEFAULT_PRESSURE_TARGET_MAX: f64 = 0.01;
const DEFAULT_MAX_PROBE: f64 = 0.01;
const DEFAULT_MAX_BACKOFF: f64 = 0.05;

/// Validity window written with each memory.high.tmp update; generously
/// longer than any sane tick interval so the limit doesn't lapse between
/// ticks, but bounded so a dead daemon leaves no permanent clamp behind.
const MEM_HIGH_TMP_TIMEOUT: Duration = Duration::from_secs(20);

struct TargetState {
    limit: i64,
    has_high_tmp: bool,
    last_total: Duration,
    last_tick: Instant,
}

/// Proactive reclaim controller. Squeezes each target's memory.high until a
/// small amount of memory pressure shows up, which makes the kernel evict
/// pages nobody has touched in a while; backs off when pressure leaves the
/// target band. A steady-state controller: it adjusts every tick and always
/// continues the chain.
///
/// Kernels carrying the memory.high.tmp patch get their limit applied there
/// so memory.high itself keeps its configured value; elsewhere memory.high
/// is driven directly.
#[derive(Default)]
pub struct Senpai {
    cgroups: Vec<CgroupPath>,
    limit_min_bytes: i64,
    pressure_target_min: f64,
    pressure_target_max: f64,
    max_probe: f64,
    max_backoff: f64,
    targets: HashMap<CgroupPath, TargetState>,
}

impl Plugin for Senpai {
    fn name(&self) -> &'static str {
        "senpai"
    }

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.cgroups = register_cgroup_patterns(resources, args, construction)?;

        self.limit_min_bytes = match args.get("limit_min_bytes") {
            Some(value) => value
                .parse()
                .context("Argument=limit_min_bytes is not a byte count")?,
            None => DEFAULT_LIMIT_MIN_BYTES,
        };
        self.pressure_target_min =
            optional_f64(args, "pressure_target_min", DEFAULT_PRESSURE_TARGET_MIN)?;
        self.pressure_target_max =
            optional_f64(args, "pressure_target_max", DEFAULT_PRESSURE_TARGET_MAX)?;
        self.max_probe = optional_f64(args, "max_probe", DEFAULT_MAX_PROBE)?;
        self.max_backoff = optional_f64(args, "max_backoff", DEFAULT_MAX_BACKOFF)?;
        Ok(())
    }

    fn run(&mut self, ctx: &mut OomdContext) -> PluginRet {
        let now = ctx.now();
        let mut seen = HashSet::new();

        for pattern in self.cgroups.clone() {
            for absolute in cgroupfs::resolve_wildcard(&pattern) {
                let Some(target) = CgroupPath::from_absolute(pattern.cgroup_fs(), &absolute)
                else {
                    continue;
                };
                seen.insert(target.clone());
                if let Err(e) = self.tick_target(&target, now) {
                    warn!("senpai: skipping {}: {}", target.relative(), e);
                }
            }
        }

        // Forget limits of cgroups that went away.
        self.targets.retain(|path, _| seen.contains(path));

        PluginRet::Continue
    }
}

impl Senpai {
    fn tick_target(&mut self, target: &CgroupPath, now: Instant) -> Result<()> {
        let current = cgroupfs::read_mem_current(target)?;
        let pressure = cgroupfs::read_mem_pressure(target, PressureKind::Some)?;
        let total = pressure.total.unwrap_or_default();

        let Some(state) = self.targets.get_mut(target) else {
            // First sight of this cgroup: take over whatever limit is in
            // effect. An unset limit (max) starts the probe at current usage.
            let has_high_tmp = cgroupfs::read_mem_high_tmp(target).is_ok();
            let mut limit = if has_high_tmp {
                cgroupfs::read_mem_high_tmp(target)?
            } else {
                cgroupfs::read_mem_high(target)?
            };
            if limit == i64::MAX {
                limit = current;
            }

            let state = TargetState {
                limit,
                has_high_tmp,
                last_total: total,
                last_tick: now,
            };
            write_limit(target, &state)?;
            self.targets.insert(target.clone(), state);
            return Ok(());
        };

        let tick_us = now.duration_since(state.last_tick).as_micros().max(1);
        let delta_us = total.saturating_sub(state.last_total).as_micros();
        let pressure_rate = delta_us as f64 / tick_us as f64;

        if pressure_rate < self.pressure_target_min {
            // Too comfortable: probe lower to shake out cold pages.
            state.limit -= (state.limit as f64 * self.max_probe) as i64;
        } else if pressure_rate > self.pressure_target_max {
            // Hurting: give memory back.
            state.limit += (state.limit as f64 * self.max_backoff) as i64;
        }

        let floor = cgroupfs::read_mem_min(target)?.max(self.limit_min_bytes);
        state.limit = state.limit.max(floor);

        debug!(
            "senpai: cgroup={} pressure_rate={:.4} limit={}MB current={}MB",
            target.relative(),
            pressure_rate,
            state.limit >> 20,
            current >> 20,
        );

        state.last_total = total;
        state.last_tick = now;
        write_limit(target, state)?;
        Ok(())
    }
}

fn write_limit(target: &CgroupPath, state: &TargetState) -> Result<()> {
    if state.has_high_tmp {
        cgroupfs::write_mem_high_tmp(target, state.limit, MEM_HIGH_TMP_TIMEOUT)?;
    } else {
        cgroupfs::write_mem_high(target, state.limit)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::tests_support::init_plugin;
    use crate::test_util::FakeCgroupTree;

    fn senpai_plugin(tree: &FakeCgroupTree, cgroup: &str, extra: &[(&str, &str)]) -> Senpai {
        let root = tree.root().to_string_lossy().into_owned();
        let mut args = vec![("cgroup", cgroup.to_owned()), ("cgroup_fs", root)];
        args.extend(extra.iter().map(|(k, v)| (*k, v.to_string())));
        let args: Vec<(&str, &str)> = args.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let mut plugin = Senpai::default();
        init_plugin(&mut plugin, &args);
        plugin
    }

    fn run_ticks(plugin: &mut Senpai, ticks: usize) {
        let mut ctx = OomdContext::new();
        let t0 = ctx.now();
        for tick in 0..ticks {
            ctx.set_now(t0 + Duration::from_secs(6 * tick as u64));
            assert_eq!(plugin.run(&mut ctx), PluginRet::Continue);
        }
    }

    #[test]
    fn test_drives_limit_to_memory_min_floor() {
        let tree = FakeCgroupTree::new();
        tree.add_leaf("workload", 1073741824);
        tree.add_cgroup_file("workload", cgroupfs::MEM_MIN_FILE, "1048576000\n");

        let mut plugin = senpai_plugin(&tree, "workload", &[("limit_min_bytes", "0")]);
        run_ticks(&mut plugin, 100);

        // Zero pressure the whole way: the limit walks down monotonically
        // until it parks exactly on max(memory.min, limit_min_bytes).
        assert_eq!(
            cgroupfs::read_mem_high(&tree.cgroup("workload")).unwrap(),
            1048576000
        );
    }

    #[test]
    fn test_limit_min_bytes_floor() {
        let tree = FakeCgroupTree::new();
        tree.add_leaf("workload", 1 << 30);

        let mut plugin = senpai_plugin(
            &tree,
            "workload",
            &[("limit_min_bytes", &(900 << 20i64).to_string())],
        );
        run_ticks(&mut plugin, 50);

        assert_eq!(
            cgroupfs::read_mem_high(&tree.cgroup("workload")).unwrap(),
            900 << 20
        );
    }

    #[test]
    fn test_prefers_mem_high_tmp() {
        let tree = FakeCgroupTree::new();
        tree.add_leaf("workload", 1 << 30);
        tree.add_cgroup_file("workload", cgroupfs::MEM_HIGH_TMP_FILE, "max 0\n");

        let mut plugin = senpai_plugin(&tree, "workload", &[("limit_min_bytes", "0")]);
        run_ticks(&mut plugin, 10);

        let workload = tree.cgroup("workload");
        // The temporary knob takes the writes; memory.high keeps its
        // configured value.
        assert_eq!(cgroupfs::read_mem_high(&workload).unwrap(), i64::MAX);
        let tmp_limit = cgroupfs::read_mem_high_tmp(&workload).unwrap();
        assert!(tmp_limit < 1 << 30);
        assert!(tmp_limit > 0);
    }

    #[test]
    fn test_backs_off_under_pressure() {
        let tree = FakeCgroupTree::new();
        tree.add_leaf("workload", 1 << 30);

        let mut plugin = senpai_plugin(&tree, "workload", &[("limit_min_bytes", "0")]);

        let mut ctx = OomdContext::new();
        let t0 = ctx.now();
        plugin.run(&mut ctx);
        let initial = cgroupfs::read_mem_high(&tree.cgroup("workload")).unwrap();

        // Large stall growth over one 6s tick: way over the pressure band.
        tree.add_pressure("workload", cgroupfs::MEM_PRESSURE_FILE, 50.0, 3_000_000);
        ctx.set_now(t0 + Duration::from_secs(6));
        plugin.run(&mut ctx);

        let raised = cgroupfs::read_mem_high(&tree.cgroup("workload")).unwrap();
        assert!(raised > initial);
    }
}
