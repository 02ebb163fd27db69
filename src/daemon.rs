// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The sampling/evaluation loop. Each tick resolves the monitored cgroup
//! globs, snapshots every resolved cgroup into a fresh `OomdContext`
//! (carrying the smoothed usage average and IO cost rate forward from the
//! previous tick), hands the snapshot to the engine, and sleeps out the rest
//! of the interval.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::error;
use log::info;
use log::warn;

use crate::cgroup_path::CgroupPath;
use crate::cgroupfs;
use crate::cgroupfs::PressureKind;
use crate::cgroupfs::ResourcePressure;
use crate::context::CgroupContext;
use crate::context::OomdContext;
use crate::context::SystemContext;
use crate::engine::Engine;

/// Decay constant of the running usage average: each tick contributes 1/4 of
/// the new sample.
const AVERAGE_SIZE_DECAY: f64 = 4.0;

const PGSCAN_KSWAPD: &str = "pgscan_kswapd";
const PGSCAN_DIRECT: &str = "pgscan_direct";

/// Weights of io.stat counters in the IO cost scalar. Byte counters carry
/// the cost; iops are informational only until per-device-class coefficients
/// are configurable.
const IO_COST_BYTE_COEFF: f64 = 1.0;
const IO_COST_IOPS_COEFF: f64 = 0.0;

pub struct Oomd {
    engine: Engine,
    interval: Duration,
    meminfo_path: PathBuf,
    vmstat_path: PathBuf,
    warned_io_pressure: bool,
}

impl Oomd {
    pub fn new(engine: Engine, interval: Duration) -> Self {
        Oomd {
            engine,
            interval,
            meminfo_path: PathBuf::from(cgroupfs::PROC_MEMINFO),
            vmstat_path: PathBuf::from(cgroupfs::PROC_VMSTAT),
            warned_io_pressure: false,
        }
    }

    pub fn run(&mut self, terminating: &AtomicBool) {
        info!("Running oomd with interval={}s", self.interval.as_secs());
        let mut ctx = OomdContext::new();

        while !terminating.load(Ordering::Relaxed) {
            let before = Instant::now();

            let mut new_ctx = self.update_context(&ctx);
            self.log_overview(&new_ctx);
            self.engine.run_once(&mut new_ctx);
            ctx = new_ctx;

            let elapsed = before.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }

        info!("Terminating on signal");
    }

    /// Builds this tick's snapshot. Cgroups can be created and removed
    /// underneath us at any time; entries that vanish mid-sample are skipped
    /// silently. A monitored parent without the memory controller is fatal:
    /// without its knobs nothing here can work.
    pub fn update_context(&mut self, previous: &OomdContext) -> OomdContext {
        let mut new_ctx = OomdContext::new();
        let mut checked_parents = HashSet::new();

        let patterns: Vec<CgroupPath> =
            self.engine.monitored_resources().iter().cloned().collect();
        for pattern in &patterns {
            for absolute in cgroupfs::resolve_wildcard(pattern) {
                if !cgroupfs::is_dir(&absolute) {
                    continue;
                }
                let Some(target) = CgroupPath::from_absolute(pattern.cgroup_fs(), &absolute)
                else {
                    continue;
                };
                if new_ctx.contains(&target) {
                    continue;
                }

                let parent = target.parent();
                if checked_parents.insert(parent.absolute()) {
                    self.assert_memory_controller(&parent);
                }

                match self.populate(&target) {
                    Ok(mut cgroup_ctx) => {
                        self.carry_forward(previous, &target, &mut cgroup_ctx);
                        new_ctx.set(target, cgroup_ctx);
                    }
                    Err(e) => {
                        // Not an error if the cgroup was torn down while we
                        // were reading it.
                        if cgroupfs::is_dir(&absolute) {
                            warn!("Failed to sample {}: {}", target.relative(), e);
                        }
                    }
                }
            }
        }

        match cgroupfs::get_meminfo(&self.meminfo_path) {
            Ok(meminfo) => {
                let total = meminfo.get("SwapTotal").copied().unwrap_or(0).max(0) as u64;
                let free = meminfo.get("SwapFree").copied().unwrap_or(0).max(0) as u64;
                new_ctx.system = SystemContext {
                    swap_total: total,
                    swap_used: total.saturating_sub(free),
                };
            }
            Err(e) => warn!("Failed to read {}: {}", self.meminfo_path.display(), e),
        }

        new_ctx
    }

    fn assert_memory_controller(&self, cgroup: &CgroupPath) {
        match cgroupfs::read_controllers(cgroup) {
            Ok(controllers) if controllers.iter().any(|c| c == "memory") => (),
            Ok(_) => {
                error!(
                    "FATAL: cgroup memory controller not enabled on {}",
                    cgroup.absolute().display()
                );
                std::process::abort();
            }
            Err(e) => {
                error!(
                    "FATAL: unable to read cgroup.controllers on {}: {}",
                    cgroup.absolute().display(),
                    e
                );
                std::process::abort();
            }
        }
    }

    fn populate(&mut self, target: &CgroupPath) -> Result<CgroupContext, cgroupfs::Error> {
        let current_usage = cgroupfs::read_mem_current(target)?;
        let pressure = cgroupfs::read_mem_pressure(target, PressureKind::Some)?;

        // Old kernels have no io.pressure; degrade to NaN and mention it
        // once.
        let io_pressure = match cgroupfs::read_io_pressure(target, PressureKind::Some) {
            Ok(io_pressure) => io_pressure,
            Err(e) => {
                if !self.warned_io_pressure {
                    self.warned_io_pressure = true;
                    warn!("IO pressure unavailable: {}", e);
                }
                ResourcePressure::unavailable()
            }
        };

        let memory_low = cgroupfs::read_mem_low(target)?;
        let memory_min = cgroupfs::read_mem_min(target)?;
        let memory_high = cgroupfs::read_mem_high(target)?;
        let memory_max = cgroupfs::read_mem_max(target)?;
        let swap_usage = cgroupfs::read_swap_current(target)?;

        let memstat = cgroupfs::get_memstat(target)?;
        let stat = |key: &str| memstat.get(key).copied().unwrap_or(0);

        // The io controller may not be enabled even where memory is.
        let io_cost_cumulative = cgroupfs::read_io_stat(target)
            .map(|stats| {
                stats
                    .iter()
                    .map(|s| {
                        (s.rbytes + s.wbytes + s.dbytes) as f64 * IO_COST_BYTE_COEFF
                            + (s.rios + s.wios + s.dios) as f64 * IO_COST_IOPS_COEFF
                    })
                    .sum()
            })
            .unwrap_or(0.0);

        Ok(CgroupContext {
            pressure,
            io_pressure,
            current_usage,
            memory_low,
            memory_min,
            memory_high,
            memory_max,
            swap_usage,
            anon_usage: stat("anon"),
            file_usage: stat("file"),
            shmem_usage: stat("shmem"),
            nr_dying_descendants: cgroupfs::nr_dying_descendants(target),
            io_cost_cumulative,
            memory_protection: current_usage.min(memory_low.max(memory_min)),
            ..Default::default()
        })
    }

    /// Smooths usage and derives the IO cost rate against the previous
    /// tick's entry for the same cgroup; a cgroup with no history starts
    /// from zero.
    fn carry_forward(
        &self,
        previous: &OomdContext,
        target: &CgroupPath,
        cgroup_ctx: &mut CgroupContext,
    ) {
        let prev = previous.get(target).ok();

        let prev_average = prev.map(|p| p.average_usage).unwrap_or(0);
        cgroup_ctx.average_usage = (prev_average as f64 * (AVERAGE_SIZE_DECAY - 1.0)
            / AVERAGE_SIZE_DECAY
            + cgroup_ctx.current_usage as f64 / AVERAGE_SIZE_DECAY)
            as i64;

        let interval_secs = self.interval.as_secs_f64().max(1.0);
        cgroup_ctx.io_cost_rate = prev
            .map(|p| (cgroup_ctx.io_cost_cumulative - p.io_cost_cumulative) / interval_secs)
            .unwrap_or(0.0);
    }

    fn log_overview(&self, ctx: &OomdContext) {
        let pgscan = cgroupfs::get_vmstat(&self.vmstat_path)
            .map(|vmstat| {
                vmstat.get(PGSCAN_KSWAPD).copied().unwrap_or(0)
                    + vmstat.get(PGSCAN_DIRECT).copied().unwrap_or(0)
            })
            .unwrap_or(0);
        let swap_free = ctx.system.swap_total.saturating_sub(ctx.system.swap_used);

        for pattern in self.engine.monitored_resources() {
            let entries = ctx.matching_entries(std::slice::from_ref(pattern));
            let total: i64 = entries.iter().map(|(_, c)| c.current_usage).sum();
            let pressure = entries
                .iter()
                .map(|(_, c)| c.pressure.avg10)
                .fold(0.0f32, f32::max);
            info!(
                "cgroup={} total={}MB pressure={:.2} swapfree={}MB/{}MB pgscan={}",
                pattern.relative(),
                total >> 20,
                pressure,
                swap_free >> 20,
                ctx.system.swap_total >> 20,
                pgscan,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MonitoredResources;
    use crate::test_util::FakeCgroupTree;

    fn standard_tree() -> FakeCgroupTree {
        let tree = FakeCgroupTree::new();
        tree.add_leaf("system.slice/service1.service", 100 << 20);
        tree.add_leaf("system.slice/service2.service", 200 << 20);
        tree.add_leaf("system.slice/service3.service", 300 << 20);
        tree.add_leaf("system.slice/service4.service", 400 << 20);
        tree.add_leaf("system.slice/slice1.slice", 500 << 20);
        tree.add_leaf("workload.slice/service1.service", 600 << 20);
        tree
    }

    fn oomd_for(tree: &FakeCgroupTree, patterns: &[&str]) -> Oomd {
        let mut resources = MonitoredResources::new();
        for pattern in patterns {
            resources.insert(tree.cgroup(pattern));
        }
        let engine = Engine::new(resources, Vec::new());
        let mut oomd = Oomd::new(engine, Duration::from_secs(5));
        oomd.meminfo_path = tree.add_meminfo(
            "meminfo",
            &[
                ("MemTotal", 16 * 1024 * 1024),
                ("MemFree", 8 * 1024 * 1024),
                ("SwapTotal", 102400),
                ("SwapFree", 51200),
            ],
        );
        oomd.vmstat_path = tree.add_file("vmstat", "pgscan_kswapd 100\npgscan_direct 23\n");
        oomd
    }

    #[test]
    fn test_update_context() {
        let tree = standard_tree();
        let mut oomd = oomd_for(&tree, &["system.slice/*"]);

        let ctx = oomd.update_context(&OomdContext::new());
        assert_eq!(ctx.cgroups().count(), 5);
        assert!(ctx.contains(&tree.cgroup("system.slice/service1.service")));
        assert!(ctx.contains(&tree.cgroup("system.slice/slice1.slice")));
        assert!(!ctx.contains(&tree.cgroup("workload.slice/service1.service")));

        let service1 = ctx
            .get(&tree.cgroup("system.slice/service1.service"))
            .unwrap();
        assert_eq!(service1.current_usage, 100 << 20);
        assert_eq!(service1.memory_max, i64::MAX);

        // Swap totals come from the fixture meminfo, scaled to bytes.
        assert_eq!(ctx.system.swap_total, 102400 * 1024);
        assert_eq!(ctx.system.swap_used, 51200 * 1024);
    }

    #[test]
    fn test_update_context_multiple_patterns() {
        let tree = standard_tree();
        let mut oomd = oomd_for(&tree, &["system.slice/*", "workload.slice/*"]);

        let ctx = oomd.update_context(&OomdContext::new());
        assert_eq!(ctx.cgroups().count(), 6);
    }

    #[test]
    fn test_update_context_overlapping_wildcards() {
        let tree = standard_tree();
        let mut oomd = oomd_for(&tree, &["*.slice/*", "workload.slice/*"]);

        // Overlapping patterns must not duplicate entries.
        let ctx = oomd.update_context(&OomdContext::new());
        assert_eq!(ctx.cgroups().count(), 6);
    }

    #[test]
    fn test_average_usage_converges() {
        let tree = standard_tree();
        let mut oomd = oomd_for(&tree, &["system.slice/*"]);
        let service1 = tree.cgroup("system.slice/service1.service");

        let mut ctx = oomd.update_context(&OomdContext::new());
        // First observation: prev average of zero, one quarter of current.
        assert_eq!(
            ctx.get(&service1).unwrap().average_usage,
            (100 << 20) / 4
        );

        // The running average climbs toward the steady current usage.
        for _ in 0..3 {
            let average = ctx.get(&service1).unwrap().average_usage;
            ctx = oomd.update_context(&ctx);
            let next = ctx.get(&service1).unwrap().average_usage;
            assert!(next > average);
            assert!(next <= 100 << 20);
        }
    }

    #[test]
    fn test_io_cost_rate_from_deltas() {
        let tree = standard_tree();
        let mut oomd = oomd_for(&tree, &["system.slice/*"]);
        let service1 = tree.cgroup("system.slice/service1.service");

        let ctx = oomd.update_context(&OomdContext::new());
        // No history yet.
        assert_eq!(ctx.get(&service1).unwrap().io_cost_rate, 0.0);

        // 10 MB more read traffic since the last tick, over a 5s interval.
        tree.add_cgroup_file(
            "system.slice/service1.service",
            cgroupfs::IO_STAT_FILE,
            "8:0 rbytes=10485760 wbytes=0 rios=50 wios=0 dbytes=0 dios=0\n",
        );
        let ctx = oomd.update_context(&ctx);
        let rate = ctx.get(&service1).unwrap().io_cost_rate;
        assert_eq!(rate, 10485760.0 / 5.0);
    }

    #[test]
    fn test_vanished_cgroup_is_skipped() {
        let tree = standard_tree();
        let mut oomd = oomd_for(&tree, &["system.slice/*"]);

        // A cgroup directory with no control files at all, as if it were
        // being torn down: sampled over without complaint.
        tree.add_cgroup("system.slice/dying.service");
        let ctx = oomd.update_context(&OomdContext::new());
        assert_eq!(ctx.cgroups().count(), 5);
        assert!(!ctx.contains(&tree.cgroup("system.slice/dying.service")));
    }
}
