// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::Result;
use log::info;

use crate::context::CgroupContext;
use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::kill::KillMechanics;
use crate::plugins::optional_f64;

const DEFAULT_SIZE_THRESHOLD_PCT: f64 = 50.0;
const DEFAULT_GROWTH_THRESHOLD: f64 = 1.25;

/// Two-phase victim selection. Size phase: kill the biggest scoped cgroup if
/// it holds at least `size_threshold` percent of the scoped total. Growth
/// phase (when nothing is dominant): kill the cgroup growing fastest
/// relative to its own smoothed average, if that ratio clears
/// `growth_threshold`.
pub struct KillMemorySizeOrGrowth {
    kill: KillMechanics,
    size_threshold_pct: f64,
    growth_threshold: f64,
}

impl KillMemorySizeOrGrowth {
    pub fn new() -> Self {
        KillMemorySizeOrGrowth {
            kill: KillMechanics::new(),
            size_threshold_pct: DEFAULT_SIZE_THRESHOLD_PCT,
            growth_threshold: DEFAULT_GROWTH_THRESHOLD,
        }
    }

    fn try_to_kill_something(&mut self, ctx: &mut OomdContext) -> bool {
        let candidates = self
            .kill
            .sorted_candidates(ctx, |c| c.effective_usage() as f64);
        let total: i64 = candidates.iter().map(|(_, c)| c.effective_usage()).sum();
        let size_floor = total as f64 * self.size_threshold_pct / 100.0;

        // Size phase: candidates arrive largest-first, so the walk can stop
        // at the first one below the dominance floor.
        let action = ctx.action_context().clone();
        for (path, cgroup_ctx) in &candidates {
            if (cgroup_ctx.effective_usage() as f64) < size_floor {
                break;
            }
            info!(
                "Picked \"{}\" ({}MB) based on size at {}% of total {}MB",
                path.relative(),
                cgroup_ctx.current_usage >> 20,
                self.size_threshold_pct,
                total >> 20,
            );
            if self
                .kill
                .try_kill_cgroup("kill_by_memory_size_or_growth", path, cgroup_ctx, &action)
            {
                return true;
            }
        }

        // Growth phase.
        let mut by_growth = candidates;
        OomdContext::reverse_sort_vec(&mut by_growth, growth);
        for (path, cgroup_ctx) in &by_growth {
            if growth(cgroup_ctx) < self.growth_threshold {
                break;
            }
            info!(
                "Picked \"{}\" ({}MB) based on growth {:.2}",
                path.relative(),
                cgroup_ctx.current_usage >> 20,
                growth(cgroup_ctx),
            );
            if self
                .kill
                .try_kill_cgroup("kill_by_memory_size_or_growth", path, cgroup_ctx, &action)
            {
                return true;
            }
        }

        false
    }
}

/// Growth relative to the smoothed average; a cgroup with no history yet has
/// no growth signal.
fn growth(cgroup_ctx: &CgroupContext) -> f64 {
    if cgroup_ctx.average_usage <= 0 {
        return 0.0;
    }
    cgroup_ctx.current_usage as f64 / cgroup_ctx.average_usage as f64
}

impl Plugin for KillMemorySizeOrGrowth {
    fn name(&self) -> &'static str {
        "kill_by_memory_size_or_growth"
    }

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.kill.init(resources, args, construction)?;
        self.size_threshold_pct = match args.get("size_threshold").map(String::as_str) {
            Some(value) => value
                .trim_end_matches('%')
                .parse()
                .map_err(|_| anyhow::anyhow!("Argument=size_threshold is not a percentage"))?,
            None => DEFAULT_SIZE_THRESHOLD_PCT,
        };
        self.growth_threshold = optional_f64(args, "growth_threshold", DEFAULT_GROWTH_THRESHOLD)?;
        Ok(())
    }

    fn run(&mut self, ctx: &mut OomdContext) -> PluginRet {
        if let Some(ret) = self.kill.check_cooldown(ctx.now()) {
            return ret;
        }
        if self.try_to_kill_something(ctx) {
            self.kill.after_kill(ctx.now())
        } else {
            PluginRet::Continue
        }
    }
}
