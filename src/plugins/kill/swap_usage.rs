// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::Result;
use log::info;

use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::kill::KillMechanics;
use crate::plugins::parse_threshold;
use crate::plugins::Threshold;

/// Kills the scoped cgroup using the most swap, provided it uses more than
/// `threshold` (bytes, or `N%` of SwapTotal; default anything above zero).
/// Swap-heavy cgroups are the cheapest victims: their working set is already
/// cold.
pub struct KillSwapUsage {
    kill: KillMechanics,
    threshold: Threshold,
}

impl KillSwapUsage {
    pub fn new() -> Self {
        KillSwapUsage {
            kill: KillMechanics::new(),
            threshold: Threshold::Absolute(0),
        }
    }

    fn try_to_kill_something(&mut self, ctx: &mut OomdContext) -> bool {
        let threshold_bytes = self.threshold.in_bytes(ctx.system.swap_total as i64);
        let candidates = self.kill.sorted_candidates(ctx, |c| c.swap_usage as f64);

        let action = ctx.action_context().clone();
        for (path, cgroup_ctx) in &candidates {
            // Sorted descending: once one candidate is at or under the
            // threshold the rest are too.
            if cgroup_ctx.swap_usage <= threshold_bytes {
                break;
            }
            info!(
                "Picked \"{}\" ({}MB) based on swap usage at {}MB",
                path.relative(),
                cgroup_ctx.current_usage >> 20,
                cgroup_ctx.swap_usage >> 20,
            );
            if self
                .kill
                .try_kill_cgroup("kill_by_swap_usage", path, cgroup_ctx, &action)
            {
                return true;
            }
        }

        false
    }
}

impl Plugin for KillSwapUsage {
    fn name(&self) -> &'static str {
        "kill_by_swap_usage"
    }

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.kill.init(resources, args, construction)?;
        if let Some(threshold) = args.get("threshold") {
            // A bare threshold is in bytes here.
            self.threshold = parse_threshold(threshold, 1)?;
        }
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
