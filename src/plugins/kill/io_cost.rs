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

/// Kills the scoped cgroup with the highest IO cost rate, the
/// coefficient-weighted per-second device traffic computed by the sampler.
pub struct KillIoCost {
    kill: KillMechanics,
}

impl KillIoCost {
    pub fn new() -> Self {
        KillIoCost {
            kill: KillMechanics::new(),
        }
    }

    fn try_to_kill_something(&mut self, ctx: &mut OomdContext) -> bool {
        let candidates = self.kill.sorted_candidates(ctx, |c| c.io_cost_rate);

        let action = ctx.action_context().clone();
        for (path, cgroup_ctx) in &candidates {
            info!(
                "Picked \"{}\" ({}MB) based on io cost rate {:.2}",
                path.relative(),
                cgroup_ctx.current_usage >> 20,
                cgroup_ctx.io_cost_rate,
            );
            if self
                .kill
                .try_kill_cgroup("kill_by_io_cost", path, cgroup_ctx, &action)
            {
                return true;
            }
        }

        false
    }
}

impl Plugin for KillIoCost {
    fn name(&self) -> &'static str {
        "kill_by_io_cost"
    }

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.kill.init(resources, args, construction)
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
