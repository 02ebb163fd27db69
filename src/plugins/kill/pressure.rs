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
use crate::plugins::required_resource;
use crate::plugins::ResourceType;

/// Kills the scoped cgroup generating the most PSI on the configured
/// resource (10s window). No admission threshold: whoever is stalling the
/// most goes first.
pub struct KillPressure {
    kill: KillMechanics,
    resource: ResourceType,
}

impl KillPressure {
    pub fn new() -> Self {
        KillPressure {
            kill: KillMechanics::new(),
            resource: ResourceType::Memory,
        }
    }

    fn pressure_key(resource: ResourceType) -> impl Fn(&CgroupContext) -> f64 {
        move |cgroup_ctx| {
            let avg10 = match resource {
                ResourceType::Memory => cgroup_ctx.pressure.avg10,
                ResourceType::Io => cgroup_ctx.io_pressure.avg10,
            };
            // Unavailable pressure sorts behind every real reading.
            if avg10.is_nan() {
                -1.0
            } else {
                avg10 as f64
            }
        }
    }

    fn try_to_kill_something(&mut self, ctx: &mut OomdContext) -> bool {
        let candidates = self
            .kill
            .sorted_candidates(ctx, Self::pressure_key(self.resource));

        let action = ctx.action_context().clone();
        for (path, cgroup_ctx) in &candidates {
            let pressure = match self.resource {
                ResourceType::Memory => &cgroup_ctx.pressure,
                ResourceType::Io => &cgroup_ctx.io_pressure,
            };
            info!(
                "Picked \"{}\" ({}MB) based on pressure generation at 10s={:.2} 60s={:.2}",
                path.relative(),
                cgroup_ctx.current_usage >> 20,
                pressure.avg10,
                pressure.avg60,
            );
            if self
                .kill
                .try_kill_cgroup("kill_by_pressure", path, cgroup_ctx, &action)
            {
                return true;
            }
        }

        false
    }
}

impl Plugin for KillPressure {
    fn name(&self) -> &'static str {
        "kill_by_pressure"
    }

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.kill.init(resources, args, construction)?;
        self.resource = required_resource(args)?;
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
