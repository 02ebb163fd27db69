// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::Context;
use anyhow::Result;

use crate::cgroup_path::CgroupPath;
use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::register_cgroup_patterns;

/// Rewrites the scoped cgroups' effective-usage inputs for the rest of this
/// tick: `effective_usage = current * memory_scale - protection + memory`.
/// Purely in-snapshot; nothing is written back to the kernel. Place it ahead
/// of a kill plugin to bias (or shield) specific subtrees.
#[derive(Default)]
pub struct AdjustCgroup {
    cgroups: Vec<CgroupPath>,
    memory_scale: Option<f64>,
    memory_adjust: Option<i64>,
}

impl Plugin for AdjustCgroup {
    fn name(&self) -> &'static str {
        "adjust_cgroup"
    }

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.cgroups = register_cgroup_patterns(resources, args, construction)?;

        self.memory_scale = match args.get("memory_scale") {
            Some(value) => Some(
                value
                    .parse()
                    .context("Argument=memory_scale is not a number")?,
            ),
            None => None,
        };
        // Bytes; may be negative to shield a cgroup.
        self.memory_adjust = match args.get("memory") {
            Some(value) => Some(value.parse().context("Argument=memory is not a number")?),
            None => None,
        };
        Ok(())
    }

    fn run(&mut self, ctx: &mut OomdContext) -> PluginRet {
        for (_, cgroup_ctx) in ctx.matching_entries_mut(&self.cgroups) {
            if let Some(scale) = self.memory_scale {
                cgroup_ctx.memory_scale = scale;
            }
            if let Some(adjust) = self.memory_adjust {
                cgroup_ctx.memory_adjust = adjust;
            }
        }
        PluginRet::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CgroupContext;
    use crate::plugins::tests_support::init_plugin;

    #[test]
    fn test_adjusts_effective_usage() {
        let mut plugin = AdjustCgroup::default();
        init_plugin(
            &mut plugin,
            &[
                ("cgroup", "workload"),
                ("memory_scale", "2.0"),
                ("memory", "-1000"),
            ],
        );

        let mut ctx = OomdContext::new();
        let workload = CgroupPath::new("/sys/fs/cgroup", "workload");
        let bystander = CgroupPath::new("/sys/fs/cgroup", "bystander");
        ctx.set(
            workload.clone(),
            CgroupContext {
                current_usage: 10000,
                ..Default::default()
            },
        );
        ctx.set(
            bystander.clone(),
            CgroupContext {
                current_usage: 10000,
                ..Default::default()
            },
        );

        assert_eq!(plugin.run(&mut ctx), PluginRet::Continue);
        assert_eq!(ctx.get(&workload).unwrap().effective_usage(), 19000);
        // Cgroups outside the scope keep plain usage.
        assert_eq!(ctx.get(&bystander).unwrap().effective_usage(), 10000);
    }

    #[test]
    fn test_unset_args_leave_defaults() {
        let mut plugin = AdjustCgroup::default();
        init_plugin(&mut plugin, &[("cgroup", "workload"), ("memory", "512")]);

        let mut ctx = OomdContext::new();
        let workload = CgroupPath::new("/sys/fs/cgroup", "workload");
        ctx.set(
            workload.clone(),
            CgroupContext {
                current_usage: 1000,
                ..Default::default()
            },
        );

        plugin.run(&mut ctx);
        let adjusted = ctx.get(&workload).unwrap();
        assert_eq!(adjusted.memory_scale, 1.0);
        assert_eq!(adjusted.effective_usage(), 1512);
    }
}
