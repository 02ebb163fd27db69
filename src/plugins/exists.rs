// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::Result;

use crate::cgroup_path::CgroupPath;
use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::parse_bool;
use crate::plugins::register_cgroup_patterns;

/// Matches when any of the configured cgroups is present in the snapshot;
/// `negate=true` inverts the test.
#[derive(Default)]
pub struct Exists {
    cgroups: Vec<CgroupPath>,
    negate: bool,
}

impl Plugin for Exists {
    fn name(&self) -> &'static str {
        "exists"
    }

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.cgroups = register_cgroup_patterns(resources, args, construction)?;
        self.negate = parse_bool(args, "negate");
        Ok(())
    }

    fn run(&mut self, ctx: &mut OomdContext) -> PluginRet {
        let exists = !ctx.matching_entries(&self.cgroups).is_empty();
        if exists != self.negate {
            PluginRet::Continue
        } else {
            PluginRet::Stop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CgroupContext;
    use crate::plugins::tests_support::init_plugin;

    fn context_with(names: &[&str]) -> OomdContext {
        let mut ctx = OomdContext::new();
        for name in names {
            ctx.set(
                CgroupPath::new("/sys/fs/cgroup", name),
                CgroupContext::default(),
            );
        }
        ctx
    }

    #[test]
    fn test_exists() {
        let mut plugin = Exists::default();
        init_plugin(&mut plugin, &[("cgroup", "cgroup_A,cgroup_B,cgroup_C")]);

        let mut ctx = context_with(&["cgroup_D"]);
        assert_eq!(plugin.run(&mut ctx), PluginRet::Stop);

        let mut ctx = context_with(&["cgroup_D", "cgroup_C"]);
        assert_eq!(plugin.run(&mut ctx), PluginRet::Continue);
    }

    #[test]
    fn test_exists_negated() {
        let mut plugin = Exists::default();
        init_plugin(
            &mut plugin,
            &[("cgroup", "cgroup_A,cgroup_B,cgroup_C"), ("negate", "true")],
        );

        let mut ctx = context_with(&["cgroup_D"]);
        assert_eq!(plugin.run(&mut ctx), PluginRet::Continue);

        let mut ctx = context_with(&["cgroup_D", "cgroup_C"]);
        assert_eq!(plugin.run(&mut ctx), PluginRet::Stop);
    }

    #[test]
    fn test_exists_wildcard() {
        let mut plugin = Exists::default();
        init_plugin(&mut plugin, &[("cgroup", "workload/*")]);

        let mut ctx = context_with(&["workload/app1"]);
        assert_eq!(plugin.run(&mut ctx), PluginRet::Continue);

        let mut ctx = context_with(&["system/app1"]);
        assert_eq!(plugin.run(&mut ctx), PluginRet::Stop);
    }
}
