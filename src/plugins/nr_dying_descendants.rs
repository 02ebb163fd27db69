// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;

use crate::cgroup_path::CgroupPath;
use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::parse_bool;
use crate::plugins::register_cgroup_patterns;

/// Compares nr_dying_descendants of the scoped cgroups against `count`.
/// With `lte=true` (the default) it matches on `<= count`, otherwise on
/// `> count`. High counts point at zombie cgroup leaks or stuck teardown.
#[derive(Default)]
pub struct NrDyingDescendants {
    cgroups: Vec<CgroupPath>,
    count: i64,
    lte: bool,
    debug: bool,
}

impl Plugin for NrDyingDescendants {
    fn name(&self) -> &'static str {
        "nr_dying_descendants"
    }

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.cgroups = register_cgroup_patterns(resources, args, construction)?;

        let Some(count) = args.get("count") else {
            bail!("Argument=count not present");
        };
        self.count = count.parse().context("Argument=count is not a number")?;
        if self.count < 0 {
            bail!("Argument=count must be non-negative");
        }

        // lte defaults to true; only an explicit false flips it.
        self.lte = !matches!(
            args.get("lte").map(String::as_str),
            Some("false") | Some("False") | Some("0")
        );
        self.debug = parse_bool(args, "debug");
        Ok(())
    }

    fn run(&mut self, ctx: &mut OomdContext) -> PluginRet {
        for (path, cgroup_ctx) in ctx.matching_entries(&self.cgroups) {
            let nr = cgroup_ctx.nr_dying_descendants;
            let matched = if self.lte {
                nr <= self.count
            } else {
                nr > self.count
            };
            if matched {
                if self.debug {
                    debug!(
                        "cgroup={} nr_dying_descendants={} {} count={}",
                        path.relative(),
                        nr,
                        if self.lte { "<=" } else { ">" },
                        self.count
                    );
                }
                return PluginRet::Continue;
            }
        }

        PluginRet::Stop
    }
}
