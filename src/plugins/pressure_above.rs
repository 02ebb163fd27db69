// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::info;

use crate::cgroup_path::CgroupPath;
use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::required_duration;
use crate::plugins::required_resource;
use crate::plugins::register_cgroup_patterns;
use crate::plugins::ResourceType;

/// Matches when any scoped cgroup's PSI has stayed at or above the threshold
/// continuously for the configured duration.
#[derive(Default)]
pub struct PressureAbove {
    cgroups: Vec<CgroupPath>,
    resource: ResourceType,
    threshold: f32,
    duration: Duration,
    /// When each cgroup first crossed the threshold.
    hit_at: HashMap<CgroupPath, Instant>,
}

impl Plugin for PressureAbove {
    fn name(&self) -> &'static str {
        "pressure_above"
    }

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.cgroups = register_cgroup_patterns(resources, args, construction)?;
        self.resource = required_resource(args)?;

        let Some(threshold) = args.get("threshold") else {
            bail!("Argument=threshold not present");
        };
        self.threshold = threshold
            .parse()
            .context("Argument=threshold is not a number")?;

        self.duration = required_duration(args, "duration")?;
        Ok(())
    }

    fn run(&mut self, ctx: &mut OomdContext) -> PluginRet {
        let now = ctx.now();
        let mut fired = None;

        let entries = ctx.matching_entries(&self.cgroups);
        for (path, cgroup_ctx) in &entries {
            let pressure = match self.resource {
                ResourceType::Memory => &cgroup_ctx.pressure,
                ResourceType::Io => &cgroup_ctx.io_pressure,
            };

            // NaN (pressure unavailable) never satisfies the comparison.
            if pressure.max_avg() >= self.threshold {
                let hit = *self.hit_at.entry((*path).clone()).or_insert(now);
                if now.duration_since(hit) >= self.duration {
                    fired = Some(((*path).clone(), pressure.max_avg()));
                }
            } else {
                self.hit_at.remove(*path);
            }
        }

        // Drop state for cgroups that disappeared so a returning cgroup
        // starts a fresh window.
        self.hit_at
            .retain(|path, _| entries.iter().any(|(p, _)| *p == path));

        match fired {
            Some((path, avg)) => {
                info!(
                    "cgroup={} pressure {:.2} is over the threshold of {:.2} for {}s",
                    path.relative(),
                    avg,
                    self.threshold,
                    self.duration.as_secs()
                );
                PluginRet::Continue
            }
            None => PluginRet::Stop,
        }
    }
}
