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
use crate::cgroupfs::ResourcePressure;
use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::required_duration;
use crate::plugins::required_resource;
use crate::plugins::register_cgroup_patterns;
use crate::plugins::optional_f64;
use crate::plugins::ResourceType;

const DEFAULT_FAST_FALL_RATIO: f64 = 0.85;

/// Like pressure_above, but refuses to fire while pressure is collapsing
/// faster than `fast_fall_ratio` relative to the previous sample. Dampens
/// kill decisions against oscillating workloads that are already backing
/// off.
#[derive(Default)]
pub struct PressureRisingBeyond {
    cgroups: Vec<CgroupPath>,
    resource: ResourceType,
    threshold: f32,
    duration: Duration,
    fast_fall_ratio: f64,
    hit_at: HashMap<CgroupPath, Instant>,
    last_pressure: HashMap<CgroupPath, ResourcePressure>,
}

impl Plugin for PressureRisingBeyond {
    fn name(&self) -> &'static str {
        "pressure_rising_beyond"
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
        self.fast_fall_ratio = optional_f64(args, "fast_fall_ratio", DEFAULT_FAST_FALL_RATIO)?;
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

            let held = if pressure.max_avg() >= self.threshold {
                let hit = *self.hit_at.entry((*path).clone()).or_insert(now);
                now.duration_since(hit) >= self.duration
            } else {
                self.hit_at.remove(*path);
                false
            };

            // Pressure collapsing on the 10s window means the workload is
            // recovering on its own; hold fire.
            let falling_rapidly = self
                .last_pressure
                .get(*path)
                .map(|last| {
                    (pressure.avg10 as f64) < (last.avg10 as f64) * self.fast_fall_ratio
                })
                .unwrap_or(false);

            if held && !falling_rapidly {
                fired = Some(((*path).clone(), pressure.max_avg()));
            }

            self.last_pressure.insert((*path).clone(), pressure.clone());
        }

        self.hit_at
            .retain(|path, _| entries.iter().any(|(p, _)| *p == path));
        self.last_pressure
            .retain(|path, _| entries.iter().any(|(p, _)| *p == path));

        match fired {
            Some((path, avg)) => {
                info!(
                    "cgroup={} pressure {:.2} is over the threshold of {:.2} for {}s and not fast-falling",
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
