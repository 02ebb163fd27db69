// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;

use crate::cgroup_path::CgroupPath;
use crate::cgroupfs;
use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::parse_bool;
use crate::plugins::parse_threshold;
use crate::plugins::required_duration;
use crate::plugins::register_cgroup_patterns;
use crate::plugins::Threshold;

/// Matches when any scoped cgroup's memory usage has exceeded the threshold
/// for the configured duration. With `threshold_anon` set, anonymous memory
/// is compared instead of total usage. Bare thresholds are megabytes;
/// `N%` is relative to MemTotal.
#[derive(Default)]
pub struct MemoryAbove {
    cgroups: Vec<CgroupPath>,
    threshold: Threshold,
    /// When set, compare anon_usage against this and ignore `threshold`.
    threshold_anon: Option<Threshold>,
    duration: Duration,
    meminfo_location: Option<PathBuf>,
    debug: bool,
    hit_at: Option<Instant>,
}

impl Plugin for MemoryAbove {
    fn name(&self) -> &'static str {
        "memory_above"
    }

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.cgroups = register_cgroup_patterns(resources, args, construction)?;

        // A bare number has historically meant megabytes here.
        self.threshold_anon = match args.get("threshold_anon") {
            Some(value) => Some(parse_threshold(value, 1 << 20)?),
            None => None,
        };
        match args.get("threshold") {
            Some(value) => self.threshold = parse_threshold(value, 1 << 20)?,
            None if self.threshold_anon.is_none() => {
                bail!("Argument=threshold not present")
            }
            None => (),
        }

        self.duration = required_duration(args, "duration")?;
        self.meminfo_location = args.get("meminfo_location").map(PathBuf::from);
        self.debug = parse_bool(args, "debug");
        Ok(())
    }

    fn run(&mut self, ctx: &mut OomdContext) -> PluginRet {
        let use_anon = self.threshold_anon.is_some();
        let mut usage = 0i64;
        let mut current_cgroup = String::new();
        for (path, cgroup_ctx) in ctx.matching_entries(&self.cgroups) {
            let cgroup_usage = if use_anon {
                cgroup_ctx.anon_usage
            } else {
                cgroup_ctx.current_usage
            };
            if self.debug {
                debug!(
                    "cgroup \"{}\" memory usage={} (anon={})",
                    path.relative(),
                    cgroup_ctx.current_usage,
                    cgroup_ctx.anon_usage
                );
            }
            if cgroup_usage > usage {
                usage = cgroup_usage;
                current_cgroup = path.relative();
            }
        }

        let meminfo_path = self
            .meminfo_location
            .clone()
            .unwrap_or_else(|| PathBuf::from(cgroupfs::PROC_MEMINFO));
        let mem_total = match cgroupfs::get_meminfo(Path::new(&meminfo_path)) {
            Ok(meminfo) => meminfo.get("MemTotal").copied().unwrap_or(0),
            Err(e) => {
                warn!("Failed to read meminfo: {}", e);
                self.hit_at = None;
                return PluginRet::Stop;
            }
        };

        let threshold = self.threshold_anon.unwrap_or(self.threshold);
        let threshold_bytes = threshold.in_bytes(mem_total);

        let now = ctx.now();
        if usage >= threshold_bytes {
            let hit = *self.hit_at.get_or_insert(now);
            if now.duration_since(hit) >= self.duration {
                info!(
                    "cgroup \"{}\" current memory usage {}MB is over the threshold of {}MB for {}s",
                    current_cgroup,
                    usage >> 20,
                    threshold_bytes >> 20,
                    self.duration.as_secs()
                );
                return PluginRet::Continue;
            }
        } else {
            self.hit_at = None;
        }

        PluginRet::Stop
    }
}
