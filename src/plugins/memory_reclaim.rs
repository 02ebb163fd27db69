// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use log::debug;
use log::warn;

use crate::cgroupfs;
use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::required_duration;

const PGSCAN_KSWAPD: &str = "pgscan_kswapd";
const PGSCAN_DIRECT: &str = "pgscan_direct";

/// Matches while the kernel has scanned pages for reclaim within the last
/// `duration` seconds.
#[derive(Default)]
pub struct MemoryReclaim {
    duration: Duration,
    vmstat_location: Option<PathBuf>,
    last_pgscan: i64,
    last_reclaim_at: Option<Instant>,
}

impl Plugin for MemoryReclaim {
    fn name(&self) -> &'static str {
        "memory_reclaim"
    }

    fn init(
        &mut self,
        _resources: &mut MonitoredResources,
        args: &PluginArgs,
        _construction: &ConstructionContext,
    ) -> Result<()> {
        self.duration = required_duration(args, "duration")?;
        self.vmstat_location = args.get("vmstat_location").map(PathBuf::from);
        Ok(())
    }

    fn run(&mut self, ctx: &mut OomdContext) -> PluginRet {
        let vmstat_path = self
            .vmstat_location
            .clone()
            .unwrap_or_else(|| PathBuf::from(cgroupfs::PROC_VMSTAT));
        let vmstat = match cgroupfs::get_vmstat(&vmstat_path) {
            Ok(vmstat) => vmstat,
            Err(e) => {
                warn!("Failed to read vmstat: {}", e);
                return PluginRet::Stop;
            }
        };

        let pgscan = vmstat.get(PGSCAN_KSWAPD).copied().unwrap_or(0)
            + vmstat.get(PGSCAN_DIRECT).copied().unwrap_or(0);
        let now = ctx.now();

        if pgscan > self.last_pgscan {
            self.last_reclaim_at = Some(now);
        }
        debug!("pgscan delta={}", pgscan - self.last_pgscan);
        self.last_pgscan = pgscan;

        match self.last_reclaim_at {
            Some(at) if now.duration_since(at) <= self.duration => PluginRet::Continue,
            _ => PluginRet::Stop,
        }
    }
}
