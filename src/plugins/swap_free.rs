// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::info;

use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::required_duration;

/// Matches when free swap has stayed at or below `threshold_pct` percent of
/// total swap for the configured duration. Hosts running without swap never
/// match.
#[derive(Default)]
pub struct SwapFree {
    threshold_pct: f64,
    duration: Duration,
    hit_at: Option<Instant>,
}

impl Plugin for SwapFree {
    fn name(&self) -> &'static str {
        "swap_free"
    }

    fn init(
        &mut self,
        _resources: &mut MonitoredResources,
        args: &PluginArgs,
        _construction: &ConstructionContext,
    ) -> Result<()> {
        let Some(threshold) = args.get("threshold_pct") else {
            bail!("Argument=threshold_pct not present");
        };
        self.threshold_pct = threshold
            .parse()
            .context("Argument=threshold_pct is not a number")?;
        self.duration = required_duration(args, "duration")?;
        Ok(())
    }

    fn run(&mut self, ctx: &mut OomdContext) -> PluginRet {
        let swap_total = ctx.system.swap_total;
        if swap_total == 0 {
            self.hit_at = None;
            return PluginRet::Stop;
        }

        let swap_free = swap_total.saturating_sub(ctx.system.swap_used);
        let free_pct = swap_free as f64 * 100.0 / swap_total as f64;

        let now = ctx.now();
        if free_pct <= self.threshold_pct {
            let hit = *self.hit_at.get_or_insert(now);
            if now.duration_since(hit) >= self.duration {
                info!(
                    "SwapFree {}MB is {:.1}% of {}MB total, at or below the {}% threshold",
                    swap_free >> 20,
                    free_pct,
                    swap_total >> 20,
                    self.threshold_pct
                );
                return PluginRet::Continue;
            }
        } else {
            self.hit_at = None;
        }

        PluginRet::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SystemContext;
    use crate::plugins::tests_support::init_plugin;

    fn plugin(threshold_pct: &str) -> SwapFree {
        let mut plugin = SwapFree::default();
        init_plugin(
            &mut plugin,
            &[("threshold_pct", threshold_pct), ("duration", "0")],
        );
        plugin
    }

    fn context_with_swap(total_mb: u64, used_mb: u64) -> OomdContext {
        let mut ctx = OomdContext::new();
        ctx.system = SystemContext {
            swap_total: total_mb << 20,
            swap_used: used_mb << 20,
        };
        ctx
    }

    #[test]
    fn test_low_swap() {
        let mut plugin = plugin("20");
        // 15% free.
        let mut ctx = context_with_swap(1000, 850);
        assert_eq!(plugin.run(&mut ctx), PluginRet::Continue);
    }

    #[test]
    fn test_enough_swap() {
        let mut plugin = plugin("20");
        // 50% free.
        let mut ctx = context_with_swap(1000, 500);
        assert_eq!(plugin.run(&mut ctx), PluginRet::Stop);
    }

    #[test]
    fn test_swap_off_is_stop() {
        let mut plugin = plugin("90");
        let mut ctx = context_with_swap(0, 0);
        assert_eq!(plugin.run(&mut ctx), PluginRet::Stop);
    }

    #[test]
    fn test_duration_must_hold() {
        let mut plugin = plugin("20");
        plugin.duration = Duration::from_secs(10);

        let mut ctx = context_with_swap(1000, 900);
        let t0 = ctx.now();
        assert_eq!(plugin.run(&mut ctx), PluginRet::Stop);

        ctx.set_now(t0 + Duration::from_secs(10));
        assert_eq!(plugin.run(&mut ctx), PluginRet::Continue);
    }
}
