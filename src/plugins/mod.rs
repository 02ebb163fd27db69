// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Detector and action plugins plus the name -> instance factory the config
//! compiler uses. Plugin arguments arrive as string maps straight from the
//! config file; all parsing and validation happens in init so a bad config
//! fails at startup, not mid-remediation.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::cgroup_path::CgroupPath;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::Plugin;
use crate::engine::PluginArgs;

pub mod adjust_cgroup;
pub mod exists;
pub mod kill;
pub mod memory_above;
pub mod memory_reclaim;
pub mod nr_dying_descendants;
pub mod pressure_above;
pub mod pressure_rising_beyond;
pub mod senpai;
pub mod stop;
pub mod swap_free;

pub fn create(name: &str) -> Option<Box<dyn Plugin>> {
    match name {
        "pressure_above" => Some(Box::<pressure_above::PressureAbove>::default()),
        "pressure_rising_beyond" => {
            Some(Box::<pressure_rising_beyond::PressureRisingBeyond>::default())
        }
        "memory_above" => Some(Box::<memory_above::MemoryAbove>::default()),
        "memory_reclaim" => Some(Box::<memory_reclaim::MemoryReclaim>::default()),
        "swap_free" => Some(Box::<swap_free::SwapFree>::default()),
        "exists" => Some(Box::<exists::Exists>::default()),
        "nr_dying_descendants" => {
            Some(Box::<nr_dying_descendants::NrDyingDescendants>::default())
        }
        "stop" => Some(Box::<stop::Stop>::default()),
        "adjust_cgroup" => Some(Box::<adjust_cgroup::AdjustCgroup>::default()),
        "senpai" => Some(Box::<senpai::Senpai>::default()),
        "kill_by_memory_size_or_growth" => {
            Some(Box::new(kill::memory_growth::KillMemorySizeOrGrowth::new()))
        }
        "kill_by_swap_usage" => Some(Box::new(kill::swap_usage::KillSwapUsage::new())),
        "kill_by_pressure" => Some(Box::new(kill::pressure::KillPressure::new())),
        "kill_by_io_cost" => Some(Box::new(kill::io_cost::KillIoCost::new())),
        _ => None,
    }
}

/// Parses the comma-separated `cgroup` argument into paths rooted at the
/// configured cgroup fs (overridable per plugin via `cgroup_fs`, which the
/// tests lean on) and registers each pattern for sampling.
pub(crate) fn register_cgroup_patterns(
    resources: &mut MonitoredResources,
    args: &PluginArgs,
    construction: &ConstructionContext,
) -> Result<Vec<CgroupPath>> {
    let Some(cgroup) = args.get("cgroup") else {
        bail!("Argument=cgroup not present");
    };
    let cgroup_fs = args
        .get("cgroup_fs")
        .map(PathBuf::from)
        .unwrap_or_else(|| construction.cgroup_fs.clone());

    let mut patterns = Vec::new();
    for entry in cgroup.split(',').filter(|c| !c.is_empty()) {
        let path = CgroupPath::new(&cgroup_fs, entry);
        resources.insert(path.clone());
        patterns.push(path);
    }

    if patterns.is_empty() {
        bail!("Argument=cgroup is empty");
    }
    Ok(patterns)
}

pub(crate) fn parse_bool(args: &PluginArgs, key: &str) -> bool {
    matches!(
        args.get(key).map(String::as_str),
        Some("true") | Some("True") | Some("1")
    )
}

/// Required `duration`-style argument, in seconds.
pub(crate) fn required_duration(args: &PluginArgs, key: &str) -> Result<Duration> {
    let Some(value) = args.get(key) else {
        bail!("Argument={} not present", key);
    };
    let secs: u64 = value
        .parse()
        .with_context(|| format!("Argument={} is not a duration in seconds", key))?;
    Ok(Duration::from_secs(secs))
}

pub(crate) fn optional_f64(args: &PluginArgs, key: &str, default: f64) -> Result<f64> {
    match args.get(key) {
        Some(value) => value
            .parse()
            .with_context(|| format!("Argument={} is not a number", key)),
        None => Ok(default),
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum ResourceType {
    #[default]
    Memory,
    Io,
}

pub(crate) fn required_resource(args: &PluginArgs) -> Result<ResourceType> {
    match args.get("resource").map(String::as_str) {
        Some("memory") => Ok(ResourceType::Memory),
        Some("io") => Ok(ResourceType::Io),
        _ => bail!("Argument=resource missing or not (io|memory)"),
    }
}

/// A size threshold from config: `N%` (relative to some total the plugin
/// picks), `NM`/`NG` (binary mega/gigabytes), or a bare number scaled by
/// `bare_unit` bytes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Threshold {
    Absolute(i64),
    Percent(f64),
}

impl Default for Threshold {
    fn default() -> Self {
        Threshold::Absolute(0)
    }
}

impl Threshold {
    pub fn in_bytes(self, total: i64) -> i64 {
        match self {
            Threshold::Absolute(bytes) => bytes,
            Threshold::Percent(pct) => (total as f64 * pct / 100.0) as i64,
        }
    }
}

pub(crate) fn parse_threshold(value: &str, bare_unit: i64) -> Result<Threshold> {
    let value = value.trim();
    if let Some(pct) = value.strip_suffix('%') {
        let pct: f64 = pct
            .parse()
            .with_context(|| format!("bad percent threshold \"{}\"", value))?;
        return Ok(Threshold::Percent(pct));
    }

    let (digits, unit) = match value.strip_suffix(['M', 'G']) {
        Some(digits) if value.ends_with('M') => (digits, 1i64 << 20),
        Some(digits) => (digits, 1i64 << 30),
        None => (value, bare_unit),
    };
    let n: i64 = digits
        .parse()
        .with_context(|| format!("bad threshold \"{}\"", value))?;
    Ok(Threshold::Absolute(n * unit))
}
