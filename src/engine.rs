// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Rule evaluation. A ruleset is a set of detector groups (AND within a
//! group, OR across groups) guarding an ordered action chain. The engine
//! runs every ruleset once per tick.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;

use log::debug;
use log::info;
use log::warn;

use crate::cgroup_path::CgroupPath;
use crate::context::ActionContext;
use crate::context::OomdContext;

/// Cgroup glob patterns the main loop must resolve and sample every tick;
/// plugins register theirs during init.
pub type MonitoredResources = HashSet<CgroupPath>;

pub type PluginArgs = HashMap<String, String>;

/// Ambient configuration handed to every plugin's init.
#[derive(Clone, Debug)]
pub struct ConstructionContext {
    /// Cgroup filesystem mount point, usually /sys/fs/cgroup.
    pub cgroup_fs: PathBuf,
    /// Daemon-wide dry-run: no kill plugin may signal anything.
    pub dry: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PluginRet {
    /// Detector: matched. Action: completed, run the next one.
    Continue,
    /// Detector: not matched. Action: terminate the chain.
    Stop,
    /// Action only: mid-operation; hold this position in the chain and
    /// resume here next tick without re-running detectors.
    AsyncPaused,
}

pub trait Plugin {
    fn name(&self) -> &'static str;

    fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> anyhow::Result<()>;

    fn run(&mut self, ctx: &mut OomdContext) -> PluginRet;
}

pub struct DetectorGroup {
    name: String,
    detectors: Vec<Box<dyn Plugin>>,
}

impl DetectorGroup {
    pub fn new(name: String, detectors: Vec<Box<dyn Plugin>>) -> Self {
        DetectorGroup { name, detectors }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff every detector matches.
    fn check(&mut self, ctx: &mut OomdContext) -> bool {
        for detector in &mut self.detectors {
            match detector.run(ctx) {
                PluginRet::Continue => continue,
                PluginRet::Stop => {
                    debug!(
                        "detector={} returned STOP, abandoning group={}",
                        detector.name(),
                        self.name
                    );
                    return false;
                }
                PluginRet::AsyncPaused => {
                    warn!(
                        "detector={} returned ASYNC_PAUSED; treating as STOP",
                        detector.name()
                    );
                    return false;
                }
            }
        }
        true
    }
}

pub struct Ruleset {
    name: String,
    detector_groups: Vec<DetectorGroup>,
    actions: Vec<Box<dyn Plugin>>,
    /// Action index (plus firing group name) where a prior tick parked with
    /// ASYNC_PAUSED.
    paused: Option<(usize, String)>,
}

impl Ruleset {
    pub fn new(
        name: String,
        detector_groups: Vec<DetectorGroup>,
        actions: Vec<Box<dyn Plugin>>,
    ) -> Self {
        Ruleset {
            name,
            detector_groups,
            actions,
            paused: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn run_once(&mut self, ctx: &mut OomdContext) {
        let start = match self.paused.take() {
            Some((index, group)) => {
                debug!(
                    "ruleset={} resuming paused action chain at index={}",
                    self.name, index
                );
                ctx.set_action_context(ActionContext {
                    ruleset: self.name.clone(),
                    detector_group: group,
                });
                index
            }
            None => {
                let mut fired = None;
                for group in &mut self.detector_groups {
                    if group.check(ctx) {
                        fired = Some(group.name().to_owned());
                        break;
                    }
                }
                let Some(group_name) = fired else {
                    return;
                };
                info!(
                    "detector group={} fired for ruleset={}, running action chain",
                    group_name, self.name
                );
                ctx.set_action_context(ActionContext {
                    ruleset: self.name.clone(),
                    detector_group: group_name,
                });
                0
            }
        };

        for index in start..self.actions.len() {
            let action = &mut self.actions[index];
            match action.run(ctx) {
                PluginRet::Continue => continue,
                PluginRet::Stop => {
                    debug!("action={} returned STOP, terminating chain", action.name());
                    break;
                }
                PluginRet::AsyncPaused => {
                    debug!("action={} returned ASYNC_PAUSED, holding chain", action.name());
                    self.paused = Some((index, ctx.action_context().detector_group.clone()));
                    return;
                }
            }
        }
    }
}

pub struct Engine {
    resources: MonitoredResources,
    rulesets: Vec<Ruleset>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("rulesets", &self.rulesets.len())
            .finish()
    }
}

impl Engine {
    pub fn new(resources: MonitoredResources, rulesets: Vec<Ruleset>) -> Self {
        Engine {
            resources,
            rulesets,
        }
    }

    pub fn monitored_resources(&self) -> &MonitoredResources {
        &self.resources
    }

    pub fn run_once(&mut self, ctx: &mut OomdContext) {
        for ruleset in &mut self.rulesets {
            ruleset.run_once(ctx);
        }
    }
}
