// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared kill mechanics. The four kill_by_* plugins differ only in how they
//! order candidates and which candidates they admit; everything else (scope
//! filtering, xattr bookkeeping, the SIGKILL sweep, the post-kill cooldown)
//! lives here. Kernel side effects go through `KillBackend` so tests swap in
//! a map-backed fake.

use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context as AnyhowContext;
use anyhow::Result;
use log::info;
use log::warn;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use rand::Rng;

use crate::cgroup_path::CgroupPath;
use crate::cgroupfs;
use crate::context::ActionContext;
use crate::context::CgroupContext;
use crate::context::OomdContext;
use crate::engine::ConstructionContext;
use crate::engine::MonitoredResources;
use crate::engine::PluginArgs;
use crate::engine::PluginRet;
use crate::plugins::parse_bool;
use crate::plugins::register_cgroup_patterns;

pub mod io_cost;
pub mod memory_growth;
pub mod pressure;
pub mod swap_usage;

/// Kill count per invocation, incremented by one per kill decision.
pub const OOMS_XATTR: &str = "trusted.oomd_ooms";
/// Cumulative processes killed across invocations.
pub const KILL_XATTR: &str = "trusted.oomd_kill";
/// UUID of the most recent kill, for correlating with logs.
pub const KILL_UUID_XATTR: &str = "trusted.oomd_kill_uuid";

const DEFAULT_POST_ACTION_DELAY: Duration = Duration::from_secs(15);

/// Victims can fork while being killed; sweep cgroup.procs repeatedly until
/// the kill count stops moving.
const MAX_KILL_SWEEPS: u32 = 10;

/// Kernel side effects of a kill, injectable for tests.
pub trait KillBackend {
    fn list_pids(&self, cgroup: &Path, recursive: bool) -> Vec<i32>;
    /// Returns true if the signal was delivered.
    fn kill_pid(&mut self, pid: i32) -> bool;
    fn get_xattr(&self, path: &Path, attr: &str) -> Option<String>;
    fn set_xattr(&mut self, path: &Path, attr: &str, value: &str) -> bool;
}

pub struct SystemKillBackend;

impl KillBackend for SystemKillBackend {
    fn list_pids(&self, cgroup: &Path, recursive: bool) -> Vec<i32> {
        cgroupfs::get_pids(cgroup, recursive)
    }

    fn kill_pid(&mut self, pid: i32) -> bool {
        kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok()
    }

    fn get_xattr(&self, path: &Path, attr: &str) -> Option<String> {
        cgroupfs::get_xattr(path, attr)
    }

    fn set_xattr(&mut self, path: &Path, attr: &str, value: &str) -> bool {
        cgroupfs::set_xattr(path, attr, value)
    }
}

/// Map-backed fake: records kills and xattrs instead of touching the kernel.
#[cfg(test)]
pub struct FakeKillBackend {
    pub pids: std::collections::HashMap<std::path::PathBuf, Vec<i32>>,
    pub killed: std::rc::Rc<std::cell::RefCell<Vec<i32>>>,
    pub xattrs: std::rc::Rc<
        std::cell::RefCell<std::collections::HashMap<(std::path::PathBuf, String), String>>,
    >,
}

#[cfg(test)]
impl KillBackend for FakeKillBackend {
    fn list_pids(&self, cgroup: &Path, _recursive: bool) -> Vec<i32> {
        let known = self.pids.get(cgroup).cloned().unwrap_or_default();
        let killed = self.killed.borrow();
        known.into_iter().filter(|p| !killed.contains(p)).collect()
    }

    fn kill_pid(&mut self, pid: i32) -> bool {
        self.killed.borrow_mut().push(pid);
        true
    }

    fn get_xattr(&self, path: &Path, attr: &str) -> Option<String> {
        self.xattrs
            .borrow()
            .get(&(path.to_owned(), attr.to_owned()))
            .cloned()
    }

    fn set_xattr(&mut self, path: &Path, attr: &str, value: &str) -> bool {
        self.xattrs
            .borrow_mut()
            .insert((path.to_owned(), attr.to_owned()), value.to_owned());
        true
    }
}

/// Shared state and flow for kill plugins.
pub struct KillMechanics {
    cgroups: Vec<CgroupPath>,
    post_action_delay: Duration,
    dry: bool,
    recursive: bool,
    cooldown_until: Option<Instant>,
    backend: Box<dyn KillBackend>,
}

impl KillMechanics {
    pub fn new() -> Self {
        KillMechanics {
            cgroups: Vec::new(),
            post_action_delay: DEFAULT_POST_ACTION_DELAY,
            dry: false,
            recursive: true,
            cooldown_until: None,
            backend: Box::new(SystemKillBackend),
        }
    }

    #[cfg(test)]
    pub fn set_backend(&mut self, backend: Box<dyn KillBackend>) {
        self.backend = backend;
    }

    pub fn init(
        &mut self,
        resources: &mut MonitoredResources,
        args: &PluginArgs,
        construction: &ConstructionContext,
    ) -> Result<()> {
        self.cgroups = register_cgroup_patterns(resources, args, construction)?;

        if let Some(delay) = args.get("post_action_delay") {
            let secs: u64 = delay
                .parse()
                .context("Argument=post_action_delay must be a non-negative number of seconds")?;
            self.post_action_delay = Duration::from_secs(secs);
        }

        self.dry = parse_bool(args, "dry") || construction.dry;
        if args.contains_key("recursive") {
            self.recursive = parse_bool(args, "recursive");
        }
        Ok(())
    }

    pub fn cgroups(&self) -> &[CgroupPath] {
        &self.cgroups
    }

    /// During the post-kill cooldown the plugin abstains entirely: it keeps
    /// the engine parked on itself via ASYNC_PAUSED and resolves to STOP once
    /// the victim has had its time to exit.
    pub fn check_cooldown(&mut self, now: Instant) -> Option<PluginRet> {
        match self.cooldown_until {
            Some(until) if now < until => Some(PluginRet::AsyncPaused),
            Some(_) => {
                self.cooldown_until = None;
                Some(PluginRet::Stop)
            }
            None => None,
        }
    }

    /// The return value for a tick on which something was killed.
    pub fn after_kill(&mut self, now: Instant) -> PluginRet {
        if self.post_action_delay.is_zero() {
            PluginRet::Stop
        } else {
            self.cooldown_until = Some(now + self.post_action_delay);
            PluginRet::AsyncPaused
        }
    }

    /// All context entries sorted descending by `key`, then restricted to
    /// this plugin's configured subtrees. Sorting before filtering keeps the
    /// tie-break order identical across kill plugins sharing a context.
    pub fn sorted_candidates<F>(
        &self,
        ctx: &OomdContext,
        key: F,
    ) -> Vec<(CgroupPath, CgroupContext)>
    where
        F: Fn(&CgroupContext) -> f64,
    {
        let mut candidates = ctx.reverse_sort(key);
        OomdContext::remove_sibling_cgroups(&self.cgroups, &mut candidates);
        OomdContext::dump_candidates(&candidates);
        candidates
    }

    /// Stamps the audit xattrs and sweeps SIGKILL through the victim's
    /// cgroup.procs. Returns true when the victim counts as handled, which
    /// ends the candidate walk; a victim with no processes left is already
    /// handled, not a reason to pick someone else.
    pub fn try_kill_cgroup(
        &mut self,
        killer: &'static str,
        path: &CgroupPath,
        cgroup_ctx: &CgroupContext,
        action: &ActionContext,
    ) -> bool {
        let absolute = path.absolute();

        if !self.dry && self.backend.list_pids(&absolute, self.recursive).is_empty() {
            info!("No processes to kill in {}", path.relative());
            return true;
        }

        let uuid = new_kill_uuid();
        // Bookkeeping first: the kill attempt is recorded whether or not any
        // process dies. Xattr failures are logged but never block the kill.
        self.bump_xattr(&absolute, OOMS_XATTR, 1);
        if !self.backend.set_xattr(&absolute, KILL_UUID_XATTR, &uuid) {
            warn!("Unable to set {} on {}", KILL_UUID_XATTR, absolute.display());
        }

        let killed = if self.dry {
            info!("In dry-run mode; would have tried to kill {}", path.relative());
            0
        } else {
            let killed = self.sweep_kill(&absolute);
            self.bump_xattr(&absolute, KILL_XATTR, killed);
            killed
        };

        let succeeded = self.dry || killed > 0;
        if succeeded {
            info!(
                "{:.2} {:.2} {:.2} {} {} killer:{}{} ruleset=\"{}\" detectorgroup=\"{}\" uuid={}",
                cgroup_ctx.pressure.avg10,
                cgroup_ctx.pressure.avg60,
                cgroup_ctx.pressure.avg300,
                path.relative(),
                cgroup_ctx.current_usage,
                if self.dry { "(dry)" } else { "" },
                killer,
                action.ruleset,
                action.detector_group,
                uuid,
            );
        }
        succeeded
    }

    fn sweep_kill(&mut self, cgroup: &Path) -> i64 {
        let mut killed = std::collections::HashSet::new();

        for _ in 0..MAX_KILL_SWEEPS {
            let fresh: Vec<i32> = self
                .backend
                .list_pids(cgroup, self.recursive)
                .into_iter()
                .filter(|pid| !killed.contains(pid))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for pid in fresh {
                if self.backend.kill_pid(pid) {
                    info!("Killed pid {}", pid);
                    killed.insert(pid);
                } else {
                    warn!("Failed to kill pid {}", pid);
                }
            }
        }

        killed.len() as i64
    }

    fn bump_xattr(&mut self, path: &Path, attr: &str, delta: i64) {
        let previous = self
            .backend
            .get_xattr(path, attr)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let value = (previous + delta).to_string();
        if !self.backend.set_xattr(path, attr, &value) {
            warn!("Unable to set {}={} on {}", attr, value, path.display());
        }
    }
}

impl Default for KillMechanics {
    fn default() -> Self {
        Self::new()
    }
}

/// RFC 4122 version-4 UUID, rendered as the canonical 36-char string.
fn new_kill_uuid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex = |range: std::ops::Range<usize>| -> String {
        bytes[range].iter().map(|b| format!("{:02x}", b)).collect()
    };
    format!(
        "{}-{}-{}-{}-{}",
        hex(0..4),
        hex(4..6),
        hex(6..8),
        hex(8..10),
        hex(10..16)
    )
}

#[cfg(test)]
pub(crate) mod tests_support {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::rc::Rc;

    use super::*;

    /// Handles to observe a `FakeKillBackend` after it has been moved into a
    /// plugin.
    pub struct KillObserver {
        pub killed: Rc<RefCell<Vec<i32>>>,
        pub xattrs: Rc<RefCell<HashMap<(PathBuf, String), String>>>,
    }

    impl KillObserver {
        pub fn killed(&self) -> Vec<i32> {
            self.killed.borrow().clone()
        }

        pub fn xattr(&self, path: &Path, attr: &str) -> Option<String> {
            self.xattrs
                .borrow()
                .get(&(path.to_owned(), attr.to_owned()))
                .cloned()
        }
    }

    pub fn fake_backend(pids: &[(&Path, &[i32])]) -> (FakeKillBackend, KillObserver) {
        let killed = Rc::new(RefCell::new(Vec::new()));
        let xattrs = Rc::new(RefCell::new(HashMap::new()));
        let backend = FakeKillBackend {
            pids: pids
                .iter()
                .map(|(path, pids)| (path.to_path_buf(), pids.to_vec()))
                .collect(),
            killed: Rc::clone(&killed),
            xattrs: Rc::clone(&xattrs),
        };
        (backend, KillObserver { killed, xattrs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_kill_uuid_shape() {
        let uuid = new_kill_uuid();
        assert_eq!(uuid.len(), 36);
        let groups: Vec<&str> = uuid.split('-').collect();
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        // Version and variant nibbles.
        assert!(groups[2].starts_with('4'));
        assert!(matches!(
            groups[3].chars().next(),
            Some('8') | Some('9') | Some('a') | Some('b')
        ));

        assert_ne!(new_kill_uuid(), new_kill_uuid());
    }

    #[test]
    fn test_cooldown_lifecycle() {
        let mut mechanics = KillMechanics::new();
        mechanics.post_action_delay = Duration::from_secs(10);

        let t0 = Instant::now();
        assert_eq!(mechanics.check_cooldown(t0), None);

        assert_eq!(mechanics.after_kill(t0), PluginRet::AsyncPaused);
        assert_eq!(
            mechanics.check_cooldown(t0 + Duration::from_secs(5)),
            Some(PluginRet::AsyncPaused)
        );
        // Cooldown expires: one STOP, then back to normal.
        assert_eq!(
            mechanics.check_cooldown(t0 + Duration::from_secs(10)),
            Some(PluginRet::Stop)
        );
        assert_eq!(mechanics.check_cooldown(t0 + Duration::from_secs(11)), None);
    }

    #[test]
    fn test_zero_delay_is_plain_stop() {
        let mut mechanics = KillMechanics::new();
        mechanics.post_action_delay = Duration::ZERO;

        let t0 = Instant::now();
        assert_eq!(mechanics.after_kill(t0), PluginRet::Stop);
        assert_eq!(mechanics.check_cooldown(t0 + Duration::from_secs(1)), None);
    }
}
