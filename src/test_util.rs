// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Test fixture that materializes a fake cgroup-v2 tree under a tempdir so
//! the control-file readers and the sampling loop can be exercised without a
//! real kernel.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::cgroup_path::CgroupPath;
use crate::cgroupfs;

pub struct FakeCgroupTree {
    root: TempDir,
}

impl FakeCgroupTree {
    pub fn new() -> Self {
        FakeCgroupTree {
            root: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn cgroup(&self, relative: &str) -> CgroupPath {
        CgroupPath::new(self.root(), relative)
    }

    pub fn add_cgroup(&self, relative: &str) {
        fs::create_dir_all(self.root().join(relative)).unwrap();
    }

    pub fn add_cgroup_file(&self, relative: &str, file: &str, contents: &str) {
        self.add_cgroup(relative);
        fs::write(self.root().join(relative).join(file), contents).unwrap();
    }

    /// A loose fixture file (meminfo, vmstat, ...) at `relative` under the
    /// tree root; returns its absolute path.
    pub fn add_file(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    /// A meminfo fixture; values in kB, as the kernel reports them.
    pub fn add_meminfo(&self, relative: &str, entries: &[(&str, i64)]) -> PathBuf {
        let contents: String = entries
            .iter()
            .map(|(name, kb)| format!("{}:       {} kB\n", name, kb))
            .collect();
        self.add_file(relative, &contents)
    }

    pub fn psi_line(kind: &str, avg10: f64, avg60: f64, avg300: f64, total: u64) -> String {
        format!(
            "{} avg10={:.2} avg60={:.2} avg300={:.2} total={}\n",
            kind, avg10, avg60, avg300, total
        )
    }

    pub fn add_pressure(&self, relative: &str, file: &str, some_avg: f64, total: u64) {
        let contents = format!(
            "{}{}",
            Self::psi_line("some", some_avg, some_avg, some_avg, total),
            Self::psi_line("full", some_avg, some_avg, some_avg, total),
        );
        self.add_cgroup_file(relative, file, &contents);
    }

    /// Populates the full control file set the sampler reads for one leaf
    /// cgroup. Callers overwrite individual files afterwards when a test
    /// needs something other than the defaults.
    pub fn add_leaf(&self, relative: &str, mem_current: i64) {
        self.add_cgroup_file(
            relative,
            cgroupfs::MEM_CURRENT_FILE,
            &format!("{}\n", mem_current),
        );
        self.add_pressure(relative, cgroupfs::MEM_PRESSURE_FILE, 0.0, 0);
        self.add_pressure(relative, cgroupfs::IO_PRESSURE_FILE, 0.0, 0);
        self.add_cgroup_file(relative, cgroupfs::MEM_LOW_FILE, "0\n");
        self.add_cgroup_file(relative, cgroupfs::MEM_MIN_FILE, "0\n");
        self.add_cgroup_file(relative, cgroupfs::MEM_HIGH_FILE, "max\n");
        self.add_cgroup_file(relative, cgroupfs::MEM_MAX_FILE, "max\n");
        self.add_cgroup_file(relative, cgroupfs::MEM_SWAP_CURRENT_FILE, "0\n");
        self.add_cgroup_file(
            relative,
            cgroupfs::MEM_STAT_FILE,
            "anon 0\nfile 0\nshmem 0\npgscan 0\n",
        );
        self.add_cgroup_file(relative, cgroupfs::CGROUP_STAT_FILE, "nr_dying_descendants 0\n");
        self.add_cgroup_file(
            relative,
            cgroupfs::IO_STAT_FILE,
            "8:0 rbytes=0 wbytes=0 rios=0 wios=0 dbytes=0 dios=0\n",
        );
        self.add_cgroup_file(relative, cgroupfs::PROCS_FILE, "");

        // The sampler asserts the memory controller on the parent; write the
        // controllers file there and at the tree root.
        let parent = self.cgroup(relative).parent().relative();
        self.add_cgroup_file(&parent, cgroupfs::CONTROLLERS_FILE, "cpu io memory pids\n");
        self.add_cgroup_file("", cgroupfs::CONTROLLERS_FILE, "cpu io memory pids\n");
    }
}
