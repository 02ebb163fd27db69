// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

/// A cgroup location: the cgroup filesystem mount point plus a path relative
/// to it, stored as components. An empty component list denotes the root
/// cgroup. The relative part may contain glob metacharacters; such paths are
/// only meaningful as patterns and must be expanded with
/// `cgroupfs::resolve_wildcard` before any control file is read.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CgroupPath {
    cgroup_fs: String,
    components: Vec<String>,
}

impl CgroupPath {
    pub fn new<P: AsRef<Path>>(cgroup_fs: P, relative: &str) -> Self {
        let mut fs = cgroup_fs.as_ref().to_string_lossy().into_owned();
        while fs.len() > 1 && fs.ends_with('/') {
            fs.pop();
        }

        CgroupPath {
            cgroup_fs: fs,
            components: relative
                .split('/')
                .filter(|c| !c.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    pub fn cgroup_fs(&self) -> &str {
        &self.cgroup_fs
    }

    /// The path relative to the cgroup fs mount; empty for the root cgroup.
    pub fn relative(&self) -> String {
        self.components.join("/")
    }

    pub fn absolute(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.cgroup_fs);
        for component in &self.components {
            path.push(component);
        }
        path
    }

    /// The leaf component; empty for the root cgroup.
    pub fn name(&self) -> &str {
        self.components.last().map(String::as_str).unwrap_or("")
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Strips one trailing component. Ascending from the root is a no-op.
    pub fn ascend(&mut self) {
        self.components.pop();
    }

    pub fn parent(&self) -> CgroupPath {
        let mut parent = self.clone();
        parent.ascend();
        parent
    }

    pub fn descend(&mut self, relative: &str) {
        self.components
            .extend(relative.split('/').filter(|c| !c.is_empty()).map(str::to_owned));
    }

    /// Rebuilds a `CgroupPath` from an absolute path known to live under
    /// `cgroup_fs` (e.g. one returned by wildcard resolution). None if the
    /// path is outside the mount.
    pub fn from_absolute<P: AsRef<Path>>(cgroup_fs: &str, absolute: P) -> Option<Self> {
        let relative = absolute.as_ref().strip_prefix(cgroup_fs).ok()?;
        Some(CgroupPath::new(cgroup_fs, &relative.to_string_lossy()))
    }
}

impl fmt::Display for CgroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.absolute().display())
    }
}
