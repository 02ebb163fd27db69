// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed accessors for the cgroup-v2 control files and the /proc files the
//! daemon samples. Every reader returns `Error::BadControlFile` on a missing
//! or malformed file; callers decide which files are optional and downgrade
//! accordingly.

use std::collections::HashMap;
use std::collections::HashSet;
use std::ffi::CString;
use std::fs;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use glob::Pattern;
use thiserror::Error;

use crate::cgroup_path::CgroupPath;

pub const CONTROLLERS_FILE: &str = "cgroup.controllers";
pub const PROCS_FILE: &str = "cgroup.procs";
pub const CGROUP_STAT_FILE: &str = "cgroup.stat";
pub const MEM_CURRENT_FILE: &str = "memory.current";
pub const MEM_PRESSURE_FILE: &str = "memory.pressure";
pub const MEM_LOW_FILE: &str = "memory.low";
pub const MEM_MIN_FILE: &str = "memory.min";
pub const MEM_HIGH_FILE: &str = "memory.high";
pub const MEM_HIGH_TMP_FILE: &str = "memory.high.tmp";
pub const MEM_MAX_FILE: &str = "memory.max";
pub const MEM_STAT_FILE: &str = "memory.stat";
pub const MEM_SWAP_CURRENT_FILE: &str = "memory.swap.current";
pub const IO_PRESSURE_FILE: &str = "io.pressure";
pub const IO_STAT_FILE: &str = "io.stat";

const PROC_MEM_PRESSURE: &str = "/proc/pressure/memory";
const PROC_MEM_PRESSURE_LEGACY: &str = "/proc/mempressure";
const PROC_IO_PRESSURE: &str = "/proc/pressure/io";
pub const PROC_MEMINFO: &str = "/proc/meminfo";
pub const PROC_VMSTAT: &str = "/proc/vmstat";

#[derive(Debug, Error)]
pub enum Error {
    #[error("{}: {reason}", .path.display())]
    BadControlFile { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

fn bad(path: &Path, reason: impl ToString) -> Error {
    Error::BadControlFile {
        path: path.to_owned(),
        reason: reason.to_string(),
    }
}

/// PSI averages for one resource. NaN averages mean the kernel does not
/// expose the file (e.g. io.pressure on old kernels); `total` is absent under
/// the experimental PSI format.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourcePressure {
    pub avg10: f32,
    pub avg60: f32,
    pub avg300: f32,
    pub total: Option<Duration>,
}

impl ResourcePressure {
    pub fn unavailable() -> Self {
        ResourcePressure {
            avg10: f32::NAN,
            avg60: f32::NAN,
            avg300: f32::NAN,
            total: None,
        }
    }

    /// Largest of the three windows. NaN entries are ignored; all-NaN
    /// (unavailable pressure) yields NaN.
    pub fn max_avg(&self) -> f32 {
        [self.avg10, self.avg60, self.avg300]
            .into_iter()
            .fold(f32::NAN, f32::max)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PressureKind {
    Some,
    Full,
}

impl PressureKind {
    fn token(self) -> &'static str {
        match self {
            PressureKind::Some => "some",
            PressureKind::Full => "full",
        }
    }

    fn line_index(self) -> usize {
        match self {
            PressureKind::Some => 0,
            PressureKind::Full => 1,
        }
    }
}

/// One line of io.stat.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceIoStat {
    pub dev_id: String,
    pub rbytes: i64,
    pub wbytes: i64,
    pub rios: i64,
    pub wios: i64,
    pub dbytes: i64,
    pub dios: i64,
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| bad(path, e))?;
    BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<String>>>()
        .map_err(|e| bad(path, e))
}

fn parse_i64(path: &Path, token: &str) -> Result<i64> {
    token.parse::<i64>().map_err(|e| bad(path, e))
}

fn parse_f32(path: &Path, token: &str) -> Result<f32> {
    token.parse::<f32>().map_err(|e| bad(path, e))
}

/// Splits an `avg10=0.22` style token and checks the key.
fn parse_kv(path: &Path, token: &str, key: &str) -> Result<String> {
    match token.split_once('=') {
        Some((k, v)) if k == key => Ok(v.to_owned()),
        _ => Err(bad(path, format!("expected {}=<value>, got \"{}\"", key, token))),
    }
}

fn read_psi_file(path: &Path, kind: PressureKind) -> Result<ResourcePressure> {
    let lines = read_lines(path)?;
    let first_token = lines
        .first()
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or("");

    // Sniff the PSI flavor off the first token. Upstream v4.20+:
    //   some avg10=0.22 avg60=0.17 avg300=1.11 total=58761459
    //   full avg10=0.22 avg60=0.16 avg300=1.08 total=58464525
    // Old experimental patch set:
    //   aggr 316016073
    //   some 0.00 0.03 0.05
    //   full 0.00 0.03 0.05
    if first_token == "some" && lines.len() >= 2 {
        let tokens: Vec<&str> = lines[kind.line_index()].split_whitespace().collect();
        if tokens.len() < 5 || tokens[0] != kind.token() {
            return Err(bad(path, "invalid format"));
        }
        let avg10 = parse_f32(path, &parse_kv(path, tokens[1], "avg10")?)?;
        let avg60 = parse_f32(path, &parse_kv(path, tokens[2], "avg60")?)?;
        let avg300 = parse_f32(path, &parse_kv(path, tokens[3], "avg300")?)?;
        let total = parse_i64(path, &parse_kv(path, tokens[4], "total")?)?;
        Ok(ResourcePressure {
            avg10,
            avg60,
            avg300,
            total: Some(Duration::from_micros(total as u64)),
        })
    } else if first_token == "aggr" && lines.len() >= 3 {
        let tokens: Vec<&str> = lines[kind.line_index() + 1].split_whitespace().collect();
        if tokens.len() < 4 || tokens[0] != kind.token() {
            return Err(bad(path, "invalid format"));
        }
        Ok(ResourcePressure {
            avg10: parse_f32(path, tokens[1])?,
            avg60: parse_f32(path, tokens[2])?,
            avg300: parse_f32(path, tokens[3])?,
            total: None,
        })
    } else {
        Err(bad(path, "unrecognized pressure format"))
    }
}

/// Memory PSI of a cgroup; the root cgroup reads the system-wide file, with a
/// fallback for kernels that predate /proc/pressure.
pub fn read_mem_pressure(cgroup: &CgroupPath, kind: PressureKind) -> Result<ResourcePressure> {
    if cgroup.is_root() {
        read_psi_file(Path::new(PROC_MEM_PRESSURE), kind)
            .or_else(|_| read_psi_file(Path::new(PROC_MEM_PRESSURE_LEGACY), kind))
    } else {
        read_psi_file(&cgroup.absolute().join(MEM_PRESSURE_FILE), kind)
    }
}

pub fn read_io_pressure(cgroup: &CgroupPath, kind: PressureKind) -> Result<ResourcePressure> {
    if cgroup.is_root() {
        read_psi_file(Path::new(PROC_IO_PRESSURE), kind)
    } else {
        read_psi_file(&cgroup.absolute().join(IO_PRESSURE_FILE), kind)
    }
}

fn read_single_line(path: &Path) -> Result<String> {
    let lines = read_lines(path)?;
    if lines.len() != 1 {
        return Err(bad(path, "expected exactly one line"));
    }
    Ok(lines.into_iter().next().unwrap_or_default())
}

/// Parses a memory.{low,min,high,max} style value; the literal `max` is the
/// no-limit sentinel.
fn parse_mem_value(path: &Path, token: &str) -> Result<i64> {
    if token == "max" {
        Ok(i64::MAX)
    } else {
        parse_i64(path, token)
    }
}

fn read_mem_file(cgroup: &CgroupPath, file: &str) -> Result<i64> {
    let path = cgroup.absolute().join(file);
    let line = read_single_line(&path)?;
    parse_mem_value(&path, line.trim())
}

/// Resident bytes. The root cgroup has no memory.current; it is derived from
/// /proc/meminfo instead.
pub fn read_mem_current(cgroup: &CgroupPath) -> Result<i64> {
    if cgroup.is_root() {
        let meminfo = get_meminfo(Path::new(PROC_MEMINFO))?;
        let total = meminfo.get("MemTotal").copied().unwrap_or(0);
        let free = meminfo.get("MemFree").copied().unwrap_or(0);
        Ok(total - free)
    } else {
        let path = cgroup.absolute().join(MEM_CURRENT_FILE);
        let line = read_single_line(&path)?;
        parse_i64(&path, line.trim())
    }
}

pub fn read_mem_low(cgroup: &CgroupPath) -> Result<i64> {
    read_mem_file(cgroup, MEM_LOW_FILE)
}

pub fn read_mem_min(cgroup: &CgroupPath) -> Result<i64> {
    read_mem_file(cgroup, MEM_MIN_FILE)
}

pub fn read_mem_high(cgroup: &CgroupPath) -> Result<i64> {
    read_mem_file(cgroup, MEM_HIGH_FILE)
}

pub fn read_mem_max(cgroup: &CgroupPath) -> Result<i64> {
    read_mem_file(cgroup, MEM_MAX_FILE)
}

/// memory.high.tmp holds `<value|max> <remaining duration>`; only the value
/// matters to us.
pub fn read_mem_high_tmp(cgroup: &CgroupPath) -> Result<i64> {
    let path = cgroup.absolute().join(MEM_HIGH_TMP_FILE);
    let line = read_single_line(&path)?;
    let mut tokens = line.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(value), Some(_duration)) => parse_mem_value(&path, value),
        _ => Err(bad(&path, "invalid format")),
    }
}

pub fn write_mem_high(cgroup: &CgroupPath, value: i64) -> Result<()> {
    let path = cgroup.absolute().join(MEM_HIGH_FILE);
    fs::write(&path, value.to_string()).map_err(|e| bad(&path, e))
}

pub fn write_mem_high_tmp(cgroup: &CgroupPath, value: i64, duration: Duration) -> Result<()> {
    let path = cgroup.absolute().join(MEM_HIGH_TMP_FILE);
    fs::write(&path, format!("{} {}", value, duration.as_micros())).map_err(|e| bad(&path, e))
}

/// Swap accounting can be compiled out (CONFIG_MEMCG_SWAP=n); a missing file
/// reads as zero rather than an error.
pub fn read_swap_current(cgroup: &CgroupPath) -> Result<i64> {
    let path = cgroup.absolute().join(MEM_SWAP_CURRENT_FILE);
    match read_lines(&path) {
        Ok(lines) if lines.len() == 1 => parse_i64(&path, lines[0].trim()),
        _ => Ok(0),
    }
}

/// Label -> bytes from /proc/meminfo. The kernel reports kB; values are
/// scaled to bytes here so no caller ever sees kB.
pub fn get_meminfo(path: &Path) -> Result<HashMap<String, i64>> {
    let mut map = HashMap::new();
    for line in read_lines(path)? {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if let Some(token) = rest.split_whitespace().next() {
            if let Ok(value) = token.parse::<i64>() {
                map.insert(name.to_owned(), value * 1024);
            }
        }
    }
    Ok(map)
}

/// Label -> value for `<name> <value>` line formats (/proc/vmstat,
/// memory.stat, cgroup.stat).
fn get_stat_like(path: &Path) -> Result<HashMap<String, i64>> {
    let mut map = HashMap::new();
    for line in read_lines(path)? {
        let mut tokens = line.split_whitespace();
        if let (Some(name), Some(value)) = (tokens.next(), tokens.next()) {
            if let Ok(value) = value.parse::<i64>() {
                map.insert(name.to_owned(), value);
            }
        }
    }
    Ok(map)
}

pub fn get_vmstat(path: &Path) -> Result<HashMap<String, i64>> {
    get_stat_like(path)
}

pub fn get_memstat(cgroup: &CgroupPath) -> Result<HashMap<String, i64>> {
    get_stat_like(&cgroup.absolute().join(MEM_STAT_FILE))
}

/// nr_dying_descendants from cgroup.stat; zero when the file or the entry is
/// absent (pre-4.14 kernels).
pub fn nr_dying_descendants(cgroup: &CgroupPath) -> i64 {
    get_stat_like(&cgroup.absolute().join(CGROUP_STAT_FILE))
        .map(|stat| stat.get("nr_dying_descendants").copied().unwrap_or(0))
        .unwrap_or(0)
}

pub fn read_io_stat(cgroup: &CgroupPath) -> Result<Vec<DeviceIoStat>> {
    let path = cgroup.absolute().join(IO_STAT_FILE);
    let mut stats = Vec::new();
    for line in read_lines(&path)? {
        // 8:16 rbytes=1459200 wbytes=314773504 rios=192 wios=353 dbytes=0 dios=0
        let mut tokens = line.split_whitespace();
        let Some(dev_id) = tokens.next() else {
            continue;
        };
        let mut stat = DeviceIoStat {
            dev_id: dev_id.to_owned(),
            ..Default::default()
        };
        for token in tokens {
            let Some((key, value)) = token.split_once('=') else {
                return Err(bad(&path, "invalid format"));
            };
            let value = parse_i64(&path, value)?;
            match key {
                "rbytes" => stat.rbytes = value,
                "wbytes" => stat.wbytes = value,
                "rios" => stat.rios = value,
                "wios" => stat.wios = value,
                "dbytes" => stat.dbytes = value,
                "dios" => stat.dios = value,
                _ => (),
            }
        }
        stats.push(stat);
    }
    Ok(stats)
}

pub fn read_controllers(cgroup: &CgroupPath) -> Result<Vec<String>> {
    let path = cgroup.absolute().join(CONTROLLERS_FILE);
    let line = read_single_line(&path)?;
    Ok(line.split_whitespace().map(str::to_owned).collect())
}

/// Pids from cgroup.procs, optionally walking child cgroups too. Cgroups can
/// vanish while we walk; missing files and directories read as empty.
pub fn get_pids(path: &Path, recursive: bool) -> Vec<i32> {
    let mut pids = Vec::new();
    if let Ok(lines) = read_lines(&path.join(PROCS_FILE)) {
        pids.extend(lines.iter().filter_map(|l| l.trim().parse::<i32>().ok()));
    }

    if recursive {
        for child in list_dir(path, DirEntFilter::Directory) {
            pids.extend(get_pids(&path.join(child), true));
        }
    }

    pids
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DirEntFilter {
    Directory,
    File,
    Both,
}

/// Names of entries in `path`, with dotfiles excluded. `DirEntry::file_type`
/// uses the d_type returned by kernfs and only falls back to lstat when the
/// filesystem does not fill it in, which keeps enumeration of large cgroup
/// trees cheap.
pub fn list_dir(path: &Path, filter: DirEntFilter) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(entries) = fs::read_dir(path) else {
        return names;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.as_bytes().first() == Some(&b'.') {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let wanted = match filter {
            DirEntFilter::Directory => file_type.is_dir(),
            DirEntFilter::File => file_type.is_file(),
            DirEntFilter::Both => file_type.is_dir() || file_type.is_file(),
        };
        if wanted {
            names.push(name.to_string_lossy().into_owned());
        }
    }

    names
}

pub fn is_dir(path: &Path) -> bool {
    path.is_dir()
}

/// Whether a path segment could mean something to glob matching. May return
/// false positives; never false negatives.
pub fn has_glob(segment: &str) -> bool {
    segment.contains(['*', '?', '['])
}

/// Expands glob metacharacters in the relative part of `cgroup` against the
/// live filesystem, returning absolute paths.
///
/// The expansion is a DFS over the path segments. Segments without
/// metacharacters are descended directly instead of enumerated, so a pattern
/// like `system.slice/*` never readdirs the (potentially huge) siblings of
/// `system.slice`. Any prefix that is not a directory terminates that branch.
pub fn resolve_wildcard(cgroup: &CgroupPath) -> HashSet<PathBuf> {
    let mut resolved = HashSet::new();
    let segments: Vec<String> = cgroup
        .relative()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();

    if segments.is_empty() {
        let root = PathBuf::from(cgroup.cgroup_fs());
        if is_dir(&root) {
            resolved.insert(root);
        }
        return resolved;
    }

    let mut stack: Vec<(PathBuf, usize)> = vec![(PathBuf::from(cgroup.cgroup_fs()), 0)];

    while let Some((prefix, depth)) = stack.pop() {
        let segment = &segments[depth];
        let last = depth == segments.len() - 1;

        if !has_glob(segment) {
            let next = prefix.join(segment);
            if last {
                if next.exists() {
                    resolved.insert(next);
                }
            } else if is_dir(&next) {
                stack.push((next, depth + 1));
            }
            continue;
        }

        let Ok(pattern) = Pattern::new(segment) else {
            continue;
        };
        for entry in list_dir(&prefix, DirEntFilter::Both) {
            if !pattern.matches(&entry) {
                continue;
            }
            let next = prefix.join(&entry);
            if last {
                resolved.insert(next);
            } else if is_dir(&next) {
                stack.push((next, depth + 1));
            }
        }
    }

    resolved
}

/// setxattr(2); kill bookkeeping must not fail the kill, so errors collapse
/// to false.
pub fn set_xattr(path: &Path, attr: &str, value: &str) -> bool {
    let (Ok(c_path), Ok(c_attr)) = (
        CString::new(path.as_os_str().as_bytes()),
        CString::new(attr),
    ) else {
        return false;
    };

    // SAFETY: the pointers reference live CStrings/slice for the duration of
    // the call and the kernel copies the value out.
    let ret = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_attr.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    ret == 0
}

pub fn get_xattr(path: &Path, attr: &str) -> Option<String> {
    let (Ok(c_path), Ok(c_attr)) = (
        CString::new(path.as_os_str().as_bytes()),
        CString::new(attr),
    ) else {
        return None;
    };

    // SAFETY: a null destination queries the value size.
    let size = unsafe { libc::getxattr(c_path.as_ptr(), c_attr.as_ptr(), std::ptr::null_mut(), 0) };
    if size <= 0 {
        return None;
    }

    let mut buf = vec![0u8; size as usize];
    // SAFETY: buf is a live allocation of the queried size.
    let ret = unsafe {
        libc::getxattr(
            c_path.as_ptr(),
            c_attr.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if ret < 0 {
        return None;
    }
    buf.truncate(ret as usize);
    String::from_utf8(buf).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeCgroupTree;

    const UPSTREAM_PSI: &str = "some avg10=0.22 avg60=0.17 avg300=1.11 total=58761459\n\
                                full avg10=0.12 avg60=0.16 avg300=1.08 total=58464525\n";
    const EXPERIMENTAL_PSI: &str = "aggr 316016073\n\
                                    some 0.10 0.03 0.05\n\
                                    full 0.00 0.03 0.05\n";

    #[test]
    fn test_read_mem_pressure_upstream() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file("workload", MEM_PRESSURE_FILE, UPSTREAM_PSI);
        let cgroup = tree.cgroup("workload");

        let some = read_mem_pressure(&cgroup, PressureKind::Some).unwrap();
        assert_eq!(some.avg10, 0.22);
        assert_eq!(some.avg60, 0.17);
        assert_eq!(some.avg300, 1.11);
        assert_eq!(some.total, Some(Duration::from_micros(58761459)));

        let full = read_mem_pressure(&cgroup, PressureKind::Full).unwrap();
        assert_eq!(full.avg10, 0.12);
        assert_eq!(full.total, Some(Duration::from_micros(58464525)));
    }

    #[test]
    fn test_read_mem_pressure_experimental() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file("workload", MEM_PRESSURE_FILE, EXPERIMENTAL_PSI);
        let cgroup = tree.cgroup("workload");

        let some = read_mem_pressure(&cgroup, PressureKind::Some).unwrap();
        assert_eq!(some.avg10, 0.10);
        assert_eq!(some.total, None);

        let full = read_mem_pressure(&cgroup, PressureKind::Full).unwrap();
        assert_eq!(full.avg300, 0.05);
    }

    #[test]
    fn test_read_pressure_bad_format() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file("workload", MEM_PRESSURE_FILE, "what even is this\n");
        tree.add_cgroup("empty");
        let cgroup = tree.cgroup("workload");

        assert!(read_mem_pressure(&cgroup, PressureKind::Some).is_err());
        assert!(read_mem_pressure(&tree.cgroup("empty"), PressureKind::Some).is_err());
        assert!(read_io_pressure(&tree.cgroup("empty"), PressureKind::Some).is_err());
    }

    #[test]
    fn test_max_avg_ignores_nan() {
        let pressure = ResourcePressure {
            avg10: 3.0,
            avg60: f32::NAN,
            avg300: 7.0,
            total: None,
        };
        assert_eq!(pressure.max_avg(), 7.0);
        assert!(ResourcePressure::unavailable().max_avg().is_nan());
    }

    #[test]
    fn test_read_mem_current() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file("workload", MEM_CURRENT_FILE, "987654321\n");
        assert_eq!(read_mem_current(&tree.cgroup("workload")).unwrap(), 987654321);
    }

    #[test]
    fn test_read_mem_limits_and_max_sentinel() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file("workload", MEM_LOW_FILE, "1048576\n");
        tree.add_cgroup_file("workload", MEM_MIN_FILE, "0\n");
        tree.add_cgroup_file("workload", MEM_HIGH_FILE, "max\n");
        tree.add_cgroup_file("workload", MEM_MAX_FILE, "max\n");
        let cgroup = tree.cgroup("workload");

        assert_eq!(read_mem_low(&cgroup).unwrap(), 1048576);
        assert_eq!(read_mem_min(&cgroup).unwrap(), 0);
        assert_eq!(read_mem_high(&cgroup).unwrap(), i64::MAX);
        assert_eq!(read_mem_max(&cgroup).unwrap(), i64::MAX);
    }

    #[test]
    fn test_read_mem_high_tmp() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file("a", MEM_HIGH_TMP_FILE, "1073741824 20000000\n");
        tree.add_cgroup_file("b", MEM_HIGH_TMP_FILE, "max 0\n");
        tree.add_cgroup_file("c", MEM_HIGH_TMP_FILE, "1073741824\n");

        assert_eq!(read_mem_high_tmp(&tree.cgroup("a")).unwrap(), 1073741824);
        assert_eq!(read_mem_high_tmp(&tree.cgroup("b")).unwrap(), i64::MAX);
        assert!(read_mem_high_tmp(&tree.cgroup("c")).is_err());
    }

    #[test]
    fn test_write_mem_high() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup("workload");
        let cgroup = tree.cgroup("workload");

        write_mem_high(&cgroup, 536870912).unwrap();
        assert_eq!(read_mem_high(&cgroup).unwrap(), 536870912);

        write_mem_high_tmp(&cgroup, 268435456, Duration::from_secs(20)).unwrap();
        assert_eq!(read_mem_high_tmp(&cgroup).unwrap(), 268435456);
    }

    #[test]
    fn test_swap_current_missing_is_zero() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup("no_swap_accounting");
        tree.add_cgroup_file("with_swap", MEM_SWAP_CURRENT_FILE, "4096\n");

        assert_eq!(read_swap_current(&tree.cgroup("no_swap_accounting")).unwrap(), 0);
        assert_eq!(read_swap_current(&tree.cgroup("with_swap")).unwrap(), 4096);
    }

    #[test]
    fn test_get_meminfo_scales_to_bytes() {
        let tree = FakeCgroupTree::new();
        let path = tree.add_file(
            "meminfo",
            "MemTotal:       16777216 kB\n\
             MemFree:         8388608 kB\n\
             SwapTotal:        102400 kB\n\
             SwapFree:          51200 kB\n\
             HugePages_Total:       0\n",
        );

        let meminfo = get_meminfo(&path).unwrap();
        assert_eq!(meminfo["MemTotal"], 16777216 * 1024);
        assert_eq!(meminfo["SwapFree"], 51200 * 1024);
        assert_eq!(meminfo["HugePages_Total"], 0);
    }

    #[test]
    fn test_get_vmstat() {
        let tree = FakeCgroupTree::new();
        let path = tree.add_file("vmstat", "pgscan_kswapd 100\npgscan_direct 23\n");

        let vmstat = get_vmstat(&path).unwrap();
        assert_eq!(vmstat["pgscan_kswapd"], 100);
        assert_eq!(vmstat["pgscan_direct"], 23);
    }

    #[test]
    fn test_get_memstat() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file(
            "workload",
            MEM_STAT_FILE,
            "anon 1294336\nfile 36864\nshmem 1024\npgscan 100\n",
        );

        let stat = get_memstat(&tree.cgroup("workload")).unwrap();
        assert_eq!(stat["anon"], 1294336);
        assert_eq!(stat["shmem"], 1024);
    }

    #[test]
    fn test_nr_dying_descendants() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file(
            "leaky",
            CGROUP_STAT_FILE,
            "nr_descendants 2\nnr_dying_descendants 27\n",
        );
        tree.add_cgroup("bare");

        assert_eq!(nr_dying_descendants(&tree.cgroup("leaky")), 27);
        assert_eq!(nr_dying_descendants(&tree.cgroup("bare")), 0);
    }

    #[test]
    fn test_read_io_stat() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file(
            "workload",
            IO_STAT_FILE,
            "8:16 rbytes=1459200 wbytes=314773504 rios=192 wios=353 dbytes=0 dios=0\n\
             8:0 rbytes=90494976 wbytes=299008000 rios=8950 wios=1252 dbytes=50331648 dios=3021\n",
        );

        let stats = read_io_stat(&tree.cgroup("workload")).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].dev_id, "8:16");
        assert_eq!(stats[0].wbytes, 314773504);
        assert_eq!(stats[1].dbytes, 50331648);
        assert_eq!(stats[1].dios, 3021);
    }

    #[test]
    fn test_read_controllers() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file("workload", CONTROLLERS_FILE, "cpuset cpu io memory pids\n");

        let controllers = read_controllers(&tree.cgroup("workload")).unwrap();
        assert_eq!(controllers, ["cpuset", "cpu", "io", "memory", "pids"]);
    }

    #[test]
    fn test_get_pids() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup_file("service", PROCS_FILE, "123\n456\n");
        tree.add_cgroup_file("service/nested", PROCS_FILE, "789\n");

        let mut flat = get_pids(&tree.cgroup("service").absolute(), false);
        flat.sort_unstable();
        assert_eq!(flat, [123, 456]);

        let mut all = get_pids(&tree.cgroup("service").absolute(), true);
        all.sort_unstable();
        assert_eq!(all, [123, 456, 789]);
    }

    #[test]
    fn test_list_dir_skips_dotfiles() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup("parent/child_a");
        tree.add_cgroup("parent/child_b");
        tree.add_cgroup("parent/.hidden");
        tree.add_cgroup_file("parent", MEM_CURRENT_FILE, "0\n");

        let parent = tree.cgroup("parent").absolute();
        let mut dirs = list_dir(&parent, DirEntFilter::Directory);
        dirs.sort();
        assert_eq!(dirs, ["child_a", "child_b"]);

        let files = list_dir(&parent, DirEntFilter::File);
        assert_eq!(files, [MEM_CURRENT_FILE]);

        let mut both = list_dir(&parent, DirEntFilter::Both);
        both.sort();
        assert_eq!(both, ["child_a", "child_b", MEM_CURRENT_FILE]);
    }

    #[test]
    fn test_resolve_wildcard() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup("system.slice/service1.service");
        tree.add_cgroup("system.slice/service2.service");
        tree.add_cgroup("system.slice/slice1.slice");
        tree.add_cgroup("workload.slice/service1.service");

        let matches = resolve_wildcard(&tree.cgroup("system.slice/*"));
        assert_eq!(matches.len(), 3);
        assert!(matches.contains(&tree.cgroup("system.slice/service1.service").absolute()));

        let services = resolve_wildcard(&tree.cgroup("*.slice/service?.service"));
        assert_eq!(services.len(), 3);
        assert!(services.contains(&tree.cgroup("workload.slice/service1.service").absolute()));

        let direct = resolve_wildcard(&tree.cgroup("system.slice/slice1.slice"));
        assert_eq!(direct.len(), 1);

        let missing = resolve_wildcard(&tree.cgroup("does_not_exist/*"));
        assert!(missing.is_empty());

        // A pure function of filesystem state: same tree, same answer.
        assert_eq!(matches, resolve_wildcard(&tree.cgroup("system.slice/*")));
    }

    #[test]
    fn test_get_xattr_missing() {
        let tree = FakeCgroupTree::new();
        tree.add_cgroup("workload");
        assert_eq!(
            get_xattr(&tree.cgroup("workload").absolute(), "user.oomd_test"),
            None
        );
    }
}
