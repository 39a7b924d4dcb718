//! Host cgroup readers: the limits the supervisor sizes the sandbox by.

use crate::errors::SandboxError;
use std::{fs, path::PathBuf};

/// A handle to the cgroup the sandbox process lives in. Serialized into
/// the persisted sandbox descriptor.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Cgroup {
    /// cgroupfs directory for the sandbox (v2 unified hierarchy, or the
    /// cpu/memory controller directories on v1).
    pub path: PathBuf,
    #[serde(default)]
    pub v2: bool,
}

impl Cgroup {
    pub fn new(path: PathBuf, v2: bool) -> Cgroup {
        Cgroup { path, v2 }
    }

    fn read_control(&self, v2_name: &str, v1_name: &str) -> Result<String, SandboxError> {
        let name = if self.v2 { v2_name } else { v1_name };
        let path = self.path.join(name);
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|err| SandboxError::Cgroup(format!("reading {}: {err}", path.display())))
    }

    /// The memory limit in bytes, or None when unlimited.
    pub fn memory_limit(&self) -> Result<Option<u64>, SandboxError> {
        let raw = self.read_control("memory.max", "memory/memory.limit_in_bytes")?;
        if raw == "max" {
            return Ok(None);
        }
        let bytes: u64 = raw
            .parse()
            .map_err(|_| SandboxError::Cgroup(format!("invalid memory limit {raw:?}")))?;
        // v1 reports "unlimited" as a huge page-rounded number.
        if bytes >= i64::MAX as u64 / 2 {
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    /// The CPU quota as fractional CPUs, or None when unlimited.
    pub fn cpu_quota(&self) -> Result<Option<f64>, SandboxError> {
        if self.v2 {
            // "max 100000" or "50000 100000".
            let raw = self.read_control("cpu.max", "")?;
            let mut parts = raw.split_whitespace();
            let quota = parts.next().unwrap_or("max");
            let period: f64 = parts
                .next()
                .unwrap_or("100000")
                .parse()
                .map_err(|_| SandboxError::Cgroup(format!("invalid cpu.max {raw:?}")))?;
            if quota == "max" || period <= 0.0 {
                return Ok(None);
            }
            let quota: f64 = quota
                .parse()
                .map_err(|_| SandboxError::Cgroup(format!("invalid cpu.max {raw:?}")))?;
            Ok(Some(quota / period))
        } else {
            let quota: f64 = self
                .read_control("", "cpu/cpu.cfs_quota_us")?
                .parse()
                .map_err(|err| SandboxError::Cgroup(format!("invalid cpu quota: {err}")))?;
            if quota < 0.0 {
                return Ok(None);
            }
            let period: f64 = self
                .read_control("", "cpu/cpu.cfs_period_us")?
                .parse()
                .map_err(|err| SandboxError::Cgroup(format!("invalid cpu period: {err}")))?;
            if period <= 0.0 {
                return Ok(None);
            }
            Ok(Some(quota / period))
        }
    }

    /// The number of CPUs available to the cgroup; falls back to the
    /// host count when no cpuset is configured.
    pub fn num_cpus(&self) -> Result<u32, SandboxError> {
        let raw = self
            .read_control("cpuset.cpus.effective", "cpuset/cpuset.cpus")
            .unwrap_or_default();
        if raw.is_empty() {
            return Ok(host_cpu_count());
        }
        let mut count = 0u32;
        for part in raw.split(',') {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo.trim().parse().map_err(|_| {
                        SandboxError::Cgroup(format!("invalid cpuset {raw:?}"))
                    })?;
                    let hi: u32 = hi.trim().parse().map_err(|_| {
                        SandboxError::Cgroup(format!("invalid cpuset {raw:?}"))
                    })?;
                    count += hi.saturating_sub(lo) + 1;
                }
                None => count += 1,
            }
        }
        Ok(count.max(1))
    }
}

/// CPUs the host exposes to this process.
pub fn host_cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Total host memory, from /proc/meminfo.
pub fn total_system_memory() -> Result<u64, SandboxError> {
    let meminfo = fs::read_to_string("/proc/meminfo")?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches(" kB")
                .trim()
                .parse()
                .map_err(|_| SandboxError::Cgroup(format!("invalid MemTotal line {line:?}")))?;
            return Ok(kb * 1024);
        }
    }
    Err(SandboxError::Cgroup(
        "MemTotal not found in /proc/meminfo".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cgroup_with(files: &[(&str, &str)]) -> (tempfile::TempDir, Cgroup) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            let mut file = fs::File::create(path).unwrap();
            writeln!(file, "{contents}").unwrap();
        }
        let cgroup = Cgroup::new(dir.path().to_path_buf(), true);
        (dir, cgroup)
    }

    #[test]
    fn v2_memory_limit() {
        let (_dir, cgroup) = cgroup_with(&[("memory.max", "1073741824")]);
        assert_eq!(cgroup.memory_limit().unwrap(), Some(1 << 30));

        let (_dir, cgroup) = cgroup_with(&[("memory.max", "max")]);
        assert_eq!(cgroup.memory_limit().unwrap(), None);
    }

    #[test]
    fn v2_cpu_quota() {
        let (_dir, cgroup) = cgroup_with(&[("cpu.max", "250000 100000")]);
        assert_eq!(cgroup.cpu_quota().unwrap(), Some(2.5));

        let (_dir, cgroup) = cgroup_with(&[("cpu.max", "max 100000")]);
        assert_eq!(cgroup.cpu_quota().unwrap(), None);
    }

    #[test]
    fn cpuset_ranges() {
        let (_dir, cgroup) = cgroup_with(&[("cpuset.cpus.effective", "0-3,8,10-11")]);
        assert_eq!(cgroup.num_cpus().unwrap(), 7);
    }

    #[test]
    fn missing_cpuset_falls_back_to_host() {
        let (_dir, cgroup) = cgroup_with(&[]);
        assert!(cgroup.num_cpus().unwrap() >= 1);
    }

    #[test]
    fn total_memory_reads_meminfo() {
        assert!(total_system_memory().unwrap() > 0);
    }
}
