//! Cgroup v2 limits for native backends.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ProvisionError;

const CPU_PERIOD_USEC: u64 = 100_000;

/// Parent cgroup under which one child group per execution is created.
#[derive(Debug, Clone)]
pub struct CgroupRoot {
    path: PathBuf,
}

impl CgroupRoot {
    /// Check that the hierarchy is cgroup v2, writable, and delegates the
    /// memory and pids controllers. Returns `None` otherwise.
    pub fn probe(path: &Path) -> Option<Self> {
        let parent = path.parent()?;
        if !parent.join("cgroup.controllers").exists() {
            debug!(path = %path.display(), "No cgroup v2 hierarchy");
            return None;
        }

        if let Err(e) = fs::create_dir_all(path) {
            debug!(path = %path.display(), error = %e, "Cgroup root not writable");
            return None;
        }

        let available = fs::read_to_string(path.join("cgroup.controllers")).ok()?;
        for controller in ["memory", "pids", "cpu"] {
            if available.split_whitespace().any(|c| c == controller) {
                let _ = fs::write(
                    path.join("cgroup.subtree_control"),
                    format!("+{}", controller),
                );
            }
        }

        let enabled = fs::read_to_string(path.join("cgroup.subtree_control")).ok()?;
        let has = |c: &str| enabled.split_whitespace().any(|e| e == c);
        if !(has("memory") && has("pids")) {
            debug!(path = %path.display(), enabled = %enabled.trim(), "Memory/pids controllers not delegated");
            return None;
        }

        Some(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create(&self, name: &str) -> Result<Cgroup, ProvisionError> {
        let path = self.path.join(name);
        fs::create_dir(&path).map_err(|e| ProvisionError::from_alloc("create cgroup", e))?;
        Ok(Cgroup { path })
    }

    /// Per-execution groups left behind by a previous process.
    pub fn stale_groups(&self) -> Vec<Cgroup> {
        let Ok(entries) = fs::read_dir(&self.path) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("exec_"))
            .filter(|e| e.path().is_dir())
            .map(|e| Cgroup { path: e.path() })
            .collect()
    }
}

/// One execution's cgroup.
#[derive(Debug, Clone)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    pub fn from_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    /// Hard memory cap with swap disabled; the whole group is OOM-killed together.
    pub fn set_memory_limit(&self, bytes: u64) -> io::Result<()> {
        fs::write(self.path.join("memory.max"), bytes.to_string())?;
        self.write_optional("memory.swap.max", "0");
        self.write_optional("memory.oom.group", "1");
        Ok(())
    }

    pub fn set_pids_limit(&self, max: u32) -> io::Result<()> {
        fs::write(self.path.join("pids.max"), max.to_string())
    }

    pub fn set_cpu_percent(&self, percent: u32) -> io::Result<()> {
        let quota = CPU_PERIOD_USEC * u64::from(percent) / 100;
        fs::write(
            self.path.join("cpu.max"),
            format!("{} {}", quota.max(1000), CPU_PERIOD_USEC),
        )
    }

    fn write_optional(&self, file: &str, value: &str) {
        let path = self.path.join(file);
        if path.exists() {
            if let Err(e) = fs::write(&path, value) {
                warn!(file = %path.display(), error = %e, "Failed to set cgroup knob");
            }
        }
    }

    /// Number of OOM kills recorded in `memory.events`.
    pub fn oom_kills(&self) -> u64 {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|content| parse_oom_kills(&content))
            .unwrap_or(0)
    }

    /// SIGKILL every task in the group.
    pub fn kill(&self) {
        let kill_file = self.path.join("cgroup.kill");
        if kill_file.exists() && fs::write(&kill_file, "1").is_ok() {
            return;
        }
        // Kernels before 5.14 have no cgroup.kill.
        if let Ok(procs) = fs::read_to_string(self.procs_path()) {
            for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
                // SAFETY: sending a signal has no memory-safety implications.
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
    }

    /// Kill remaining tasks and remove the group. Removal is retried while
    /// the kernel finishes reaping.
    pub async fn remove(&self) {
        if !self.path.exists() {
            return;
        }
        self.kill();
        for _ in 0..20 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        warn!(path = %self.path.display(), "Failed to remove cgroup");
    }
}

fn parse_oom_kills(content: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
