use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::ProvisionError;
use crate::execution::ExecutionId;
use crate::sandbox::cgroup::Cgroup;
use crate::sandbox::limits::{LaunchSpec, SandboxLimits};
use crate::sandbox::runtime::Language;

/// Capability flags indicating which isolation guarantees the backend provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// The program only sees its own sandbox directory and read-only system paths
    pub filesystem_isolation: bool,
    /// The program has no network access
    pub network_isolation: bool,
    /// The program cannot see or signal host processes
    pub pid_isolation: bool,
    /// Memory/pids limits come from a host cgroup created by the provisioner.
    /// Backends that enforce limits themselves (containers) leave this off.
    pub host_cgroups: bool,
}

/// Inputs for preparing one sandbox.
pub struct SandboxContext<'a> {
    pub execution_id: &'a ExecutionId,
    pub language: Language,
    /// Host directory holding the source file; the program's only writable area.
    pub root: &'a Path,
    pub source_file: &'a str,
    pub limits: &'a SandboxLimits,
    pub cgroup: Option<&'a Cgroup>,
}

/// Handles to everything allocated for one sandbox, enough to stop and
/// release it without the original context.
#[derive(Debug, Clone)]
pub struct SandboxResources {
    pub execution_id: ExecutionId,
    pub backend: String,
    pub root: PathBuf,
    pub cgroup: Option<PathBuf>,
    /// Container name for container backends
    pub container: Option<String>,
    /// Process group of the launched program, once spawned
    pub pgid: Option<u32>,
}

/// Trait for isolation backends.
///
/// A backend turns a prepared sandbox directory into a launch plan. The
/// supervisor spawns the plan; the backend's hooks stop and release
/// anything that lives outside the spawned process tree.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Returns the backend name (e.g., "bubblewrap", "docker")
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Build the launch plan for a sandbox whose directory and cgroup exist.
    async fn prepare(&self, ctx: &SandboxContext<'_>) -> Result<LaunchSpec, ProvisionError>;

    /// Name of any out-of-process resource `prepare` will create for this
    /// execution (e.g. a container). Recorded so teardown can find it.
    fn instance_name(&self, _execution_id: &ExecutionId) -> Option<String> {
        None
    }

    /// Forcibly stop whatever the backend runs outside the launched process
    /// group. Default implementation is a no-op for process-tree backends.
    async fn force_stop(&self, _resources: &SandboxResources) {}

    /// Release backend-owned resources after the program ended.
    async fn release(&self, _resources: &SandboxResources) {}

    /// Whether the backend observed an out-of-memory kill it enforces itself.
    async fn oom_killed(&self, _resources: &SandboxResources) -> bool {
        false
    }

    /// Remove resources left behind by a previous process. Returns the count.
    async fn recover(&self) -> usize {
        0
    }

    /// Check if the backend is ready to accept sandboxes.
    async fn health_check(&self) -> bool {
        true
    }
}
