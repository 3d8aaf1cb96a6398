//! Allocation and teardown of per-execution sandboxes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::types::{LimitsConfig, RunletConfig};
use crate::error::ProvisionError;
use crate::execution::ExecutionId;
use crate::sandbox::cgroup::{Cgroup, CgroupRoot};
use crate::sandbox::limits::{LaunchSpec, SandboxLimits};
use crate::sandbox::runtime::Language;
use crate::sandbox::traits::{IsolationBackend, SandboxContext, SandboxResources};

const SANDBOX_PREFIX: &str = "exec_";

/// What the provisioner needs to know about one execution.
#[derive(Debug, Clone)]
pub struct SandboxRequest<'a> {
    pub execution_id: &'a ExecutionId,
    pub language: &'a str,
    pub code: &'a str,
    pub memory_mb: u64,
    pub timeout: Duration,
}

/// Creates isolated sandboxes on top of an [`IsolationBackend`].
///
/// Concurrency is bounded by a fixed number of slots; a request that finds
/// no free slot fails with a retryable [`ProvisionError::ResourceExhausted`].
pub struct Provisioner {
    backend: Arc<dyn IsolationBackend>,
    root: PathBuf,
    cgroups: Option<CgroupRoot>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    limits: LimitsConfig,
    cpu_percent: Option<u32>,
}

impl Provisioner {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        config: &RunletConfig,
        root: PathBuf,
    ) -> Result<Self, ProvisionError> {
        std::fs::create_dir_all(&root)?;

        let cgroups = if config.sandbox.cgroup.enabled && backend.capabilities().host_cgroups {
            let probed = CgroupRoot::probe(&config.sandbox.cgroup.root);
            if probed.is_none() {
                warn!(
                    root = %config.sandbox.cgroup.root.display(),
                    "Cgroup v2 delegation unavailable, falling back to rlimits"
                );
            }
            probed
        } else {
            None
        };

        let max_concurrent = config.sandbox.max_concurrent.max(1);

        info!(
            backend = backend.name(),
            root = %root.display(),
            cgroups = cgroups.is_some(),
            max_concurrent,
            "Provisioner initialized"
        );

        Ok(Self {
            backend,
            root,
            cgroups,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            limits: config.limits.clone(),
            cpu_percent: config.sandbox.cgroup.cpu_percent,
        })
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cgroups_enabled(&self) -> bool {
        self.cgroups.is_some()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Sandboxes currently allocated and not yet torn down.
    pub fn active(&self) -> usize {
        self.max_concurrent - self.available_slots()
    }

    /// Allocate a sandbox for one execution.
    ///
    /// Either returns a sandbox with every resource in place, or fails having
    /// released whatever was allocated along the way.
    pub async fn provision(&self, request: &SandboxRequest<'_>) -> Result<Sandbox, ProvisionError> {
        let language =
            Language::parse(request.language).ok_or_else(|| ProvisionError::Unsupported {
                language: request.language.to_string(),
            })?;

        let ceiling = self.limits.memory_ceiling_mb;
        if request.memory_mb == 0 || request.memory_mb > ceiling {
            return Err(ProvisionError::InvalidLimit {
                requested: request.memory_mb,
                ceiling,
            });
        }

        let permit = self.slots.clone().try_acquire_owned().map_err(|_| {
            ProvisionError::ResourceExhausted {
                reason: format!("all {} sandbox slots in use", self.max_concurrent),
            }
        })?;

        let name = format!("{}{}", SANDBOX_PREFIX, request.execution_id);
        let root = self.root.join(&name);
        tokio::fs::create_dir(&root)
            .await
            .map_err(|e| ProvisionError::from_alloc("create sandbox directory", e))?;

        let limits = SandboxLimits {
            memory_mb: request.memory_mb,
            timeout: request.timeout,
            max_file_bytes: self.limits.max_file_bytes,
            max_pids: self.limits.max_pids,
        };

        match self.populate(&root, &name, language, request, &limits).await {
            Ok((launch, cgroup)) => {
                let resources = SandboxResources {
                    execution_id: request.execution_id.clone(),
                    backend: self.backend.name().to_string(),
                    root,
                    cgroup: cgroup.as_ref().map(|c| c.path().to_path_buf()),
                    container: self.backend.instance_name(request.execution_id),
                    pgid: None,
                };
                debug!(
                    execution_id = %request.execution_id,
                    backend = %resources.backend,
                    program = %launch.program.display(),
                    "Sandbox provisioned"
                );
                Ok(Sandbox {
                    resources: resources.clone(),
                    launch,
                    limits,
                    cgroup: cgroup.clone(),
                    backend: self.backend.clone(),
                    lease: Some(SandboxLease {
                        resources,
                        cgroup,
                        backend: self.backend.clone(),
                        _permit: permit,
                    }),
                })
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(&root).await {
                    warn!(root = %root.display(), error = %rm, "Failed to roll back sandbox directory");
                }
                Err(e)
            }
        }
    }

    async fn populate(
        &self,
        root: &Path,
        name: &str,
        language: Language,
        request: &SandboxRequest<'_>,
        limits: &SandboxLimits,
    ) -> Result<(LaunchSpec, Option<Cgroup>), ProvisionError> {
        let source_file = language.source_file();
        tokio::fs::write(root.join(source_file), request.code)
            .await
            .map_err(|e| ProvisionError::from_alloc("write source file", e))?;

        let cgroup = match &self.cgroups {
            Some(cgroups) => {
                let cgroup = cgroups.create(name)?;
                if let Err(e) = self.apply_cgroup_limits(&cgroup, limits) {
                    cgroup.remove().await;
                    return Err(ProvisionError::from_alloc("configure cgroup", e));
                }
                Some(cgroup)
            }
            None => None,
        };

        let ctx = SandboxContext {
            execution_id: request.execution_id,
            language,
            root,
            source_file,
            limits,
            cgroup: cgroup.as_ref(),
        };

        match self.backend.prepare(&ctx).await {
            Ok(launch) => Ok((launch, cgroup)),
            Err(e) => {
                if let Some(cgroup) = &cgroup {
                    cgroup.remove().await;
                }
                Err(e)
            }
        }
    }

    fn apply_cgroup_limits(&self, cgroup: &Cgroup, limits: &SandboxLimits) -> std::io::Result<()> {
        cgroup.set_memory_limit(limits.memory_bytes())?;
        cgroup.set_pids_limit(limits.max_pids)?;
        if let Some(percent) = self.cpu_percent {
            if let Err(e) = cgroup.set_cpu_percent(percent) {
                // cpu is optional; memory and pids are not.
                debug!(error = %e, "CPU controller not available");
            }
        }
        Ok(())
    }

    /// Remove sandboxes left behind by a previous process.
    pub async fn recover(&self) -> usize {
        let mut removed = 0;

        if let Ok(mut entries) = tokio::fs::read_dir(&self.root).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if !entry.file_name().to_string_lossy().starts_with(SANDBOX_PREFIX) {
                    continue;
                }
                match tokio::fs::remove_dir_all(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "Failed to remove stale sandbox")
                    }
                }
            }
        }

        if let Some(cgroups) = &self.cgroups {
            for cgroup in cgroups.stale_groups() {
                cgroup.remove().await;
                removed += 1;
            }
        }

        removed += self.backend.recover().await;

        if removed > 0 {
            info!(removed, "Recovered stale sandbox resources");
        }
        removed
    }
}

/// A provisioned sandbox, ready to launch.
pub struct Sandbox {
    resources: SandboxResources,
    launch: LaunchSpec,
    limits: SandboxLimits,
    cgroup: Option<Cgroup>,
    backend: Arc<dyn IsolationBackend>,
    lease: Option<SandboxLease>,
}

impl Sandbox {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.resources.execution_id
    }

    pub fn backend_name(&self) -> &str {
        &self.resources.backend
    }

    pub fn resources(&self) -> &SandboxResources {
        &self.resources
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Take the teardown handle. The registry owns it from then on and
    /// releases it exactly once when the execution ends.
    pub fn take_lease(&mut self) -> Option<SandboxLease> {
        self.lease.take()
    }

    /// Stop everything running in the sandbox, including resources that live
    /// outside the launched process group.
    pub async fn force_stop(&self) {
        if let Some(cgroup) = &self.cgroup {
            cgroup.kill();
        }
        self.backend.force_stop(&self.resources).await;
    }

    pub async fn oom_killed(&self) -> bool {
        if let Some(cgroup) = &self.cgroup {
            if cgroup.oom_kills() > 0 {
                return true;
            }
        }
        self.backend.oom_killed(&self.resources).await
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        // A lease that was never handed over would leak the slot and the directory.
        if let Some(lease) = self.lease.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(lease.teardown());
                }
                Err(_) => warn!(
                    execution_id = %self.resources.execution_id,
                    "Sandbox dropped outside a runtime; resources leaked"
                ),
            }
        }
    }
}

/// Ownership of a sandbox's resources, including its concurrency slot.
pub struct SandboxLease {
    resources: SandboxResources,
    cgroup: Option<Cgroup>,
    backend: Arc<dyn IsolationBackend>,
    _permit: OwnedSemaphorePermit,
}

impl SandboxLease {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.resources.execution_id
    }

    pub fn set_pgid(&mut self, pgid: u32) {
        self.resources.pgid = Some(pgid);
    }

    /// Release everything: stray processes, backend resources, the cgroup,
    /// the directory, and finally the slot.
    pub async fn teardown(self) {
        let id = self.resources.execution_id.clone();

        if let Some(pgid) = self.resources.pgid {
            if let Ok(pgid) = i32::try_from(pgid) {
                // SAFETY: sending a signal has no memory-safety implications.
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
        }

        self.backend.release(&self.resources).await;

        if let Some(cgroup) = &self.cgroup {
            cgroup.remove().await;
        }

        match tokio::fs::remove_dir_all(&self.resources.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                execution_id = %id,
                root = %self.resources.root.display(),
                error = %e,
                "Failed to remove sandbox directory"
            ),
        }

        debug!(execution_id = %id, "Sandbox released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::BackendType;
    use crate::sandbox::backends::ProcessBackend;

    fn provisioner(dir: &Path, slots: usize) -> Provisioner {
        let mut config = RunletConfig::default();
        config.sandbox.backend = BackendType::Process;
        config.sandbox.max_concurrent = slots;
        config.sandbox.cgroup.enabled = false;
        Provisioner::new(Arc::new(ProcessBackend::new()), &config, dir.to_path_buf()).unwrap()
    }

    fn request<'a>(id: &'a ExecutionId, language: &'a str, memory_mb: u64) -> SandboxRequest<'a> {
        SandboxRequest {
            execution_id: id,
            language,
            code: "echo hi",
            memory_mb,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_provision_writes_only_the_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path(), 4);
        let id = ExecutionId::generate();

        let mut sandbox = p.provision(&request(&id, "shell", 64)).await.unwrap();
        let root = sandbox.resources().root.clone();
        let files: Vec<_> = std::fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("main.sh")]);
        assert_eq!(std::fs::read_to_string(root.join("main.sh")).unwrap(), "echo hi");

        sandbox.take_lease().unwrap().teardown().await;
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_rejects_unknown_language_and_bad_memory() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path(), 4);
        let id = ExecutionId::generate();

        assert!(matches!(
            p.provision(&request(&id, "cobol", 64)).await,
            Err(ProvisionError::Unsupported { .. })
        ));
        assert!(matches!(
            p.provision(&request(&id, "shell", 0)).await,
            Err(ProvisionError::InvalidLimit { .. })
        ));
        assert!(matches!(
            p.provision(&request(&id, "shell", 1_000_000)).await,
            Err(ProvisionError::InvalidLimit { .. })
        ));
        assert_eq!(p.available_slots(), 4);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_slots_are_retryable_and_returned_on_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path(), 1);
        let first = ExecutionId::generate();
        let second = ExecutionId::generate();

        let mut sandbox = p.provision(&request(&first, "shell", 64)).await.unwrap();
        let Err(err) = p.provision(&request(&second, "shell", 64)).await else {
            panic!("second sandbox allocated past the concurrency limit");
        };
        assert!(err.is_retryable());

        sandbox.take_lease().unwrap().teardown().await;
        assert_eq!(p.available_slots(), 1);
        assert!(p.provision(&request(&second, "shell", 64)).await.is_ok());
    }

    #[tokio::test]
    async fn test_recover_removes_stale_sandboxes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("exec_stale")).unwrap();
        std::fs::write(dir.path().join("exec_stale/main.py"), "x").unwrap();
        std::fs::create_dir(dir.path().join("keep")).unwrap();

        let p = provisioner(dir.path(), 1);
        assert_eq!(p.recover().await, 1);
        assert!(!dir.path().join("exec_stale").exists());
        assert!(dir.path().join("keep").exists());
    }
}
