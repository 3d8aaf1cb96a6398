use std::ffi::OsString;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ProvisionError;
use crate::sandbox::limits::LaunchSpec;
use crate::sandbox::traits::{BackendCapabilities, IsolationBackend, SandboxContext};

pub(crate) const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Plain process backend.
///
/// Runs the interpreter directly on the host inside the sandbox directory,
/// confined only by rlimits and, when delegated, a cgroup. It provides no
/// filesystem, network, or pid isolation and is only selected automatically
/// when unisolated execution is explicitly allowed.
#[derive(Debug, Default)]
pub struct ProcessBackend;

impl ProcessBackend {
    pub fn new() -> Self {
        Self
    }

    /// Always available on Unix hosts.
    pub fn is_available() -> bool {
        cfg!(unix)
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            filesystem_isolation: false,
            network_isolation: false,
            pid_isolation: false,
            host_cgroups: true,
        }
    }

    async fn prepare(&self, ctx: &SandboxContext<'_>) -> Result<LaunchSpec, ProvisionError> {
        let interpreter = ctx.language.resolve_interpreter();
        debug!(
            execution_id = %ctx.execution_id,
            interpreter = %interpreter.display(),
            "Preparing unisolated launch"
        );

        let mut args: Vec<OsString> = ctx
            .language
            .interpreter_args()
            .iter()
            .map(OsString::from)
            .collect();
        args.push(ctx.root.join(ctx.source_file).into_os_string());

        let root = ctx.root.display().to_string();
        let mut env = vec![
            ("PATH".to_string(), SANDBOX_PATH.to_string()),
            ("HOME".to_string(), root.clone()),
            ("TMPDIR".to_string(), root),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        env.extend(
            ctx.language
                .env()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        Ok(LaunchSpec {
            program: interpreter,
            args,
            env,
            current_dir: ctx.root.to_path_buf(),
            rlimits: ctx.limits.rlimits(ctx.cgroup.is_some()),
            join_cgroup: ctx.cgroup.map(|c| c.procs_path()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionId;
    use crate::sandbox::limits::{RlimitResource, SandboxLimits};
    use crate::sandbox::runtime::Language;
    use std::time::Duration;

    #[tokio::test]
    async fn test_prepare_runs_source_from_sandbox_root() {
        let dir = tempfile::tempdir().unwrap();
        let id = ExecutionId::from("p1");
        let limits = SandboxLimits {
            memory_mb: 32,
            timeout: Duration::from_secs(2),
            max_file_bytes: 1024,
            max_pids: 8,
        };
        let ctx = SandboxContext {
            execution_id: &id,
            language: Language::Shell,
            root: dir.path(),
            source_file: "main.sh",
            limits: &limits,
            cgroup: None,
        };

        let spec = ProcessBackend::new().prepare(&ctx).await.unwrap();
        assert_eq!(spec.current_dir, dir.path());
        assert_eq!(
            spec.args.last().unwrap(),
            &dir.path().join("main.sh").into_os_string()
        );
        assert!(spec.join_cgroup.is_none());
        assert!(spec
            .rlimits
            .iter()
            .any(|l| l.resource == RlimitResource::AddressSpace));
        assert!(spec.env.iter().any(|(k, v)| k == "HOME" && v == &dir.path().display().to_string()));
    }
}
