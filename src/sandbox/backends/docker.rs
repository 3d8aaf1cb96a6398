use std::collections::HashMap;
use std::ffi::OsString;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::types::DockerConfig;
use crate::error::{ProvisionError, Result, RunletError};
use crate::execution::ExecutionId;
use crate::sandbox::limits::LaunchSpec;
use crate::sandbox::runtime::Language;
use crate::sandbox::traits::{
    BackendCapabilities, IsolationBackend, SandboxContext, SandboxResources,
};

/// Label attached to every container this backend creates.
const MANAGED_LABEL: &str = "runlet.managed=1";

/// Mount point of the sandbox directory inside the container.
const GUEST_ROOT: &str = "/sandbox";

/// Docker sandbox backend.
///
/// Each execution runs in a fresh container with the sandbox directory as its
/// only writable bind mount. Memory, pids, and CPU limits are enforced by the
/// container runtime rather than by a host cgroup. Containers are named after
/// the execution and labelled, so they can be killed, inspected, and removed
/// independently of the `docker run` client process.
pub struct DockerBackend {
    images: HashMap<String, String>,
    enable_networking: bool,
    cpus: Option<f32>,
}

impl DockerBackend {
    /// Create a new Docker backend.
    pub fn new(config: DockerConfig) -> Result<Self> {
        // Verify Docker is available
        if !Self::is_available() {
            return Err(RunletError::BackendNotAvailable {
                backend: "docker".to_string(),
                reason: "Docker daemon is not accessible. Ensure Docker is installed and running."
                    .to_string(),
            });
        }

        info!(
            networking = config.enable_networking,
            images = config.images.len(),
            "Docker backend initialized"
        );

        Ok(Self::with_config(config))
    }

    fn with_config(config: DockerConfig) -> Self {
        Self {
            images: config.images,
            enable_networking: config.enable_networking,
            cpus: config.cpus,
        }
    }

    /// Check if the Docker backend is available on this system.
    ///
    /// Returns true if Docker daemon is accessible.
    pub fn is_available() -> bool {
        // Check if docker command exists and daemon is responsive
        match std::process::Command::new("docker")
            .args(["info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    fn image_for(&self, language: Language) -> String {
        self.images
            .get(language.id())
            .cloned()
            .unwrap_or_else(|| language.default_image().to_string())
    }

    fn container_name(execution_id: &ExecutionId) -> String {
        format!("runlet-{}", execution_id)
    }

    fn run_args(&self, ctx: &SandboxContext<'_>) -> Vec<String> {
        let limits = ctx.limits;
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            Self::container_name(ctx.execution_id),
            "--label".to_string(),
            MANAGED_LABEL.to_string(),
        ];

        // Network isolation
        if !self.enable_networking {
            args.push("--network=none".to_string());
        }

        // Memory limit, swap disabled
        args.push(format!("--memory={}m", limits.memory_mb));
        args.push(format!("--memory-swap={}m", limits.memory_mb));
        args.push(format!("--pids-limit={}", limits.max_pids));
        if let Some(cpus) = self.cpus {
            args.push(format!("--cpus={}", cpus));
        }

        args.extend(
            [
                "--read-only",
                "--tmpfs",
                "/tmp",
                "--security-opt",
                "no-new-privileges",
                "--cap-drop",
                "ALL",
            ]
            .map(String::from),
        );
        args.push(format!("--ulimit=fsize={}", limits.max_file_bytes));
        args.push("--ulimit=core=0".to_string());

        // Sandbox directory
        args.push("-v".to_string());
        args.push(format!("{}:{}:rw", ctx.root.display(), GUEST_ROOT));

        // Working directory
        args.extend(["-w".to_string(), GUEST_ROOT.to_string()]);

        // Environment variables
        args.extend(["-e".to_string(), format!("HOME={}", GUEST_ROOT)]);
        for (key, value) in ctx.language.env() {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        // Image and command
        args.push(self.image_for(ctx.language));
        args.push(ctx.language.interpreters()[0].to_string());
        args.extend(ctx.language.interpreter_args().iter().map(|a| a.to_string()));
        args.push(format!("{}/{}", GUEST_ROOT, ctx.source_file));
        args
    }

    async fn docker(args: &[&str]) -> Option<std::process::Output> {
        match Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
        {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(args = ?args, error = %e, "Failed to run docker");
                None
            }
        }
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            filesystem_isolation: true,
            network_isolation: !self.enable_networking,
            pid_isolation: true,
            host_cgroups: false,
        }
    }

    async fn prepare(
        &self,
        ctx: &SandboxContext<'_>,
    ) -> std::result::Result<LaunchSpec, ProvisionError> {
        let program = which::which("docker").map_err(|e| ProvisionError::Backend {
            backend: "docker".to_string(),
            message: format!("docker CLI not found: {}", e),
        })?;

        let args = self.run_args(ctx);
        debug!(execution_id = %ctx.execution_id, args = ?args, "Prepared docker launch");

        // The docker client itself only needs enough environment to reach the daemon.
        let mut env = vec![(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
        )];
        for key in ["HOME", "DOCKER_HOST", "DOCKER_CONFIG", "DOCKER_CONTEXT"] {
            if let Ok(value) = std::env::var(key) {
                env.push((key.to_string(), value));
            }
        }

        Ok(LaunchSpec {
            program,
            args: args.into_iter().map(OsString::from).collect(),
            env,
            current_dir: ctx.root.to_path_buf(),
            rlimits: Vec::new(),
            join_cgroup: None,
        })
    }

    fn instance_name(&self, execution_id: &ExecutionId) -> Option<String> {
        Some(Self::container_name(execution_id))
    }

    async fn force_stop(&self, resources: &SandboxResources) {
        if let Some(name) = &resources.container {
            debug!(container = %name, "Killing container");
            // Fails harmlessly when the container already exited.
            let _ = Self::docker(&["kill", name]).await;
        }
    }

    async fn release(&self, resources: &SandboxResources) {
        if let Some(name) = &resources.container {
            if let Some(output) = Self::docker(&["rm", "-f", name]).await {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if !stderr.contains("No such container") {
                        warn!(container = %name, error = %stderr.trim(), "Failed to remove container");
                    }
                }
            }
        }
    }

    async fn oom_killed(&self, resources: &SandboxResources) -> bool {
        let Some(name) = &resources.container else {
            return false;
        };
        match Self::docker(&["inspect", "--format", "{{.State.OOMKilled}}", name]).await {
            Some(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            _ => false,
        }
    }

    async fn recover(&self) -> usize {
        let filter = format!("label={}", MANAGED_LABEL);
        let Some(output) = Self::docker(&["ps", "-aq", "--filter", &filter]).await else {
            return 0;
        };
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(String::from)
            .collect();
        if ids.is_empty() {
            return 0;
        }

        let mut args = vec!["rm", "-f"];
        args.extend(ids.iter().map(String::as_str));
        let _ = Self::docker(&args).await;
        info!(count = ids.len(), "Removed stale containers");
        ids.len()
    }

    async fn health_check(&self) -> bool {
        Self::is_available()
    }
}
