use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::types::BubblewrapConfig;
use crate::error::{ProvisionError, Result, RunletError};
use crate::sandbox::backends::process::SANDBOX_PATH;
use crate::sandbox::limits::LaunchSpec;
use crate::sandbox::traits::{BackendCapabilities, IsolationBackend, SandboxContext};

/// Mount point of the sandbox directory inside the namespace.
const GUEST_ROOT: &str = "/sandbox";

/// Bubblewrap namespace backend.
///
/// Each execution runs in fresh user, mount, pid, network, ipc, and uts
/// namespaces. The host filesystem is visible only through read-only binds
/// of system directories; the sandbox directory is the only writable mount
/// besides a private `/tmp`.
pub struct BubblewrapBackend {
    binary: PathBuf,
    ro_binds: Vec<PathBuf>,
    enable_networking: bool,
}

impl BubblewrapBackend {
    pub fn new(config: BubblewrapConfig) -> Result<Self> {
        let binary = Self::locate(&config).ok_or_else(|| RunletError::BackendNotAvailable {
            backend: "bubblewrap".to_string(),
            reason: "bwrap binary not found".to_string(),
        })?;

        if !Self::probe(&binary) {
            return Err(RunletError::BackendNotAvailable {
                backend: "bubblewrap".to_string(),
                reason: "bwrap cannot create namespaces (unprivileged user namespaces disabled?)"
                    .to_string(),
            });
        }

        info!(binary = %binary.display(), networking = config.enable_networking, "Bubblewrap backend initialized");

        Ok(Self {
            binary,
            ro_binds: config.ro_binds,
            enable_networking: config.enable_networking,
        })
    }

    fn locate(config: &BubblewrapConfig) -> Option<PathBuf> {
        match &config.binary_path {
            Some(path) if path.exists() => Some(path.clone()),
            Some(_) => None,
            None => which::which("bwrap").ok(),
        }
    }

    /// Check if bubblewrap can create namespaces on this system.
    pub fn is_available() -> bool {
        which::which("bwrap")
            .map(|binary| Self::probe(&binary))
            .unwrap_or(false)
    }

    fn probe(binary: &Path) -> bool {
        std::process::Command::new(binary)
            .args(["--unshare-all", "--die-with-parent", "--ro-bind", "/", "/", "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn build_args(&self, ctx: &SandboxContext<'_>, interpreter: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();

        extend(&mut args, &["--unshare-all", "--die-with-parent", "--new-session"]);
        if self.enable_networking {
            extend(&mut args, &["--share-net"]);
        }

        for path in &self.ro_binds {
            args.push("--ro-bind-try".into());
            args.push(path.clone().into_os_string());
            args.push(path.clone().into_os_string());
        }

        // Interpreters outside the standard binds (e.g. /usr/local, /opt).
        if let Some(dir) = interpreter.parent() {
            if !self.ro_binds.iter().any(|bind| dir.starts_with(bind)) {
                args.push("--ro-bind-try".into());
                args.push(dir.as_os_str().to_owned());
                args.push(dir.as_os_str().to_owned());
            }
        }

        extend(&mut args, &["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"]);

        args.push("--bind".into());
        args.push(ctx.root.as_os_str().to_owned());
        args.push(GUEST_ROOT.into());

        extend(&mut args, &["--chdir", GUEST_ROOT, "--hostname", "runlet", "--"]);

        args.push(interpreter.as_os_str().to_owned());
        args.extend(ctx.language.interpreter_args().iter().map(OsString::from));
        args.push(Path::new(GUEST_ROOT).join(ctx.source_file).into_os_string());
        args
    }
}

fn extend(args: &mut Vec<OsString>, parts: &[&str]) {
    args.extend(parts.iter().map(OsString::from));
}

#[async_trait]
impl IsolationBackend for BubblewrapBackend {
    fn name(&self) -> &str {
        "bubblewrap"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            filesystem_isolation: true,
            network_isolation: !self.enable_networking,
            pid_isolation: true,
            host_cgroups: true,
        }
    }

    async fn prepare(
        &self,
        ctx: &SandboxContext<'_>,
    ) -> std::result::Result<LaunchSpec, ProvisionError> {
        let interpreter = ctx.language.resolve_interpreter();
        if !interpreter.is_absolute() {
            return Err(ProvisionError::Backend {
                backend: "bubblewrap".to_string(),
                message: format!("no {} interpreter on host", ctx.language),
            });
        }

        let args = self.build_args(ctx, &interpreter);
        debug!(execution_id = %ctx.execution_id, args = ?args, "Prepared bwrap launch");

        // bwrap passes its own environment through to the sandboxed program.
        let mut env = vec![
            ("PATH".to_string(), SANDBOX_PATH.to_string()),
            ("HOME".to_string(), GUEST_ROOT.to_string()),
            ("TMPDIR".to_string(), "/tmp".to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        env.extend(
            ctx.language
                .env()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        Ok(LaunchSpec {
            program: self.binary.clone(),
            args,
            env,
            current_dir: ctx.root.to_path_buf(),
            rlimits: ctx.limits.rlimits(ctx.cgroup.is_some()),
            join_cgroup: ctx.cgroup.map(|c| c.procs_path()),
        })
    }

    async fn health_check(&self) -> bool {
        Self::probe(&self.binary)
    }
}
