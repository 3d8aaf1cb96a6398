//! Kernel-enforced limits and the launch plan handed to the supervisor.

use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Limits attached to one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub memory_mb: u64,
    pub timeout: Duration,
    pub max_file_bytes: u64,
    pub max_pids: u32,
}

impl SandboxLimits {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }

    /// rlimits for native backends. The address-space limit stands in for
    /// the memory cgroup when none is available.
    pub fn rlimits(&self, with_cgroup: bool) -> Vec<Rlimit> {
        // CPU time can never legitimately exceed the wall clock budget.
        let cpu_seconds = self.timeout.as_secs() + 1;
        let mut limits = vec![
            Rlimit::new(RlimitResource::CpuTime, cpu_seconds),
            Rlimit::new(RlimitResource::FileSize, self.max_file_bytes),
            Rlimit::new(RlimitResource::Core, 0),
            Rlimit::new(RlimitResource::OpenFiles, 256),
        ];
        if !with_cgroup {
            limits.push(Rlimit::new(RlimitResource::AddressSpace, self.memory_bytes()));
        }
        limits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitResource {
    AddressSpace,
    CpuTime,
    FileSize,
    Core,
    OpenFiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub resource: RlimitResource,
    pub value: u64,
}

impl Rlimit {
    pub fn new(resource: RlimitResource, value: u64) -> Self {
        Self { resource, value }
    }
}

/// Everything needed to start the interpreter inside a provisioned sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub current_dir: PathBuf,
    /// Applied in the child between fork and exec.
    pub rlimits: Vec<Rlimit>,
    /// `cgroup.procs` file the child moves itself into before exec.
    pub join_cgroup: Option<PathBuf>,
}

impl LaunchSpec {
    /// Build the command: scrubbed environment, null stdin, piped output,
    /// and a fresh process group so the whole tree can be signalled at once.
    pub fn command(&self) -> io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.current_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let procs = match &self.join_cgroup {
            Some(path) => Some(CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "cgroup path contains NUL")
            })?),
            None => None,
        };
        let rlimits = self.rlimits.clone();

        // SAFETY: the closure runs in the forked child and only performs
        // async-signal-safe calls (open, write, close, setrlimit) on data
        // prepared before the fork.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(procs) = &procs {
                    join_cgroup(procs)?;
                }
                apply_rlimits(&rlimits)
            });
        }

        Ok(cmd)
    }
}

fn join_cgroup(procs: &CString) -> io::Result<()> {
    // SAFETY: plain syscalls on a valid NUL-terminated path and a static buffer.
    unsafe {
        let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Writing "0" moves the writing process itself.
        let written = libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1);
        let err = io::Error::last_os_error();
        libc::close(fd);
        if written != 1 {
            return Err(err);
        }
    }
    Ok(())
}

fn apply_rlimits(limits: &[Rlimit]) -> io::Result<()> {
    for limit in limits {
        let value = libc::rlimit {
            rlim_cur: limit.value as libc::rlim_t,
            rlim_max: limit.value as libc::rlim_t,
        };
        // SAFETY: setrlimit only reads the struct we pass.
        let rc = unsafe {
            match limit.resource {
                RlimitResource::AddressSpace => libc::setrlimit(libc::RLIMIT_AS, &value),
                RlimitResource::CpuTime => libc::setrlimit(libc::RLIMIT_CPU, &value),
                RlimitResource::FileSize => libc::setrlimit(libc::RLIMIT_FSIZE, &value),
                RlimitResource::Core => libc::setrlimit(libc::RLIMIT_CORE, &value),
                RlimitResource::OpenFiles => libc::setrlimit(libc::RLIMIT_NOFILE, &value),
            }
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
