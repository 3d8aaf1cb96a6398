use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunletConfig {
    pub sandbox: SandboxConfig,
    pub limits: LimitsConfig,
    pub provision: ProvisionConfig,
    pub supervisor: SupervisorConfig,
    pub stream: StreamConfig,
    pub registry: RegistryConfig,
    pub server: ServerConfig,
}

/// The type of isolation backend to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Linux namespaces via bubblewrap
    Bubblewrap,
    /// Docker container sandbox
    Docker,
    /// Plain child process with rlimits only (no namespace isolation)
    Process,
    /// Automatically select the best available backend
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Which backend to use
    pub backend: BackendType,
    /// Directory holding per-execution sandbox roots (defaults to the data dir)
    pub root_dir: Option<PathBuf>,
    /// Maximum number of sandboxes alive at the same time
    pub max_concurrent: usize,
    /// Let `auto` fall back to the unisolated process backend
    pub allow_unisolated: bool,
    /// Bubblewrap-specific configuration
    pub bubblewrap: BubblewrapConfig,
    /// Docker-specific configuration
    pub docker: DockerConfig,
    /// Cgroup v2 configuration for native backends
    pub cgroup: CgroupConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            root_dir: None,
            max_concurrent: 64,
            allow_unisolated: false,
            bubblewrap: BubblewrapConfig::default(),
            docker: DockerConfig::default(),
            cgroup: CgroupConfig::default(),
        }
    }
}

/// Bubblewrap-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BubblewrapConfig {
    /// Path to the bwrap binary (looked up on PATH if not set)
    pub binary_path: Option<PathBuf>,
    /// Host directories bound read-only into every sandbox
    pub ro_binds: Vec<PathBuf>,
    /// Enable networking inside the sandbox
    pub enable_networking: bool,
}

impl Default for BubblewrapConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            ro_binds: ["/usr", "/bin", "/lib", "/lib64", "/sbin", "/etc/alternatives"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            enable_networking: false,
        }
    }
}

/// Docker-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image override per language id (python, nodejs, shell)
    pub images: HashMap<String, String>,
    /// Enable networking in the container (default: false)
    pub enable_networking: bool,
    /// CPU quota passed as --cpus
    pub cpus: Option<f32>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            images: HashMap::new(),
            enable_networking: false,
            cpus: Some(1.0),
        }
    }
}

/// Cgroup v2 configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// Use cgroups when the hierarchy is writable
    pub enabled: bool,
    /// Parent cgroup under which per-execution groups are created
    pub root: PathBuf,
    /// CPU share per sandbox in percent of one core (None = unlimited)
    pub cpu_percent: Option<u32>,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("/sys/fs/cgroup/runlet"),
            cpu_percent: Some(100),
        }
    }
}

/// Bounds applied to every submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub default_memory_mb: u64,
    pub memory_ceiling_mb: u64,
    /// Total stdout + stderr bytes before the process is killed
    pub max_output_bytes: u64,
    /// Largest accepted source payload
    pub max_code_bytes: usize,
    /// Largest file the program may write (RLIMIT_FSIZE)
    pub max_file_bytes: u64,
    /// Maximum number of tasks inside one sandbox
    pub max_pids: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 5,
            max_timeout_seconds: 60,
            default_memory_mb: 128,
            memory_ceiling_mb: 1024,
            max_output_bytes: 1024 * 1024,
            max_code_bytes: 256 * 1024,
            max_file_bytes: 16 * 1024 * 1024,
            max_pids: 64,
        }
    }
}

/// Retry policy for `ResourceExhausted` provisioning failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Size of a single read from the child's pipes
    pub read_chunk_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            read_chunk_bytes: 8 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-subscriber queue depth before the subscriber is dropped
    pub subscriber_queue: usize,
    /// Number of events kept for replay
    pub replay_events: usize,
    /// Payload bytes kept for replay
    pub replay_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: 256,
            replay_events: 1024,
            replay_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long terminal executions stay queryable
    pub retention_seconds: u64,
    /// Upper bound on retained terminal executions
    pub max_retained: usize,
    /// Interval of the orphan/retention sweep
    pub sweep_interval_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 300,
            max_retained: 10_000,
            sweep_interval_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".to_string(),
        }
    }
}
