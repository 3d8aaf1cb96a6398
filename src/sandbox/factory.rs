use std::sync::Arc;

use tracing::warn;

use crate::config::types::{BackendType, SandboxConfig};
use crate::error::{Result, RunletError};
use crate::sandbox::backends::{BubblewrapBackend, ProcessBackend};
use crate::sandbox::traits::IsolationBackend;

#[cfg(feature = "docker")]
use crate::sandbox::backends::DockerBackend;

/// Create an isolation backend based on the configuration.
///
/// This factory function selects and instantiates the appropriate backend
/// based on the configured backend type and platform availability.
pub fn create_backend(config: &SandboxConfig) -> Result<Arc<dyn IsolationBackend>> {
    let backend_type = resolve_backend_type(config)?;

    match backend_type {
        BackendType::Bubblewrap => Ok(Arc::new(BubblewrapBackend::new(
            config.bubblewrap.clone(),
        )?)),

        #[cfg(feature = "docker")]
        BackendType::Docker => Ok(Arc::new(DockerBackend::new(config.docker.clone())?)),
        #[cfg(not(feature = "docker"))]
        BackendType::Docker => Err(RunletError::BackendNotAvailable {
            backend: "docker".to_string(),
            reason: "Docker support was not compiled in. Rebuild with --features docker"
                .to_string(),
        }),

        BackendType::Process => {
            warn!("Using the process backend: executions are NOT isolated from the host");
            Ok(Arc::new(ProcessBackend::new()))
        }

        BackendType::Auto => Err(RunletError::Config(
            "backend type 'auto' was not resolved".to_string(),
        )),
    }
}

/// Resolve the backend type, handling Auto selection.
fn resolve_backend_type(config: &SandboxConfig) -> Result<BackendType> {
    match config.backend {
        BackendType::Auto => {
            // Priority: bubblewrap > Docker > process (only when explicitly allowed)
            if BubblewrapBackend::is_available() {
                return Ok(BackendType::Bubblewrap);
            }

            if docker_available() {
                return Ok(BackendType::Docker);
            }

            if config.allow_unisolated {
                return Ok(BackendType::Process);
            }

            Err(RunletError::BackendNotAvailable {
                backend: "auto".to_string(),
                reason: "No isolating backend available (install bubblewrap or Docker, \
                         or set sandbox.allow_unisolated = true)"
                    .to_string(),
            })
        }
        BackendType::Bubblewrap => {
            if !BubblewrapBackend::is_available() && config.bubblewrap.binary_path.is_none() {
                return Err(RunletError::BackendNotAvailable {
                    backend: "bubblewrap".to_string(),
                    reason: "bwrap is not installed or cannot create user namespaces".to_string(),
                });
            }
            Ok(BackendType::Bubblewrap)
        }
        BackendType::Docker => {
            if !docker_available() {
                return Err(RunletError::BackendNotAvailable {
                    backend: "docker".to_string(),
                    reason: "Docker daemon is not accessible. Ensure Docker is installed and running."
                        .to_string(),
                });
            }
            Ok(BackendType::Docker)
        }
        BackendType::Process => Ok(BackendType::Process),
    }
}

#[cfg(feature = "docker")]
fn docker_available() -> bool {
    DockerBackend::is_available()
}

#[cfg(not(feature = "docker"))]
fn docker_available() -> bool {
    false
}

/// Get information about available backends on this system.
pub fn available_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    let bwrap = BubblewrapBackend::is_available();
    backends.push(BackendInfo {
        name: "bubblewrap",
        available: bwrap,
        description: "Linux namespace sandbox (bwrap)",
        unavailable_reason: if bwrap {
            None
        } else {
            Some("bwrap not installed or user namespaces disabled")
        },
    });

    #[cfg(feature = "docker")]
    {
        let docker = DockerBackend::is_available();
        backends.push(BackendInfo {
            name: "docker",
            available: docker,
            description: "Docker container sandbox",
            unavailable_reason: if docker {
                None
            } else {
                Some("Docker daemon not accessible")
            },
        });
    }

    #[cfg(not(feature = "docker"))]
    {
        backends.push(BackendInfo {
            name: "docker",
            available: false,
            description: "Docker container sandbox",
            unavailable_reason: Some("Not compiled in (use --features docker)"),
        });
    }

    backends.push(BackendInfo {
        name: "process",
        available: ProcessBackend::is_available(),
        description: "Unisolated child process with rlimits (development only)",
        unavailable_reason: None,
    });

    backends
}

/// Information about a sandbox backend.
pub struct BackendInfo {
    pub name: &'static str,
    pub available: bool,
    pub description: &'static str,
    pub unavailable_reason: Option<&'static str>,
}
