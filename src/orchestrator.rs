//! Wires provisioner, supervisor, registry, and gateway together and owns
//! one driver task per execution.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::sandbox_root;
use crate::config::types::{LimitsConfig, ProvisionConfig, RunletConfig};
use crate::error::{GatewayError, ProvisionError, RegistryError, Result, ValidationError};
use crate::execution::{Execution, ExecutionId, ExecutionRequest, ExecutionState, KillReason};
use crate::gateway::Gateway;
use crate::registry::{ExecutionHandle, Registry, Transition};
use crate::sandbox::{
    create_backend, IsolationBackend, Language, Provisioner, Sandbox, SandboxRequest,
};
use crate::stream::{StreamKind, Subscription};
use crate::supervisor::{Control, OutputSink, Supervisor, SupervisorOutcome};

/// A submission as received from a client. Missing fields take defaults
/// from `[limits]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, rename = "timeout")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, rename = "memory")]
    pub memory_mb: Option<u64>,
}

impl SubmitRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            language: Some(language.into()),
            ..Self::default()
        }
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn memory(mut self, mb: u64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    /// Check the request against the configured bounds without allocating anything.
    pub fn validate(&self, limits: &LimitsConfig) -> std::result::Result<ExecutionRequest, ValidationError> {
        let code = match self.code.as_deref() {
            Some(code) if !code.trim().is_empty() => code,
            _ => return Err(ValidationError::MissingField { field: "code" }),
        };
        let language = match self.language.as_deref() {
            Some(lang) if !lang.trim().is_empty() => lang,
            _ => return Err(ValidationError::MissingField { field: "language" }),
        };

        let language =
            Language::parse(language).ok_or_else(|| ValidationError::UnsupportedLanguage {
                language: language.to_string(),
            })?;

        if code.len() > limits.max_code_bytes {
            return Err(ValidationError::CodeTooLarge {
                max: limits.max_code_bytes,
            });
        }

        let timeout_seconds = self.timeout_seconds.unwrap_or(limits.default_timeout_seconds);
        if timeout_seconds == 0 || timeout_seconds > limits.max_timeout_seconds {
            return Err(ValidationError::Timeout {
                value: timeout_seconds,
                max: limits.max_timeout_seconds,
            });
        }

        let memory_mb = self.memory_mb.unwrap_or(limits.default_memory_mb);
        if memory_mb == 0 || memory_mb > limits.memory_ceiling_mb {
            return Err(ValidationError::Memory {
                value: memory_mb,
                max: limits.memory_ceiling_mb,
            });
        }

        Ok(ExecutionRequest {
            language,
            code: code.to_string(),
            timeout_seconds,
            memory_mb,
        })
    }
}

/// Entry point for submitting, observing, and cancelling executions.
pub struct Orchestrator {
    config: RunletConfig,
    registry: Arc<Registry>,
    gateway: Gateway,
    driver: Arc<Driver>,
    background: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Create an orchestrator using the backend selected by the configuration.
    pub async fn new(config: RunletConfig) -> Result<Self> {
        let backend = create_backend(&config.sandbox)?;
        Self::with_backend(config, backend).await
    }

    pub async fn with_backend(
        config: RunletConfig,
        backend: Arc<dyn IsolationBackend>,
    ) -> Result<Self> {
        if !backend.health_check().await {
            warn!(backend = backend.name(), "Backend health check failed");
        }

        let provisioner = Provisioner::new(backend, &config, sandbox_root(&config))?;
        provisioner.recover().await;

        let (registry, teardown) = Registry::new(config.registry.clone(), config.stream.clone());
        let reaper = tokio::spawn(teardown.run());

        let sweeper = {
            let registry = registry.clone();
            let every = Duration::from_secs(config.registry.sweep_interval_seconds.max(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let report = registry.sweep();
                    if report.orphaned > 0 || report.purged > 0 {
                        debug!(
                            orphaned = report.orphaned,
                            killed = report.killed,
                            purged = report.purged,
                            "Sweep"
                        );
                    }
                }
            })
        };

        let driver = Arc::new(Driver {
            registry: registry.clone(),
            provisioner,
            supervisor: Supervisor::new(&config.supervisor),
            provision: config.provision.clone(),
            max_output_bytes: config.limits.max_output_bytes,
        });

        info!(
            backend = driver.provisioner.backend().name(),
            cgroups = driver.provisioner.cgroups_enabled(),
            "Orchestrator ready"
        );

        Ok(Self {
            gateway: Gateway::new(registry.clone()),
            config,
            registry,
            driver,
            background: vec![reaper, sweeper],
        })
    }

    pub fn config(&self) -> &RunletConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.driver.provisioner.backend().name()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Number of sandboxes currently allocated.
    pub fn active_sandboxes(&self) -> usize {
        self.driver.provisioner.active()
    }

    /// Validate and start an execution. Returns as soon as the execution is
    /// registered; every later failure is reported on its event stream.
    pub fn submit(&self, request: SubmitRequest) -> std::result::Result<ExecutionId, ValidationError> {
        let request = request.validate(&self.config.limits)?;
        let handle = self.registry.create(&request);
        let id = handle.id.clone();

        info!(
            execution_id = %id,
            language = %request.language,
            timeout_seconds = request.timeout_seconds,
            memory_mb = request.memory_mb,
            "Execution submitted"
        );

        self.spawn_driver(handle, request);
        Ok(id)
    }

    fn spawn_driver(&self, handle: ExecutionHandle, request: ExecutionRequest) {
        let id = handle.id.clone();
        let driver = self.driver.clone();
        let task = tokio::spawn(async move { driver.drive(handle, request).await });

        // A panic is confined to its own execution.
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(execution_id = %id, "Execution driver panicked");
                    let _ = registry.transition(
                        &id,
                        ExecutionState::Failed {
                            message: "internal fault".to_string(),
                        },
                    );
                }
            }
        });
    }

    pub fn cancel(&self, id: &ExecutionId) -> std::result::Result<bool, RegistryError> {
        self.registry.cancel(id)
    }

    pub fn subscribe(
        &self,
        id: &ExecutionId,
        since: Option<u64>,
    ) -> std::result::Result<Subscription, GatewayError> {
        self.gateway.subscribe(id, since)
    }

    pub fn status(&self, id: &ExecutionId) -> std::result::Result<Execution, RegistryError> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<Execution> {
        self.registry.list()
    }

    /// Cancel everything still running and wait up to `grace` for the
    /// sandboxes to be released.
    pub async fn shutdown(&self, grace: Duration) {
        let cancelled = self.registry.cancel_all();
        info!(cancelled, "Shutting down");

        let deadline = tokio::time::Instant::now() + grace;
        while self.active_sandboxes() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let leftover = self.active_sandboxes();
        if leftover > 0 {
            warn!(leftover, "Sandboxes still allocated at shutdown");
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

/// Shared state of the per-execution driver tasks.
struct Driver {
    registry: Arc<Registry>,
    provisioner: Provisioner,
    supervisor: Supervisor,
    provision: ProvisionConfig,
    max_output_bytes: u64,
}

/// Clears the registry's liveness flag when the driver ends, including by panic.
struct DriverGuard<'a> {
    registry: &'a Registry,
    id: &'a ExecutionId,
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        self.registry.set_driver_alive(self.id, false);
    }
}

impl Driver {
    async fn drive(&self, handle: ExecutionHandle, request: ExecutionRequest) {
        let ExecutionHandle { id, mut control } = handle;
        let _guard = DriverGuard {
            registry: &self.registry,
            id: &id,
        };

        if !matches!(
            self.registry.transition(&id, ExecutionState::Provisioning),
            Ok(Transition::Applied)
        ) {
            return;
        }

        let mut sandbox = match self.provision(&id, &request, &mut control).await {
            Ok(Some(sandbox)) => sandbox,
            Ok(None) => {
                self.finish(
                    &id,
                    ExecutionState::Killed {
                        reason: KillReason::Cancelled,
                    },
                );
                return;
            }
            Err(e) => {
                warn!(execution_id = %id, error = %e, "Provisioning failed");
                self.finish(
                    &id,
                    ExecutionState::Failed {
                        message: e.to_string(),
                    },
                );
                return;
            }
        };

        if let Some(lease) = sandbox.take_lease() {
            match self.registry.attach_sandbox(&id, sandbox.backend_name(), lease) {
                Ok(true) => {}
                // Ended while provisioning; the lease is already being released.
                _ => return,
            }
        }

        let sink = ExecutionSink {
            registry: &self.registry,
            id: &id,
            max_output_bytes: self.max_output_bytes,
        };
        let timeout = Duration::from_secs(request.timeout_seconds);
        let outcome = self
            .supervisor
            .run(&sandbox, timeout, &mut control, &sink)
            .await;

        let state = match outcome {
            SupervisorOutcome::Exited { code } => ExecutionState::Completed { exit_code: code },
            SupervisorOutcome::TimedOut => ExecutionState::TimedOut,
            SupervisorOutcome::Cancelled => ExecutionState::Killed {
                reason: KillReason::Cancelled,
            },
            SupervisorOutcome::OutputLimit => ExecutionState::Killed {
                reason: KillReason::OutputLimit,
            },
            SupervisorOutcome::MemoryLimit => ExecutionState::Killed {
                reason: KillReason::MemoryLimit,
            },
            SupervisorOutcome::LaunchFailed(message) => ExecutionState::LaunchFailed { message },
        };
        self.finish(&id, state);
    }

    fn finish(&self, id: &ExecutionId, state: ExecutionState) {
        if let Err(e) = self.registry.transition(id, state) {
            warn!(execution_id = %id, error = %e, "Failed to record final state");
        }
    }

    /// Provision with exponential backoff on resource exhaustion.
    /// Returns `Ok(None)` if cancelled while waiting.
    async fn provision(
        &self,
        id: &ExecutionId,
        request: &ExecutionRequest,
        control: &mut mpsc::Receiver<Control>,
    ) -> std::result::Result<Option<Sandbox>, ProvisionError> {
        let language = request.language.id();
        let sandbox_request = SandboxRequest {
            execution_id: id,
            language,
            code: &request.code,
            memory_mb: request.memory_mb,
            timeout: Duration::from_secs(request.timeout_seconds),
        };

        let max_attempts = self.provision.max_attempts.max(1);
        let max_backoff = Duration::from_millis(self.provision.max_backoff_ms);
        let mut backoff = Duration::from_millis(self.provision.initial_backoff_ms);
        let mut attempt = 1;

        loop {
            match self.provisioner.provision(&sandbox_request).await {
                Ok(sandbox) => return Ok(Some(sandbox)),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    debug!(
                        execution_id = %id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Provisioning deferred"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        Some(Control::Cancel) = control.recv() => return Ok(None),
                    }
                    backoff = (backoff * 2).min(max_backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Forwards supervisor observations into the registry.
struct ExecutionSink<'a> {
    registry: &'a Registry,
    id: &'a ExecutionId,
    max_output_bytes: u64,
}

impl OutputSink for ExecutionSink<'_> {
    fn started(&self, pid: u32) {
        if let Err(e) = self.registry.mark_running(self.id, pid) {
            warn!(execution_id = %self.id, error = %e, "Failed to record start");
        }
    }

    fn output(&self, stream: StreamKind, text: String) -> bool {
        match self.registry.publish_output(self.id, stream, text) {
            Ok(total) if total > self.max_output_bytes => {
                warn!(
                    execution_id = %self.id,
                    total,
                    limit = self.max_output_bytes,
                    "Output limit exceeded"
                );
                false
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }
}
