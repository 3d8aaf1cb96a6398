//! Authoritative store of execution records.
//!
//! Every state change goes through [`Registry::transition`], which enforces
//! forward-only moves and makes terminal transitions idempotent: the first
//! terminal state wins, publishes the single terminal event, and hands the
//! sandbox to the teardown queue. Later terminal signals are ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::types::{RegistryConfig, StreamConfig};
use crate::error::RegistryError;
use crate::execution::{Execution, ExecutionId, ExecutionRequest, ExecutionState, KillReason};
use crate::sandbox::{Language, SandboxLease};
use crate::stream::{Completion, EventKind, ExecutionChannel, StreamKind, Subscription};
use crate::supervisor::Control;

/// Whether a transition changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The execution had already ended; nothing changed and nothing was published.
    Ignored,
}

/// Returned by [`Registry::create`] to the task that will drive the execution.
pub struct ExecutionHandle {
    pub id: ExecutionId,
    pub control: mpsc::Receiver<Control>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub orphaned: usize,
    /// Orphaned process groups that were still alive and got killed.
    pub killed: usize,
    pub purged: usize,
}

struct Entry {
    record: Mutex<Record>,
    channel: ExecutionChannel,
    control: mpsc::Sender<Control>,
    driver_alive: AtomicBool,
}

impl Entry {
    fn lock(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Record {
    language: Language,
    timeout_seconds: u64,
    memory_mb: u64,
    state: ExecutionState,
    created_at: DateTime<Utc>,
    created: Instant,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    finished_at: Option<DateTime<Utc>>,
    finished: Option<Instant>,
    output_bytes: u64,
    backend: Option<String>,
    lease: Option<SandboxLease>,
}

impl Record {
    fn snapshot(&self, id: &ExecutionId) -> Execution {
        Execution {
            id: id.clone(),
            language: self.language,
            timeout_seconds: self.timeout_seconds,
            memory_mb: self.memory_mb,
            state: self.state.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.state.exit_code(),
            output_bytes: self.output_bytes,
            backend: self.backend.clone(),
        }
    }

    /// Time the program ran, or time since submission if it never started.
    fn execution_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started.unwrap_or(self.created))
    }
}

pub struct Registry {
    config: RegistryConfig,
    stream: StreamConfig,
    entries: RwLock<HashMap<ExecutionId, Arc<Entry>>>,
    reaper: mpsc::UnboundedSender<SandboxLease>,
}

impl Registry {
    pub fn new(config: RegistryConfig, stream: StreamConfig) -> (Arc<Self>, TeardownQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            config,
            stream,
            entries: RwLock::new(HashMap::new()),
            reaper: tx,
        });
        (registry, TeardownQueue { rx })
    }

    fn entry(&self, id: &ExecutionId) -> Result<Arc<Entry>, RegistryError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                id: id.to_string(),
            })
    }

    fn all(&self) -> Vec<(ExecutionId, Arc<Entry>)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }

    /// Register a new execution in `Pending`.
    pub fn create(&self, request: &ExecutionRequest) -> ExecutionHandle {
        let id = ExecutionId::generate();
        let (control_tx, control_rx) = mpsc::channel(1);
        let entry = Arc::new(Entry {
            record: Mutex::new(Record {
                language: request.language,
                timeout_seconds: request.timeout_seconds,
                memory_mb: request.memory_mb,
                state: ExecutionState::Pending,
                created_at: Utc::now(),
                created: Instant::now(),
                started_at: None,
                started: None,
                finished_at: None,
                finished: None,
                output_bytes: 0,
                backend: None,
                lease: None,
            }),
            channel: ExecutionChannel::new(id.clone(), self.stream.clone()),
            control: control_tx,
            driver_alive: AtomicBool::new(true),
        });

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), entry);

        debug!(execution_id = %id, language = %request.language, "Execution registered");
        ExecutionHandle {
            id,
            control: control_rx,
        }
    }

    pub fn get(&self, id: &ExecutionId) -> Result<Execution, RegistryError> {
        Ok(self.entry(id)?.lock().snapshot(id))
    }

    /// Snapshots of every retained execution, oldest first.
    pub fn list(&self) -> Vec<Execution> {
        let mut all: Vec<Execution> = self
            .all()
            .iter()
            .map(|(id, entry)| entry.lock().snapshot(id))
            .collect();
        all.sort_by_key(|e| e.created_at);
        all
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(
        &self,
        id: &ExecutionId,
        since: Option<u64>,
    ) -> Result<Subscription, RegistryError> {
        Ok(self.entry(id)?.channel.subscribe(since))
    }

    /// Move an execution to `next`.
    ///
    /// Terminal executions ignore every transition. A terminal transition
    /// publishes the terminal event and schedules sandbox teardown.
    pub fn transition(
        &self,
        id: &ExecutionId,
        next: ExecutionState,
    ) -> Result<Transition, RegistryError> {
        let entry = self.entry(id)?;
        self.apply(id, &entry, next, |_| {})
    }

    /// Record a successful spawn.
    pub fn mark_running(&self, id: &ExecutionId, pid: u32) -> Result<Transition, RegistryError> {
        let entry = self.entry(id)?;
        self.apply(id, &entry, ExecutionState::Running { pid }, |record| {
            record.started_at = Some(Utc::now());
            record.started = Some(Instant::now());
            if let Some(lease) = record.lease.as_mut() {
                lease.set_pgid(pid);
            }
        })
    }

    fn apply(
        &self,
        id: &ExecutionId,
        entry: &Entry,
        next: ExecutionState,
        on_apply: impl FnOnce(&mut Record),
    ) -> Result<Transition, RegistryError> {
        let mut record = entry.lock();

        if record.state.is_terminal() {
            debug!(
                execution_id = %id,
                state = record.state.name(),
                ignored = next.name(),
                "Transition ignored, execution already ended"
            );
            return Ok(Transition::Ignored);
        }

        if !record.state.can_advance_to(&next) {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: record.state.name(),
                to: next.name(),
            });
        }

        debug!(execution_id = %id, from = record.state.name(), to = next.name(), "Transition");
        record.state = next;
        on_apply(&mut record);

        if !record.state.is_terminal() {
            return Ok(Transition::Applied);
        }

        let now = Instant::now();
        record.finished = Some(now);
        record.finished_at = Some(Utc::now());
        let elapsed_ms = record.execution_time(now).as_millis() as u64;
        let lease = record.lease.take();

        if let Some(completion) = Completion::from_state(&record.state, elapsed_ms) {
            info!(
                execution_id = %id,
                status = ?completion.status,
                exit_code = ?completion.exit_code,
                execution_time_ms = elapsed_ms,
                output_bytes = record.output_bytes,
                "Execution finished"
            );
            entry.channel.publish(EventKind::Terminal(completion));
        }
        drop(record);

        if let Some(lease) = lease {
            self.reap(lease);
        }
        Ok(Transition::Applied)
    }

    fn reap(&self, lease: SandboxLease) {
        if let Err(err) = self.reaper.send(lease) {
            // Queue gone (shutdown): release inline.
            let lease = err.0;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(lease.teardown());
            }
        }
    }

    /// Hand the sandbox's resources to the record. If the execution already
    /// ended, they are released immediately and `false` is returned.
    pub fn attach_sandbox(
        &self,
        id: &ExecutionId,
        backend: &str,
        lease: SandboxLease,
    ) -> Result<bool, RegistryError> {
        let entry = self.entry(id)?;
        let mut record = entry.lock();
        record.backend = Some(backend.to_string());
        if record.state.is_terminal() {
            drop(record);
            self.reap(lease);
            return Ok(false);
        }
        record.lease = Some(lease);
        Ok(true)
    }

    /// Publish an output chunk and return the execution's total output bytes.
    /// Output after the terminal event is discarded.
    pub fn publish_output(
        &self,
        id: &ExecutionId,
        stream: StreamKind,
        text: String,
    ) -> Result<u64, RegistryError> {
        let entry = self.entry(id)?;
        let mut record = entry.lock();
        if record.state.is_terminal() {
            return Ok(record.output_bytes);
        }
        record.output_bytes += text.len() as u64;
        entry.channel.publish(EventKind::output(stream, text));
        Ok(record.output_bytes)
    }

    /// Request cancellation. Returns `false` if the execution already ended.
    pub fn cancel(&self, id: &ExecutionId) -> Result<bool, RegistryError> {
        let entry = self.entry(id)?;
        if entry.lock().state.is_terminal() {
            return Ok(false);
        }

        match entry.control.try_send(Control::Cancel) {
            // A full queue already holds a cancel.
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {
                info!(execution_id = %id, "Cancellation requested");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // No driver left to act on it.
                self.apply(
                    id,
                    &entry,
                    ExecutionState::Killed {
                        reason: KillReason::Cancelled,
                    },
                    |_| {},
                )?;
            }
        }
        Ok(true)
    }

    pub fn set_driver_alive(&self, id: &ExecutionId, alive: bool) {
        if let Ok(entry) = self.entry(id) {
            entry.driver_alive.store(alive, Ordering::SeqCst);
        }
    }

    /// Reconcile records with reality and drop expired ones.
    ///
    /// Live executions whose driver is gone become `Killed(Orphaned)`.
    /// Terminal executions are kept for the retention period, and at most
    /// `max_retained` of them are kept at all.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let retention = Duration::from_secs(self.config.retention_seconds);
        let now = Instant::now();

        let mut finished: Vec<(Instant, ExecutionId)> = Vec::new();
        let mut expired: Vec<ExecutionId> = Vec::new();

        for (id, entry) in self.all() {
            let (terminal, finished_at, pid) = {
                let record = entry.lock();
                let pid = match record.state {
                    ExecutionState::Running { pid } => Some(pid),
                    _ => None,
                };
                (record.state.is_terminal(), record.finished, pid)
            };

            if !terminal {
                if !entry.driver_alive.load(Ordering::SeqCst) {
                    let alive = pid.filter(|pid| process_exists(*pid));
                    warn!(
                        execution_id = %id,
                        pid = ?pid,
                        process_alive = alive.is_some(),
                        "Driver gone, marking execution orphaned"
                    );
                    // Nothing supervises the group any more.
                    if let Some(pid) = alive {
                        if kill_process_group(pid) {
                            report.killed += 1;
                        }
                    }
                    let orphaned = ExecutionState::Killed {
                        reason: KillReason::Orphaned,
                    };
                    if let Ok(Transition::Applied) = self.apply(&id, &entry, orphaned, |_| {}) {
                        report.orphaned += 1;
                    }
                }
                continue;
            }

            match finished_at {
                Some(at) if now.saturating_duration_since(at) >= retention => expired.push(id),
                Some(at) => finished.push((at, id)),
                None => {}
            }
        }

        if finished.len() > self.config.max_retained {
            finished.sort_by_key(|(at, _)| *at);
            let excess = finished.len() - self.config.max_retained;
            expired.extend(finished.into_iter().take(excess).map(|(_, id)| id));
        }

        if !expired.is_empty() {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            for id in &expired {
                entries.remove(id);
            }
            report.purged = expired.len();
            debug!(purged = report.purged, remaining = entries.len(), "Purged finished executions");
        }

        report
    }

    /// Request cancellation of every live execution. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        self.all()
            .iter()
            .filter(|(id, _)| matches!(self.cancel(id), Ok(true)))
            .count()
    }
}

fn process_exists(pid: u32) -> bool {
    match i32::try_from(pid) {
        // SAFETY: signal 0 performs only the existence and permission check.
        Ok(pid) => unsafe { libc::kill(pid, 0) == 0 },
        Err(_) => false,
    }
}

/// The supervised child leads its own process group, so its pid is the pgid.
fn kill_process_group(pgid: u32) -> bool {
    match i32::try_from(pgid) {
        // SAFETY: plain kill(2) on a negated pgid.
        Ok(pgid) if pgid > 0 => unsafe { libc::kill(-pgid, libc::SIGKILL) == 0 },
        _ => false,
    }
}

/// Consumer side of the teardown queue. Runs until the registry is dropped.
pub struct TeardownQueue {
    rx: mpsc::UnboundedReceiver<SandboxLease>,
}

impl TeardownQueue {
    pub async fn run(mut self) {
        let mut running = JoinSet::new();
        loop {
            tokio::select! {
                Some(lease) = self.rx.recv() => {
                    debug!(execution_id = %lease.execution_id(), "Teardown scheduled");
                    running.spawn(lease.teardown());
                }
                Some(result) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Teardown task failed");
                    }
                }
                else => break,
            }
        }
        debug!("Teardown queue closed");
    }
}
