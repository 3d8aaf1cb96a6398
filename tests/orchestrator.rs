use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use runlet::config::types::RunletConfig;
use runlet::error::{GatewayError, ValidationError};
use runlet::registry::Transition;
use runlet::sandbox::backends::ProcessBackend;
use runlet::{
    Completion, Event, EventKind, ExecutionId, ExecutionState, KillReason, Orchestrator,
    SubmitRequest, TerminalStatus,
};

fn config(dir: &Path) -> RunletConfig {
    let mut config = RunletConfig::default();
    config.sandbox.root_dir = Some(dir.to_path_buf());
    config.sandbox.cgroup.enabled = false;
    config.sandbox.max_concurrent = 128;
    config
}

async fn start(config: RunletConfig) -> Orchestrator {
    Orchestrator::with_backend(config, Arc::new(ProcessBackend::new()))
        .await
        .unwrap()
}

async fn orchestrator(dir: &Path) -> Orchestrator {
    start(config(dir)).await
}

/// An orchestrator with a single sandbox slot and the given retry policy.
async fn single_slot(dir: &Path, max_attempts: u32) -> Orchestrator {
    let mut config = config(dir);
    config.sandbox.max_concurrent = 1;
    config.provision.max_attempts = max_attempts;
    config.provision.initial_backoff_ms = 10;
    config.provision.max_backoff_ms = 50;
    start(config).await
}

/// Collect every event from the start of the stream through the terminal event.
async fn events(orchestrator: &Orchestrator, id: &ExecutionId) -> Vec<Arc<Event>> {
    let mut subscription = orchestrator.subscribe(id, Some(0)).unwrap();
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(event) = subscription.next().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("stream did not terminate");
    events
}

fn stdout(events: &[Arc<Event>]) -> String {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Stdout(s) => Some(s.as_str()),
            _ => None,
        })
        .collect()
}

fn stderr(events: &[Arc<Event>]) -> String {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Stderr(s) => Some(s.as_str()),
            _ => None,
        })
        .collect()
}

fn completion(events: &[Arc<Event>]) -> Completion {
    let last = events.last().expect("no events");
    last.completion().expect("last event is not terminal").clone()
}

async fn wait_for_running(orchestrator: &Orchestrator, id: &ExecutionId) {
    for _ in 0..200 {
        if matches!(orchestrator.status(id).unwrap().state, ExecutionState::Running { .. }) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution never started running");
}

async fn wait_for_release(orchestrator: &Orchestrator) {
    for _ in 0..500 {
        if orchestrator.active_sandboxes() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sandboxes were not released");
}

#[tokio::test]
async fn test_streams_output_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let id = o
        .submit(SubmitRequest::new(
            "shell",
            "echo one\necho two >&2\necho three",
        ))
        .unwrap();
    let events = events(&o, &id).await;

    assert_eq!(stdout(&events), "one\nthree\n");
    assert_eq!(stderr(&events), "two\n");

    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{:?}", seqs);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let done = completion(&events);
    assert_eq!(done.status, TerminalStatus::Success);
    assert_eq!(done.exit_code, Some(0));
}

#[tokio::test]
async fn test_subscribers_see_the_same_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let id = o
        .submit(SubmitRequest::new(
            "shell",
            "for i in 1 2 3 4 5; do echo line$i; sleep 0.01; done",
        ))
        .unwrap();

    let (a, b) = tokio::join!(events(&o, &id), events(&o, &id));
    let a: Vec<(u64, EventKind)> = a.iter().map(|e| (e.seq, e.kind.clone())).collect();
    let b: Vec<(u64, EventKind)> = b.iter().map(|e| (e.seq, e.kind.clone())).collect();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_late_subscriber_replays_and_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let id = o.submit(SubmitRequest::new("shell", "echo hi")).unwrap();
    let first = events(&o, &id).await;
    let replayed = events(&o, &id).await;

    assert_eq!(stdout(&replayed), "hi\n");
    assert_eq!(completion(&first), completion(&replayed));
}

#[tokio::test]
async fn test_nonzero_exit_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let id = o
        .submit(SubmitRequest::new("shell", "echo bad >&2; exit 3"))
        .unwrap();
    let events = events(&o, &id).await;

    assert_eq!(stderr(&events), "bad\n");
    let done = completion(&events);
    assert_eq!(done.status, TerminalStatus::Error);
    assert_eq!(done.exit_code, Some(3));

    let status = o.status(&id).unwrap();
    assert_eq!(status.exit_code, Some(3));
    assert!(status.finished_at.is_some());
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let started = Instant::now();
    let id = o
        .submit(SubmitRequest::new("shell", "while true; do :; done").timeout(1))
        .unwrap();
    let events = events(&o, &id).await;
    let elapsed = started.elapsed();

    let done = completion(&events);
    assert_eq!(done.status, TerminalStatus::Timeout);
    assert!(done.execution_time_ms >= 900, "{}", done.execution_time_ms);
    assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
    assert_eq!(o.status(&id).unwrap().state, ExecutionState::TimedOut);
}

#[tokio::test]
async fn test_cancel_running_execution() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let id = o
        .submit(SubmitRequest::new("shell", "sleep 30").timeout(30))
        .unwrap();
    wait_for_running(&o, &id).await;

    let started = Instant::now();
    assert!(o.cancel(&id).unwrap());
    let events = events(&o, &id).await;

    let done = completion(&events);
    assert_eq!(done.status, TerminalStatus::Killed);
    assert_eq!(done.reason, Some(KillReason::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));

    // A second cancel is a no-op.
    assert!(!o.cancel(&id).unwrap());
}

#[tokio::test]
async fn test_unknown_execution() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let missing = ExecutionId::from("does-not-exist");
    assert!(matches!(
        o.subscribe(&missing, None),
        Err(GatewayError::NotFound { .. })
    ));
    assert!(o.status(&missing).is_err());
    assert!(o.cancel(&missing).is_err());
    assert!(o.list().is_empty());
}

#[tokio::test]
async fn test_rejected_submission_allocates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let err = o
        .submit(SubmitRequest::new("shell", "echo hi").timeout(3600))
        .unwrap_err();
    assert!(matches!(err, ValidationError::Timeout { .. }));

    let err = o
        .submit(SubmitRequest::new("cobol", "DISPLAY 'HI'."))
        .unwrap_err();
    assert!(matches!(err, ValidationError::UnsupportedLanguage { .. }));

    assert!(o.list().is_empty());
    assert_eq!(o.active_sandboxes(), 0);
}

#[tokio::test]
async fn test_terminal_state_is_final() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let id = o.submit(SubmitRequest::new("shell", "true")).unwrap();
    let before = events(&o, &id).await;

    let transition = o
        .registry()
        .transition(&id, ExecutionState::Completed { exit_code: 9 })
        .unwrap();
    assert_eq!(transition, Transition::Ignored);
    assert_eq!(o.status(&id).unwrap().exit_code, Some(0));

    let after = events(&o, &id).await;
    assert_eq!(before.len(), after.len());
    assert_eq!(completion(&after).exit_code, Some(0));
}

#[tokio::test]
async fn test_concurrent_executions_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let o = Arc::new(orchestrator(dir.path()).await);

    let ids: Vec<ExecutionId> = (0..100)
        .map(|i| {
            o.submit(SubmitRequest::new("shell", format!("echo run-{}", i)).timeout(20))
                .unwrap()
        })
        .collect();

    let mut tasks = Vec::new();
    for (i, id) in ids.into_iter().enumerate() {
        let o = o.clone();
        tasks.push(tokio::spawn(async move {
            let events = events(&o, &id).await;
            assert_eq!(stdout(&events), format!("run-{}\n", i));
            assert_eq!(completion(&events).status, TerminalStatus::Success);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    wait_for_release(&o).await;
    assert_eq!(o.list().len(), 100);
}

#[tokio::test]
async fn test_sandbox_directory_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let id = o
        .submit(SubmitRequest::new("shell", "echo data > scratch.txt; ls"))
        .unwrap();
    let events = events(&o, &id).await;
    assert!(stdout(&events).contains("scratch.txt"));

    wait_for_release(&o).await;
    let leftover: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("exec_"))
        .collect();
    assert!(leftover.is_empty());
}

#[tokio::test]
async fn test_python_exception_reports_traceback() {
    if which::which("python3").is_err() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let id = o
        .submit(SubmitRequest::new("python", "print('before')\nprint(1/0)"))
        .unwrap();
    let events = events(&o, &id).await;

    assert_eq!(stdout(&events), "before\n");
    assert!(stderr(&events).contains("ZeroDivisionError"));
    let done = completion(&events);
    assert_eq!(done.status, TerminalStatus::Error);
    assert_eq!(done.exit_code, Some(1));
}

#[tokio::test]
async fn test_python_busy_loop_times_out() {
    if which::which("python3").is_err() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let id = o
        .submit(SubmitRequest::new("python", "while True:\n    pass").timeout(1))
        .unwrap();
    let events = events(&o, &id).await;
    assert_eq!(completion(&events).status, TerminalStatus::Timeout);
}

#[tokio::test]
async fn test_python_memory_limit_is_enforced() {
    if which::which("python3").is_err() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(dir.path()).await;

    let id = o
        .submit(
            SubmitRequest::new("python", "x = bytearray(512 * 1024 * 1024)\nprint('allocated')")
                .memory(64)
                .timeout(10),
        )
        .unwrap();
    let events = events(&o, &id).await;

    assert!(!stdout(&events).contains("allocated"));
    assert!(stderr(&events).contains("MemoryError"), "{}", stderr(&events));
    let done = completion(&events);
    assert_eq!(done.status, TerminalStatus::Error);
    assert_eq!(done.exit_code, Some(1));
}

#[tokio::test]
async fn test_exhausted_slots_are_retried_until_free() {
    let dir = tempfile::tempdir().unwrap();
    let o = single_slot(dir.path(), 200).await;

    let first = o
        .submit(SubmitRequest::new("shell", "sleep 0.3; echo first").timeout(10))
        .unwrap();
    wait_for_running(&o, &first).await;
    let second = o
        .submit(SubmitRequest::new("shell", "echo second").timeout(10))
        .unwrap();

    let first_events = events(&o, &first).await;
    let second_events = events(&o, &second).await;
    assert_eq!(stdout(&first_events), "first\n");
    assert_eq!(stdout(&second_events), "second\n");
    assert_eq!(completion(&second_events).status, TerminalStatus::Success);

    // The second run only started once the first had ended.
    let first_done = o.status(&first).unwrap().finished_at.unwrap();
    let second_started = o.status(&second).unwrap().started_at.unwrap();
    assert!(second_started >= first_done);
}

#[tokio::test]
async fn test_exhausted_slots_fail_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let o = single_slot(dir.path(), 3).await;

    let blocker = o
        .submit(SubmitRequest::new("shell", "sleep 30").timeout(30))
        .unwrap();
    wait_for_running(&o, &blocker).await;

    let starved = o
        .submit(SubmitRequest::new("shell", "echo never").timeout(10))
        .unwrap();
    let events = events(&o, &starved).await;

    assert_eq!(events.len(), 1);
    let done = completion(&events);
    assert_eq!(done.status, TerminalStatus::Error);
    assert_eq!(done.exit_code, None);
    assert!(done.error.unwrap().contains("exhausted"));
    assert!(o.status(&starved).unwrap().started_at.is_none());

    assert!(o.cancel(&blocker).unwrap());
    crate::events(&o, &blocker).await;
}

#[tokio::test]
async fn test_cancel_while_waiting_for_a_slot() {
    let dir = tempfile::tempdir().unwrap();
    let o = single_slot(dir.path(), 10_000).await;

    let blocker = o
        .submit(SubmitRequest::new("shell", "sleep 30").timeout(30))
        .unwrap();
    wait_for_running(&o, &blocker).await;

    let waiting = o
        .submit(SubmitRequest::new("shell", "echo never").timeout(10))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(o.status(&waiting).unwrap().state, ExecutionState::Provisioning);

    assert!(o.cancel(&waiting).unwrap());
    let events = events(&o, &waiting).await;
    let done = completion(&events);
    assert_eq!(done.status, TerminalStatus::Killed);
    assert_eq!(done.reason, Some(KillReason::Cancelled));
    assert!(stdout(&events).is_empty());

    // The blocker is unaffected.
    assert!(matches!(
        o.status(&blocker).unwrap().state,
        ExecutionState::Running { .. }
    ));
    assert!(o.cancel(&blocker).unwrap());
    crate::events(&o, &blocker).await;
}
