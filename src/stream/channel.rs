use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::types::StreamConfig;
use crate::execution::ExecutionId;
use crate::stream::event::{Event, EventKind};

/// Per-execution broadcast channel.
///
/// Publishing never blocks: every subscriber owns a bounded queue and is
/// disconnected when it falls behind. One queue slot is held back for the
/// terminal event, so every subscriber still attached at termination
/// receives it.
pub struct ExecutionChannel {
    execution_id: ExecutionId,
    config: StreamConfig,
    inner: Mutex<ChannelInner>,
}

struct ChannelInner {
    next_seq: u64,
    subscribers: Vec<mpsc::Sender<Arc<Event>>>,
    replay: VecDeque<Arc<Event>>,
    replay_bytes: usize,
    terminal: Option<Arc<Event>>,
    dropped: u64,
}

impl ExecutionChannel {
    pub fn new(execution_id: ExecutionId, config: StreamConfig) -> Self {
        Self {
            execution_id,
            config,
            inner: Mutex::new(ChannelInner {
                next_seq: 1,
                subscribers: Vec::new(),
                replay: VecDeque::new(),
                replay_bytes: 0,
                terminal: None,
                dropped: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event and return its sequence number.
    ///
    /// Returns `None` once the terminal event has been published.
    pub fn publish(&self, kind: EventKind) -> Option<u64> {
        let mut inner = self.lock();
        if inner.terminal.is_some() {
            return None;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let event = Arc::new(Event {
            execution_id: self.execution_id.clone(),
            seq,
            kind,
        });

        if event.is_terminal() {
            for tx in inner.subscribers.drain(..) {
                // The reserved slot guarantees room unless the receiver is gone.
                let _ = tx.try_send(event.clone());
            }
            inner.terminal = Some(event);
            debug!(execution_id = %self.execution_id, seq, "Channel closed");
            return Some(seq);
        }

        inner.remember(event.clone(), &self.config);

        let before = inner.subscribers.len();
        inner.subscribers.retain(|tx| {
            if tx.capacity() <= 1 {
                return false;
            }
            tx.try_send(event.clone()).is_ok()
        });
        let removed = before - inner.subscribers.len();
        if removed > 0 {
            inner.dropped += removed as u64;
            warn!(
                execution_id = %self.execution_id,
                seq,
                removed,
                "Dropped slow or disconnected subscribers"
            );
        }

        Some(seq)
    }

    /// Attach a subscriber.
    ///
    /// With `since = Some(n)` buffered events with a sequence number above `n`
    /// are replayed first. Replay and registration happen under the publish
    /// lock, so the handover neither skips nor repeats events. A subscriber
    /// attaching after termination receives the terminal event and the
    /// channel then closes.
    pub fn subscribe(&self, since: Option<u64>) -> Subscription {
        let mut inner = self.lock();
        // A resume point past the head would skip the terminal event.
        let head = match &inner.terminal {
            Some(terminal) => terminal.seq - 1,
            None => inner.next_seq - 1,
        };
        let since = since.map(|after| after.min(head));

        let backlog: Vec<Arc<Event>> = match since {
            Some(after) => inner
                .replay
                .iter()
                .filter(|e| e.seq > after)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        // The backlog must not eat into the live queue or the terminal slot.
        let capacity = backlog.len() + self.config.subscriber_queue.max(1) + 1;
        let (tx, rx) = mpsc::channel(capacity);
        for event in backlog {
            let _ = tx.try_send(event);
        }

        if let Some(terminal) = inner.terminal.clone() {
            let _ = tx.try_send(terminal);
        } else {
            inner.subscribers.push(tx);
        }

        Subscription {
            execution_id: self.execution_id.clone(),
            rx,
            last_seq: since.unwrap_or(0),
            saw_terminal: false,
            lagged: false,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn dropped_subscribers(&self) -> u64 {
        self.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().terminal.is_some()
    }

    /// Sequence number of the most recently published event (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.lock().next_seq - 1
    }
}

impl ChannelInner {
    fn remember(&mut self, event: Arc<Event>, config: &StreamConfig) {
        self.replay_bytes += event.payload_len();
        self.replay.push_back(event);
        while self.replay.len() > config.replay_events
            || (self.replay_bytes > config.replay_bytes && self.replay.len() > 1)
        {
            match self.replay.pop_front() {
                Some(old) => self.replay_bytes -= old.payload_len(),
                None => break,
            }
        }
    }
}

/// Ordered view of one execution's events.
pub struct Subscription {
    execution_id: ExecutionId,
    rx: mpsc::Receiver<Arc<Event>>,
    last_seq: u64,
    saw_terminal: bool,
    lagged: bool,
}

impl Subscription {
    /// Next event, or `None` once the channel closed.
    ///
    /// Events at or below the last delivered sequence number are skipped.
    pub async fn next(&mut self) -> Option<Arc<Event>> {
        if self.saw_terminal {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Some(event) => {
                    if event.seq <= self.last_seq {
                        continue;
                    }
                    self.last_seq = event.seq;
                    self.saw_terminal = event.is_terminal();
                    return Some(event);
                }
                None => {
                    self.lagged = true;
                    return None;
                }
            }
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Sequence number of the last delivered event; use it as `since` to resume.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// True when the channel closed before a terminal event was seen,
    /// i.e. this subscriber was dropped for falling behind.
    pub fn lagged(&self) -> bool {
        self.lagged
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Event>> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::event::{Completion, TerminalStatus};

    fn channel(queue: usize) -> ExecutionChannel {
        ExecutionChannel::new(
            ExecutionId::from("exec-1"),
            StreamConfig {
                subscriber_queue: queue,
                replay_events: 4,
                replay_bytes: 1024,
            },
        )
    }

    fn terminal() -> EventKind {
        EventKind::Terminal(Completion {
            status: TerminalStatus::Success,
            exit_code: Some(0),
            execution_time_ms: 1,
            reason: None,
            error: None,
        })
    }

    async fn drain(sub: &mut Subscription) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        while let Some(e) = sub.next().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_subscribers_see_identical_order() {
        let ch = channel(16);
        let mut a = ch.subscribe(None);
        let mut b = ch.subscribe(None);

        ch.publish(EventKind::Stdout("one".into()));
        ch.publish(EventKind::Stderr("two".into()));
        ch.publish(EventKind::Stdout("three".into()));
        ch.publish(terminal());

        let ea = drain(&mut a).await;
        let eb = drain(&mut b).await;
        assert_eq!(ea.len(), 4);
        assert_eq!(ea, eb);
        assert_eq!(
            ea.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert!(ea.last().unwrap().is_terminal());
        assert!(!a.lagged());
    }

    #[tokio::test]
    async fn test_nothing_published_after_terminal() {
        let ch = channel(16);
        let mut sub = ch.subscribe(None);
        assert_eq!(ch.publish(terminal()), Some(1));
        assert_eq!(ch.publish(EventKind::Stdout("late".into())), None);
        assert_eq!(ch.publish(terminal()), None);

        let events = drain(&mut sub).await;
        assert_eq!(events.len(), 1);
        assert!(ch.is_closed());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_terminal_only() {
        let ch = channel(16);
        ch.publish(EventKind::Stdout("a".into()));
        ch.publish(terminal());

        let mut late = ch.subscribe(None);
        let events = drain(&mut late).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }

    #[tokio::test]
    async fn test_replay_after_sequence() {
        let ch = channel(16);
        for i in 0..3 {
            ch.publish(EventKind::Stdout(format!("line {}", i)));
        }

        let mut resumed = ch.subscribe(Some(1));
        ch.publish(EventKind::Stdout("live".into()));
        ch.publish(terminal());

        let seqs: Vec<u64> = drain(&mut resumed).await.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_replayed_subscriber_keeps_receiving_live_events() {
        let ch = ExecutionChannel::new(
            ExecutionId::from("exec-1"),
            StreamConfig {
                subscriber_queue: 4,
                replay_events: 8,
                replay_bytes: 1024,
            },
        );
        for i in 0..8 {
            ch.publish(EventKind::Stdout(format!("{}", i)));
        }

        let mut resumed = ch.subscribe(Some(0));
        ch.publish(EventKind::Stdout("live".into()));
        ch.publish(terminal());

        let seqs: Vec<u64> = drain(&mut resumed).await.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
        assert!(!resumed.lagged());
        assert_eq!(ch.dropped_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_resume_point_past_head_still_gets_terminal() {
        let ch = channel(16);
        ch.publish(EventKind::Stdout("a".into()));

        let mut ahead = ch.subscribe(Some(1000));
        ch.publish(EventKind::Stdout("b".into()));
        ch.publish(terminal());

        let events = drain(&mut ahead).await;
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert!(events[1].is_terminal());
        assert!(!ahead.lagged());
    }

    #[tokio::test]
    async fn test_resume_after_termination_still_gets_terminal() {
        let ch = channel(16);
        ch.publish(EventKind::Stdout("a".into()));
        ch.publish(terminal());

        let mut sub = ch.subscribe(Some(2));
        let events = drain(&mut sub).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }

    #[tokio::test]
    async fn test_replay_buffer_is_bounded() {
        let ch = channel(16);
        for i in 0..10 {
            ch.publish(EventKind::Stdout(format!("{}", i)));
        }
        ch.publish(terminal());

        let mut sub = ch.subscribe(Some(0));
        let seqs: Vec<u64> = drain(&mut sub).await.iter().map(|e| e.seq).collect();
        // Four buffered events plus the terminal one.
        assert_eq!(seqs, vec![7, 8, 9, 10, 11]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_without_blocking() {
        let ch = channel(2);
        let mut slow = ch.subscribe(None);
        let mut fast = ch.subscribe(None);

        let mut fast_seen = Vec::new();
        for i in 0..5 {
            ch.publish(EventKind::Stdout(format!("{}", i)));
            fast_seen.push(fast.next().await.unwrap().seq);
        }
        ch.publish(terminal());
        fast_seen.push(fast.next().await.unwrap().seq);

        assert_eq!(fast_seen, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(ch.dropped_subscribers(), 1);

        let slow_events = drain(&mut slow).await;
        assert_eq!(slow_events.len(), 2);
        assert!(slow_events.iter().all(|e| !e.is_terminal()));
        assert!(slow.lagged());
    }

    #[tokio::test]
    async fn test_full_queue_still_receives_terminal() {
        let ch = channel(2);
        let mut sub = ch.subscribe(None);
        ch.publish(EventKind::Stdout("a".into()));
        ch.publish(EventKind::Stdout("b".into()));
        ch.publish(terminal());

        let events = drain(&mut sub).await;
        assert_eq!(events.len(), 3);
        assert!(events[2].is_terminal());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let ch = channel(4);
        let sub = ch.subscribe(None);
        assert_eq!(ch.subscriber_count(), 1);
        drop(sub);
        ch.publish(EventKind::Stdout("x".into()));
        assert_eq!(ch.subscriber_count(), 0);
    }
}
