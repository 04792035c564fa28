//! Bounded outbound event queue.
//!
//! Producers push from any thread; only the communication loop pops. Events
//! carry their monotonic enqueue instant so the loop can stamp wall-clock
//! time at send. Priority events (rejections of priority commands, command
//! failures) jump ahead of the ordinary backlog and survive overflow.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use plink_protocol::Event;
use tokio::sync::Notify;
use tracing::warn;

pub const QUEUE_CAPACITY: usize = 100;

/// Bound on how long the loop parks waiting for work.
pub const POP_WAIT: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct QueuedEvent {
    pub event: Event,
    pub enqueued_at: Instant,
    pub priority: bool,
}

#[derive(Default)]
struct Inner {
    items: VecDeque<QueuedEvent>,
    dropped: u64,
}

pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an event; priority events are inserted ahead of the first
    /// non-priority entry. On overflow the oldest non-priority event is
    /// dropped (and counted).
    pub fn push(&self, event: Event, priority: bool) {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.items.len() >= self.capacity {
            match inner.items.iter().position(|item| !item.priority) {
                Some(pos) => {
                    let dropped = inner.items.remove(pos);
                    inner.dropped += 1;
                    metrics::counter!("plink_events_dropped_total").increment(1);
                    if let Some(dropped) = dropped {
                        warn!("event queue full, dropping {:?}", dropped.event.kind);
                    }
                }
                // Every queued item is priority; the newcomer loses instead.
                None if !priority => {
                    inner.dropped += 1;
                    metrics::counter!("plink_events_dropped_total").increment(1);
                    return;
                }
                None => {}
            }
        }
        let item = QueuedEvent {
            event,
            enqueued_at: Instant::now(),
            priority,
        };
        if priority {
            let pos = inner
                .items
                .iter()
                .position(|queued| !queued.priority)
                .unwrap_or(inner.items.len());
            inner.items.insert(pos, item);
        } else {
            inner.items.push_back(item);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Put an already-popped event back at the head, e.g. after a send that
    /// must be retried. Capacity is not enforced here; the entry was already
    /// admitted once.
    pub fn requeue(&self, item: QueuedEvent) {
        self.inner
            .lock()
            .expect("queue lock")
            .items
            .push_front(item);
        self.notify.notify_one();
    }

    /// Pop the head entry only if it is a priority one.
    pub fn pop_priority(&self) -> Option<QueuedEvent> {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.items.front().is_some_and(|item| item.priority) {
            inner.items.pop_front()
        } else {
            None
        }
    }

    pub fn pop(&self) -> Option<QueuedEvent> {
        self.inner.lock().expect("queue lock").items.pop_front()
    }

    /// Park until something is queued, at most [`POP_WAIT`].
    pub async fn wait_nonempty(&self) {
        if !self.is_empty() {
            return;
        }
        let _ = tokio::time::timeout(POP_WAIT, self.notify.notified()).await;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("queue lock").items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").items.len()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("queue lock").dropped
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plink_protocol::{EventKind, Source};

    fn event(kind: EventKind) -> Event {
        Event::new(kind, Source::Marlin)
    }

    #[test]
    fn fifo_order_within_same_producer() {
        let queue = EventQueue::new();
        queue.push(event(EventKind::StateChanged), false);
        queue.push(event(EventKind::Info), false);
        assert_eq!(queue.pop().unwrap().event.kind, EventKind::StateChanged);
        assert_eq!(queue.pop().unwrap().event.kind, EventKind::Info);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn priority_jumps_the_backlog_but_keeps_priority_order() {
        let queue = EventQueue::new();
        queue.push(event(EventKind::Info), false);
        queue.push(event(EventKind::Failed), true);
        queue.push(event(EventKind::Rejected), true);
        assert_eq!(queue.pop_priority().unwrap().event.kind, EventKind::Failed);
        assert_eq!(queue.pop_priority().unwrap().event.kind, EventKind::Rejected);
        assert!(queue.pop_priority().is_none());
        assert_eq!(queue.pop().unwrap().event.kind, EventKind::Info);
    }

    #[test]
    fn overflow_drops_oldest_non_priority() {
        let queue = EventQueue::with_capacity(3);
        queue.push(event(EventKind::Failed), true);
        queue.push(event(EventKind::Info), false);
        queue.push(event(EventKind::StateChanged), false);
        queue.push(event(EventKind::Attention), false);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);
        // The priority event survived; the oldest non-priority (Info) did not.
        let kinds: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|item| item.event.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::Failed, EventKind::StateChanged, EventKind::Attention]
        );
    }

    #[test]
    fn all_priority_queue_rejects_new_non_priority_overflow() {
        let queue = EventQueue::with_capacity(2);
        queue.push(event(EventKind::Failed), true);
        queue.push(event(EventKind::Failed), true);
        queue.push(event(EventKind::Info), false);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }
}
