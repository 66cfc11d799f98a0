//! Request queues with scheduled events.
//!
//! Each queue owns a FIFO of host requests and a time-ordered set of
//! scheduled events, guarded by one mutex and one condition variable. One
//! worker thread serves each queue: requests run strictly in submission
//! order, events fire at or after their absolute time (ties in insertion
//! order), and an event scheduled ahead of the current earliest wakes the
//! worker early.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::requests::{RilRequest, Task, Token};

/// Which queue(s) an event targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    Normal,
    Priority,
    /// Independent copies on both queues.
    Both,
}

/// A host request waiting for its worker.
#[derive(Debug)]
pub struct QueuedRequest {
    pub request: RilRequest,
    pub token: Token,
}

struct ScheduledEvent {
    at: Instant,
    /// Insertion order; breaks ties between events with equal fire times.
    seq: u64,
    task: Task,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for ScheduledEvent {}
impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct Inner {
    requests: VecDeque<QueuedRequest>,
    events: BinaryHeap<Reverse<ScheduledEvent>>,
    closed: bool,
    seq: u64,
}

/// What a worker got out of one wait cycle.
pub enum Work {
    /// The queue closed; drain and reopen the transport.
    Closed,
    /// At most one due event and at most one request, in that firing
    /// order. Never both `None`.
    Items {
        event: Option<Task>,
        request: Option<QueuedRequest>,
    },
}

pub struct RequestQueue {
    name: &'static str,
    enabled: bool,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl RequestQueue {
    /// Queues start closed; the worker opens them once its channel is up.
    pub fn new(name: &'static str, enabled: bool) -> Self {
        RequestQueue {
            name,
            enabled,
            inner: Mutex::new(Inner {
                requests: VecDeque::new(),
                events: BinaryHeap::new(),
                closed: true,
                seq: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Whether this queue has a worker at all (the priority queue is
    /// optional).
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Reopen after the worker has (re)established its channel.
    pub fn open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = false;
        debug!("queue {}: open", self.name);
    }

    /// Close and wake the worker so it can drain and recover.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.cond.notify_all();
        debug!("queue {}: closed", self.name);
    }

    pub fn enqueue_request(&self, request: RilRequest, token: Token) {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push_back(QueuedRequest { request, token });
        self.cond.notify_all();
    }

    /// Schedule a task `delay` from now. A zero delay fires on the next
    /// wake.
    pub fn enqueue_event(&self, delay: Duration, task: Task) {
        self.enqueue_event_at(Instant::now() + delay, task);
    }

    pub fn enqueue_event_at(&self, at: Instant, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq;
        inner.seq += 1;
        inner.events.push(Reverse(ScheduledEvent { at, seq, task }));
        // Always wake: the new event may be earlier than the one the
        // worker is currently sleeping toward.
        self.cond.notify_all();
    }

    /// Block until there is something to do or the queue closes.
    pub fn next_work(&self) -> Work {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Work::Closed;
            }

            if inner.requests.is_empty() && inner.events.is_empty() {
                inner = self.cond.wait(inner).unwrap();
                continue;
            }

            // With no request to run, sleep toward the earliest event.
            if inner.requests.is_empty() {
                let head_at = inner.events.peek().map(|Reverse(e)| e.at);
                if let Some(head_at) = head_at {
                    let now = Instant::now();
                    if head_at > now {
                        let (guard, _) = self.cond.wait_timeout(inner, head_at - now).unwrap();
                        inner = guard;
                        continue;
                    }
                }
            }

            let now = Instant::now();
            let due = matches!(inner.events.peek(), Some(Reverse(e)) if e.at <= now);
            let event = if due {
                inner.events.pop().map(|Reverse(e)| e.task)
            } else {
                None
            };
            let request = inner.requests.pop_front();

            if event.is_none() && request.is_none() {
                // Woken with nothing due yet; go around again.
                continue;
            }
            return Work::Items { event, request };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::RilRequest;
    use std::sync::Arc;
    use std::thread;

    fn take(queue: &RequestQueue) -> (Option<Task>, Option<QueuedRequest>) {
        match queue.next_work() {
            Work::Items { event, request } => (event, request),
            Work::Closed => panic!("queue unexpectedly closed"),
        }
    }

    #[test]
    fn test_requests_fifo() {
        let q = RequestQueue::new("test", true);
        q.open();
        q.enqueue_request(RilRequest::GetImsi, Token(1));
        q.enqueue_request(RilRequest::GetImei, Token(2));

        let (_, first) = take(&q);
        let (_, second) = take(&q);
        assert_eq!(first.unwrap().token, Token(1));
        assert_eq!(second.unwrap().token, Token(2));
    }

    #[test]
    fn test_events_fire_in_absolute_time_order() {
        let q = RequestQueue::new("test", true);
        q.open();
        let now = Instant::now();
        q.enqueue_event_at(now + Duration::from_millis(30), Task::SimReadyInit);
        q.enqueue_event_at(now + Duration::from_millis(10), Task::RadioPowerOn);

        let (event, _) = take(&q);
        assert!(matches!(event, Some(Task::RadioPowerOn)));
        let (event, _) = take(&q);
        assert!(matches!(event, Some(Task::SimReadyInit)));
    }

    #[test]
    fn test_equal_times_tie_break_in_insertion_order() {
        let q = RequestQueue::new("test", true);
        q.open();
        let at = Instant::now();
        q.enqueue_event_at(at, Task::PollSignalStrength { fallback_bars: 1 });
        q.enqueue_event_at(at, Task::PollSignalStrength { fallback_bars: 2 });

        match take(&q).0 {
            Some(Task::PollSignalStrength { fallback_bars }) => assert_eq!(fallback_bars, 1),
            other => panic!("unexpected: {other:?}"),
        }
        match take(&q).0 {
            Some(Task::PollSignalStrength { fallback_bars }) => assert_eq!(fallback_bars, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_event_fires_at_or_after_its_time() {
        let q = RequestQueue::new("test", true);
        q.open();
        let at = Instant::now() + Duration::from_millis(80);
        q.enqueue_event_at(at, Task::DataCallListChanged);

        let (event, _) = take(&q);
        assert!(event.is_some());
        assert!(Instant::now() >= at);
    }

    #[test]
    fn test_zero_delay_event_fires_immediately() {
        let q = RequestQueue::new("test", true);
        q.open();
        q.enqueue_event(Duration::ZERO, Task::DataCallListChanged);
        let start = Instant::now();
        let (event, _) = take(&q);
        assert!(event.is_some());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_earlier_event_wakes_sleeping_worker() {
        let q = Arc::new(RequestQueue::new("test", true));
        q.open();
        q.enqueue_event(Duration::from_secs(30), Task::SimReadyInit);

        let q2 = q.clone();
        let worker = thread::spawn(move || {
            let start = Instant::now();
            let (event, _) = match q2.next_work() {
                Work::Items { event, request } => (event, request),
                Work::Closed => panic!("closed"),
            };
            (event, start.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        q.enqueue_event(Duration::ZERO, Task::RadioPowerOn);

        let (event, elapsed) = worker.join().unwrap();
        assert!(matches!(event, Some(Task::RadioPowerOn)));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_request_runs_while_event_not_due() {
        let q = RequestQueue::new("test", true);
        q.open();
        q.enqueue_event(Duration::from_secs(30), Task::SimReadyInit);
        q.enqueue_request(RilRequest::GetImsi, Token(7));

        let (event, request) = take(&q);
        assert!(event.is_none());
        assert_eq!(request.unwrap().token, Token(7));
    }

    #[test]
    fn test_close_wakes_empty_worker_without_deadlock() {
        let q = Arc::new(RequestQueue::new("test", true));
        q.open();

        let q2 = q.clone();
        let worker = thread::spawn(move || matches!(q2.next_work(), Work::Closed));

        thread::sleep(Duration::from_millis(50));
        q.close();
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_starts_closed_until_opened() {
        let q = RequestQueue::new("test", true);
        assert!(q.is_closed());
        assert!(matches!(q.next_work(), Work::Closed));
        q.open();
        assert!(!q.is_closed());
    }
}
