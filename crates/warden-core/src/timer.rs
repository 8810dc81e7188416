//! Deferred-execution queue for engine timers
//!
//! Deliveries are keyed by `(kind, group)` so the engine can cancel
//! everything aimed at one group. Ordering is earliest deadline first,
//! FIFO within equal deadlines. Dispatch happens outside the queue lock,
//! so handlers are free to post and cancel further entries.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use warden_util::Clock;

use crate::group::GroupId;

/// Message kinds served by the timer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    /// Re-check a running group that may have reached its limit.
    CheckTimeout,
    /// Deliver the limit-reached notification.
    LimitReached,
    /// Deliver the session-end notification.
    SessionEnd,
}

/// A scheduled delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerMsg {
    pub kind: TimerKind,
    pub group: GroupId,
}

#[derive(Debug)]
struct Entry {
    due_ms: u64,
    seq: u64,
    msg: TimerMsg,
}

// Min-heap on (due_ms, seq).
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due_ms, other.seq).cmp(&(self.due_ms, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for Entry {}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

type Dispatch = Box<dyn Fn(TimerMsg) + Send + Sync>;

struct Shared {
    clock: Arc<dyn Clock>,
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
    dispatch: Dispatch,
}

/// Single-consumer deferred delivery queue.
pub(crate) struct TimerService {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl TimerService {
    /// Queue served by a dedicated dispatch thread.
    pub fn spawn(clock: Arc<dyn Clock>, dispatch: Dispatch) -> Self {
        let shared = Self::make_shared(clock, dispatch);
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("warden-timer".into())
                .spawn(move || run(&shared))
                .expect("failed to spawn timer thread")
        };
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Queue without a thread; entries are delivered when [`Self::fire_due`]
    /// drains them. Used by tests to step timers deterministically.
    pub fn manual(clock: Arc<dyn Clock>, dispatch: Dispatch) -> Self {
        Self {
            shared: Self::make_shared(clock, dispatch),
            thread: None,
        }
    }

    fn make_shared(clock: Arc<dyn Clock>, dispatch: Dispatch) -> Arc<Shared> {
        Arc::new(Shared {
            clock,
            queue: Mutex::new(TimerQueue::default()),
            wakeup: Condvar::new(),
            dispatch,
        })
    }

    /// Schedules `(kind, group)` for immediate delivery.
    pub fn post(&self, kind: TimerKind, group: GroupId) {
        self.post_delayed(kind, group, 0);
    }

    /// Schedules delivery of `(kind, group)` at `now + delay_ms`.
    pub fn post_delayed(&self, kind: TimerKind, group: GroupId, delay_ms: u64) {
        let due_ms = self.shared.clock.now_ms().saturating_add(delay_ms);
        {
            let mut queue = self.shared.queue.lock().unwrap();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.heap.push(Entry {
                due_ms,
                seq,
                msg: TimerMsg { kind, group },
            });
        }
        self.shared.wakeup.notify_all();
    }

    /// Drops every pending delivery matching `(kind, group)`.
    pub fn cancel(&self, kind: TimerKind, group: GroupId) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue
                .heap
                .retain(|e| !(e.msg.kind == kind && e.msg.group == group));
        }
        self.shared.wakeup.notify_all();
    }

    /// Delivers every entry due at the current clock reading, including
    /// entries posted by those deliveries. Returns the count delivered.
    pub fn fire_due(&self) -> usize {
        let mut delivered = 0;
        loop {
            let msg = {
                let mut queue = self.shared.queue.lock().unwrap();
                let now_ms = self.shared.clock.now_ms();
                if queue.heap.peek().is_some_and(|e| e.due_ms <= now_ms) {
                    queue.heap.pop().map(|e| e.msg)
                } else {
                    None
                }
            };
            match msg {
                Some(msg) => {
                    (self.shared.dispatch)(msg);
                    delivered += 1;
                }
                None => return delivered,
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.shared.queue.lock().unwrap().shutdown = true;
            self.shared.wakeup.notify_all();
            // The last owner may be the dispatch closure running on the
            // timer thread itself; joining there would never return. The
            // thread exits on its own once it sees the shutdown flag.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock().unwrap();
    loop {
        if queue.shutdown {
            return;
        }
        let now_ms = shared.clock.now_ms();
        match queue.heap.peek().map(|e| e.due_ms) {
            Some(due_ms) if due_ms <= now_ms => {
                let msg = queue.heap.pop().expect("peeked entry vanished").msg;
                drop(queue);
                (shared.dispatch)(msg);
                queue = shared.queue.lock().unwrap();
            }
            Some(due_ms) => {
                let wait = Duration::from_millis(due_ms - now_ms);
                let (guard, _) = shared.wakeup.wait_timeout(queue, wait).unwrap();
                queue = guard;
            }
            None => {
                queue = shared.wakeup.wait(queue).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKind;
    use std::sync::OnceLock;
    use std::sync::mpsc;
    use warden_util::{ManualClock, ObserverId, SystemClock, Uid, UserId};

    fn group(observer_id: i32) -> GroupId {
        GroupId {
            user_id: UserId::new(0),
            uid: Uid::new(100),
            observer_id: ObserverId::new(observer_id),
            kind: GroupKind::App,
        }
    }

    fn recording(clock: Arc<ManualClock>) -> (TimerService, Arc<Mutex<Vec<TimerMsg>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let timers = TimerService::manual(
            clock,
            Box::new(move |msg| sink.lock().unwrap().push(msg)),
        );
        (timers, fired)
    }

    #[test]
    fn nothing_fires_before_its_deadline() {
        let clock = Arc::new(ManualClock::new());
        let (timers, fired) = recording(clock.clone());

        timers.post_delayed(TimerKind::CheckTimeout, group(1), 1_000);
        assert_eq!(timers.fire_due(), 0);

        clock.set_ms(999);
        assert_eq!(timers.fire_due(), 0);
        clock.set_ms(1_000);
        assert_eq!(timers.fire_due(), 1);
        assert_eq!(fired.lock().unwrap().len(), 1);
    }

    #[test]
    fn earliest_deadline_first_fifo_within_equal() {
        let clock = Arc::new(ManualClock::new());
        let (timers, fired) = recording(clock.clone());

        timers.post_delayed(TimerKind::CheckTimeout, group(1), 500);
        timers.post_delayed(TimerKind::SessionEnd, group(2), 100);
        timers.post_delayed(TimerKind::LimitReached, group(3), 100);

        clock.set_ms(1_000);
        timers.fire_due();

        let fired = fired.lock().unwrap();
        assert_eq!(fired[0].group, group(2));
        assert_eq!(fired[1].group, group(3));
        assert_eq!(fired[2].group, group(1));
    }

    #[test]
    fn cancel_matches_kind_and_group() {
        let clock = Arc::new(ManualClock::new());
        let (timers, fired) = recording(clock.clone());

        timers.post_delayed(TimerKind::CheckTimeout, group(1), 100);
        timers.post_delayed(TimerKind::SessionEnd, group(1), 100);
        timers.post_delayed(TimerKind::CheckTimeout, group(2), 100);

        timers.cancel(TimerKind::CheckTimeout, group(1));

        clock.set_ms(1_000);
        assert_eq!(timers.fire_due(), 2);
        let fired = fired.lock().unwrap();
        assert!(
            fired
                .iter()
                .all(|m| !(m.kind == TimerKind::CheckTimeout && m.group == group(1)))
        );
    }

    #[test]
    fn reentrant_post_during_dispatch_is_delivered() {
        let clock = Arc::new(ManualClock::new());
        let slot: Arc<OnceLock<Arc<TimerService>>> = Arc::new(OnceLock::new());
        let fired = Arc::new(Mutex::new(Vec::new()));

        let timers = {
            let slot = slot.clone();
            let sink = fired.clone();
            Arc::new(TimerService::manual(
                clock.clone(),
                Box::new(move |msg: TimerMsg| {
                    sink.lock().unwrap().push(msg);
                    if msg.kind == TimerKind::CheckTimeout {
                        slot.get().unwrap().post(TimerKind::LimitReached, msg.group);
                    }
                }),
            ))
        };
        slot.set(timers.clone()).ok().unwrap();

        timers.post_delayed(TimerKind::CheckTimeout, group(1), 50);
        clock.set_ms(50);
        assert_eq!(timers.fire_due(), 2);

        let fired = fired.lock().unwrap();
        assert_eq!(fired[0].kind, TimerKind::CheckTimeout);
        assert_eq!(fired[1].kind, TimerKind::LimitReached);
    }

    #[test]
    fn background_thread_delivers() {
        let (tx, rx) = mpsc::channel();
        let timers = TimerService::spawn(
            Arc::new(SystemClock::new()),
            Box::new(move |msg: TimerMsg| {
                let _ = tx.send(msg);
            }),
        );

        timers.post_delayed(TimerKind::CheckTimeout, group(1), 10);
        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(msg.kind, TimerKind::CheckTimeout);
        assert_eq!(msg.group, group(1));
    }
}
