//! Serialized event queue: one worker thread draining a time-ordered queue
//! of posted closures.
//!
//! All orchestrator state transitions run through this queue, one at a time,
//! so handlers need no locking between each other. Events carry an optional
//! kind token: a second post of a kind that is already pending is a no-op
//! (coalescing), and pending events can be cancelled by kind.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::trace;

/// Identity token for coalescing and cancellation.
pub type EventKind = &'static str;

type EventFn = Box<dyn FnOnce() + Send>;

struct QueuedEvent {
    deadline: Instant,
    seq: u64,
    kind: Option<EventKind>,
    f: EventFn,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reverse ordering: BinaryHeap is a max-heap, we want the earliest deadline.
impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedEvent>,
    next_seq: u64,
    shutdown: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    wakeup: Condvar,
}

/// The time-ordered serialized event queue.
pub struct EventQueue {
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl EventQueue {
    pub fn new() -> Self {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("playback-events".into())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn event worker");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Post a closure to fire as soon as possible.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.post_at(None, Instant::now(), f);
    }

    /// Post a closure to fire no earlier than `delay` from now.
    pub fn post_in(
        &self,
        kind: Option<EventKind>,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> bool {
        self.post_at(kind, Instant::now() + delay, f)
    }

    /// Post a closure to fire no earlier than `deadline`.
    ///
    /// With a kind token, a post while an event of the same kind is pending
    /// is a no-op; returns whether the event was enqueued.
    pub fn post_at(
        &self,
        kind: Option<EventKind>,
        deadline: Instant,
        f: impl FnOnce() + Send + 'static,
    ) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return false;
        }
        if let Some(kind) = kind
            && state.heap.iter().any(|e| e.kind == Some(kind))
        {
            trace!(kind, "coalesced duplicate event");
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueuedEvent {
            deadline,
            seq,
            kind,
            f: Box::new(f),
        });
        drop(state);
        self.wakeup_notify();
        true
    }

    /// Remove pending events of `kind`. Events already running are not
    /// interrupted.
    pub fn cancel(&self, kind: EventKind) {
        let mut state = self.shared.state.lock();
        state.heap.retain(|e| e.kind != Some(kind));
        drop(state);
        self.wakeup_notify();
    }

    /// Remove every pending event.
    pub fn cancel_all(&self) {
        let mut state = self.shared.state.lock();
        state.heap.clear();
        drop(state);
        self.wakeup_notify();
    }

    pub fn is_pending(&self, kind: EventKind) -> bool {
        self.shared
            .state
            .lock()
            .heap
            .iter()
            .any(|e| e.kind == Some(kind))
    }

    fn wakeup_notify(&self) {
        self.shared.wakeup.notify_all();
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.heap.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<QueueShared>) {
    loop {
        let event = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                let now = Instant::now();
                match state.heap.peek() {
                    Some(head) if head.deadline <= now => break state.heap.pop().unwrap(),
                    Some(head) => {
                        let wait = head.deadline - now;
                        shared.wakeup.wait_for(&mut state, wait);
                    }
                    None => {
                        shared.wakeup.wait(&mut state);
                    }
                }
            }
        };
        // Run outside the queue lock; handlers take the session lock.
        (event.f)();
    }
}
