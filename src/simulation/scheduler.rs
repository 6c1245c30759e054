//! Event scheduling types.
//!
//! The scheduler queue is a binary min-heap of events keyed by
//! `(time, sequence)`: events fire in time order, and events scheduled for
//! the same simulated time fire in scheduling order. An event scheduled by
//! a handler at the current time therefore runs strictly after every event
//! already pending at that time. Cancellation is key-based: a cancelled
//! event stays in the heap (removing it would break the heap invariant)
//! and is discarded when it reaches the head.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

use crate::agent::{AgentId, MessageId};
use crate::element::LocationId;
use crate::executor::ProcessId;
use crate::simulation::SimError;
use crate::time::SimTime;

/// Handle to a scheduled event.
///
/// An `EventKey` can be used to cancel the event it was returned for.
/// Cancellation is idempotent, and cancelling an event that already fired
/// has no effect.
#[derive(Clone, Debug)]
pub struct EventKey {
    is_cancelled: Rc<Cell<bool>>,
}

impl EventKey {
    /// Creates a key for a pending event.
    pub(crate) fn new() -> Self {
        Self {
            is_cancelled: Rc::new(Cell::new(false)),
        }
    }

    /// Checks whether the event was cancelled.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.is_cancelled.get()
    }

    /// Cancels the associated event.
    pub fn cancel(self) {
        self.is_cancelled.set(true);
    }
}

/// What a scheduled event does when it fires.
#[derive(Clone, Debug)]
pub(crate) enum EventKind {
    /// Begins executing a newly spawned process body.
    StartProcess(ProcessId),
    /// Resumes a process suspended in a blocking operation.
    Resume(ProcessId),
    /// Resumes a suspended process by delivering an error into it.
    Interrupt(ProcessId, SimError),
    /// Runs one round of queued-request processing on an assignment agent.
    ProcessQueue(AgentId),
    /// Expires a pending resource request.
    AcquireTimeout {
        agent: AgentId,
        request: MessageId,
        process: ProcessId,
    },
    /// Fires one entity generator of a source.
    SourceArrival { source: LocationId, generator: usize },
    /// Starts a one-shot startup process.
    Startup(usize),
    /// Initiates a takedown on a downtime agent.
    Takedown(AgentId),
    /// Initiates a bring-up on a downtime agent.
    Bringup(AgentId),
    /// Expires the going-down grace period of a downtime agent.
    GoingDownTimeout(AgentId),
}

/// A scheduled event: its firing time, its tie-breaking sequence number,
/// its cancellation key and its action.
///
/// Events order by `(time, sequence)` in reverse, so that the earliest
/// event sits at the top of the max-heap the queue is built on.
struct ScheduledEvent {
    time: SimTime,
    seq: u64,
    key: EventKey,
    kind: EventKind,
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.seq.cmp(&other.seq))
            .reverse()
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for ScheduledEvent {}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

/// The simulation event queue.
///
/// Insertion order among equal firing times is preserved: every event is
/// stamped with a monotonically increasing sequence number that breaks
/// ties. Cancelled events are discarded when they reach the head of the
/// queue.
pub(crate) struct SchedulerQueue {
    heap: BinaryHeap<ScheduledEvent>,
    next_seq: u64,
}

impl SchedulerQueue {
    /// Creates an empty queue.
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Stamps an event with the next sequence number and pushes it.
    fn push(&mut self, time: SimTime, key: EventKey, kind: EventKind) {
        let seq = self.next_seq;
        assert_ne!(seq, u64::MAX);
        self.next_seq += 1;
        self.heap.push(ScheduledEvent {
            time,
            seq,
            key,
            kind,
        });
    }

    /// Inserts an event without a caller-held key.
    pub(crate) fn insert(&mut self, time: SimTime, kind: EventKind) {
        self.push(time, EventKey::new(), kind);
    }

    /// Inserts an event and returns its cancellation key.
    pub(crate) fn insert_keyed(&mut self, time: SimTime, kind: EventKind) -> EventKey {
        let key = EventKey::new();
        self.push(time, key.clone(), kind);
        key
    }

    /// Pops the earliest non-cancelled event.
    pub(crate) fn pull(&mut self) -> Option<(SimTime, EventKind)> {
        loop {
            let event = self.heap.pop()?;
            if !event.key.is_cancelled() {
                return Some((event.time, event.kind));
            }
        }
    }

    /// Returns the time of the earliest non-cancelled event, discarding
    /// cancelled events found on the way.
    pub(crate) fn next_time(&mut self) -> Option<SimTime> {
        loop {
            let cancelled = match self.heap.peek() {
                Some(event) => event.key.is_cancelled(),
                None => return None,
            };
            if !cancelled {
                return self.heap.peek().map(|event| event.time);
            }
            self.heap.pop();
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_order_dominates_insertion_order() {
        let mut q = SchedulerQueue::new();
        q.insert(SimTime::none(5.0), EventKind::Resume(ProcessId(5)));
        q.insert(SimTime::none(1.0), EventKind::Resume(ProcessId(1)));
        q.insert(SimTime::none(3.0), EventKind::Resume(ProcessId(3)));

        let order: Vec<ProcessId> = std::iter::from_fn(|| q.pull())
            .map(|(_, kind)| match kind {
                EventKind::Resume(p) => p,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![ProcessId(1), ProcessId(3), ProcessId(5)]);
        assert!(q.pull().is_none());
    }

    #[test]
    fn fifo_among_equal_times() {
        let mut q = SchedulerQueue::new();
        let t = SimTime::none(5.0);
        q.insert(t, EventKind::Resume(ProcessId(1)));
        q.insert(t, EventKind::Resume(ProcessId(2)));
        q.insert(SimTime::none(1.0), EventKind::Resume(ProcessId(0)));

        let order: Vec<ProcessId> = std::iter::from_fn(|| q.pull())
            .map(|(_, kind)| match kind {
                EventKind::Resume(p) => p,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![ProcessId(0), ProcessId(1), ProcessId(2)]);
    }

    #[test]
    fn cancelled_events_never_fire() {
        let mut q = SchedulerQueue::new();
        let key = q.insert_keyed(SimTime::none(1.0), EventKind::Resume(ProcessId(1)));
        q.insert(SimTime::none(2.0), EventKind::Resume(ProcessId(2)));
        key.cancel();

        let (t, kind) = q.pull().unwrap();
        assert_eq!(t, SimTime::none(2.0));
        assert!(matches!(kind, EventKind::Resume(ProcessId(2))));
        assert!(q.pull().is_none());
    }

    #[test]
    fn next_time_skips_cancelled() {
        let mut q = SchedulerQueue::new();
        let key = q.insert_keyed(SimTime::none(1.0), EventKind::Resume(ProcessId(1)));
        q.insert(SimTime::none(3.0), EventKind::Resume(ProcessId(2)));
        key.cancel();
        assert_eq!(q.next_time(), Some(SimTime::none(3.0)));
    }
}
