//! The coroutine host.
//!
//! Process bodies are plain `async` blocks, boxed and polled manually by the
//! event loop; there is no reactor and no wakeup machinery. A process
//! suspends by returning `Pending` from one of the blocking operations on
//! [`ProcessContext`](crate::process::ProcessContext) and is resumed by the
//! event loop re-polling it after depositing a value (or an error) in its
//! resume slot. Because resumption is always initiated by the event loop,
//! polling uses a no-op waker.
//!
//! Exactly one process executes at any moment; all scheduling decisions are
//! made through the event queue, which keeps runs deterministic.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::agent::{AgentId, MessageId};
use crate::element::EntityId;
use crate::resource::AssignmentId;
use crate::simulation::SimError;
use crate::simulation::scheduler::EventKey;
use crate::time::SimTime;

/// Identifier of a process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessId(pub(crate) usize);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The boxed future driving one process body.
///
/// Futures are `!Send`: the whole engine lives on one thread.
pub type ProcessFuture = Pin<Box<dyn Future<Output = Result<(), SimError>>>>;

/// What a resumed blocking operation receives.
#[derive(Clone, Debug)]
pub(crate) enum ResumeValue {
    /// A plain wake-up (timer expiry, counter grant, resource up).
    Wake,
    /// A fulfilled resource request.
    Assignment(AssignmentId),
}

/// The communication cell between the event loop and a suspended process.
#[derive(Clone, Debug, Default)]
pub(crate) enum ResumeSlot {
    /// The process is not suspended in a blocking operation.
    #[default]
    Idle,
    /// The process is suspended and nothing was delivered yet.
    Waiting,
    /// A value was delivered; the next poll picks it up.
    Ready(ResumeValue),
    /// An error was delivered; the next poll raises it.
    Failed(SimError),
}

/// A resource request the process is suspended on.
pub(crate) struct PendingRequest {
    /// The assignment agent holding the queued request.
    pub(crate) agent: AgentId,
    /// The queued request message.
    pub(crate) message: MessageId,
    /// The pending expiry event, for requests with a timeout.
    pub(crate) timeout_event: Option<EventKey>,
}

/// Host-side state of one process.
pub(crate) struct ProcessEntry {
    /// The process body; taken out while being polled.
    pub(crate) future: Option<ProcessFuture>,
    pub(crate) slot: ResumeSlot,
    /// Pending resume event, if the process waits on a timer or a grant.
    pub(crate) resume_event: Option<EventKey>,
    /// Pending interrupt event, if one was scheduled.
    pub(crate) interrupt_event: Option<EventKey>,
    /// Pending resource request, while suspended in an acquire.
    pub(crate) pending_request: Option<PendingRequest>,
    /// Assignments currently held.
    pub(crate) assignments: Vec<AssignmentId>,
    /// The entity this process belongs to.
    pub(crate) entity: EntityId,
    /// Index of the process class element, for bookkeeping datasets.
    pub(crate) element: usize,
    /// Set while the process is parked waiting for resources to come back
    /// up.
    pub(crate) waiting_resources_up: bool,
    /// The resources the park is waiting on.
    pub(crate) watching: Vec<crate::resource::ResourceId>,
    pub(crate) started_at: SimTime,
    pub(crate) running: bool,
}

impl ProcessEntry {
    pub(crate) fn new(entity: EntityId, element: usize) -> Self {
        Self {
            future: None,
            slot: ResumeSlot::Idle,
            resume_event: None,
            interrupt_event: None,
            pending_request: None,
            assignments: Vec::new(),
            entity,
            element,
            waiting_resources_up: false,
            watching: Vec::new(),
            started_at: SimTime::ZERO,
            running: false,
        }
    }
}

/// Polls a process future once with a no-op waker.
pub(crate) fn poll_once(future: &mut ProcessFuture) -> Poll<Result<(), SimError>> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    future.as_mut().poll(&mut cx)
}

/// A waker that does nothing: resumption is driven by the event loop, never
/// by wake notifications.
fn noop_waker() -> Waker {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(|_| RAW, |_| {}, |_| {}, |_| {});
    const RAW: RawWaker = RawWaker::new(std::ptr::null(), &VTABLE);

    // SAFETY: the vtable functions are all no-ops on a null pointer.
    unsafe { Waker::from_raw(RAW) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_drives_a_future_to_completion() {
        let mut steps = 0;
        let mut fut: ProcessFuture = Box::pin(async move {
            steps += 1;
            Ok(())
        });
        match poll_once(&mut fut) {
            Poll::Ready(Ok(())) => {}
            other => panic!("unexpected poll result: {other:?}"),
        }
    }

    #[test]
    fn pending_future_stays_pending() {
        struct Never;
        impl Future for Never {
            type Output = Result<(), SimError>;
            fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
                Poll::Pending
            }
        }
        let mut fut: ProcessFuture = Box::pin(Never);
        assert!(poll_once(&mut fut).is_pending());
        assert!(poll_once(&mut fut).is_pending());
    }
}
