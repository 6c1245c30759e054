//! Processes.
//!
//! A process is the imperative lifetime of one entity, written as an
//! `async` body over a [`ProcessContext`]. The context's blocking
//! operations ([`wait_for`](ProcessContext::wait_for),
//! [`acquire`](ProcessContext::acquire),
//! [`acquire_from`](ProcessContext::acquire_from) and capped
//! [`increment`](ProcessContext::increment)) are the only suspension
//! points; everything else runs to completion within the current event.
//! Helper `async fn`s compose freely, so acquisition can live in shared
//! subroutines rather than the body itself.
//!
//! Engine-delivered conditions (`TimedOut`, `ResourceDown`) surface as
//! [`SimError`] values out of the blocking operations; a process that does
//! not care lets them bubble out of its body with `?`, which ends the run
//! as a model error after its resources are reclaimed.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Weak;
use std::task::{Context, Poll};

use crate::agent::{AgentId, MsgKind, MsgPayload, MsgSender};
use crate::data::CounterId;
use crate::element::{EntityId, LocationId};
use crate::executor::{PendingRequest, ProcessId, ResumeSlot, ResumeValue};
use crate::random::{SimDistribution, StreamId, TimeSampler};
use crate::resource::{
    ResourceAssignment, ResourceClass, ResourceId, ResourceRequest, ResourceSelector,
};
use crate::simulation::scheduler::EventKind;
use crate::simulation::{SimError, SimState};
use crate::time::SimTime;

/// A handle to the simulation, scoped to one process.
///
/// The context is handed to the process body at creation and stays valid
/// for the body's lifetime. It is cheap to clone and can be passed into
/// helper functions.
#[derive(Clone)]
pub struct ProcessContext {
    state: Weak<RefCell<SimState>>,
    process: ProcessId,
}

impl ProcessContext {
    pub(crate) fn new(state: Weak<RefCell<SimState>>, process: ProcessId) -> Self {
        Self { state, process }
    }

    /// The process id.
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Runs a closure against the simulation state.
    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> Result<R, SimError> {
        let rc = self
            .state
            .upgrade()
            .ok_or_else(|| SimError::SchedulerInvariant("simulation state dropped".into()))?;
        let mut sim = rc.borrow_mut();
        Ok(f(&mut sim))
    }

    /// The current simulation time.
    pub fn now(&self) -> SimTime {
        self.with(|sim| sim.now).unwrap_or_default()
    }

    /// The entity this process runs for.
    pub fn entity(&self) -> EntityId {
        self.with(|sim| sim.processes[self.process.0].entity)
            .unwrap_or(EntityId(usize::MAX))
    }

    /// The population of a location.
    pub fn population(&self, location: LocationId) -> usize {
        self.with(|sim| sim.locations[location.0].population.len())
            .unwrap_or(0)
    }

    /// Units of a resource currently available to new requests.
    pub fn available(&self, resource: ResourceId) -> u32 {
        self.with(|sim| sim.resource_available(resource)).unwrap_or(0)
    }

    /// Draws the next sample from a time sampler.
    pub fn sample(&self, sampler: &TimeSampler) -> Result<SimTime, SimError> {
        self.with(|sim| {
            let t = sampler
                .sample_time(&mut sim.streams)
                .map_err(|e| SimError::InvalidRequest(e.to_string()))?;
            sim.coerce_time(t)
        })?
    }

    /// Draws the next raw sample of a distribution from a stream.
    pub fn sample_value(&self, dist: &SimDistribution, stream: StreamId) -> Result<f64, SimError> {
        self.with(|sim| {
            sim.streams
                .sample(dist, stream)
                .map_err(|e| SimError::InvalidRequest(e.to_string()))
        })?
    }

    /// Moves the entity to another location. Moving to a sink destroys the
    /// entity; the process then normally returns.
    pub fn move_to(&self, location: LocationId) -> Result<(), SimError> {
        let entity = self.entity();
        self.with(|sim| sim.move_entity(entity, location))?
    }

    /// Suspends the process for a fixed amount of simulated time.
    ///
    /// `wait_for(0)` yields to the event loop: the process resumes at the
    /// same simulated time, after every event already pending at that
    /// time. The wait can end early with a
    /// [`SimError::ResourceDown`] if a resource held by this process is
    /// taken down; see
    /// [`wait_for_through_downtime`](Self::wait_for_through_downtime) for
    /// the variant that absorbs downtime.
    pub async fn wait_for(&self, delta: impl Into<SimTime>) -> Result<(), SimError> {
        let delta = delta.into();
        self.with(|sim| -> Result<(), SimError> {
            let delta = sim.coerce_time(delta)?;
            if delta.is_negative() {
                return Err(SimError::InvalidRequest("negative wait_for delay".into()));
            }
            let at = sim
                .now
                .checked_add(delta)
                .map_err(|e| SimError::InvalidRequest(e.to_string()))?;
            let process = self.process;
            let key = sim.queue.insert_keyed(at, EventKind::Resume(process));
            let entry = &mut sim.processes[process.0];
            entry.resume_event = Some(key);
            entry.slot = ResumeSlot::Waiting;
            Ok(())
        })??;

        match self.resumed().await? {
            ResumeValue::Wake => Ok(()),
            ResumeValue::Assignment(_) => Err(SimError::SchedulerInvariant(
                "assignment delivered into a plain wait".into(),
            )),
        }
    }

    /// Like [`wait_for`](Self::wait_for), but transparently extends the
    /// wait through downtime of held resources: a
    /// [`SimError::ResourceDown`] interrupting the wait is absorbed, the
    /// process waits for the resource to come back up, and the remaining
    /// wait then continues. The total wait becomes the requested amount
    /// plus the time the resource was down.
    pub async fn wait_for_through_downtime(
        &self,
        delta: impl Into<SimTime>,
    ) -> Result<(), SimError> {
        let mut remaining = self.with(|sim| sim.coerce_time(delta.into()))??;
        loop {
            let start = self.now();
            match self.wait_for(remaining).await {
                Ok(()) => return Ok(()),
                Err(SimError::ResourceDown { resource }) => {
                    let elapsed = self.now() - start;
                    remaining = remaining - elapsed;
                    if remaining.is_negative() {
                        remaining = remaining * 0.0;
                    }
                    self.wait_until_resource_up(resource).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Parks the process until a resource is back up. Further takedowns
    /// interrupting the park extend it: the process waits until every
    /// resource whose downtime it observed here is up again.
    pub async fn wait_until_resource_up(&self, resource: ResourceId) -> Result<(), SimError> {
        let mut watched: Vec<ResourceId> = vec![resource];
        loop {
            let parked = self.with(|sim| {
                watched.retain(|r| sim.resources[r.0].down());
                if watched.is_empty() {
                    return false;
                }
                let entry = &mut sim.processes[self.process.0];
                entry.waiting_resources_up = true;
                entry.watching = watched.clone();
                entry.slot = ResumeSlot::Waiting;
                true
            })?;
            if !parked {
                return Ok(());
            }
            match self.resumed().await {
                Ok(ResumeValue::Wake) => continue,
                Ok(ResumeValue::Assignment(_)) => {
                    return Err(SimError::SchedulerInvariant(
                        "assignment delivered into an up-wait".into(),
                    ))
                }
                Err(SimError::ResourceDown { resource }) => {
                    if !watched.contains(&resource) {
                        watched.push(resource);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquires units of a resource, suspending until they are assigned.
    pub async fn acquire(
        &self,
        resource: ResourceId,
        units: u32,
    ) -> Result<ResourceAssignment, SimError> {
        self.acquire_with(resource, units, 0, None).await
    }

    /// Acquires units of a resource with an explicit priority (lower values
    /// go first) and an optional timeout. On expiry the request is
    /// withdrawn and [`SimError::TimedOut`] is returned.
    pub async fn acquire_with(
        &self,
        resource: ResourceId,
        units: u32,
        priority: i64,
        timeout: Option<SimTime>,
    ) -> Result<ResourceAssignment, SimError> {
        let agent = self.with(|sim| -> Result<AgentId, SimError> {
            let r = sim
                .resources
                .get(resource.0)
                .ok_or_else(|| SimError::InvalidRequest("acquire of an unknown resource".into()))?;
            if units == 0 {
                return Err(SimError::InvalidRequest(
                    "acquire requires at least one unit".into(),
                ));
            }
            if units > r.capacity {
                return Err(SimError::InvalidRequest(format!(
                    "acquire of {units} units exceeds the capacity ({}) of resource {}",
                    r.capacity, r.element_id
                )));
            }
            Ok(r.agent)
        })??;
        self.acquire_impl(agent, ResourceSelector::Resource(resource), units, priority, timeout)
            .await
    }

    /// Acquires units of any resources of a class from a pool agent.
    pub async fn acquire_from(
        &self,
        pool: AgentId,
        class: ResourceClass,
        units: u32,
    ) -> Result<ResourceAssignment, SimError> {
        self.acquire_from_with(pool, class, units, 0, None).await
    }

    /// Class-filtered acquisition with an explicit priority and an optional
    /// timeout.
    pub async fn acquire_from_with(
        &self,
        pool: AgentId,
        class: ResourceClass,
        units: u32,
        priority: i64,
        timeout: Option<SimTime>,
    ) -> Result<ResourceAssignment, SimError> {
        self.with(|sim| -> Result<(), SimError> {
            if units == 0 {
                return Err(SimError::InvalidRequest(
                    "acquire requires at least one unit".into(),
                ));
            }
            let size = sim.pool_capacity(pool, &class).ok_or_else(|| {
                SimError::InvalidRequest("acquire_from requires a pool assignment agent".into())
            })?;
            if units > size {
                return Err(SimError::InvalidRequest(format!(
                    "acquire of {units} units of class {class} exceeds the pool size ({size})"
                )));
            }
            Ok(())
        })??;
        self.acquire_impl(pool, ResourceSelector::Class(class), units, priority, timeout)
            .await
    }

    async fn acquire_impl(
        &self,
        agent: AgentId,
        selector: ResourceSelector,
        units: u32,
        priority: i64,
        timeout: Option<SimTime>,
    ) -> Result<ResourceAssignment, SimError> {
        self.with(|sim| -> Result<(), SimError> {
            let process = self.process;
            let entity = sim.processes[process.0].entity;
            let enqueue_seq = sim.next_request_seq;
            sim.next_request_seq += 1;

            let request = ResourceRequest {
                process,
                entity,
                selector,
                units,
                priority,
                enqueue_seq,
            };
            let message =
                sim.send_message(MsgSender::Process(process), agent, MsgKind::Request, MsgPayload::Request(request));

            let timeout_event = match timeout {
                Some(t) => {
                    let t = sim.coerce_time(t)?;
                    if t.is_negative() {
                        return Err(SimError::InvalidRequest("negative acquire timeout".into()));
                    }
                    let at = sim
                        .now
                        .checked_add(t)
                        .map_err(|e| SimError::InvalidRequest(e.to_string()))?;
                    Some(sim.queue.insert_keyed(
                        at,
                        EventKind::AcquireTimeout {
                            agent,
                            request: message,
                            process,
                        },
                    ))
                }
                None => None,
            };

            let entry = &mut sim.processes[process.0];
            entry.pending_request = Some(PendingRequest {
                agent,
                message,
                timeout_event,
            });
            entry.slot = ResumeSlot::Waiting;
            Ok(())
        })??;

        match self.resumed().await? {
            ResumeValue::Assignment(id) => Ok(ResourceAssignment::new(
                self.state.clone(),
                id,
                self.process,
            )),
            ResumeValue::Wake => Err(SimError::SchedulerInvariant(
                "plain wake delivered into an acquire".into(),
            )),
        }
    }

    /// Releases an assignment in full.
    ///
    /// Equivalent to dropping it; the method exists for the symmetry of
    /// `acquire`/`release` call sites.
    pub fn release(&self, assignment: ResourceAssignment) {
        assignment.release();
    }

    /// Increments a counter, suspending while a finite-capacity counter
    /// lacks the headroom. Blocked increments are granted in FIFO order as
    /// decrements free capacity.
    pub async fn increment(&self, counter: CounterId, amount: u64) -> Result<(), SimError> {
        let granted = self.with(|sim| sim.counter_increment(self.process, counter, amount))??;
        if granted {
            return Ok(());
        }
        match self.resumed().await? {
            ResumeValue::Wake => Ok(()),
            ResumeValue::Assignment(_) => Err(SimError::SchedulerInvariant(
                "assignment delivered into a counter wait".into(),
            )),
        }
    }

    /// Decrements a counter. Never suspends; granting blocked increments
    /// happens through scheduled resumptions.
    pub fn decrement(&self, counter: CounterId, amount: u64) -> Result<(), SimError> {
        self.with(|sim| sim.counter_decrement(counter, amount))?
    }

    /// The future that suspends the process until the event loop delivers
    /// a value or an error.
    fn resumed(&self) -> WaitForResume {
        WaitForResume {
            state: self.state.clone(),
            process: self.process,
        }
    }
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// Future resolving when the event loop resumes the owning process.
struct WaitForResume {
    state: Weak<RefCell<SimState>>,
    process: ProcessId,
}

impl Future for WaitForResume {
    type Output = Result<ResumeValue, SimError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rc) = self.state.upgrade() else {
            return Poll::Ready(Err(SimError::SchedulerInvariant(
                "simulation state dropped".into(),
            )));
        };
        let mut sim = rc.borrow_mut();
        let entry = &mut sim.processes[self.process.0];
        match std::mem::take(&mut entry.slot) {
            ResumeSlot::Ready(value) => Poll::Ready(Ok(value)),
            ResumeSlot::Failed(e) => Poll::Ready(Err(e)),
            other @ (ResumeSlot::Waiting | ResumeSlot::Idle) => {
                entry.slot = other;
                Poll::Pending
            }
        }
    }
}
