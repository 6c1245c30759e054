//! Discrete-event simulation management.
//!
//! This module contains the [`Simulation`] environment, the [`SimInit`]
//! builder and the engine-wide error type [`SimError`].
//!
//! # Simulation lifecycle
//!
//! 1. instantiation of a [`SimInit`] builder, configuration and data sink
//!    injection,
//! 2. definition of the static model: locations, resources, pools, sources
//!    with their entity generators, downtime agents,
//! 3. initialization of a [`Simulation`] with [`SimInit::init`], passing
//!    the replication index,
//! 4. execution: [`Simulation::run_until`] for ad-hoc runs, or
//!    [`Simulation::run_single`] for a warmup-plus-batches production run
//!    emitting to the data sink.
//!
//! # The event loop
//!
//! The event queue is a priority queue keyed by `(time, sequence)`. Each
//! step pops the earliest non-cancelled event, advances the clock to its
//! time and dispatches it. Dispatching may resume a process coroutine, run
//! an agent's queued-request processing, fire a source or drive a downtime
//! agent; anything it does may schedule further events, but only the loop
//! itself ever advances the clock. Two events at the same time fire in
//! scheduling order, so an event scheduled "now" from within a dispatch
//! runs after everything already pending at the current time.

pub(crate) mod scheduler;
mod sim_init;

pub use scheduler::EventKey;
pub use sim_init::SimInit;

use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::rc::{Rc, Weak};
use std::task::Poll;

use slab::Slab;

use crate::agent::AgentEntry;
use crate::config::SimConfig;
use crate::data::{CounterId, CounterState, DataLayer};
use crate::element::{
    ElementRegistry, EntityElement, EntityState, LocationId, LocationState, ProcessElement,
    StartupProcess,
};
use crate::executor::{self, ProcessEntry, ProcessId, ResumeSlot, ResumeValue};
use crate::process::ProcessContext;
use crate::random::RandomStreams;
use crate::resource::{AssignmentState, ResourceId, ResourceState};
use crate::time::{SimTime, TimeUnit, UnitMismatchError};
use scheduler::{EventKind, SchedulerQueue};

/// The engine-wide error type.
///
/// `TimedOut` and `ResourceDown` are ordinary outcomes of blocking
/// operations and are meant to be caught by model code; the other kinds
/// are fatal for the run.
#[derive(Clone, Debug, PartialEq)]
pub enum SimError {
    /// A malformed request: zero units, more units than capacity, a
    /// negative delay, an overlapping downtime schedule...
    InvalidRequest(String),
    /// Arithmetic between dimensioned and dimensionless simulated times.
    UnitMismatch(String),
    /// An `acquire` timeout expired before the request was fulfilled.
    TimedOut,
    /// A resource held by the process was taken down; its units were
    /// reclaimed.
    ResourceDown {
        /// The resource that went down.
        resource: ResourceId,
    },
    /// An error escaped a process body and halted the run.
    ModelError(String),
    /// An engine or custom-agent bug was detected; the run halts.
    SchedulerInvariant(String),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Self::UnitMismatch(msg) => write!(f, "unit mismatch: {msg}"),
            Self::TimedOut => write!(f, "resource acquisition timed out"),
            Self::ResourceDown { resource } => {
                write!(f, "resource {resource} was taken down")
            }
            Self::ModelError(msg) => write!(f, "model error: {msg}"),
            Self::SchedulerInvariant(msg) => write!(f, "scheduler invariant violated: {msg}"),
        }
    }
}

impl Error for SimError {}

impl From<UnitMismatchError> for SimError {
    fn from(e: UnitMismatchError) -> Self {
        Self::UnitMismatch(e.to_string())
    }
}

/// The whole mutable state of one run.
///
/// Everything lives in per-kind arenas indexed by the public id types; the
/// non-owning cross-references mandated by the model (a resource knows its
/// assignment agent, a downtime agent its resource, a process its
/// assignments) are stored as indices into these arenas.
pub struct SimState {
    pub(crate) now: SimTime,
    pub(crate) queue: SchedulerQueue,
    pub(crate) processes: Slab<ProcessEntry>,
    pub(crate) agents: Slab<AgentEntry>,
    pub(crate) resources: Slab<ResourceState>,
    pub(crate) assignments: Slab<AssignmentState>,
    pub(crate) entities: Slab<EntityState>,
    pub(crate) locations: Slab<LocationState>,
    pub(crate) counters: Slab<CounterState>,
    pub(crate) process_elements: Vec<ProcessElement>,
    pub(crate) entity_elements: Vec<EntityElement>,
    pub(crate) startups: Vec<StartupProcess>,
    pub(crate) registry: ElementRegistry,
    pub(crate) data: DataLayer,
    pub(crate) streams: RandomStreams,
    pub(crate) config: SimConfig,
    pub(crate) base_unit: Option<TimeUnit>,
    pub(crate) next_message_id: u64,
    pub(crate) next_request_seq: u64,
    pub(crate) run_index: u32,
    pub(crate) fatal: Option<SimError>,
    pub(crate) self_ref: Weak<RefCell<SimState>>,
    pub(crate) trace_count: u64,
}

impl SimState {
    /// Applies the model base unit to a time value.
    pub(crate) fn coerce_time(&self, t: SimTime) -> Result<SimTime, SimError> {
        t.coerced(self.base_unit).map_err(SimError::from)
    }

    /// Latches a fatal error; the event loop halts before the next
    /// dispatch.
    pub(crate) fn record_fatal(&mut self, e: SimError) {
        tracing::error!(%e, "fatal simulation error");
        if self.fatal.is_none() {
            self.fatal = Some(e);
        }
    }

    /// Latches an invariant violation as fatal.
    pub(crate) fn invariant_violation(&mut self, msg: impl Into<String>) {
        self.record_fatal(SimError::SchedulerInvariant(msg.into()));
    }

    /// Emits a model trace event, honoring the trace configuration.
    pub(crate) fn trace_event(&mut self, event: &str, detail: &str) {
        if !self.config.trace.enabled {
            return;
        }
        let max = self.config.trace.max_events;
        if max != 0 && self.trace_count >= max {
            return;
        }
        self.trace_count += 1;
        tracing::info!(target: "simproc::trace", time = %self.now, event, detail);
    }

    /// Schedules a resume event for a process at the current time.
    pub(crate) fn schedule_resume(&mut self, process: ProcessId) {
        let key = self
            .queue
            .insert_keyed(self.now, EventKind::Resume(process));
        self.processes[process.0].resume_event = Some(key);
    }

    /// Wakes processes parked on a resource coming back up.
    pub(crate) fn wake_resource_watchers(&mut self, resource: ResourceId) {
        let watchers: Vec<ProcessId> = self
            .processes
            .iter()
            .filter(|(_, e)| e.waiting_resources_up && e.watching.contains(&resource))
            .map(|(i, _)| ProcessId(i))
            .collect();
        for process in watchers {
            let entry = &mut self.processes[process.0];
            entry.waiting_resources_up = false;
            entry.watching.clear();
            if matches!(entry.slot, ResumeSlot::Waiting) {
                self.schedule_resume(process);
            }
        }
    }

    /// Increments a counter on behalf of a process. Returns `false` if the
    /// process was parked waiting for capacity.
    pub(crate) fn counter_increment(
        &mut self,
        process: ProcessId,
        counter: CounterId,
        amount: u64,
    ) -> Result<bool, SimError> {
        if amount == 0 {
            return Err(SimError::InvalidRequest(
                "counter increment must be positive".into(),
            ));
        }
        let granted = {
            let c = self
                .counters
                .get_mut(counter.0)
                .ok_or_else(|| SimError::InvalidRequest("unknown counter".into()))?;
            match c.capacity {
                None => {
                    c.value += amount;
                    true
                }
                Some(cap) => {
                    if amount > cap {
                        return Err(SimError::InvalidRequest(format!(
                            "counter increment of {amount} exceeds the capacity ({cap})"
                        )));
                    }
                    if c.waiting.is_empty() && c.value + amount <= cap {
                        c.value += amount;
                        true
                    } else {
                        c.waiting.push_back((process, amount));
                        false
                    }
                }
            }
        };
        if granted {
            self.emit_counter(counter);
        } else {
            self.processes[process.0].slot = ResumeSlot::Waiting;
        }
        Ok(granted)
    }

    /// Decrements a counter and grants waiting increments in FIFO order.
    pub(crate) fn counter_decrement(
        &mut self,
        counter: CounterId,
        amount: u64,
    ) -> Result<(), SimError> {
        if amount == 0 {
            return Err(SimError::InvalidRequest(
                "counter decrement must be positive".into(),
            ));
        }
        let granted = {
            let c = self
                .counters
                .get_mut(counter.0)
                .ok_or_else(|| SimError::InvalidRequest("unknown counter".into()))?;
            c.value = c.value.saturating_sub(amount);
            let mut granted = Vec::new();
            if let Some(cap) = c.capacity {
                while let Some(&(process, n)) = c.waiting.front() {
                    if c.value + n > cap {
                        break;
                    }
                    c.value += n;
                    c.waiting.pop_front();
                    granted.push(process);
                }
            }
            granted
        };
        self.emit_counter(counter);
        for process in granted {
            self.schedule_resume(process);
        }
        Ok(())
    }

    /// Emits the current (possibly normalized) value of a counter.
    pub(crate) fn emit_counter(&mut self, counter: CounterId) {
        let (ds, value) = {
            let c = &self.counters[counter.0];
            (c.dataset, c.value as f64 / c.normalizer)
        };
        let now = self.now;
        self.data.set_value(ds, now, value);
    }

    /// Draws the next interarrival of a generator and schedules its
    /// arrival event.
    pub(crate) fn schedule_next_arrival(
        &mut self,
        source: crate::element::LocationId,
        generator: usize,
    ) {
        let sampler = self.locations[source.0].generators[generator]
            .interarrival
            .clone();
        let dt = match sampler
            .sample_time(&mut self.streams)
            .map_err(|e| SimError::InvalidRequest(e.to_string()))
            .and_then(|t| self.coerce_time(t))
        {
            Ok(dt) => dt,
            Err(e) => {
                self.record_fatal(e);
                return;
            }
        };
        let next = match self.now.checked_add(dt) {
            Ok(t) => t,
            Err(e) => {
                self.record_fatal(e.into());
                return;
            }
        };
        self.queue
            .insert(next, EventKind::SourceArrival { source, generator });
    }

    /// Fires one entity generator: schedules the next arrival, creates the
    /// entity and spawns its process.
    pub(crate) fn source_arrival(&mut self, source: crate::element::LocationId, generator: usize) {
        let (entity_element, process_element) = {
            let g = &self.locations[source.0].generators[generator];
            (g.entity_element, g.process_element)
        };
        self.schedule_next_arrival(source, generator);
        if self.fatal.is_some() {
            return;
        }

        let entity = self.create_entity(entity_element, source);
        let process = ProcessId(self.processes.insert(ProcessEntry::new(entity, process_element)));
        self.entities[entity.0].process = Some(process);
        let ctx = ProcessContext::new(self.self_ref.clone(), process);
        let future = (self.locations[source.0].generators[generator].body)(ctx);
        self.processes[process.0].future = Some(future);
        self.queue.insert(self.now, EventKind::StartProcess(process));
        let source_id = self.locations[source.0].element_id.clone();
        self.trace_event("arrival", &source_id);
    }

    /// Fires a one-shot startup process.
    pub(crate) fn startup(&mut self, index: usize) {
        let (location, entity_element, process_element, body) = {
            let s = &mut self.startups[index];
            match s.body.take() {
                Some(body) => (s.location, s.entity_element, s.process_element, body),
                None => return,
            }
        };
        let entity = self.create_entity(entity_element, location);
        let process = ProcessId(self.processes.insert(ProcessEntry::new(entity, process_element)));
        self.entities[entity.0].process = Some(process);
        let ctx = ProcessContext::new(self.self_ref.clone(), process);
        self.processes[process.0].future = Some(body(ctx));
        self.queue.insert(self.now, EventKind::StartProcess(process));
    }
}

impl fmt::Debug for SimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimState")
            .field("time", &self.now)
            .finish_non_exhaustive()
    }
}

/// Simulation environment.
///
/// A `Simulation` is created by calling [`SimInit::init`] on a builder. It
/// owns the event queue, the clock and every model element, and drives
/// simulated time forward one event at a time.
pub struct Simulation {
    state: Rc<RefCell<SimState>>,
}

impl Simulation {
    pub(crate) fn new(state: Rc<RefCell<SimState>>) -> Self {
        Self { state }
    }

    /// Returns the current simulation time.
    pub fn time(&self) -> SimTime {
        self.state.borrow().now
    }

    /// Units of a resource currently assigned to processes.
    pub fn resource_in_use(&self, resource: ResourceId) -> u32 {
        self.state.borrow().resources[resource.0].in_use
    }

    /// Units of a resource currently assignable to new requests.
    pub fn resource_available(&self, resource: ResourceId) -> u32 {
        self.state.borrow().resource_available(resource)
    }

    /// Whether a resource is currently down.
    pub fn resource_is_down(&self, resource: ResourceId) -> bool {
        self.state.borrow().resources[resource.0].down()
    }

    /// Whether a resource is currently going down.
    pub fn resource_is_going_down(&self, resource: ResourceId) -> bool {
        self.state.borrow().resources[resource.0].going_down
    }

    /// The population of a location (the size, for a queue).
    pub fn population(&self, location: LocationId) -> usize {
        self.state.borrow().locations[location.0].population.len()
    }

    /// Processes the next event, if any. Returns `false` when the event
    /// queue is empty.
    pub fn step(&mut self) -> Result<bool, SimError> {
        let next = {
            let mut state = self.state.borrow_mut();
            if let Some(e) = state.fatal.clone() {
                return Err(e);
            }
            state.queue.pull()
        };
        let Some((time, kind)) = next else {
            return Ok(false);
        };

        {
            let mut state = self.state.borrow_mut();
            if time < state.now {
                state.invariant_violation("event scheduled in the past of the clock");
            } else {
                state.now = time;
            }
        }
        self.dispatch(kind)?;

        let fatal = self.state.borrow().fatal.clone();
        match fatal {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Processes events until the specified simulation time. The clock
    /// lands exactly on `stop_time`, whether or not an event was scheduled
    /// there.
    pub fn run_until(&mut self, stop_time: SimTime) -> Result<(), SimError> {
        let stop_time = {
            let state = self.state.borrow();
            state.coerce_time(stop_time)?
        };
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                if let Some(e) = state.fatal.clone() {
                    return Err(e);
                }
                state.queue.next_time()
            };
            match next {
                Some(t) if t <= stop_time => {
                    self.step()?;
                }
                _ => {
                    let mut state = self.state.borrow_mut();
                    if state.now < stop_time {
                        state.now = stop_time;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Processes events while the predicate holds and events remain.
    pub fn run_while(&mut self, mut predicate: impl FnMut(&Simulation) -> bool) -> Result<(), SimError> {
        while predicate(self) {
            if !self.step()? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Processes events until the queue runs dry.
    pub fn run(&mut self) -> Result<(), SimError> {
        while self.step()? {}
        Ok(())
    }

    /// Runs one full replication: the warmup interval as batch 0, then
    /// `nbatches` batches of `batch_length`, emitting batch boundaries and
    /// run begin/end to the data sink.
    pub fn run_single(
        &mut self,
        warmup: SimTime,
        batch_length: SimTime,
        nbatches: u32,
    ) -> Result<(), SimError> {
        let (warmup, batch_length, run) = {
            let state = self.state.borrow();
            (
                state.coerce_time(warmup)?,
                state.coerce_time(batch_length)?,
                state.run_index,
            )
        };
        {
            let mut state = self.state.borrow_mut();
            state.data.run = run;
            state.data.batch = 0;
            state.data.sink.begin_run(run);
            state.data.sink.begin_batch(run, 0);
        }

        let mut mark = self.time().checked_add(warmup)?;
        self.run_until(mark)?;

        for batch in 1..=nbatches {
            {
                let mut state = self.state.borrow_mut();
                let now = state.now;
                state.data.flush_timeweighted(now);
                state.data.sink.end_batch(run, batch - 1);
                state.data.batch = batch;
                state.data.sink.begin_batch(run, batch);
            }
            mark = mark.checked_add(batch_length)?;
            self.run_until(mark)?;
        }

        {
            let mut state = self.state.borrow_mut();
            let now = state.now;
            state.data.flush_timeweighted(now);
            state.data.sink.end_batch(run, nbatches);
            state.data.sink.end_run(run);
        }
        Ok(())
    }

    /// Dispatches one event.
    fn dispatch(&mut self, kind: EventKind) -> Result<(), SimError> {
        match kind {
            EventKind::StartProcess(process) => {
                {
                    let mut state = self.state.borrow_mut();
                    let state = &mut *state;
                    let element = {
                        let entry = &mut state.processes[process.0];
                        entry.running = true;
                        entry.started_at = state.now;
                        entry.element
                    };
                    let now = state.now;
                    let (inproc_ds, entries_ds, in_process, entries) = {
                        let e = &mut state.process_elements[element];
                        e.in_process += 1;
                        e.entries += 1;
                        (e.inproc_dataset, e.entries_dataset, e.in_process, e.entries)
                    };
                    state.data.set_value(inproc_ds, now, in_process as f64);
                    state.data.put_value(entries_ds, now, entries as f64);
                }
                self.poll_process(process)
            }
            EventKind::Resume(process) => {
                let poll = {
                    let mut state = self.state.borrow_mut();
                    if !state.processes.contains(process.0) {
                        return Ok(());
                    }
                    let entry = &mut state.processes[process.0];
                    entry.resume_event = None;
                    if let Some(key) = entry.interrupt_event.take() {
                        key.cancel();
                    }
                    match entry.slot {
                        ResumeSlot::Waiting => {
                            entry.slot = ResumeSlot::Ready(ResumeValue::Wake);
                            true
                        }
                        ResumeSlot::Ready(_) => true,
                        ResumeSlot::Idle | ResumeSlot::Failed(_) => false,
                    }
                };
                if poll {
                    self.poll_process(process)?;
                }
                Ok(())
            }
            EventKind::Interrupt(process, error) => {
                let (poll, pending) = {
                    let mut state = self.state.borrow_mut();
                    if !state.processes.contains(process.0) {
                        return Ok(());
                    }
                    let entry = &mut state.processes[process.0];
                    entry.interrupt_event = None;
                    if !matches!(entry.slot, ResumeSlot::Waiting) {
                        (false, None)
                    } else {
                        if let Some(key) = entry.resume_event.take() {
                            key.cancel();
                        }
                        entry.waiting_resources_up = false;
                        entry.watching.clear();
                        entry.slot = ResumeSlot::Failed(error);
                        (true, entry.pending_request.take())
                    }
                };
                if let Some(pending) = pending {
                    let mut state = self.state.borrow_mut();
                    if let Some(key) = pending.timeout_event {
                        key.cancel();
                    }
                    // Withdrawing the request may unblock others.
                    if state.remove_queued_message(pending.agent, pending.message) {
                        state.schedule_queue_processing(pending.agent);
                    }
                }
                if poll {
                    self.poll_process(process)?;
                }
                Ok(())
            }
            EventKind::ProcessQueue(agent) => {
                let mut state = self.state.borrow_mut();
                state.agents[agent.0].core.queue_event = None;
                state.process_queued_requests(agent, None);
                Ok(())
            }
            EventKind::AcquireTimeout {
                agent,
                request,
                process,
            } => {
                let expired = {
                    let mut state = self.state.borrow_mut();
                    // One last fulfillment attempt, bounded at the expiring
                    // request so no unit leaks to lower priorities.
                    state.process_queued_requests(agent, Some(request));
                    if state.queued_request(agent, request).is_some() {
                        state.remove_queued_message(agent, request);
                        state.schedule_queue_processing(agent);
                        let entry = &mut state.processes[process.0];
                        entry.pending_request = None;
                        if let Some(key) = entry.resume_event.take() {
                            key.cancel();
                        }
                        entry.slot = ResumeSlot::Failed(SimError::TimedOut);
                        true
                    } else {
                        false
                    }
                };
                if expired {
                    self.poll_process(process)?;
                }
                Ok(())
            }
            EventKind::SourceArrival { source, generator } => {
                let mut state = self.state.borrow_mut();
                state.source_arrival(source, generator);
                Ok(())
            }
            EventKind::Startup(index) => {
                let mut state = self.state.borrow_mut();
                state.startup(index);
                Ok(())
            }
            EventKind::Takedown(agent) => {
                let mut state = self.state.borrow_mut();
                state.downtime_takedown(agent);
                Ok(())
            }
            EventKind::Bringup(agent) => {
                let mut state = self.state.borrow_mut();
                state.downtime_bringup(agent);
                Ok(())
            }
            EventKind::GoingDownTimeout(agent) => {
                let mut state = self.state.borrow_mut();
                state.downtime_going_down_timeout(agent);
                Ok(())
            }
        }
    }

    /// Polls a process body once, finalizing the process when it returns.
    fn poll_process(&mut self, process: ProcessId) -> Result<(), SimError> {
        let mut future = {
            let mut state = self.state.borrow_mut();
            match state
                .processes
                .get_mut(process.0)
                .and_then(|e| e.future.take())
            {
                Some(f) => f,
                None => return Ok(()),
            }
        };
        match executor::poll_once(&mut future) {
            Poll::Pending => {
                self.state.borrow_mut().processes[process.0].future = Some(future);
                Ok(())
            }
            Poll::Ready(result) => {
                // Dropping the body first lets assignment guards still held
                // inside it run their release paths.
                drop(future);
                self.finalize_process(process, result)
            }
        }
    }

    /// Completes a process: reclaims anything still held, updates the
    /// class-element datasets and removes the process. An error escaping
    /// the body halts the run as a model error.
    fn finalize_process(
        &mut self,
        process: ProcessId,
        result: Result<(), SimError>,
    ) -> Result<(), SimError> {
        let mut state = self.state.borrow_mut();
        let leftovers: Vec<crate::resource::AssignmentId> =
            state.processes[process.0].assignments.clone();
        for assignment in leftovers {
            if let Some(record) = state.assignments.get(assignment.0) {
                let agent = record.agent;
                let units = record.units.clone();
                tracing::debug!(%process, "releasing units left held at process completion");
                state.apply_release(agent, assignment, &units);
            }
        }

        let entry = state.processes.remove(process.0);
        let now = state.now;
        let (inproc_ds, ptime_ds, in_process) = {
            let e = &mut state.process_elements[entry.element];
            e.in_process -= 1;
            (e.inproc_dataset, e.ptime_dataset, e.in_process)
        };
        state.data.set_value(inproc_ds, now, in_process as f64);
        if entry.running && result.is_ok() {
            state
                .data
                .put_value(ptime_ds, now, (now - entry.started_at).value());
        }
        if state.entities.contains(entry.entity.0) {
            state.entities[entry.entity.0].process = None;
        }

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let fatal = SimError::ModelError(e.to_string());
                state.record_fatal(fatal.clone());
                Err(fatal)
            }
        }
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("time", &self.time())
            .finish_non_exhaustive()
    }
}
