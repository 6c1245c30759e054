//! Resources and assignment agents.
//!
//! A resource is a capacity-constrained static object. Units of a resource
//! are handed to processes by an *assignment agent*: either the resource
//! itself (the default for a stand-alone resource) or a
//! [pool](crate::resource::pool) multiplexing several resources.
//!
//! Assignment never happens inside the request handler. Requests are
//! queued, and a queue-processing round is scheduled at the current
//! simulated time behind every event already pending at that time, so that
//! concurrent requests, releases and takedowns at one simulated instant are
//! all visible before any unit is promised. A stand-alone resource agent
//! applies a *hard priority* discipline: it stops at the first request it
//! cannot fill, even when a later, lower-priority request would fit.

pub mod pool;

use std::cell::RefCell;
use std::fmt;
use std::rc::Weak;

use crate::agent::{AgentId, Message, MessageId, MsgKind, MsgPayload, MsgSender};
use crate::element::EntityId;
use crate::executor::{ProcessId, ResumeSlot, ResumeValue};
use crate::simulation::scheduler::EventKind;
use crate::simulation::{SimError, SimState};
use crate::time::SimTime;

/// Identifier of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) usize);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a live resource assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AssignmentId(pub(crate) usize);

/// The class of a resource, used by pools for class-filtered selection.
///
/// Classes form a hierarchy expressed as a dotted path: the class
/// `"Teller.Merchant"` is a subtype of `"Teller"`. A selector matches every
/// resource whose class equals it or descends from it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceClass(String);

impl ResourceClass {
    /// Creates a class from its dotted path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The dotted path of the class.
    pub fn path(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this class equals `selector` or is a subtype of
    /// it.
    pub fn is_a(&self, selector: &ResourceClass) -> bool {
        self.0 == selector.0
            || (self.0.len() > selector.0.len()
                && self.0.starts_with(&selector.0)
                && self.0.as_bytes()[selector.0.len()] == b'.')
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a request asks for: a specific resource, or any resources of a
/// class (pool requests).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceSelector {
    /// A specific resource.
    Resource(ResourceId),
    /// Any combination of units from resources of a class or its subtypes.
    Class(ResourceClass),
}

/// A queued resource request.
#[derive(Clone, Debug)]
pub struct ResourceRequest {
    /// The requesting process.
    pub process: ProcessId,
    /// The entity the process runs for.
    pub entity: EntityId,
    /// What is being requested.
    pub selector: ResourceSelector,
    /// Number of units requested.
    pub units: u32,
    /// Request priority; lower values go first. Ignored when the agent has
    /// a priority function configured.
    pub priority: i64,
    /// Tie-break between requests of equal priority: enqueue order.
    pub(crate) enqueue_seq: u64,
}

/// Internal state of one resource.
pub(crate) struct ResourceState {
    pub(crate) element_id: String,
    pub(crate) class: ResourceClass,
    pub(crate) capacity: u32,
    pub(crate) in_use: u32,
    /// Nesting count of takedowns; the resource is down while non-zero.
    pub(crate) down_count: u32,
    pub(crate) going_down: bool,
    pub(crate) down_since: Option<SimTime>,
    /// The agent assigning this resource's units (may be the resource's own
    /// agent or a pool).
    pub(crate) agent: AgentId,
    pub(crate) downtime_agents: Vec<AgentId>,
    pub(crate) util_dataset: crate::data::DatasetId,
    pub(crate) down_dataset: crate::data::DatasetId,
    pub(crate) ptime_dataset: crate::data::DatasetId,
}

impl ResourceState {
    pub(crate) fn down(&self) -> bool {
        self.down_count > 0
    }

    /// Units currently down: the whole capacity while the resource is down.
    pub(crate) fn down_units(&self) -> u32 {
        if self.down() {
            self.capacity
        } else {
            0
        }
    }

    /// Units available to new requests: zero while down *or* going down.
    pub(crate) fn available(&self) -> u32 {
        if self.down() || self.going_down {
            0
        } else {
            self.capacity - self.in_use
        }
    }
}

/// Internal record of units assigned to one process by one agent.
pub(crate) struct AssignmentState {
    pub(crate) process: ProcessId,
    pub(crate) agent: AgentId,
    pub(crate) units: Vec<(ResourceId, u32)>,
    pub(crate) acquired_at: SimTime,
}

impl AssignmentState {
    pub(crate) fn total_units(&self) -> u32 {
        self.units.iter().map(|(_, n)| n).sum()
    }

    pub(crate) fn units_of(&self, resource: ResourceId) -> u32 {
        self.units
            .iter()
            .find(|(r, _)| *r == resource)
            .map_or(0, |(_, n)| *n)
    }
}

/// Units of one or more resources held by a process.
///
/// The assignment is a scope guard: dropping it releases whatever units it
/// still holds, exactly once, so resources cannot leak out of a process
/// body on any exit path. Units can also be handed back early with
/// [`release`](ResourceAssignment::release) or in part with
/// [`release_units`](ResourceAssignment::release_units).
pub struct ResourceAssignment {
    state: Weak<RefCell<SimState>>,
    id: AssignmentId,
    process: ProcessId,
}

impl ResourceAssignment {
    pub(crate) fn new(
        state: Weak<RefCell<SimState>>,
        id: AssignmentId,
        process: ProcessId,
    ) -> Self {
        Self { state, id, process }
    }

    /// The resources and unit counts still held.
    pub fn resources(&self) -> Vec<(ResourceId, u32)> {
        match self.state.upgrade() {
            Some(rc) => rc
                .borrow()
                .assignments
                .get(self.id.0)
                .map(|a| a.units.clone())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Total number of units still held.
    pub fn units(&self) -> u32 {
        match self.state.upgrade() {
            Some(rc) => rc
                .borrow()
                .assignments
                .get(self.id.0)
                .map_or(0, |a| a.total_units()),
            None => 0,
        }
    }

    /// The single resource of the assignment.
    ///
    /// Returns `None` if the assignment spans several distinct resources or
    /// holds nothing.
    pub fn resource(&self) -> Option<ResourceId> {
        let resources = self.resources();
        match resources.as_slice() {
            [(r, _)] => Some(*r),
            _ => None,
        }
    }

    /// The simulated time the assignment was made.
    pub fn acquire_time(&self) -> Option<SimTime> {
        self.state
            .upgrade()
            .and_then(|rc| rc.borrow().assignments.get(self.id.0).map(|a| a.acquired_at))
    }

    /// Releases every unit still held.
    pub fn release(mut self) {
        self.release_remaining();
    }

    /// Releases the first `n` units (in resource order) of the assignment.
    pub fn release_units(&mut self, n: u32) {
        if let Some(rc) = self.state.upgrade() {
            let mut sim = rc.borrow_mut();
            let Some(record) = sim.assignments.get(self.id.0) else {
                return;
            };
            let mut remaining = n;
            let mut units = Vec::new();
            for &(resource, held) in &record.units {
                if remaining == 0 {
                    break;
                }
                let take = held.min(remaining);
                units.push((resource, take));
                remaining -= take;
            }
            let agent = record.agent;
            if !units.is_empty() {
                sim.send_message(
                    MsgSender::Process(self.process),
                    agent,
                    MsgKind::Release,
                    MsgPayload::Release {
                        assignment: self.id,
                        units,
                    },
                );
            }
        }
    }

    fn release_remaining(&mut self) {
        if let Some(rc) = self.state.upgrade() {
            // A drop can race with simulation teardown; skip the release if
            // the state is already mutably borrowed on the teardown path.
            let Ok(mut sim) = rc.try_borrow_mut() else {
                return;
            };
            let Some(record) = sim.assignments.get(self.id.0) else {
                return;
            };
            let agent = record.agent;
            let units = record.units.clone();
            if !units.is_empty() {
                sim.send_message(
                    MsgSender::Process(self.process),
                    agent,
                    MsgKind::Release,
                    MsgPayload::Release {
                        assignment: self.id,
                        units,
                    },
                );
            }
        }
    }
}

impl Drop for ResourceAssignment {
    fn drop(&mut self) {
        self.release_remaining();
    }
}

impl fmt::Debug for ResourceAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAssignment")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// The assignment agent of a stand-alone resource.
pub(crate) struct ResourceAgent {
    pub(crate) resource: ResourceId,
}

impl ResourceAgent {
    /// Message handler table of the agent.
    pub(crate) fn handle(&mut self, sim: &mut SimState, me: AgentId, msg: &Message) -> bool {
        match msg.kind {
            // Never fulfilled inline: queue the request and defer assignment
            // behind every event already pending at the current time.
            MsgKind::Request => {
                sim.schedule_queue_processing(me);
                false
            }
            MsgKind::Release => {
                if let MsgPayload::Release { assignment, units } = &msg.payload {
                    sim.apply_release(me, *assignment, units);
                }
                true
            }
            MsgKind::Down | MsgKind::Up => {
                sim.schedule_queue_processing(me);
                true
            }
            MsgKind::GoingDown | MsgKind::Released => true,
        }
    }

    /// The hard-priority assignment round: requests are visited in priority
    /// order and processing stops entirely at the first request that cannot
    /// be filled. A non-`None` `through` bounds the round to the requests at
    /// or above that request's queue position; the acquire-timeout path uses
    /// this for a last fulfillment attempt that cannot leak units to
    /// lower-priority requests.
    pub(crate) fn process_queued_requests(
        &mut self,
        sim: &mut SimState,
        me: AgentId,
        through: Option<MessageId>,
    ) {
        for id in sim.queued_request_ids(me) {
            let Some(request) = sim.queued_request(me, id) else {
                continue;
            };
            let available = sim.resources[self.resource.0].available();
            if request.units > available {
                return;
            }
            sim.commit_assignment(me, id, vec![(self.resource, request.units)]);
            if Some(id) == through {
                return;
            }
        }
    }
}

impl SimState {
    /// Units of a resource currently available to new requests.
    pub(crate) fn resource_available(&self, resource: ResourceId) -> u32 {
        self.resources[resource.0].available()
    }

    /// Emits the utilization transition of a resource.
    pub(crate) fn emit_utilization(&mut self, resource: ResourceId) {
        let r = &self.resources[resource.0];
        let value = r.in_use as f64 / r.capacity as f64;
        let ds = r.util_dataset;
        let now = self.now;
        self.data.set_value(ds, now, value);
    }

    /// Fulfills a queued request with the given units: updates capacity
    /// accounting, records the assignment, removes the request from the
    /// queue and resumes the requesting process.
    pub(crate) fn commit_assignment(
        &mut self,
        agent: AgentId,
        request_id: MessageId,
        units: Vec<(ResourceId, u32)>,
    ) {
        let Some(request) = self.queued_request(agent, request_id) else {
            self.invariant_violation("assignment committed for a request no longer queued");
            return;
        };
        let granted: u32 = units.iter().map(|(_, n)| n).sum();
        if granted != request.units {
            self.invariant_violation(format!(
                "assignment grants {granted} units where the request asked for {}",
                request.units
            ));
            return;
        }
        for &(resource, n) in &units {
            let (agent_ok, available, element_id) = {
                let r = &self.resources[resource.0];
                (r.agent == agent, r.available(), r.element_id.clone())
            };
            if !agent_ok {
                self.invariant_violation("assignment uses a resource managed by another agent");
                return;
            }
            if n == 0 || n > available {
                self.invariant_violation(format!(
                    "assignment of {n} units exceeds availability of resource {element_id}"
                ));
                return;
            }
        }
        for &(resource, n) in &units {
            self.resources[resource.0].in_use += n;
            self.emit_utilization(resource);
        }

        let assignment = AssignmentId(self.assignments.insert(AssignmentState {
            process: request.process,
            agent,
            units,
            acquired_at: self.now,
        }));
        self.remove_queued_message(agent, request_id);

        let process = request.process;
        tracing::debug!(%process, ?assignment, "request fulfilled");
        let entry = &mut self.processes[process.0];
        entry.assignments.push(assignment);
        if let Some(pending) = entry.pending_request.take() {
            if let Some(key) = pending.timeout_event {
                key.cancel();
            }
        }
        entry.slot = ResumeSlot::Ready(ResumeValue::Assignment(assignment));
        // The resumption itself is an event, appended behind everything
        // already pending at the current time.
        let key = self.queue.insert_keyed(self.now, EventKind::Resume(process));
        self.processes[process.0].resume_event = Some(key);
    }

    /// Applies a release: restores unit accounting, updates the assignment
    /// record, notifies the released resources' downtime agents and
    /// schedules a new assignment round.
    pub(crate) fn apply_release(
        &mut self,
        agent: AgentId,
        assignment: AssignmentId,
        units: &[(ResourceId, u32)],
    ) {
        let (process, held) = match self.assignments.get(assignment.0) {
            Some(record) => (record.process, record.units.clone()),
            // Already fully released (e.g. guard drop after a force
            // release); nothing to do.
            None => return,
        };
        let held_of = |resource: ResourceId| {
            held.iter()
                .find(|(r, _)| *r == resource)
                .map_or(0, |(_, n)| *n)
        };
        for &(resource, n) in units {
            if held_of(resource) < n {
                self.invariant_violation("release of units not contained in the assignment");
                return;
            }
            if self.resources[resource.0].agent != agent {
                self.invariant_violation("release sent to an agent that does not manage the resource");
                return;
            }
        }

        for &(resource, n) in units {
            let r = &mut self.resources[resource.0];
            r.in_use -= n;
            self.emit_utilization(resource);
            let record = &mut self.assignments[assignment.0];
            for pair in record.units.iter_mut() {
                if pair.0 == resource {
                    pair.1 -= n;
                }
            }
            record.units.retain(|(_, n)| *n > 0);
        }

        let fully_released = self.assignments[assignment.0].units.is_empty();
        if fully_released {
            let record = self.assignments.remove(assignment.0);
            let held = (self.now - record.acquired_at).value();
            for &(resource, _) in units {
                let ds = self.resources[resource.0].ptime_dataset;
                let now = self.now;
                self.data.put_value(ds, now, held);
            }
            if let Some(entry) = self.processes.get_mut(process.0) {
                entry.assignments.retain(|a| *a != assignment);
            }
        }

        // Downtime agents may be waiting for the resource to go idle.
        for &(resource, _) in units {
            let agents = self.resources[resource.0].downtime_agents.clone();
            for downtime_agent in agents {
                self.send_message(
                    MsgSender::Agent(agent),
                    downtime_agent,
                    MsgKind::Released,
                    MsgPayload::Resource(resource),
                );
            }
        }

        self.schedule_queue_processing(agent);
    }

    /// Force-releases every unit of a resource and interrupts the holding
    /// processes with a [`SimError::ResourceDown`]. Called on hard
    /// takedown. Held time is not reported to the process-time dataset for
    /// interrupted services.
    pub(crate) fn force_release_holders(&mut self, resource: ResourceId) {
        let holders: Vec<(AssignmentId, ProcessId, u32)> = self
            .assignments
            .iter()
            .filter_map(|(id, a)| {
                let n = a.units_of(resource);
                (n > 0).then_some((AssignmentId(id), a.process, n))
            })
            .collect();

        let mut interrupted: Vec<ProcessId> = Vec::new();
        for (assignment, process, n) in holders {
            let record = &mut self.assignments[assignment.0];
            record.units.retain(|(r, _)| *r != resource);
            let fully_released = record.units.is_empty();
            if fully_released {
                self.assignments.remove(assignment.0);
                self.processes[process.0]
                    .assignments
                    .retain(|a| *a != assignment);
            }
            let r = &mut self.resources[resource.0];
            r.in_use -= n;
            self.emit_utilization(resource);

            if !interrupted.contains(&process) {
                interrupted.push(process);
                self.interrupt_process(process, SimError::ResourceDown { resource });
            }
        }
    }

    /// Schedules an interrupt event delivering an error into a process.
    pub(crate) fn interrupt_process(&mut self, process: ProcessId, error: SimError) {
        let key = self
            .queue
            .insert_keyed(self.now, EventKind::Interrupt(process, error.clone()));
        self.processes[process.0].interrupt_event = Some(key);
        tracing::debug!(%process, %error, "interrupt scheduled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_hierarchy_matching() {
        let teller = ResourceClass::new("Teller");
        let merchant = ResourceClass::new("Teller.Merchant");
        let telephone = ResourceClass::new("Telephone");

        assert!(merchant.is_a(&teller));
        assert!(teller.is_a(&teller));
        assert!(!teller.is_a(&merchant));
        assert!(!telephone.is_a(&teller));
    }
}
