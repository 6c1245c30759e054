//! Resource pools: assignment agents over heterogeneous resource sets.
//!
//! A pool owns the assignment of several member resources and fills
//! requests selected by [`ResourceClass`] (or aimed at a specific member).
//! Unlike the stand-alone resource agent, a pool keeps going after an
//! unfillable request: later requests are still considered as long as they
//! cannot consume units the stalled higher-priority request needs. The
//! committed invariant is that a lower-priority request is fulfilled in a
//! round only if none of the units it receives could have served a
//! still-unfulfilled higher-priority request.
//!
//! The round is driven by an [`AssignmentPolicy`], the engine's main
//! extension seam: models with domain-specific dispatch rules ("merchant
//! tellers serve merchants first, but take regulars when no merchant is
//! waiting") replace [`DefaultAssignmentPolicy`] with their own and commit
//! assignments through [`PoolApi::assign_resource`].

use crate::agent::{AgentId, AgentKind, Message, MessageId, MsgKind, MsgPayload};
use crate::resource::{ResourceClass, ResourceId, ResourceRequest, ResourceSelector};
use crate::simulation::SimState;
use crate::time::SimTime;

/// A snapshot of one queued request, handed to assignment policies.
#[derive(Clone, Debug)]
pub struct RequestRef {
    /// Queue identity of the request; committing an assignment consumes it.
    pub id: MessageId,
    /// The request content.
    pub request: ResourceRequest,
}

/// A pool assignment algorithm.
///
/// Implementations are called once per queue-processing round. They may
/// only hand out units through [`PoolApi::assign_resource`] /
/// [`PoolApi::assign_resources`], which preserve the capacity invariants;
/// a policy cannot overdraw a resource. When `through` is set, the round
/// must stop once that request has been considered: this bounds the final
/// fulfillment attempt of an expiring request so it cannot backfill
/// lower-priority requests.
pub trait AssignmentPolicy: 'static {
    /// Runs one assignment round.
    fn process_queued_requests(&mut self, pool: &mut PoolApi<'_>, through: Option<MessageId>);
}

/// The default pool algorithm.
///
/// Requests are visited in priority order. A request that cannot be filled
/// blocks its selector: later requests for the same resource, the same
/// class or a subtype are skipped, and the blocked units are withheld from
/// later greedy gathering, reserving them for the stalled request.
#[derive(Debug, Default)]
pub struct DefaultAssignmentPolicy;

impl AssignmentPolicy for DefaultAssignmentPolicy {
    fn process_queued_requests(&mut self, pool: &mut PoolApi<'_>, through: Option<MessageId>) {
        let mut blocked_resources: Vec<ResourceId> = Vec::new();
        let mut blocked_classes: Vec<ResourceClass> = Vec::new();

        for req in pool.queued_requests() {
            let selector_blocked = match &req.request.selector {
                ResourceSelector::Resource(r) => {
                    blocked_resources.contains(r)
                        || blocked_classes
                            .iter()
                            .any(|c| pool.resource_class(*r).is_a(c))
                }
                ResourceSelector::Class(c) => blocked_classes.iter().any(|b| c.is_a(b)),
            };

            if !selector_blocked {
                let eligible: Vec<ResourceId> = pool
                    .eligible_resources(&req.request.selector)
                    .into_iter()
                    .filter(|r| {
                        !blocked_resources.contains(r)
                            && !blocked_classes.iter().any(|c| pool.resource_class(*r).is_a(c))
                    })
                    .collect();
                if !pool.try_assign_from(&req, &eligible) {
                    match &req.request.selector {
                        ResourceSelector::Resource(r) => blocked_resources.push(*r),
                        ResourceSelector::Class(c) => blocked_classes.push(c.clone()),
                    }
                }
            }

            if Some(req.id) == through {
                return;
            }
        }
    }
}

/// The view of the simulation a pool policy operates through.
pub struct PoolApi<'a> {
    sim: &'a mut SimState,
    me: AgentId,
    members: &'a [ResourceId],
}

impl PoolApi<'_> {
    /// The current simulation time.
    pub fn now(&self) -> SimTime {
        self.sim.now
    }

    /// The pool's member resources, in registration order.
    pub fn members(&self) -> &[ResourceId] {
        self.members
    }

    /// The queued requests, sorted by priority then enqueue order.
    pub fn queued_requests(&self) -> Vec<RequestRef> {
        self.sim
            .queued_request_ids(self.me)
            .into_iter()
            .filter_map(|id| {
                self.sim
                    .queued_request(self.me, id)
                    .map(|request| RequestRef { id, request })
            })
            .collect()
    }

    /// Whether a request is still queued (it may have been fulfilled
    /// earlier in the same round).
    pub fn is_queued(&self, req: &RequestRef) -> bool {
        self.sim.queued_request(self.me, req.id).is_some()
    }

    /// The class of a member resource.
    pub fn resource_class(&self, resource: ResourceId) -> ResourceClass {
        self.sim.resources[resource.0].class.clone()
    }

    /// Currently assignable units of a member resource.
    pub fn resource_available(&self, resource: ResourceId) -> u32 {
        self.sim.resource_available(resource)
    }

    /// Members whose class matches the class filter (every member when
    /// `None`), in registration order.
    pub fn resources(&self, class: Option<&ResourceClass>) -> Vec<ResourceId> {
        self.members
            .iter()
            .copied()
            .filter(|r| match class {
                None => true,
                Some(c) => self.sim.resources[r.0].class.is_a(c),
            })
            .collect()
    }

    /// Members matching a request selector, in registration order.
    pub fn eligible_resources(&self, selector: &ResourceSelector) -> Vec<ResourceId> {
        match selector {
            ResourceSelector::Resource(r) => {
                if self.members.contains(r) {
                    vec![*r]
                } else {
                    Vec::new()
                }
            }
            ResourceSelector::Class(c) => self.resources(Some(c)),
        }
    }

    /// Sum of member capacities under a class filter.
    pub fn size(&self, class: Option<&ResourceClass>) -> u32 {
        self.resources(class)
            .iter()
            .map(|r| self.sim.resources[r.0].capacity)
            .sum()
    }

    /// Sum of currently assignable units under a class filter.
    pub fn available(&self, class: Option<&ResourceClass>) -> u32 {
        self.resources(class)
            .iter()
            .map(|r| self.sim.resource_available(*r))
            .sum()
    }

    /// Greedily gathers units for a request from the candidate resources in
    /// the given order and commits the assignment if the request can be
    /// met in full. Returns `true` on fulfillment; partial fulfillment is
    /// never committed.
    pub fn try_assign_from(&mut self, req: &RequestRef, candidates: &[ResourceId]) -> bool {
        let mut needed = req.request.units;
        let mut units: Vec<(ResourceId, u32)> = Vec::new();
        for &resource in candidates {
            if needed == 0 {
                break;
            }
            let take = self.sim.resource_available(resource).min(needed);
            if take > 0 {
                units.push((resource, take));
                needed -= take;
            }
        }
        if needed > 0 {
            return false;
        }
        self.assign_resources(req, units);
        true
    }

    /// Commits an assignment of `units` units of a single resource to a
    /// request. The units must cover the full request.
    pub fn assign_resource(&mut self, req: &RequestRef, resource: ResourceId, units: u32) {
        self.assign_resources(req, vec![(resource, units)]);
    }

    /// Commits a multi-resource assignment to a request. The units must sum
    /// to the requested number; violations of capacity or request
    /// accounting halt the run as an invariant violation.
    pub fn assign_resources(&mut self, req: &RequestRef, units: Vec<(ResourceId, u32)>) {
        self.sim.commit_assignment(self.me, req.id, units);
    }
}

/// The behavior of a pool assignment agent.
pub(crate) struct PoolAgent {
    pub(crate) members: Vec<ResourceId>,
    pub(crate) policy: Box<dyn AssignmentPolicy>,
}

impl PoolAgent {
    /// Message handler table of the agent; identical in shape to the
    /// stand-alone resource agent.
    pub(crate) fn handle(&mut self, sim: &mut SimState, me: AgentId, msg: &Message) -> bool {
        match msg.kind {
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

    pub(crate) fn process_queued_requests(
        &mut self,
        sim: &mut SimState,
        me: AgentId,
        through: Option<MessageId>,
    ) {
        let mut api = PoolApi {
            sim,
            me,
            members: &self.members,
        };
        self.policy.process_queued_requests(&mut api, through);
    }
}

impl SimState {
    /// Total capacity of a pool's members under a class filter, or `None`
    /// if the agent is not a pool.
    pub(crate) fn pool_capacity(&self, agent: AgentId, class: &ResourceClass) -> Option<u32> {
        match self.agents.get(agent.0)?.behavior.as_ref()? {
            AgentKind::Pool(pool) => Some(
                pool.members
                    .iter()
                    .filter(|r| self.resources[r.0].class.is_a(class))
                    .map(|r| self.resources[r.0].capacity)
                    .sum(),
            ),
            _ => None,
        }
    }
}
