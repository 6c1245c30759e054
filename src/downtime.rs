//! Downtime agents.
//!
//! A downtime agent takes one resource down and later brings it back up.
//! Several agents may manage the same resource (say, a break schedule and a
//! failure generator); takedowns nest, and the resource is only up again
//! once every agent that took it down has brought it back.
//!
//! [`DowntimeBehavior`] is the customization seam. The provided
//! [`start_resource_takedown`](DowntimeBehavior::start_resource_takedown)
//! takes the resource down on the spot; model-specific agents override it
//! to wait for the right conditions, usually by calling
//! [`set_resource_going_down`](DowntimeBehavior::set_resource_going_down)
//! so the resource finishes its current work without accepting new
//! assignments, optionally with a hard-takedown timeout.
//!
//! Agents coordinate through messages: a takedown, going-down or bring-up
//! that actually changes the resource state notifies the resource's
//! assignment agent and its other downtime agents; releases of the
//! resource's units are forwarded to every downtime agent. Peer agents on
//! *other* resources can listen in by subscribing to those message kinds.

use crate::agent::{AgentId, Message, MsgKind, MsgPayload, MsgSender};
use crate::random::TimeSampler;
use crate::resource::ResourceId;
use crate::simulation::scheduler::{EventKey, EventKind};
use crate::simulation::{SimError, SimState};
use crate::time::SimTime;

/// The last transition a downtime agent drove its resource through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownAction {
    /// The agent last brought the resource up (or never acted).
    Up,
    /// The agent set the resource going down and is waiting to take it
    /// down.
    GoingDown,
    /// The agent took the resource down.
    Down,
}

/// Per-agent bookkeeping shared by all downtime behaviors.
pub(crate) struct DowntimeState {
    pub(crate) resource: ResourceId,
    pub(crate) last_action: DownAction,
    /// Pending hard-takedown event while going down.
    pub(crate) timeout_event: Option<EventKey>,
}

/// A downtime agent: shared bookkeeping plus its behavior.
pub(crate) struct DowntimeAgent {
    pub(crate) state: DowntimeState,
    pub(crate) behavior: Box<dyn DowntimeBehavior>,
}

impl DowntimeAgent {
    pub(crate) fn new(resource: ResourceId, behavior: Box<dyn DowntimeBehavior>) -> Self {
        Self {
            state: DowntimeState {
                resource,
                last_action: DownAction::Up,
                timeout_event: None,
            },
            behavior,
        }
    }

    /// Message handler table of the agent. Notifications are always
    /// handled; none of them is ever queued.
    pub(crate) fn handle(&mut self, sim: &mut SimState, me: AgentId, msg: &Message) -> bool {
        let resource = match msg.payload {
            MsgPayload::Resource(r) => r,
            _ => return true,
        };
        let mut api = DowntimeApi {
            sim,
            me,
            state: &mut self.state,
        };
        match msg.kind {
            MsgKind::Down => self.behavior.on_resource_down(&mut api, resource),
            MsgKind::GoingDown => self.behavior.on_resource_going_down(&mut api, resource),
            MsgKind::Up => self.behavior.on_resource_up(&mut api, resource),
            MsgKind::Released => self.behavior.on_resource_released(&mut api, resource),
            _ => {}
        }
        true
    }
}

/// The view of the simulation a downtime behavior operates through.
pub struct DowntimeApi<'a> {
    sim: &'a mut SimState,
    me: AgentId,
    state: &'a mut DowntimeState,
}

impl DowntimeApi<'_> {
    /// The current simulation time.
    pub fn now(&self) -> SimTime {
        self.sim.now
    }

    /// The agent's own id.
    pub fn agent(&self) -> AgentId {
        self.me
    }

    /// The resource this agent manages.
    pub fn resource(&self) -> ResourceId {
        self.state.resource
    }

    /// The last action this agent performed.
    pub fn last_action(&self) -> DownAction {
        self.state.last_action
    }

    /// Whether a resource is currently down.
    pub fn is_down(&self, resource: ResourceId) -> bool {
        self.sim.resources[resource.0].down()
    }

    /// Whether a resource is currently going down.
    pub fn is_going_down(&self, resource: ResourceId) -> bool {
        self.sim.resources[resource.0].going_down
    }

    /// Units of a resource currently assigned to processes.
    pub fn in_use(&self, resource: ResourceId) -> u32 {
        self.sim.resources[resource.0].in_use
    }

    /// Draws the next value from a sampler.
    pub fn sample(&mut self, sampler: &TimeSampler) -> Result<SimTime, SimError> {
        let t = sampler
            .sample_time(&mut self.sim.streams)
            .map_err(|e| SimError::InvalidRequest(e.to_string()))?;
        self.sim.coerce_time(t)
    }

    /// Notifies the resource's assignment agent and its other downtime
    /// agents of a state change.
    fn send_notifications(&mut self, kind: MsgKind) {
        let resource = self.state.resource;
        let assignment_agent = self.sim.resources[resource.0].agent;
        let me = self.me;
        self.sim.send_message(
            MsgSender::Agent(me),
            assignment_agent,
            kind,
            MsgPayload::Resource(resource),
        );
        let peers: Vec<AgentId> = self.sim.resources[resource.0]
            .downtime_agents
            .iter()
            .copied()
            .filter(|a| *a != me)
            .collect();
        for peer in peers {
            self.sim
                .send_message(MsgSender::Agent(me), peer, kind, MsgPayload::Resource(resource));
        }
    }
}

/// A downtime agent's behavior.
///
/// The `next_downtime` / `next_bringup` hooks drive self-scheduling agents:
/// `next_downtime` is consulted at simulation start and after every
/// bring-up, `next_bringup` after every takedown; both return absolute
/// times. The `on_*` handlers react to notifications from the resource's
/// other agents (and from subscribed-to peers).
///
/// The provided `takedown_resource`, `set_resource_going_down` and
/// `bring_up_resource` methods are the engine flows; override points
/// should call them rather than re-implement them.
#[allow(unused_variables)]
pub trait DowntimeBehavior: 'static {
    /// Absolute time of the next takedown, if this agent self-schedules.
    fn next_downtime(&mut self, api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        None
    }

    /// Absolute time of the bring-up for the takedown that just happened.
    fn next_bringup(&mut self, api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        None
    }

    /// Initiates a takedown. The default takes the resource down
    /// immediately; subclasses may delay by setting the resource going
    /// down instead.
    fn start_resource_takedown(&mut self, api: &mut DowntimeApi<'_>) {
        self.takedown_resource(api);
    }

    /// Reacts to another agent taking this agent's resource down. The
    /// default completes this agent's own pending takedown, on the
    /// assumption that whatever it was waiting for no longer matters.
    fn on_resource_down(&mut self, api: &mut DowntimeApi<'_>, resource: ResourceId) {
        if api.state.last_action == DownAction::GoingDown && resource == api.state.resource {
            self.takedown_resource(api);
        }
    }

    /// Reacts to a resource going down. Does nothing by default.
    fn on_resource_going_down(&mut self, api: &mut DowntimeApi<'_>, resource: ResourceId) {}

    /// Reacts to a resource coming up. Does nothing by default.
    fn on_resource_up(&mut self, api: &mut DowntimeApi<'_>, resource: ResourceId) {}

    /// Reacts to released units of this agent's resource. The default
    /// completes a pending going-down takedown once the resource is idle.
    fn on_resource_released(&mut self, api: &mut DowntimeApi<'_>, resource: ResourceId) {
        if api.state.last_action == DownAction::GoingDown
            && resource == api.state.resource
            && api.in_use(resource) == 0
        {
            self.takedown_resource(api);
        }
    }

    /// Takes the resource down now.
    ///
    /// Holders of the resource's units receive a
    /// [`SimError::ResourceDown`] and their units are reclaimed. The
    /// resource's other agents are notified if the resource was not already
    /// down, and the bring-up returned by
    /// [`next_bringup`](DowntimeBehavior::next_bringup) is scheduled.
    ///
    /// Not meant to be overridden.
    fn takedown_resource(&mut self, api: &mut DowntimeApi<'_>) {
        if api.state.last_action == DownAction::Down {
            api.sim
                .invariant_violation("downtime agent taking a resource down twice");
            return;
        }
        if let Some(key) = api.state.timeout_event.take() {
            key.cancel();
        }

        let resource = api.state.resource;
        let already_down = api.sim.resources[resource.0].down();
        api.sim.mark_resource_down(resource);
        api.state.last_action = DownAction::Down;
        if !already_down {
            api.sim.force_release_holders(resource);
            api.send_notifications(MsgKind::Down);
        }

        if let Some(at) = self.next_bringup(api) {
            let me = api.me;
            api.sim.schedule_agent_event(at, EventKind::Bringup(me));
        }
    }

    /// Sets the resource going down: it keeps serving current holders but
    /// is excluded from new assignments. With a timeout, a hard takedown is
    /// scheduled for `now + timeout` and cancelled if the takedown happens
    /// earlier for another reason.
    ///
    /// Not meant to be overridden.
    fn set_resource_going_down(&mut self, api: &mut DowntimeApi<'_>, timeout: Option<SimTime>) {
        if api.state.last_action != DownAction::Up {
            api.sim.invariant_violation(
                "downtime agent setting a resource going down twice or after taking it down",
            );
            return;
        }
        let resource = api.state.resource;
        if api.sim.resources[resource.0].down() {
            api.sim
                .invariant_violation("downtime agent setting a down resource going down");
            return;
        }

        if !api.sim.resources[resource.0].going_down {
            api.sim.resources[resource.0].going_down = true;
            api.send_notifications(MsgKind::GoingDown);
        }
        api.state.last_action = DownAction::GoingDown;

        if let Some(timeout) = timeout {
            let at = match api.sim.coerce_time(timeout).and_then(|t| {
                api.sim
                    .now
                    .checked_add(t)
                    .map_err(|e| SimError::InvalidRequest(e.to_string()))
            }) {
                Ok(at) => at,
                Err(e) => {
                    api.sim.record_fatal(e);
                    return;
                }
            };
            let me = api.me;
            let key = api
                .sim
                .queue
                .insert_keyed(at, EventKind::GoingDownTimeout(me));
            api.state.timeout_event = Some(key);
        }
    }

    /// Brings the resource up from down or going-down.
    ///
    /// If no other agent still holds the resource down, holders parked
    /// waiting for it are woken, the other agents are notified and the next
    /// takedown returned by
    /// [`next_downtime`](DowntimeBehavior::next_downtime) is scheduled.
    ///
    /// Not meant to be overridden.
    fn bring_up_resource(&mut self, api: &mut DowntimeApi<'_>) {
        let resource = api.state.resource;
        match api.state.last_action {
            DownAction::Up => {
                api.sim
                    .invariant_violation("downtime agent bringing up a resource it did not act on");
                return;
            }
            DownAction::GoingDown => {
                // The takedown never happened; withdraw the going-down.
                if let Some(key) = api.state.timeout_event.take() {
                    key.cancel();
                }
                api.sim.resources[resource.0].going_down = false;
                api.state.last_action = DownAction::Up;
                api.send_notifications(MsgKind::Up);
            }
            DownAction::Down => {
                if !api.sim.resources[resource.0].down() {
                    api.sim
                        .invariant_violation("downtime agent bringing up a resource that is not down");
                    return;
                }
                api.sim.mark_resource_up(resource);
                api.state.last_action = DownAction::Up;
                if !api.sim.resources[resource.0].down() {
                    api.sim.wake_resource_watchers(resource);
                    api.send_notifications(MsgKind::Up);
                }
            }
        }

        if let Some(at) = self.next_downtime(api) {
            let me = api.me;
            api.sim.schedule_agent_event(at, EventKind::Takedown(me));
        }
    }

    /// Completes an expired going-down grace period by taking the resource
    /// down. Not meant to be overridden.
    fn handle_going_down_timeout(&mut self, api: &mut DowntimeApi<'_>) {
        api.state.timeout_event = None;
        if api.state.last_action == DownAction::GoingDown {
            self.takedown_resource(api);
        }
    }
}

/// A fixed, cyclic downtime schedule.
///
/// The schedule is a cycle length plus non-overlapping `(offset, duration)`
/// intervals inside the cycle; the cycle repeats indefinitely. A nine hour
/// shift with two breaks and a lunch:
///
/// ```
/// use simproc::downtime::DowntimeSchedule;
/// use simproc::time::SimTime;
///
/// let schedule = DowntimeSchedule::new(
///     SimTime::hours(9.0),
///     vec![
///         (SimTime::hours(2.0), SimTime::minutes(15.0)),
///         (SimTime::hours(4.0), SimTime::minutes(30.0)),
///         (SimTime::hours(7.0), SimTime::minutes(15.0)),
///     ],
/// )
/// .unwrap();
/// # let _ = schedule;
/// ```
#[derive(Clone, Debug)]
pub struct DowntimeSchedule {
    cycle_length: SimTime,
    intervals: Vec<(SimTime, SimTime)>,
}

impl DowntimeSchedule {
    /// Validates and creates a schedule.
    pub fn new(
        cycle_length: SimTime,
        mut intervals: Vec<(SimTime, SimTime)>,
    ) -> Result<Self, SimError> {
        if !(cycle_length.value() > 0.0) {
            return Err(SimError::InvalidRequest(
                "schedule cycle length must be positive".into(),
            ));
        }
        intervals.sort_by(|a, b| a.0.cmp(&b.0));
        let mut prev_end: Option<SimTime> = None;
        for &(start, length) in &intervals {
            if start.is_negative() {
                return Err(SimError::InvalidRequest(
                    "downtime interval offset must be non-negative".into(),
                ));
            }
            let end = start
                .checked_add(length)
                .map_err(|e| SimError::InvalidRequest(e.to_string()))?;
            if !(length.value() > 0.0) {
                return Err(SimError::InvalidRequest(
                    "downtime interval duration must be positive".into(),
                ));
            }
            if let Some(prev) = prev_end {
                if start < prev {
                    return Err(SimError::InvalidRequest(
                        "downtime intervals must not overlap".into(),
                    ));
                }
            }
            if end > cycle_length {
                return Err(SimError::InvalidRequest(
                    "downtime interval must fit inside the schedule cycle".into(),
                ));
            }
            prev_end = Some(end);
        }
        Ok(Self {
            cycle_length,
            intervals,
        })
    }

    /// The cycle length.
    pub fn cycle_length(&self) -> SimTime {
        self.cycle_length
    }

    /// The down intervals, sorted by offset.
    pub fn intervals(&self) -> &[(SimTime, SimTime)] {
        &self.intervals
    }
}

/// A downtime behavior driven by a [`DowntimeSchedule`].
///
/// If a takedown is delayed past the start of the next scheduled interval
/// (by a subclass waiting for the resource to go idle, say), the overrun
/// intervals are skipped: after each bring-up the agent moves to the first
/// interval starting strictly after the current time.
pub struct ScheduledDowntime {
    schedule: DowntimeSchedule,
    cycle_base: SimTime,
    next_index: usize,
    current_length: Option<SimTime>,
    initialized: bool,
}

impl ScheduledDowntime {
    /// Creates the behavior from a schedule.
    pub fn new(schedule: DowntimeSchedule) -> Self {
        Self {
            schedule,
            cycle_base: SimTime::ZERO,
            next_index: 0,
            current_length: None,
            initialized: false,
        }
    }
}

impl DowntimeBehavior for ScheduledDowntime {
    fn next_downtime(&mut self, api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        if self.schedule.intervals.is_empty() {
            return None;
        }
        let now = api.now();
        if !self.initialized {
            self.initialized = true;
            self.cycle_base = now;
        }
        loop {
            if self.next_index >= self.schedule.intervals.len() {
                self.next_index = 0;
                self.cycle_base = self.cycle_base + self.schedule.cycle_length;
                continue;
            }
            let (offset, length) = self.schedule.intervals[self.next_index];
            let start = self.cycle_base + offset;
            self.next_index += 1;
            if start <= now {
                continue;
            }
            self.current_length = Some(length);
            return Some(start);
        }
    }

    fn next_bringup(&mut self, api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        self.current_length.take().map(|length| api.now() + length)
    }
}

/// A downtime behavior generating random failures.
///
/// Failures alternate time-to-failure (measured from the last repair) and
/// time-to-repair draws from the given samplers.
pub struct FailureDowntime {
    time_to_failure: TimeSampler,
    time_to_repair: TimeSampler,
}

impl FailureDowntime {
    /// Creates the behavior from its two samplers.
    pub fn new(time_to_failure: TimeSampler, time_to_repair: TimeSampler) -> Self {
        Self {
            time_to_failure,
            time_to_repair,
        }
    }
}

impl DowntimeBehavior for FailureDowntime {
    fn next_downtime(&mut self, api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        match api.sample(&self.time_to_failure) {
            Ok(dt) => Some(api.now() + dt),
            Err(e) => {
                api.sim.record_fatal(e);
                None
            }
        }
    }

    fn next_bringup(&mut self, api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        match api.sample(&self.time_to_repair) {
            Ok(dt) => Some(api.now() + dt),
            Err(e) => {
                api.sim.record_fatal(e);
                None
            }
        }
    }
}

impl SimState {
    /// Schedules a takedown/bring-up event at an absolute time, clamping
    /// times in the past of the clock to "now".
    pub(crate) fn schedule_agent_event(&mut self, at: SimTime, kind: EventKind) {
        let at = if at < self.now { self.now } else { at };
        self.queue.insert(at, kind);
    }

    /// Runs a closure against a downtime agent's split-out state and
    /// behavior.
    fn with_downtime_agent(
        &mut self,
        me: AgentId,
        f: impl FnOnce(&mut dyn DowntimeBehavior, &mut DowntimeApi<'_>),
    ) {
        let behavior = self.agents[me.0].behavior.take();
        match behavior {
            Some(crate::agent::AgentKind::Downtime(mut agent)) => {
                {
                    let DowntimeAgent { state, behavior } = &mut agent;
                    let mut api = DowntimeApi {
                        sim: self,
                        me,
                        state,
                    };
                    f(behavior.as_mut(), &mut api);
                }
                self.agents[me.0].behavior = Some(crate::agent::AgentKind::Downtime(agent));
            }
            other => {
                self.agents[me.0].behavior = other;
                self.invariant_violation("downtime event dispatched to a non-downtime agent");
            }
        }
    }

    /// Dispatches a takedown event.
    pub(crate) fn downtime_takedown(&mut self, me: AgentId) {
        self.with_downtime_agent(me, |behavior, api| behavior.start_resource_takedown(api));
    }

    /// Dispatches a bring-up event.
    pub(crate) fn downtime_bringup(&mut self, me: AgentId) {
        self.with_downtime_agent(me, |behavior, api| behavior.bring_up_resource(api));
    }

    /// Dispatches a going-down timeout event.
    pub(crate) fn downtime_going_down_timeout(&mut self, me: AgentId) {
        self.with_downtime_agent(me, |behavior, api| behavior.handle_going_down_timeout(api));
    }

    /// Schedules a downtime agent's first takedown; called at simulation
    /// start.
    pub(crate) fn downtime_initialize(&mut self, me: AgentId) {
        self.with_downtime_agent(me, |behavior, api| {
            if let Some(at) = behavior.next_downtime(api) {
                let me = api.me;
                api.sim.schedule_agent_event(at, EventKind::Takedown(me));
            }
        });
    }

    /// Marks a resource (further) down, updating its datasets on the first
    /// nested takedown.
    pub(crate) fn mark_resource_down(&mut self, resource: ResourceId) {
        let r = &mut self.resources[resource.0];
        r.down_count += 1;
        if r.down_count == 1 {
            r.going_down = false;
            r.down_since = Some(self.now);
            let ds = r.down_dataset;
            let now = self.now;
            self.data.set_value(ds, now, 1.0);
            tracing::debug!(resource = %self.resources[resource.0].element_id, "resource down");
        }
    }

    /// Unwinds one takedown of a resource, updating its datasets when the
    /// last nested takedown ends.
    pub(crate) fn mark_resource_up(&mut self, resource: ResourceId) {
        let r = &mut self.resources[resource.0];
        if r.down_count == 0 {
            self.invariant_violation("bringing up a resource that is not down");
            return;
        }
        r.down_count -= 1;
        if r.down_count == 0 {
            r.down_since = None;
            let ds = r.down_dataset;
            let now = self.now;
            self.data.set_value(ds, now, 0.0);
            tracing::debug!(resource = %self.resources[resource.0].element_id, "resource up");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeUnit;

    #[test]
    fn schedule_validation() {
        let hour = |h: f64| SimTime::new(h, TimeUnit::Hours);
        let min = |m: f64| SimTime::new(m, TimeUnit::Minutes);

        assert!(DowntimeSchedule::new(hour(9.0), vec![(hour(2.0), min(15.0))]).is_ok());

        // Overlapping intervals.
        assert!(DowntimeSchedule::new(
            hour(9.0),
            vec![(hour(2.0), hour(1.0)), (min(150.0), min(15.0))],
        )
        .is_err());

        // Interval spilling past the cycle.
        assert!(DowntimeSchedule::new(hour(1.0), vec![(min(50.0), min(20.0))]).is_err());

        // Zero-length interval.
        assert!(DowntimeSchedule::new(hour(1.0), vec![(min(10.0), min(0.0))]).is_err());

        // Intervals are sorted on construction.
        let s = DowntimeSchedule::new(
            hour(9.0),
            vec![(hour(4.0), min(30.0)), (hour(2.0), min(15.0))],
        )
        .unwrap();
        assert_eq!(s.intervals()[0].0, hour(2.0));
    }
}
