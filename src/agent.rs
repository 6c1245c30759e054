//! Message passing between simulation agents.
//!
//! Agents are the stationary actors of a model: assignment agents (a
//! resource managing itself, or a [pool](crate::resource::pool)) and
//! [downtime agents](crate::downtime). Each agent owns a FIFO message
//! queue and a dispatch table keyed by [`MsgKind`]; a handler either
//! consumes a message or leaves it queued for a later processing round.
//!
//! Delivery is synchronous: sending runs the receiver's handler immediately,
//! within the current event dispatch. Work that must not run before all
//! messages of the current simulated time have arrived (notably resource
//! assignment) is deferred by scheduling a queue-processing event at the
//! current time, guarded so that at most one such event is pending per
//! agent.
//!
//! Agents can also subscribe to the messages another agent *sends*: each
//! subscriber receives a copy, dispatched immediately and never queued.

use std::collections::VecDeque;
use std::fmt;

use crate::downtime::DowntimeAgent;
use crate::resource::pool::PoolAgent;
use crate::resource::{ResourceAgent, ResourceRequest};
use crate::simulation::scheduler::{EventKey, EventKind};
use crate::simulation::SimState;
use crate::time::SimTime;

/// Identifier of an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AgentId(pub(crate) usize);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a message, unique within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub(crate) u64);

/// The kind of a message, which selects the receiving handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MsgKind {
    /// A resource request ([`MsgPayload::Request`]).
    Request,
    /// A resource release ([`MsgPayload::Release`]).
    Release,
    /// A resource went down ([`MsgPayload::Resource`]).
    Down,
    /// A resource started going down ([`MsgPayload::Resource`]).
    GoingDown,
    /// A resource came back up ([`MsgPayload::Resource`]).
    Up,
    /// Units of a resource were released ([`MsgPayload::Resource`]); sent to
    /// the resource's downtime agents.
    Released,
}

/// The originator of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgSender {
    /// A process (resource requests and releases).
    Process(crate::executor::ProcessId),
    /// An agent (everything else).
    Agent(AgentId),
}

/// The payload of a message, by kind.
#[derive(Clone, Debug)]
pub enum MsgPayload {
    /// A queued resource request.
    Request(ResourceRequest),
    /// Release of units out of an assignment.
    Release {
        /// The assignment being (partially) released.
        assignment: crate::resource::AssignmentId,
        /// The units handed back, per resource.
        units: Vec<(crate::resource::ResourceId, u32)>,
    },
    /// A resource state notification.
    Resource(crate::resource::ResourceId),
}

/// A message exchanged between agents.
#[derive(Clone, Debug)]
pub struct Message {
    /// Unique message id.
    pub id: MessageId,
    /// Message kind.
    pub kind: MsgKind,
    /// Simulated send time.
    pub sent_at: SimTime,
    /// Originator.
    pub sender: MsgSender,
    /// Recipient agent.
    pub receiver: AgentId,
    /// Payload, matching the kind.
    pub payload: MsgPayload,
}

impl Message {
    /// Convenience accessor for request payloads.
    pub(crate) fn request(&self) -> Option<&ResourceRequest> {
        match &self.payload {
            MsgPayload::Request(r) => Some(r),
            _ => None,
        }
    }
}

/// Queue, subscriptions and dispatch guard shared by every agent archetype.
pub(crate) struct AgentCore {
    pub(crate) queue: VecDeque<Message>,
    /// Subscribers, in registration order, to messages sent by this agent.
    pub(crate) subscribers: Vec<(MsgKind, AgentId)>,
    /// Pending queue-processing event; the re-entrancy guard.
    pub(crate) queue_event: Option<EventKey>,
    /// Priority function for queued requests; lower values go first. When
    /// absent, all requests share one priority and order is pure FIFO.
    pub(crate) priority_fn: Option<Box<dyn Fn(&ResourceRequest) -> i64>>,
}

impl AgentCore {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            subscribers: Vec::new(),
            queue_event: None,
            priority_fn: None,
        }
    }
}

/// The behavior half of an agent; taken out of the registry while one of
/// its handlers runs, so that the handler can freely mutate the rest of the
/// simulation state.
pub(crate) enum AgentKind {
    /// A resource acting as its own assignment agent.
    Resource(ResourceAgent),
    /// A pool assignment agent.
    Pool(PoolAgent),
    /// A downtime agent.
    Downtime(DowntimeAgent),
}

impl AgentKind {
    fn handle(&mut self, sim: &mut SimState, me: AgentId, msg: &Message) -> bool {
        match self {
            AgentKind::Resource(a) => a.handle(sim, me, msg),
            AgentKind::Pool(a) => a.handle(sim, me, msg),
            AgentKind::Downtime(a) => a.handle(sim, me, msg),
        }
    }

    pub(crate) fn process_queued_requests(
        &mut self,
        sim: &mut SimState,
        me: AgentId,
        through: Option<MessageId>,
    ) {
        match self {
            AgentKind::Resource(a) => a.process_queued_requests(sim, me, through),
            AgentKind::Pool(a) => a.process_queued_requests(sim, me, through),
            AgentKind::Downtime(_) => {}
        }
    }
}

/// One registry entry: the shared core plus the behavior.
pub(crate) struct AgentEntry {
    pub(crate) core: AgentCore,
    pub(crate) behavior: Option<AgentKind>,
}

impl AgentEntry {
    pub(crate) fn new(behavior: AgentKind) -> Self {
        Self {
            core: AgentCore::new(),
            behavior: Some(behavior),
        }
    }
}

impl SimState {
    /// Builds and delivers a message, running the receiver's handler
    /// synchronously, then fans copies out to the sender's subscribers.
    pub(crate) fn send_message(
        &mut self,
        sender: MsgSender,
        receiver: AgentId,
        kind: MsgKind,
        payload: MsgPayload,
    ) -> MessageId {
        let id = MessageId(self.next_message_id);
        self.next_message_id += 1;
        let msg = Message {
            id,
            kind,
            sent_at: self.now,
            sender,
            receiver,
            payload,
        };
        tracing::trace!(?kind, %receiver, "delivering message");

        let handled = self.dispatch_to_agent(receiver, &msg);
        if !handled {
            self.agents[receiver.0].core.queue.push_back(msg.clone());
        }
        self.notify_subscribers(&msg);

        id
    }

    /// Runs the receiving agent's handler for a message. Returns `false`
    /// (leaving the message to be queued) when the receiver is itself in the
    /// middle of handling a message.
    fn dispatch_to_agent(&mut self, receiver: AgentId, msg: &Message) -> bool {
        let mut behavior = match self.agents[receiver.0].behavior.take() {
            Some(b) => b,
            None => {
                tracing::debug!(%receiver, "re-entrant delivery, queueing message");
                return false;
            }
        };
        let handled = behavior.handle(self, receiver, msg);
        self.agents[receiver.0].behavior = Some(behavior);

        handled
    }

    /// Sends a copy of the message to every agent subscribed to messages of
    /// this kind from this sender. Subscribed copies are dispatched
    /// immediately and never queued.
    fn notify_subscribers(&mut self, msg: &Message) {
        let sender = match msg.sender {
            MsgSender::Agent(a) => a,
            MsgSender::Process(_) => return,
        };
        let subscribers: Vec<AgentId> = self.agents[sender.0]
            .core
            .subscribers
            .iter()
            .filter(|(kind, sub)| *kind == msg.kind && *sub != msg.receiver)
            .map(|(_, sub)| *sub)
            .collect();
        for sub in subscribers {
            let copy = Message {
                receiver: sub,
                ..msg.clone()
            };
            self.dispatch_to_agent(sub, &copy);
        }
    }

    /// Schedules a queued-request processing round for an agent at the
    /// current time, unless one is already pending. Processing after all
    /// already-pending events of the current time avoids simulated race
    /// conditions between concurrent requests, releases and takedowns.
    pub(crate) fn schedule_queue_processing(&mut self, agent: AgentId) {
        if self.agents[agent.0].core.queue_event.is_none() {
            let key = self
                .queue
                .insert_keyed(self.now, EventKind::ProcessQueue(agent));
            self.agents[agent.0].core.queue_event = Some(key);
        }
    }

    /// Runs one round of queued-request processing on an agent.
    pub(crate) fn process_queued_requests(&mut self, agent: AgentId, through: Option<MessageId>) {
        let mut behavior = match self.agents[agent.0].behavior.take() {
            Some(b) => b,
            None => return,
        };
        behavior.process_queued_requests(self, agent, through);
        self.agents[agent.0].behavior = Some(behavior);
    }

    /// The ids of the agent's queued requests, sorted by priority and
    /// enqueue order.
    pub(crate) fn queued_request_ids(&self, agent: AgentId) -> Vec<MessageId> {
        let core = &self.agents[agent.0].core;
        let mut requests: Vec<(i64, u64, MessageId)> = core
            .queue
            .iter()
            .filter_map(|msg| {
                msg.request().map(|req| {
                    let priority = core.priority_fn.as_ref().map_or(req.priority, |f| f(req));
                    (priority, req.enqueue_seq, msg.id)
                })
            })
            .collect();
        requests.sort();
        requests.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Looks up a queued request by message id.
    pub(crate) fn queued_request(&self, agent: AgentId, id: MessageId) -> Option<ResourceRequest> {
        self.agents[agent.0]
            .core
            .queue
            .iter()
            .find(|msg| msg.id == id)
            .and_then(|msg| msg.request().cloned())
    }

    /// Removes a message from an agent's queue, returning `true` if it was
    /// still there.
    pub(crate) fn remove_queued_message(&mut self, agent: AgentId, id: MessageId) -> bool {
        let queue = &mut self.agents[agent.0].core.queue;
        match queue.iter().position(|msg| msg.id == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Registers `subscriber` for messages of `kind` sent by `publisher`.
    pub(crate) fn add_subscriber(&mut self, publisher: AgentId, kind: MsgKind, subscriber: AgentId) {
        self.agents[publisher.0]
            .core
            .subscribers
            .push((kind, subscriber));
    }
}
