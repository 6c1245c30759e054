//! Simulation builder.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use slab::Slab;

use crate::agent::{AgentEntry, AgentId, AgentKind, MsgKind};
use crate::config::SimConfig;
use crate::data::{
    CounterId, CounterState, DataLayer, DataSink, ElementType, NullDataSink, ValueType,
};
use crate::downtime::{DowntimeAgent, DowntimeBehavior, DowntimeSchedule, FailureDowntime, ScheduledDowntime};
use crate::element::{
    child_id, ElementRegistry, EntityElement, EntityGenerator, LocationId, LocationKind,
    LocationState, ProcessElement, StartupProcess,
};
use crate::executor::ProcessFuture;
use crate::process::ProcessContext;
use crate::random::{RandomStreams, TimeSampler};
use crate::resource::pool::{AssignmentPolicy, DefaultAssignmentPolicy, PoolAgent};
use crate::resource::{ResourceAgent, ResourceClass, ResourceId, ResourceRequest, ResourceState};
use crate::simulation::{SimError, SimState, Simulation};
use crate::time::SimTime;

/// Builder for a [`Simulation`].
///
/// All static model elements are defined on the builder; [`init`] seals the
/// model, announces elements and datasets to the data sink, schedules the
/// initial source and downtime events and returns the executable
/// [`Simulation`].
///
/// [`init`]: SimInit::init
///
/// # Examples
///
/// A single-server queueing station:
///
/// ```
/// use simproc::random::{SimDistribution, StreamId, TimeSampler};
/// use simproc::resource::ResourceClass;
/// use simproc::simulation::SimInit;
/// use simproc::time::SimTime;
///
/// let mut bench = SimInit::new();
/// let queue = bench.add_queue("Queue", None).unwrap();
/// let server = bench
///     .add_resource("Server", None, 1, ResourceClass::new("Server"))
///     .unwrap();
/// let sink = bench.add_entity_sink("Exit", None).unwrap();
/// let source = bench.add_source("Door", None).unwrap();
///
/// let interarrival = TimeSampler::new(
///     SimDistribution::exponential(10.0).unwrap(),
///     StreamId(1),
///     None,
/// );
/// let service = TimeSampler::new(
///     SimDistribution::exponential(8.0).unwrap(),
///     StreamId(2),
///     None,
/// );
/// bench
///     .add_generator(source, "Customer", "Visit", interarrival, move |ctx| {
///         let service = service.clone();
///         async move {
///             ctx.move_to(queue)?;
///             let assignment = ctx.acquire(server, 1).await?;
///             let service_time = ctx.sample(&service)?;
///             ctx.wait_for(service_time).await?;
///             drop(assignment);
///             ctx.move_to(sink)?;
///             Ok(())
///         }
///     })
///     .unwrap();
///
/// let mut simu = bench.init(1).unwrap();
/// simu.run_until(SimTime::none(1000.0)).unwrap();
/// ```
pub struct SimInit {
    config: SimConfig,
    data: DataLayer,
    locations: Slab<LocationState>,
    resources: Slab<ResourceState>,
    agents: Slab<AgentEntry>,
    counters: Slab<CounterState>,
    process_elements: Vec<ProcessElement>,
    entity_elements: Vec<EntityElement>,
    startups: Vec<StartupProcess>,
    registry: ElementRegistry,
}

impl Default for SimInit {
    fn default() -> Self {
        Self::new()
    }
}

impl SimInit {
    /// Creates a builder with the default configuration and a null data
    /// sink.
    pub fn new() -> Self {
        Self::with_config(SimConfig::new())
    }

    /// Creates a builder with the specified configuration.
    pub fn with_config(config: SimConfig) -> Self {
        Self {
            config,
            data: DataLayer::new(Box::new(NullDataSink)),
            locations: Slab::new(),
            resources: Slab::new(),
            agents: Slab::new(),
            counters: Slab::new(),
            process_elements: Vec::new(),
            entity_elements: Vec::new(),
            startups: Vec::new(),
            registry: ElementRegistry::default(),
        }
    }

    /// Injects the data sink receiving all dataset emission.
    pub fn set_data_sink(&mut self, sink: impl DataSink + 'static) -> &mut Self {
        self.data.sink = Box::new(sink);
        self
    }

    /// The initial clock value: zero, in the model base unit.
    fn start_time(&self) -> SimTime {
        SimTime::ZERO
            .coerced(self.config.time.base_unit)
            .unwrap_or(SimTime::ZERO)
    }

    fn parent_id(&self, parent: Option<LocationId>) -> Result<Option<String>, SimError> {
        match parent {
            None => Ok(None),
            Some(p) => match self.locations.get(p.0) {
                Some(loc) => Ok(Some(loc.element_id.clone())),
                None => Err(SimError::InvalidRequest("unknown parent location".into())),
            },
        }
    }

    fn add_location_impl(
        &mut self,
        name: &str,
        parent: Option<LocationId>,
        kind: LocationKind,
        class_name: &str,
    ) -> Result<LocationId, SimError> {
        let parent_id = self.parent_id(parent)?;
        let element_id = child_id(parent_id.as_deref(), name);
        self.registry
            .claim(&element_id, class_name, ElementType::Location)?;
        let start = self.start_time();
        let pop_dataset =
            self.data
                .add_dataset(&self.config, &element_id, "Population", ValueType::Int, true, start);
        let entries_dataset =
            self.data
                .add_dataset(&self.config, &element_id, "Entries", ValueType::Int, false, start);
        let time_dataset = self.data.add_dataset(
            &self.config,
            &element_id,
            "TimeInLocation",
            ValueType::Time,
            false,
            start,
        );
        let id = LocationId(self.locations.insert(LocationState {
            element_id,
            parent,
            children: Vec::new(),
            kind,
            population: Vec::new(),
            entry_times: std::collections::HashMap::new(),
            entries: 0,
            pop_dataset,
            entries_dataset,
            time_dataset,
            generators: Vec::new(),
        }));
        if let Some(p) = parent {
            self.locations[p.0].children.push(id);
        }
        Ok(id)
    }

    /// Adds a plain location.
    pub fn add_location(
        &mut self,
        name: &str,
        parent: Option<LocationId>,
    ) -> Result<LocationId, SimError> {
        self.add_location_impl(name, parent, LocationKind::Basic, "Location")
    }

    /// Adds a queue: a location whose population is its size.
    pub fn add_queue(
        &mut self,
        name: &str,
        parent: Option<LocationId>,
    ) -> Result<LocationId, SimError> {
        self.add_location_impl(name, parent, LocationKind::Queue, "Queue")
    }

    /// Adds an entity source.
    pub fn add_source(
        &mut self,
        name: &str,
        parent: Option<LocationId>,
    ) -> Result<LocationId, SimError> {
        self.add_location_impl(name, parent, LocationKind::Source, "Source")
    }

    /// Adds an entity sink: entities moved here are destroyed.
    pub fn add_entity_sink(
        &mut self,
        name: &str,
        parent: Option<LocationId>,
    ) -> Result<LocationId, SimError> {
        self.add_location_impl(name, parent, LocationKind::Sink, "Sink")
    }

    fn entity_element(&mut self, class_name: &str) -> Result<usize, SimError> {
        if let Some(i) = self
            .entity_elements
            .iter()
            .position(|e| e.element_id == class_name)
        {
            return Ok(i);
        }
        self.registry
            .claim(class_name, class_name, ElementType::Entity)?;
        let start = self.start_time();
        let wip_dataset = self.data.add_dataset(
            &self.config,
            class_name,
            "WorkInProcess",
            ValueType::Int,
            true,
            start,
        );
        let time_dataset = self.data.add_dataset(
            &self.config,
            class_name,
            "TimeInSystem",
            ValueType::Time,
            false,
            start,
        );
        self.entity_elements.push(EntityElement {
            element_id: class_name.to_string(),
            population: 0,
            created: 0,
            wip_dataset,
            time_dataset,
        });
        Ok(self.entity_elements.len() - 1)
    }

    fn process_element(&mut self, class_name: &str) -> Result<usize, SimError> {
        if let Some(i) = self
            .process_elements
            .iter()
            .position(|e| e.element_id == class_name)
        {
            return Ok(i);
        }
        self.registry
            .claim(class_name, class_name, ElementType::Process)?;
        let start = self.start_time();
        let inproc_dataset = self.data.add_dataset(
            &self.config,
            class_name,
            "InProcess",
            ValueType::Int,
            true,
            start,
        );
        let entries_dataset =
            self.data
                .add_dataset(&self.config, class_name, "Entries", ValueType::Int, false, start);
        let ptime_dataset = self.data.add_dataset(
            &self.config,
            class_name,
            "ProcessTime",
            ValueType::Time,
            false,
            start,
        );
        self.process_elements.push(ProcessElement {
            element_id: class_name.to_string(),
            in_process: 0,
            entries: 0,
            inproc_dataset,
            entries_dataset,
            ptime_dataset,
        });
        Ok(self.process_elements.len() - 1)
    }

    /// Attaches an entity generator to a source.
    ///
    /// On each arrival the generator creates an entity of class
    /// `entity_class` at the source and starts a `process_class` process
    /// running `body` for it; arrivals are separated by draws from
    /// `interarrival`. A source can carry several generators with
    /// independent schedules.
    ///
    /// The closure only constructs the process future; the context becomes
    /// usable once the process starts executing.
    pub fn add_generator<F, Fut>(
        &mut self,
        source: LocationId,
        entity_class: &str,
        process_class: &str,
        interarrival: TimeSampler,
        mut body: F,
    ) -> Result<(), SimError>
    where
        F: FnMut(ProcessContext) -> Fut + 'static,
        Fut: Future<Output = Result<(), SimError>> + 'static,
    {
        match self.locations.get(source.0) {
            Some(loc) if loc.kind == LocationKind::Source => {}
            Some(_) => {
                return Err(SimError::InvalidRequest(
                    "generators can only be attached to sources".into(),
                ))
            }
            None => return Err(SimError::InvalidRequest("unknown source location".into())),
        }
        let entity_element = self.entity_element(entity_class)?;
        let process_element = self.process_element(process_class)?;
        let body: Box<dyn FnMut(ProcessContext) -> ProcessFuture> =
            Box::new(move |ctx| Box::pin(body(ctx)));
        self.locations[source.0].generators.push(EntityGenerator {
            entity_element,
            process_element,
            interarrival,
            body,
        });
        Ok(())
    }

    /// Starts a one-shot process at a fixed simulated time, outside any
    /// interarrival schedule. The entity is created at `location` when the
    /// process starts. Useful for warmup traffic, scripted scenarios and
    /// tests.
    pub fn add_startup_process<F, Fut>(
        &mut self,
        location: LocationId,
        entity_class: &str,
        process_class: &str,
        at: SimTime,
        body: F,
    ) -> Result<(), SimError>
    where
        F: FnOnce(ProcessContext) -> Fut + 'static,
        Fut: Future<Output = Result<(), SimError>> + 'static,
    {
        if !self.locations.contains(location.0) {
            return Err(SimError::InvalidRequest("unknown location".into()));
        }
        let entity_element = self.entity_element(entity_class)?;
        let process_element = self.process_element(process_class)?;
        let at = at
            .coerced(self.config.time.base_unit)
            .map_err(SimError::from)?;
        if at.is_negative() {
            return Err(SimError::InvalidRequest(
                "startup process time must be non-negative".into(),
            ));
        }
        self.startups.push(StartupProcess {
            location,
            entity_element,
            process_element,
            at,
            body: Some(Box::new(move |ctx| Box::pin(body(ctx)))),
        });
        Ok(())
    }

    /// Adds a resource with the given capacity and class. The resource is
    /// its own assignment agent until added to a pool.
    pub fn add_resource(
        &mut self,
        name: &str,
        parent: Option<LocationId>,
        capacity: u32,
        class: ResourceClass,
    ) -> Result<ResourceId, SimError> {
        if capacity == 0 {
            return Err(SimError::InvalidRequest(
                "resource capacity must be at least one".into(),
            ));
        }
        let parent_id = self.parent_id(parent)?;
        let element_id = child_id(parent_id.as_deref(), name);
        self.registry
            .claim(&element_id, class.path(), ElementType::Resource)?;
        let start = self.start_time();
        let util_dataset = self.data.add_dataset(
            &self.config,
            &element_id,
            "Utilization",
            ValueType::Float,
            true,
            start,
        );
        let down_dataset =
            self.data
                .add_dataset(&self.config, &element_id, "DownTime", ValueType::Int, true, start);
        let ptime_dataset = self.data.add_dataset(
            &self.config,
            &element_id,
            "ProcessTime",
            ValueType::Time,
            false,
            start,
        );

        let resource = ResourceId(self.resources.vacant_key());
        let agent = AgentId(
            self.agents
                .insert(AgentEntry::new(AgentKind::Resource(ResourceAgent { resource }))),
        );
        self.resources.insert(ResourceState {
            element_id,
            class,
            capacity,
            in_use: 0,
            down_count: 0,
            going_down: false,
            down_since: None,
            agent,
            downtime_agents: Vec::new(),
            util_dataset,
            down_dataset,
            ptime_dataset,
        });
        Ok(resource)
    }

    /// The assignment agent currently managing a resource.
    pub fn resource_agent(&self, resource: ResourceId) -> Result<AgentId, SimError> {
        self.resources
            .get(resource.0)
            .map(|r| r.agent)
            .ok_or_else(|| SimError::InvalidRequest("unknown resource".into()))
    }

    /// Groups resources under a pool assignment agent with the default
    /// algorithm.
    pub fn add_pool(
        &mut self,
        members: impl IntoIterator<Item = ResourceId>,
    ) -> Result<AgentId, SimError> {
        self.add_pool_with_policy(members, DefaultAssignmentPolicy)
    }

    /// Groups resources under a pool assignment agent with a custom
    /// [`AssignmentPolicy`].
    pub fn add_pool_with_policy(
        &mut self,
        members: impl IntoIterator<Item = ResourceId>,
        policy: impl AssignmentPolicy,
    ) -> Result<AgentId, SimError> {
        let members: Vec<ResourceId> = members.into_iter().collect();
        if members.is_empty() {
            return Err(SimError::InvalidRequest(
                "a pool requires at least one resource".into(),
            ));
        }
        for (i, m) in members.iter().enumerate() {
            if members[..i].contains(m) {
                return Err(SimError::InvalidRequest(
                    "a resource cannot appear twice in a pool".into(),
                ));
            }
            let r = self
                .resources
                .get(m.0)
                .ok_or_else(|| SimError::InvalidRequest("unknown pool member".into()))?;
            match self.agents.get(r.agent.0) {
                Some(entry) if matches!(entry.behavior, Some(AgentKind::Resource(_))) => {}
                _ => {
                    return Err(SimError::InvalidRequest(
                        "resource is already managed by another pool".into(),
                    ))
                }
            }
        }

        let agent = AgentId(self.agents.insert(AgentEntry::new(AgentKind::Pool(PoolAgent {
            members: members.clone(),
            policy: Box::new(policy),
        }))));
        for m in &members {
            let old = self.resources[m.0].agent;
            self.agents.remove(old.0);
            self.resources[m.0].agent = agent;
        }
        Ok(agent)
    }

    /// Installs a request priority function on an assignment agent; lower
    /// values go first. Replaces the per-request priorities for that agent.
    pub fn set_request_priority_fn(
        &mut self,
        agent: AgentId,
        f: impl Fn(&ResourceRequest) -> i64 + 'static,
    ) -> Result<(), SimError> {
        match self.agents.get_mut(agent.0) {
            Some(entry) => {
                entry.core.priority_fn = Some(Box::new(f));
                Ok(())
            }
            None => Err(SimError::InvalidRequest("unknown agent".into())),
        }
    }

    /// Attaches a custom downtime agent to a resource.
    pub fn add_downtime_agent(
        &mut self,
        resource: ResourceId,
        behavior: impl DowntimeBehavior,
    ) -> Result<AgentId, SimError> {
        if !self.resources.contains(resource.0) {
            return Err(SimError::InvalidRequest("unknown resource".into()));
        }
        let agent = AgentId(self.agents.insert(AgentEntry::new(AgentKind::Downtime(
            DowntimeAgent::new(resource, Box::new(behavior)),
        ))));
        self.resources[resource.0].downtime_agents.push(agent);
        Ok(agent)
    }

    /// Attaches a scheduled downtime agent (break schedule) to a resource.
    pub fn add_scheduled_downtime(
        &mut self,
        resource: ResourceId,
        schedule: DowntimeSchedule,
    ) -> Result<AgentId, SimError> {
        let base = self.config.time.base_unit;
        let cycle = schedule.cycle_length().coerced(base).map_err(SimError::from)?;
        let intervals = schedule
            .intervals()
            .iter()
            .map(|&(s, d)| Ok((s.coerced(base)?, d.coerced(base)?)))
            .collect::<Result<Vec<_>, crate::time::UnitMismatchError>>()
            .map_err(SimError::from)?;
        let schedule = DowntimeSchedule::new(cycle, intervals)?;
        self.add_downtime_agent(resource, ScheduledDowntime::new(schedule))
    }

    /// Attaches a failure agent to a resource, alternating time-to-failure
    /// and time-to-repair draws.
    pub fn add_failure_agent(
        &mut self,
        resource: ResourceId,
        time_to_failure: TimeSampler,
        time_to_repair: TimeSampler,
    ) -> Result<AgentId, SimError> {
        self.add_downtime_agent(resource, FailureDowntime::new(time_to_failure, time_to_repair))
    }

    /// Subscribes `subscriber` to every message of `kind` sent by
    /// `publisher`.
    pub fn subscribe(
        &mut self,
        publisher: AgentId,
        kind: MsgKind,
        subscriber: AgentId,
    ) -> Result<(), SimError> {
        if !self.agents.contains(publisher.0) || !self.agents.contains(subscriber.0) {
            return Err(SimError::InvalidRequest("unknown agent".into()));
        }
        self.agents[publisher.0].core.subscribers.push((kind, subscriber));
        Ok(())
    }

    /// Adds a stand-alone counter element. A finite capacity makes
    /// over-capacity increments block; `normalize` divides emitted values
    /// by the capacity.
    pub fn add_counter(
        &mut self,
        name: &str,
        capacity: Option<u64>,
        normalize: bool,
    ) -> Result<CounterId, SimError> {
        if capacity == Some(0) {
            return Err(SimError::InvalidRequest(
                "counter capacity must be at least one".into(),
            ));
        }
        self.registry.claim(name, "Counter", ElementType::Collector)?;
        let start = self.start_time();
        let value_type = if normalize { ValueType::Float } else { ValueType::Int };
        let dataset = self
            .data
            .add_dataset(&self.config, name, "Value", value_type, true, start);
        let normalizer = match capacity {
            Some(cap) if normalize && cap > 1 => cap as f64,
            _ => 1.0,
        };
        Ok(CounterId(self.counters.insert(CounterState {
            value: 0,
            capacity,
            waiting: std::collections::VecDeque::new(),
            dataset,
            normalizer,
        })))
    }

    /// Seals the model and returns the executable simulation for the given
    /// replication index (1-based, bounded by
    /// `random.max_replications`).
    pub fn init(self, run_index: u32) -> Result<Simulation, SimError> {
        if run_index == 0 || run_index > self.config.random.max_replications {
            return Err(SimError::InvalidRequest(format!(
                "replication index {run_index} outside 1..={}",
                self.config.random.max_replications
            )));
        }
        let start = self.start_time();
        let streams = RandomStreams::new(run_index, self.config.random.streams_per_run);
        let base_unit = self.config.time.base_unit;

        let SimInit {
            config,
            data,
            locations,
            resources,
            agents,
            counters,
            process_elements,
            entity_elements,
            startups,
            registry,
        } = self;

        let state = Rc::new_cyclic(|weak| {
            RefCell::new(SimState {
                now: start,
                queue: crate::simulation::scheduler::SchedulerQueue::new(),
                processes: Slab::new(),
                agents,
                resources,
                assignments: Slab::new(),
                entities: Slab::new(),
                locations,
                counters,
                process_elements,
                entity_elements,
                startups,
                registry,
                data,
                streams,
                config,
                base_unit,
                next_message_id: 0,
                next_request_seq: 0,
                run_index,
                fatal: None,
                self_ref: weak.clone(),
                trace_count: 0,
            })
        });

        {
            let mut sim = state.borrow_mut();
            sim.data.run = run_index;
            let elements = sim.registry.ordered.clone();
            sim.data.announce(&elements);

            // First interarrival draws.
            let generators: Vec<(LocationId, usize)> = sim
                .locations
                .iter()
                .flat_map(|(i, loc)| (0..loc.generators.len()).map(move |g| (LocationId(i), g)))
                .collect();
            for (source, generator) in generators {
                sim.schedule_next_arrival(source, generator);
            }

            // Scripted startup processes.
            for i in 0..sim.startups.len() {
                let at = sim.startups[i].at;
                sim.queue
                    .insert(at, crate::simulation::scheduler::EventKind::Startup(i));
            }

            // First takedowns of self-scheduling downtime agents.
            let downtime_agents: Vec<AgentId> = sim
                .agents
                .iter()
                .filter(|(_, a)| matches!(a.behavior, Some(AgentKind::Downtime(_))))
                .map(|(i, _)| AgentId(i))
                .collect();
            for agent in downtime_agents {
                sim.downtime_initialize(agent);
            }

            if let Some(e) = sim.fatal.clone() {
                return Err(e);
            }
        }

        Ok(Simulation::new(state))
    }
}

impl std::fmt::Debug for SimInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimInit")
            .field("locations", &self.locations.len())
            .field("resources", &self.resources.len())
            .finish_non_exhaustive()
    }
}
