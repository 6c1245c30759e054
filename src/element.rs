//! Model elements: locations, entities, sources and sinks.
//!
//! Static elements form a tree; an element's id is the dotted path of its
//! ownership chain (`Branch.Queue`). Element ids are unique within a run
//! and key all data collection.
//!
//! Entities are transient: created by a source generator, moved between
//! locations by their process, destroyed on arrival at a sink. Each entity
//! belongs to an entity *class element* and each process to a process
//! *class element*; data are aggregated per class, not per instance.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::data::{DatasetId, ElementType};
use crate::executor::{ProcessFuture, ProcessId};
use crate::process::ProcessContext;
use crate::random::TimeSampler;
use crate::simulation::{SimError, SimState};
use crate::time::SimTime;

/// Identifier of an entity instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntityId(pub(crate) usize);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LocationId(pub(crate) usize);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a location is, beyond holding entities.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LocationKind {
    /// A plain location.
    Basic,
    /// A queue: a location whose population reads as its size.
    Queue,
    /// An entity source; owns entity generators.
    Source,
    /// An entity sink; destroys entities on entry.
    Sink,
}

/// One entity generator attached to a source.
pub(crate) struct EntityGenerator {
    pub(crate) entity_element: usize,
    pub(crate) process_element: usize,
    pub(crate) interarrival: TimeSampler,
    pub(crate) body: Box<dyn FnMut(ProcessContext) -> ProcessFuture>,
}

/// A one-shot process started at a fixed time, outside any interarrival
/// schedule.
pub(crate) struct StartupProcess {
    pub(crate) location: LocationId,
    pub(crate) entity_element: usize,
    pub(crate) process_element: usize,
    pub(crate) at: SimTime,
    /// Consumed when the startup fires.
    pub(crate) body: Option<Box<dyn FnOnce(ProcessContext) -> ProcessFuture>>,
}

/// Internal state of a location.
pub(crate) struct LocationState {
    pub(crate) element_id: String,
    pub(crate) parent: Option<LocationId>,
    pub(crate) children: Vec<LocationId>,
    pub(crate) kind: LocationKind,
    pub(crate) population: Vec<EntityId>,
    /// Entry time per present entity, for the time-in-location dataset.
    pub(crate) entry_times: HashMap<usize, SimTime>,
    pub(crate) entries: u64,
    pub(crate) pop_dataset: DatasetId,
    pub(crate) entries_dataset: DatasetId,
    pub(crate) time_dataset: DatasetId,
    pub(crate) generators: Vec<EntityGenerator>,
}

/// Internal state of an entity instance.
pub(crate) struct EntityState {
    pub(crate) serial: u64,
    pub(crate) element: usize,
    pub(crate) location: Option<LocationId>,
    pub(crate) created_at: SimTime,
    pub(crate) process: Option<ProcessId>,
}

/// Class-level element aggregating data for all processes of one class.
pub(crate) struct ProcessElement {
    pub(crate) element_id: String,
    pub(crate) in_process: i64,
    pub(crate) entries: u64,
    pub(crate) inproc_dataset: DatasetId,
    pub(crate) entries_dataset: DatasetId,
    pub(crate) ptime_dataset: DatasetId,
}

/// Class-level element aggregating data for all entities of one class.
pub(crate) struct EntityElement {
    pub(crate) element_id: String,
    pub(crate) population: i64,
    pub(crate) created: u64,
    pub(crate) wip_dataset: DatasetId,
    pub(crate) time_dataset: DatasetId,
}

/// The element registry: enforces id uniqueness within a run and keeps the
/// registration order for the sink announcement.
#[derive(Default)]
pub(crate) struct ElementRegistry {
    names: HashSet<String>,
    pub(crate) ordered: Vec<(String, String, ElementType)>,
}

impl ElementRegistry {
    /// Claims an element id, failing on duplicates.
    pub(crate) fn claim(
        &mut self,
        element_id: &str,
        class_name: &str,
        element_type: ElementType,
    ) -> Result<(), SimError> {
        if element_id.is_empty() {
            return Err(SimError::InvalidRequest("element names must be non-empty".into()));
        }
        if !self.names.insert(element_id.to_string()) {
            return Err(SimError::InvalidRequest(format!(
                "duplicate element id `{element_id}`"
            )));
        }
        self.ordered
            .push((element_id.to_string(), class_name.to_string(), element_type));
        Ok(())
    }
}

/// Builds a child element id from its parent's id.
pub(crate) fn child_id(parent: Option<&str>, name: &str) -> String {
    match parent {
        None | Some("") => name.to_string(),
        Some(parent) => format!("{parent}.{name}"),
    }
}

impl SimState {
    /// Creates an entity of a class at a location (normally a source).
    pub(crate) fn create_entity(&mut self, element: usize, at: LocationId) -> EntityId {
        let serial = {
            let e = &mut self.entity_elements[element];
            e.created += 1;
            e.population += 1;
            e.created
        };
        let entity = EntityId(self.entities.insert(EntityState {
            serial,
            element,
            location: None,
            created_at: self.now,
            process: None,
        }));
        let (ds, population) = {
            let e = &self.entity_elements[element];
            (e.wip_dataset, e.population)
        };
        let now = self.now;
        self.data.set_value(ds, now, population as f64);
        self.enter_location(entity, at);

        entity
    }

    /// Moves an entity into a location, updating both location datasets.
    fn enter_location(&mut self, entity: EntityId, location: LocationId) {
        let now = self.now;
        self.entities[entity.0].location = Some(location);
        let (pop_ds, entries_ds, population, entries) = {
            let loc = &mut self.locations[location.0];
            loc.population.push(entity);
            loc.entry_times.insert(entity.0, now);
            loc.entries += 1;
            (
                loc.pop_dataset,
                loc.entries_dataset,
                loc.population.len(),
                loc.entries,
            )
        };
        self.data.set_value(pop_ds, now, population as f64);
        self.data.put_value(entries_ds, now, entries as f64);
    }

    /// Takes an entity out of its current location, emitting its
    /// time-in-location.
    fn leave_location(&mut self, entity: EntityId) {
        let Some(location) = self.entities[entity.0].location.take() else {
            return;
        };
        let now = self.now;
        let (pop_ds, time_ds, population, entered) = {
            let loc = &mut self.locations[location.0];
            loc.population.retain(|e| *e != entity);
            let entered = loc.entry_times.remove(&entity.0);
            (loc.pop_dataset, loc.time_dataset, loc.population.len(), entered)
        };
        self.data.set_value(pop_ds, now, population as f64);
        if let Some(entered) = entered {
            self.data.put_value(time_ds, now, (now - entered).value());
        }
    }

    /// Moves an entity to another location. Arriving at a sink destroys the
    /// entity.
    pub(crate) fn move_entity(&mut self, entity: EntityId, to: LocationId) -> Result<(), SimError> {
        if !self.entities.contains(entity.0) {
            return Err(SimError::InvalidRequest(
                "move_to on an entity that was already destroyed".into(),
            ));
        }
        self.leave_location(entity);
        if self.locations[to.0].kind == LocationKind::Sink {
            // Count the pass-through before the entity disappears.
            let now = self.now;
            let entries_ds = {
                let loc = &mut self.locations[to.0];
                loc.entries += 1;
                loc.entries_dataset
            };
            let entries = self.locations[to.0].entries;
            self.data.put_value(entries_ds, now, entries as f64);
            self.destroy_entity(entity);
        } else {
            self.enter_location(entity, to);
        }
        Ok(())
    }

    /// Destroys an entity, updating its class element datasets.
    pub(crate) fn destroy_entity(&mut self, entity: EntityId) {
        let state = self.entities.remove(entity.0);
        let now = self.now;
        let (wip_ds, time_ds, population) = {
            let e = &mut self.entity_elements[state.element];
            e.population -= 1;
            (e.wip_dataset, e.time_dataset, e.population)
        };
        self.data.set_value(wip_ds, now, population as f64);
        self.data.put_value(time_ds, now, (now - state.created_at).value());
        tracing::trace!(entity = state.serial, "entity destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_ids_are_dotted_paths() {
        assert_eq!(child_id(None, "Queue"), "Queue");
        assert_eq!(child_id(Some("Branch"), "Queue"), "Branch.Queue");
        assert_eq!(child_id(Some(""), "Queue"), "Queue");
    }
}
