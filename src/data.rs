//! Datasets, collectors and the data sink interface.
//!
//! The engine does not persist output data itself. Every element registers
//! *datasets* (a population, a utilization, a process time...); dataset
//! values are forwarded to an injected [`DataSink`] implementation as they
//! are produced. Time-weighted datasets emit `(from, to, value)` segments,
//! each holding until the next change; unweighted datasets emit
//! `(time, value)` observations.
//!
//! Batch boundaries re-target emission: the warmup interval is batch 0 and
//! batches 1..=n follow. The summary layer downstream decides what to do
//! with batch 0.
//!
//! [`MemoryDataSink`] collects everything in memory and is the sink used by
//! the crate's own tests; [`NullDataSink`] discards everything.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use slab::Slab;

use crate::config::SimConfig;
use crate::executor::ProcessId;
use crate::time::{SimTime, TimeUnit};

/// Identifier of a registered dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(pub(crate) usize);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a model-level counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CounterId(pub(crate) usize);

/// The value type of a dataset, for the benefit of the sink's schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// Integer-valued observations.
    Int,
    /// Real-valued observations.
    Float,
    /// Simulated-time observations, in the dataset's time unit.
    Time,
}

/// The kind of a registered element, for the benefit of the sink's schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    /// A location (including queues, sources and sinks).
    Location,
    /// A resource.
    Resource,
    /// A process class.
    Process,
    /// An entity class.
    Entity,
    /// A stand-alone counter or collector.
    Collector,
}

/// Receiver of everything the engine measures.
///
/// Implementations map these calls onto their storage of choice; the
/// reference implementation outside this crate writes SQL rows.
pub trait DataSink {
    /// Reports a simulation element, once, before the run starts.
    fn on_element(&mut self, element_id: &str, class_name: &str, element_type: ElementType);

    /// Reports a dataset belonging to a previously reported element.
    fn on_dataset(
        &mut self,
        dataset: DatasetId,
        element_id: &str,
        name: &str,
        value_type: ValueType,
        time_weighted: bool,
        time_unit: Option<TimeUnit>,
    );

    /// Marks the start of a replication.
    fn begin_run(&mut self, run: u32);

    /// Marks the start of a batch (batch 0 is the warmup).
    fn begin_batch(&mut self, run: u32, batch: u32);

    /// Records an unweighted observation.
    fn put_unweighted(&mut self, dataset: DatasetId, run: u32, batch: u32, time: SimTime, value: f64);

    /// Records a time-weighted segment: `value` held from `from` to `to`.
    fn put_timeweighted(
        &mut self,
        dataset: DatasetId,
        run: u32,
        batch: u32,
        from: SimTime,
        to: SimTime,
        value: f64,
    );

    /// Marks the end of a batch.
    fn end_batch(&mut self, run: u32, batch: u32);

    /// Marks the end of a replication.
    fn end_run(&mut self, run: u32);
}

/// A sink that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDataSink;

impl DataSink for NullDataSink {
    fn on_element(&mut self, _: &str, _: &str, _: ElementType) {}
    fn on_dataset(&mut self, _: DatasetId, _: &str, _: &str, _: ValueType, _: bool, _: Option<TimeUnit>) {
    }
    fn begin_run(&mut self, _: u32) {}
    fn begin_batch(&mut self, _: u32, _: u32) {}
    fn put_unweighted(&mut self, _: DatasetId, _: u32, _: u32, _: SimTime, _: f64) {}
    fn put_timeweighted(&mut self, _: DatasetId, _: u32, _: u32, _: SimTime, _: SimTime, _: f64) {}
    fn end_batch(&mut self, _: u32, _: u32) {}
    fn end_run(&mut self, _: u32) {}
}

/// One record captured by a [`MemoryDataSink`].
#[derive(Clone, Debug, PartialEq)]
pub enum SinkRecord {
    /// An element registration.
    Element {
        /// Dotted element id.
        element_id: String,
        /// Model-facing class name.
        class_name: String,
        /// Element kind.
        element_type: ElementType,
    },
    /// A dataset registration.
    Dataset {
        /// Dataset id.
        dataset: DatasetId,
        /// Owning element id.
        element_id: String,
        /// Dataset name, unique within the element.
        name: String,
        /// Whether segments are time-weighted.
        time_weighted: bool,
    },
    /// Start of a replication.
    BeginRun(u32),
    /// Start of a batch.
    BeginBatch(u32, u32),
    /// An unweighted observation.
    Unweighted {
        /// Dataset id.
        dataset: DatasetId,
        /// Batch number.
        batch: u32,
        /// Observation time.
        time: SimTime,
        /// Observed value.
        value: f64,
    },
    /// A time-weighted segment.
    TimeWeighted {
        /// Dataset id.
        dataset: DatasetId,
        /// Batch number.
        batch: u32,
        /// Segment start.
        from: SimTime,
        /// Segment end.
        to: SimTime,
        /// Value held over the segment.
        value: f64,
    },
    /// End of a batch.
    EndBatch(u32, u32),
    /// End of a replication.
    EndRun(u32),
}

/// A sink that appends every record to a shared in-memory buffer.
///
/// Cloning the sink clones a handle to the same buffer, so a clone kept by
/// the caller still observes records captured during the run.
#[derive(Clone, Debug, Default)]
pub struct MemoryDataSink {
    records: Rc<RefCell<Vec<SinkRecord>>>,
}

impl MemoryDataSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all captured records.
    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.borrow().clone()
    }

    /// Returns all time-weighted segments of one dataset in one batch.
    pub fn timeweighted(&self, dataset: DatasetId, batch: u32) -> Vec<(SimTime, SimTime, f64)> {
        self.records
            .borrow()
            .iter()
            .filter_map(|r| match r {
                SinkRecord::TimeWeighted {
                    dataset: d,
                    batch: b,
                    from,
                    to,
                    value,
                } if *d == dataset && *b == batch => Some((*from, *to, *value)),
                _ => None,
            })
            .collect()
    }

    /// Returns all unweighted observations of one dataset in one batch.
    pub fn unweighted(&self, dataset: DatasetId, batch: u32) -> Vec<(SimTime, f64)> {
        self.records
            .borrow()
            .iter()
            .filter_map(|r| match r {
                SinkRecord::Unweighted {
                    dataset: d,
                    batch: b,
                    time,
                    value,
                } if *d == dataset && *b == batch => Some((*time, *value)),
                _ => None,
            })
            .collect()
    }

    /// Time-weighted mean of one dataset over one batch, or `None` if the
    /// dataset has no segments in that batch.
    pub fn timeweighted_mean(&self, dataset: DatasetId, batch: u32) -> Option<f64> {
        let segments = self.timeweighted(dataset, batch);
        let mut weight = 0.0;
        let mut total = 0.0;
        for (from, to, value) in segments {
            let w = (to - from).value();
            weight += w;
            total += w * value;
        }
        (weight > 0.0).then(|| total / weight)
    }

    /// Plain mean of one dataset's unweighted observations over one batch.
    pub fn unweighted_mean(&self, dataset: DatasetId, batch: u32) -> Option<f64> {
        let values = self.unweighted(dataset, batch);
        (!values.is_empty()).then(|| values.iter().map(|(_, v)| v).sum::<f64>() / values.len() as f64)
    }

    /// Looks a dataset up by owning element id and dataset name.
    pub fn dataset_id(&self, element_id: &str, name: &str) -> Option<DatasetId> {
        self.records.borrow().iter().find_map(|r| match r {
            SinkRecord::Dataset {
                dataset,
                element_id: e,
                name: n,
                ..
            } if e == element_id && n == name => Some(*dataset),
            _ => None,
        })
    }
}

impl DataSink for MemoryDataSink {
    fn on_element(&mut self, element_id: &str, class_name: &str, element_type: ElementType) {
        self.records.borrow_mut().push(SinkRecord::Element {
            element_id: element_id.to_string(),
            class_name: class_name.to_string(),
            element_type,
        });
    }

    fn on_dataset(
        &mut self,
        dataset: DatasetId,
        element_id: &str,
        name: &str,
        _value_type: ValueType,
        time_weighted: bool,
        _time_unit: Option<TimeUnit>,
    ) {
        self.records.borrow_mut().push(SinkRecord::Dataset {
            dataset,
            element_id: element_id.to_string(),
            name: name.to_string(),
            time_weighted,
        });
    }

    fn begin_run(&mut self, run: u32) {
        self.records.borrow_mut().push(SinkRecord::BeginRun(run));
    }

    fn begin_batch(&mut self, run: u32, batch: u32) {
        self.records.borrow_mut().push(SinkRecord::BeginBatch(run, batch));
    }

    fn put_unweighted(&mut self, dataset: DatasetId, _run: u32, batch: u32, time: SimTime, value: f64) {
        self.records.borrow_mut().push(SinkRecord::Unweighted {
            dataset,
            batch,
            time,
            value,
        });
    }

    fn put_timeweighted(
        &mut self,
        dataset: DatasetId,
        _run: u32,
        batch: u32,
        from: SimTime,
        to: SimTime,
        value: f64,
    ) {
        self.records.borrow_mut().push(SinkRecord::TimeWeighted {
            dataset,
            batch,
            from,
            to,
            value,
        });
    }

    fn end_batch(&mut self, run: u32, batch: u32) {
        self.records.borrow_mut().push(SinkRecord::EndBatch(run, batch));
    }

    fn end_run(&mut self, run: u32) {
        self.records.borrow_mut().push(SinkRecord::EndRun(run));
    }
}

/// Internal state of one dataset.
pub(crate) struct DatasetState {
    pub(crate) element_id: String,
    pub(crate) name: String,
    pub(crate) value_type: ValueType,
    pub(crate) time_unit: Option<TimeUnit>,
    pub(crate) time_weighted: bool,
    pub(crate) enabled: bool,
    /// Current value of a time-weighted dataset.
    pub(crate) last_value: f64,
    /// Start of the segment holding `last_value`.
    pub(crate) last_change: SimTime,
}

/// Internal state of a model-level counter.
pub(crate) struct CounterState {
    pub(crate) value: u64,
    pub(crate) capacity: Option<u64>,
    /// FIFO of processes blocked on increments that exceeded capacity.
    pub(crate) waiting: VecDeque<(ProcessId, u64)>,
    pub(crate) dataset: DatasetId,
    /// Divisor applied to emitted values (capacity when normalizing).
    pub(crate) normalizer: f64,
}

/// The dataset registry plus the injected sink and batch bookkeeping.
pub(crate) struct DataLayer {
    pub(crate) datasets: Slab<DatasetState>,
    pub(crate) sink: Box<dyn DataSink>,
    pub(crate) run: u32,
    pub(crate) batch: u32,
}

impl DataLayer {
    pub(crate) fn new(sink: Box<dyn DataSink>) -> Self {
        Self {
            datasets: Slab::new(),
            sink,
            run: 0,
            batch: 0,
        }
    }

    /// Registers a dataset, applying the configured disable filters. The
    /// sink learns about datasets in one sweep at simulation start, via
    /// [`announce`](DataLayer::announce).
    pub(crate) fn add_dataset(
        &mut self,
        config: &SimConfig,
        element_id: &str,
        name: &str,
        value_type: ValueType,
        time_weighted: bool,
        start: SimTime,
    ) -> DatasetId {
        let enabled = config.data_collection.dataset_enabled(element_id, name);
        DatasetId(self.datasets.insert(DatasetState {
            element_id: element_id.to_string(),
            name: name.to_string(),
            value_type,
            time_unit: config.time.base_unit,
            time_weighted,
            enabled,
            last_value: 0.0,
            last_change: start,
        }))
    }

    /// Reports every registered element and dataset to the sink, in
    /// registration order.
    pub(crate) fn announce(&mut self, elements: &[(String, String, ElementType)]) {
        for (element_id, class_name, element_type) in elements {
            self.sink.on_element(element_id, class_name, *element_type);
        }
        for (i, ds) in self.datasets.iter() {
            self.sink.on_dataset(
                DatasetId(i),
                &ds.element_id,
                &ds.name,
                ds.value_type,
                ds.time_weighted,
                ds.time_unit,
            );
        }
    }

    /// Records an unweighted observation.
    pub(crate) fn put_value(&mut self, id: DatasetId, now: SimTime, value: f64) {
        let ds = &self.datasets[id.0];
        if ds.enabled {
            self.sink.put_unweighted(id, self.run, self.batch, now, value);
        }
    }

    /// Transitions a time-weighted dataset to a new value, emitting the
    /// segment that just ended.
    pub(crate) fn set_value(&mut self, id: DatasetId, now: SimTime, value: f64) {
        let ds = &mut self.datasets[id.0];
        let (from, prev) = (ds.last_change, ds.last_value);
        ds.last_change = now;
        ds.last_value = value;
        if ds.enabled && from < now {
            self.sink.put_timeweighted(id, self.run, self.batch, from, now, prev);
        }
    }

    /// Emits the open segment of every time-weighted dataset up to `now`,
    /// restarting the segments at `now`. Called at batch boundaries and at
    /// the end of the run.
    pub(crate) fn flush_timeweighted(&mut self, now: SimTime) {
        let ids: Vec<usize> = self
            .datasets
            .iter()
            .filter(|(_, ds)| ds.time_weighted)
            .map(|(i, _)| i)
            .collect();
        for i in ids {
            let ds = &mut self.datasets[i];
            let (from, value) = (ds.last_change, ds.last_value);
            ds.last_change = now;
            if ds.enabled && from < now {
                self.sink
                    .put_timeweighted(DatasetId(i), self.run, self.batch, from, now, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeweighted_segments_hold_until_change() {
        let sink = MemoryDataSink::new();
        let mut layer = DataLayer::new(Box::new(sink.clone()));
        let config = SimConfig::new();
        let id = layer.add_dataset(&config, "Q", "Population", ValueType::Int, true, SimTime::ZERO);

        layer.set_value(id, SimTime::none(2.0), 1.0);
        layer.set_value(id, SimTime::none(5.0), 2.0);
        layer.flush_timeweighted(SimTime::none(9.0));

        assert_eq!(
            sink.timeweighted(id, 0),
            vec![
                (SimTime::ZERO, SimTime::none(2.0), 0.0),
                (SimTime::none(2.0), SimTime::none(5.0), 1.0),
                (SimTime::none(5.0), SimTime::none(9.0), 2.0),
            ]
        );
        assert_eq!(
            sink.timeweighted_mean(id, 0),
            Some((2.0 * 0.0 + 3.0 * 1.0 + 4.0 * 2.0) / 9.0)
        );
    }

    #[test]
    fn disabled_datasets_do_not_emit() {
        let sink = MemoryDataSink::new();
        let mut layer = DataLayer::new(Box::new(sink.clone()));
        let config = SimConfig::from_json(
            r#"{ "data_collection": { "disable_datasets": [ { "dataset": "Population" } ] } }"#,
        )
        .unwrap();
        let id = layer.add_dataset(&config, "Q", "Population", ValueType::Int, true, SimTime::ZERO);

        layer.set_value(id, SimTime::none(3.0), 4.0);
        layer.flush_timeweighted(SimTime::none(5.0));
        assert!(sink.timeweighted(id, 0).is_empty());
    }
}
