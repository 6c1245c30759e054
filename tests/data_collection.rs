//! Counters, datasets, batches and disable filters.

use std::cell::RefCell;
use std::rc::Rc;

use simproc::config::SimConfig;
use simproc::data::{MemoryDataSink, SinkRecord};
use simproc::random::{SimDistribution, StreamId, TimeSampler};
use simproc::resource::ResourceClass;
use simproc::simulation::SimInit;
use simproc::time::SimTime;

type Log = Rc<RefCell<Vec<String>>>;

#[test]
fn capped_counter_blocks_and_grants_in_fifo_order() {
    let mut bench = SimInit::new();
    let floor = bench.add_location("Floor", None).unwrap();
    let tank = bench.add_counter("Tank", Some(2), false).unwrap();
    let log: Log = Rc::default();

    for start in [0.0, 1.0, 2.0] {
        let log = log.clone();
        bench
            .add_startup_process(floor, "Job", "Fill", SimTime::none(start), move |ctx| async move {
                ctx.increment(tank, 1).await?;
                log.borrow_mut().push(format!("in@{}", ctx.now().value()));
                ctx.wait_for(10.0).await?;
                ctx.decrement(tank, 1)?;
                Ok(())
            })
            .unwrap();
    }

    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();
    // The third increment waits for the first decrement at t=10.
    assert_eq!(
        log.borrow().as_slice(),
        ["in@0", "in@1", "in@10"].map(String::from)
    );
}

#[test]
fn normalized_counter_emits_fractions_of_capacity() {
    let sink = MemoryDataSink::new();
    let mut bench = SimInit::new();
    bench.set_data_sink(sink.clone());
    let floor = bench.add_location("Floor", None).unwrap();
    let tank = bench.add_counter("Tank", Some(4), true).unwrap();

    bench
        .add_startup_process(floor, "Job", "Fill", SimTime::none(0.0), move |ctx| async move {
            ctx.wait_for(1.0).await?;
            ctx.increment(tank, 2).await?;
            ctx.wait_for(2.0).await?;
            ctx.decrement(tank, 2)?;
            Ok(())
        })
        .unwrap();

    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();

    let dataset = sink.dataset_id("Tank", "Value").unwrap();
    let segments = sink.timeweighted(dataset, 0);
    assert!(segments.contains(&(SimTime::none(1.0), SimTime::none(3.0), 0.5)));
}

/// A deterministic half-loaded station: constant interarrival 10, constant
/// service 5. Per-batch utilization is exactly one half.
#[test]
fn run_single_batches_report_deterministic_utilization() {
    let sink = MemoryDataSink::new();
    let mut bench = SimInit::new();
    bench.set_data_sink(sink.clone());
    let queue = bench.add_queue("Queue", None).unwrap();
    let station = bench.add_location("Station", None).unwrap();
    let server = bench
        .add_resource("Server", None, 1, ResourceClass::new("Server"))
        .unwrap();
    let exit = bench.add_entity_sink("Exit", None).unwrap();
    let door = bench.add_source("Door", None).unwrap();

    let interarrival = TimeSampler::new(SimDistribution::constant(10.0).unwrap(), StreamId(1), None);
    let service = TimeSampler::new(SimDistribution::constant(5.0).unwrap(), StreamId(2), None);
    bench
        .add_generator(door, "Part", "Machining", interarrival, move |ctx| {
            let service = service.clone();
            async move {
                ctx.move_to(queue)?;
                let assignment = ctx.acquire(server, 1).await?;
                ctx.move_to(station)?;
                let service_time = ctx.sample(&service)?;
                ctx.wait_for(service_time).await?;
                drop(assignment);
                ctx.move_to(exit)?;
                Ok(())
            }
        })
        .unwrap();

    let mut simu = bench.init(1).unwrap();
    simu.run_single(SimTime::none(100.0), SimTime::none(1000.0), 2)
        .unwrap();

    let records = sink.records();
    assert!(records.contains(&SinkRecord::BeginRun(1)));
    assert!(records.contains(&SinkRecord::BeginBatch(1, 0)));
    assert!(records.contains(&SinkRecord::BeginBatch(1, 2)));
    assert!(records.contains(&SinkRecord::EndBatch(1, 2)));
    assert!(records.contains(&SinkRecord::EndRun(1)));

    let utilization = sink.dataset_id("Server", "Utilization").unwrap();
    for batch in [1, 2] {
        let mean = sink.timeweighted_mean(utilization, batch).unwrap();
        assert!((mean - 0.5).abs() < 1e-9, "batch {batch} utilization {mean}");
    }

    // Nothing ever waits: the queue population holds at zero.
    let population = sink.dataset_id("Queue", "Population").unwrap();
    for batch in [1, 2] {
        let mean = sink.timeweighted_mean(population, batch).unwrap();
        assert!(mean.abs() < 1e-9, "batch {batch} queue {mean}");
    }
}

#[test]
fn disable_filters_suppress_emission() {
    let sink = MemoryDataSink::new();
    let config = SimConfig::from_json(
        r#"{ "data_collection": { "disable_elements": ["Server*"] } }"#,
    )
    .unwrap();
    let mut bench = SimInit::with_config(config);
    bench.set_data_sink(sink.clone());
    let floor = bench.add_location("Floor", None).unwrap();
    let annex = bench.add_location("Annex", None).unwrap();
    let server = bench
        .add_resource("Server", None, 1, ResourceClass::new("Server"))
        .unwrap();

    bench
        .add_startup_process(floor, "Job", "Run", SimTime::none(0.0), move |ctx| async move {
            let assignment = ctx.acquire(server, 1).await?;
            ctx.wait_for(5.0).await?;
            drop(assignment);
            ctx.move_to(annex)?;
            Ok(())
        })
        .unwrap();

    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();

    let utilization = sink.dataset_id("Server", "Utilization").unwrap();
    assert!(sink.timeweighted(utilization, 0).is_empty());
    // The unfiltered location still reports.
    let population = sink.dataset_id("Floor", "Population").unwrap();
    assert!(!sink.timeweighted(population, 0).is_empty());
}

#[test]
fn elements_and_datasets_are_announced_once() {
    let sink = MemoryDataSink::new();
    let mut bench = SimInit::new();
    bench.set_data_sink(sink.clone());
    bench.add_queue("Queue", None).unwrap();
    bench
        .add_resource("Server", None, 1, ResourceClass::new("Server"))
        .unwrap();

    let simu = bench.init(1).unwrap();
    drop(simu);

    let elements: Vec<String> = sink
        .records()
        .iter()
        .filter_map(|r| match r {
            SinkRecord::Element { element_id, .. } => Some(element_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(elements, vec!["Queue".to_string(), "Server".to_string()]);
    assert!(sink.dataset_id("Queue", "Population").is_some());
    assert!(sink.dataset_id("Queue", "Entries").is_some());
    assert!(sink.dataset_id("Queue", "TimeInLocation").is_some());
    assert!(sink.dataset_id("Server", "Utilization").is_some());
    assert!(sink.dataset_id("Server", "DownTime").is_some());
    assert!(sink.dataset_id("Server", "ProcessTime").is_some());
}

#[test]
fn duplicate_element_ids_are_rejected() {
    let mut bench = SimInit::new();
    bench.add_queue("Station", None).unwrap();
    assert!(bench.add_location("Station", None).is_err());

    // The same leaf name under a different parent is fine.
    let branch = bench.add_location("Branch", None).unwrap();
    assert!(bench.add_queue("Station", Some(branch)).is_ok());
}
