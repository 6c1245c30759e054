//! Event ordering and clock semantics.

use std::cell::RefCell;
use std::rc::Rc;

use simproc::data::MemoryDataSink;
use simproc::random::{SimDistribution, StreamId, TimeSampler};
use simproc::resource::ResourceClass;
use simproc::simulation::SimInit;
use simproc::time::SimTime;

type Log = Rc<RefCell<Vec<String>>>;

#[test]
fn waits_resume_in_time_order() {
    let mut bench = SimInit::new();
    let floor = bench.add_location("Floor", None).unwrap();
    let log: Log = Rc::default();

    for (name, delay) in [("A", 7.0), ("B", 3.0), ("C", 5.0)] {
        let log = log.clone();
        bench
            .add_startup_process(floor, "Widget", name, SimTime::none(0.0), move |ctx| async move {
                ctx.wait_for(delay).await?;
                log.borrow_mut().push(format!("{name}@{}", ctx.now().value()));
                Ok(())
            })
            .unwrap();
    }

    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();
    assert_eq!(
        log.borrow().as_slice(),
        ["B@3", "C@5", "A@7"].map(String::from)
    );
}

#[test]
fn equal_times_resume_in_scheduling_order() {
    let mut bench = SimInit::new();
    let floor = bench.add_location("Floor", None).unwrap();
    let log: Log = Rc::default();

    for name in ["first", "second", "third"] {
        let log = log.clone();
        bench
            .add_startup_process(floor, "Widget", name, SimTime::none(0.0), move |ctx| async move {
                ctx.wait_for(5.0).await?;
                log.borrow_mut().push(name.to_string());
                Ok(())
            })
            .unwrap();
    }

    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();
    assert_eq!(
        log.borrow().as_slice(),
        ["first", "second", "third"].map(String::from)
    );
}

#[test]
fn wait_for_zero_yields_behind_pending_events() {
    let mut bench = SimInit::new();
    let floor = bench.add_location("Floor", None).unwrap();
    let log: Log = Rc::default();

    // All three processes resume at t=5 in scheduling order; the second one
    // then yields with a zero-length wait and must fall behind the third.
    {
        let log = log.clone();
        bench
            .add_startup_process(floor, "Widget", "P1", SimTime::none(0.0), move |ctx| async move {
                ctx.wait_for(5.0).await?;
                log.borrow_mut().push("p1".into());
                Ok(())
            })
            .unwrap();
    }
    {
        let log = log.clone();
        bench
            .add_startup_process(floor, "Widget", "P2", SimTime::none(0.0), move |ctx| async move {
                ctx.wait_for(5.0).await?;
                ctx.wait_for(0.0).await?;
                log.borrow_mut().push(format!("p2@{}", ctx.now().value()));
                Ok(())
            })
            .unwrap();
    }
    {
        let log = log.clone();
        bench
            .add_startup_process(floor, "Widget", "P3", SimTime::none(0.0), move |ctx| async move {
                ctx.wait_for(5.0).await?;
                log.borrow_mut().push("p3".into());
                Ok(())
            })
            .unwrap();
    }

    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();
    assert_eq!(
        log.borrow().as_slice(),
        ["p1", "p3", "p2@5"].map(String::from)
    );
}

#[test]
fn negative_wait_is_rejected() {
    let mut bench = SimInit::new();
    let floor = bench.add_location("Floor", None).unwrap();
    let log: Log = Rc::default();
    {
        let log = log.clone();
        bench
            .add_startup_process(floor, "Widget", "P", SimTime::none(0.0), move |ctx| async move {
                let err = ctx.wait_for(-1.0).await.unwrap_err();
                log.borrow_mut().push(format!("{err}"));
                Ok(())
            })
            .unwrap();
    }
    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();
    assert!(log.borrow()[0].contains("invalid request"));
}

#[test]
fn clock_reaches_run_until_target_without_events() {
    let bench = SimInit::new();
    let mut simu = bench.init(1).unwrap();
    simu.run_until(SimTime::none(123.0)).unwrap();
    assert_eq!(simu.time(), SimTime::none(123.0));
}

fn mm1_bench(sink: MemoryDataSink) -> SimInit {
    let mut bench = SimInit::new();
    bench.set_data_sink(sink);
    let queue = bench.add_queue("Queue", None).unwrap();
    let server = bench
        .add_resource("Server", None, 1, ResourceClass::new("Server"))
        .unwrap();
    let exit = bench.add_entity_sink("Exit", None).unwrap();
    let door = bench.add_source("Door", None).unwrap();

    let interarrival = TimeSampler::new(
        SimDistribution::exponential(10.0).unwrap(),
        StreamId(1),
        None,
    );
    let service = TimeSampler::new(SimDistribution::exponential(8.0).unwrap(), StreamId(2), None);
    bench
        .add_generator(door, "Customer", "Visit", interarrival, move |ctx| {
            let service = service.clone();
            async move {
                ctx.move_to(queue)?;
                let assignment = ctx.acquire(server, 1).await?;
                let service_time = ctx.sample(&service)?;
                ctx.wait_for(service_time).await?;
                drop(assignment);
                ctx.move_to(exit)?;
                Ok(())
            }
        })
        .unwrap();
    bench
}

#[test]
fn replications_are_deterministic() {
    let sink_a = MemoryDataSink::new();
    let sink_b = MemoryDataSink::new();

    let mut run_a = mm1_bench(sink_a.clone()).init(3).unwrap();
    run_a.run_until(SimTime::none(2000.0)).unwrap();

    let mut run_b = mm1_bench(sink_b.clone()).init(3).unwrap();
    run_b.run_until(SimTime::none(2000.0)).unwrap();

    assert_eq!(sink_a.records(), sink_b.records());
    assert!(!sink_a.records().is_empty());
}

#[test]
fn distinct_replications_diverge() {
    let sink_a = MemoryDataSink::new();
    let sink_b = MemoryDataSink::new();

    let mut run_a = mm1_bench(sink_a.clone()).init(1).unwrap();
    run_a.run_until(SimTime::none(2000.0)).unwrap();

    let mut run_b = mm1_bench(sink_b.clone()).init(2).unwrap();
    run_b.run_until(SimTime::none(2000.0)).unwrap();

    assert_ne!(sink_a.records(), sink_b.records());
}
