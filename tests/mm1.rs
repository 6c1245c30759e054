//! M/M/1 sanity: long-run statistics of a single-server queue.
//!
//! Interarrival ~ Exp(10), service ~ Exp(8), so the offered load is 0.8.
//! Queueing theory gives a mean waiting-line length of rho^2 / (1 - rho) =
//! 3.2 and a mean queue time of 32. The tolerance bands are wide enough for
//! the batch-means noise of a single replication.

use simproc::data::MemoryDataSink;
use simproc::random::{SimDistribution, StreamId, TimeSampler};
use simproc::resource::ResourceClass;
use simproc::simulation::SimInit;
use simproc::time::SimTime;

const NBATCHES: u32 = 10;

#[test]
fn mm1_long_run_statistics() {
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
    simu.run_single(SimTime::none(4000.0), SimTime::none(10_000.0), NBATCHES)
        .unwrap();

    let utilization = sink.dataset_id("Server", "Utilization").unwrap();
    let population = sink.dataset_id("Queue", "Population").unwrap();
    let queue_time = sink.dataset_id("Queue", "TimeInLocation").unwrap();

    let mut util_total = 0.0;
    let mut pop_total = 0.0;
    let mut wait_total = 0.0;
    for batch in 1..=NBATCHES {
        util_total += sink.timeweighted_mean(utilization, batch).unwrap();
        pop_total += sink.timeweighted_mean(population, batch).unwrap();
        wait_total += sink.unweighted_mean(queue_time, batch).unwrap();
    }
    let utilization_mean = util_total / NBATCHES as f64;
    let population_mean = pop_total / NBATCHES as f64;
    let wait_mean = wait_total / NBATCHES as f64;

    assert!(
        (utilization_mean - 0.8).abs() < 0.05,
        "server utilization {utilization_mean}"
    );
    assert!(
        (population_mean - 3.2).abs() < 1.2,
        "mean queue size {population_mean}"
    );
    assert!((wait_mean - 32.0).abs() < 10.0, "mean queue time {wait_mean}");
}
