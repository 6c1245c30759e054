//! Downtime agents: schedules, failures, going-down and coordination.

use std::cell::RefCell;
use std::rc::Rc;

use simproc::downtime::{DowntimeApi, DowntimeBehavior, DowntimeSchedule, ScheduledDowntime};
use simproc::agent::MsgKind;
use simproc::random::{SimDistribution, StreamId, TimeSampler};
use simproc::resource::{ResourceClass, ResourceId};
use simproc::simulation::{SimError, SimInit};
use simproc::time::SimTime;

type Log = Rc<RefCell<Vec<String>>>;

fn constant_sampler(value: f64, stream: u32) -> TimeSampler {
    TimeSampler::new(SimDistribution::constant(value).unwrap(), StreamId(stream), None)
}

#[test]
fn scheduled_downtime_cycles() {
    let mut bench = SimInit::new();
    let machine = bench
        .add_resource("Machine", None, 1, ResourceClass::new("Machine"))
        .unwrap();
    let schedule = DowntimeSchedule::new(
        SimTime::none(100.0),
        vec![(SimTime::none(10.0), SimTime::none(5.0))],
    )
    .unwrap();
    bench.add_scheduled_downtime(machine, schedule).unwrap();

    let mut simu = bench.init(1).unwrap();
    simu.run_until(SimTime::none(9.0)).unwrap();
    assert!(!simu.resource_is_down(machine));

    simu.run_until(SimTime::none(12.0)).unwrap();
    assert!(simu.resource_is_down(machine));
    assert_eq!(simu.resource_available(machine), 0);

    simu.run_until(SimTime::none(16.0)).unwrap();
    assert!(!simu.resource_is_down(machine));

    // The schedule repeats each cycle.
    simu.run_until(SimTime::none(112.0)).unwrap();
    assert!(simu.resource_is_down(machine));
    simu.run_until(SimTime::none(116.0)).unwrap();
    assert!(!simu.resource_is_down(machine));
}

#[test]
fn failure_agent_alternates_failure_and_repair() {
    let mut bench = SimInit::new();
    let machine = bench
        .add_resource("Machine", None, 1, ResourceClass::new("Machine"))
        .unwrap();
    bench
        .add_failure_agent(machine, constant_sampler(10.0, 1), constant_sampler(5.0, 2))
        .unwrap();

    let mut simu = bench.init(1).unwrap();
    // Down over 10..15, 25..30, ...
    simu.run_until(SimTime::none(11.0)).unwrap();
    assert!(simu.resource_is_down(machine));
    simu.run_until(SimTime::none(16.0)).unwrap();
    assert!(!simu.resource_is_down(machine));
    simu.run_until(SimTime::none(26.0)).unwrap();
    assert!(simu.resource_is_down(machine));
}

/// A downtime behavior that, at a fixed time, starts a soft takedown with
/// a hard-stop timeout.
struct SoftStopAt {
    at: Option<SimTime>,
    timeout: SimTime,
}

impl DowntimeBehavior for SoftStopAt {
    fn next_downtime(&mut self, _api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        self.at.take()
    }

    fn start_resource_takedown(&mut self, api: &mut DowntimeApi<'_>) {
        self.set_resource_going_down(api, Some(self.timeout));
    }
}

/// Going-down excludes the resource from new assignments; the hard-stop
/// timeout then interrupts the holder, which recovers on another resource.
#[test]
fn going_down_with_timeout_interrupts_the_holder() {
    let mut bench = SimInit::new();
    let floor = bench.add_location("Floor", None).unwrap();
    let desk1 = bench
        .add_resource("Desk1", None, 1, ResourceClass::new("Desk"))
        .unwrap();
    let desk2 = bench
        .add_resource("Desk2", None, 1, ResourceClass::new("Desk"))
        .unwrap();
    bench
        .add_downtime_agent(
            desk1,
            SoftStopAt {
                at: Some(SimTime::none(4.0)),
                timeout: SimTime::none(2.0),
            },
        )
        .unwrap();
    let log: Log = Rc::default();
    {
        let log = log.clone();
        bench
            .add_startup_process(floor, "Customer", "Serve", SimTime::none(0.0), move |ctx| async move {
                let assignment = ctx.acquire(desk1, 1).await?;
                match ctx.wait_for(10.0).await {
                    Ok(()) => log.borrow_mut().push("finished undisturbed".into()),
                    Err(SimError::ResourceDown { resource }) => {
                        assert_eq!(resource, desk1);
                        log.borrow_mut().push(format!("down@{}", ctx.now().value()));
                        // The units were reclaimed; recover on the other desk.
                        drop(assignment);
                        let replacement = ctx.acquire(desk2, 1).await?;
                        ctx.wait_for(4.0).await?;
                        drop(replacement);
                        log.borrow_mut().push(format!("done@{}", ctx.now().value()));
                    }
                    Err(e) => return Err(e),
                }
                Ok(())
            })
            .unwrap();
    }

    let mut simu = bench.init(1).unwrap();
    simu.run_until(SimTime::none(5.0)).unwrap();
    // Going down: still up, but not assignable.
    assert!(!simu.resource_is_down(desk1));
    assert!(simu.resource_is_going_down(desk1));
    assert_eq!(simu.resource_available(desk1), 0);

    simu.run().unwrap();
    assert!(simu.resource_is_down(desk1));
    assert_eq!(
        log.borrow().as_slice(),
        ["down@6", "done@10"].map(String::from)
    );
}

/// "Don't both be down": the second teller postpones its break while its
/// peer is down, coordinating through subscribed bring-up messages.
struct PoliteBreak {
    inner: ScheduledDowntime,
    peer: ResourceId,
    pending: bool,
}

impl DowntimeBehavior for PoliteBreak {
    fn next_downtime(&mut self, api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        self.inner.next_downtime(api)
    }

    fn next_bringup(&mut self, api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        self.inner.next_bringup(api)
    }

    fn start_resource_takedown(&mut self, api: &mut DowntimeApi<'_>) {
        if api.is_down(self.peer) {
            self.pending = true;
        } else {
            self.takedown_resource(api);
        }
    }

    fn on_resource_up(&mut self, api: &mut DowntimeApi<'_>, resource: ResourceId) {
        if self.pending && resource == self.peer {
            self.pending = false;
            self.takedown_resource(api);
        }
    }
}

#[test]
fn peer_coordination_delays_the_second_break() {
    let mut bench = SimInit::new();
    let teller1 = bench
        .add_resource("Teller1", None, 1, ResourceClass::new("Teller"))
        .unwrap();
    let teller2 = bench
        .add_resource("Teller2", None, 1, ResourceClass::new("Teller"))
        .unwrap();

    let breaks = DowntimeSchedule::new(
        SimTime::none(1000.0),
        vec![
            (SimTime::none(120.0), SimTime::none(15.0)),
            (SimTime::none(135.0), SimTime::none(15.0)),
        ],
    )
    .unwrap();
    let agent1 = bench
        .add_scheduled_downtime(teller1, breaks.clone())
        .unwrap();
    let agent2 = bench
        .add_downtime_agent(
            teller2,
            PoliteBreak {
                inner: ScheduledDowntime::new(breaks),
                peer: teller1,
                pending: false,
            },
        )
        .unwrap();
    bench.subscribe(agent1, MsgKind::Up, agent2).unwrap();

    let mut simu = bench.init(1).unwrap();

    simu.run_until(SimTime::none(125.0)).unwrap();
    assert!(simu.resource_is_down(teller1));
    assert!(!simu.resource_is_down(teller2));

    simu.run_until(SimTime::none(140.0)).unwrap();
    assert!(!simu.resource_is_down(teller1));
    assert!(simu.resource_is_down(teller2));

    simu.run_until(SimTime::none(155.0)).unwrap();
    assert!(!simu.resource_is_down(teller1));
    assert!(!simu.resource_is_down(teller2));
}

/// `wait_for_through_downtime` extends the wait by the time the resource
/// was down.
#[test]
fn wait_extends_through_downtime() {
    let mut bench = SimInit::new();
    let floor = bench.add_location("Floor", None).unwrap();
    let machine = bench
        .add_resource("Machine", None, 1, ResourceClass::new("Machine"))
        .unwrap();
    // Fails at t=4 for 3 time units.
    bench
        .add_failure_agent(machine, constant_sampler(4.0, 1), constant_sampler(3.0, 2))
        .unwrap();
    let log: Log = Rc::default();
    {
        let log = log.clone();
        bench
            .add_startup_process(floor, "Job", "Run", SimTime::none(0.0), move |ctx| async move {
                let assignment = ctx.acquire(machine, 1).await?;
                ctx.wait_for_through_downtime(10.0).await?;
                log.borrow_mut().push(format!("done@{}", ctx.now().value()));
                drop(assignment);
                Ok(())
            })
            .unwrap();
    }

    let mut simu = bench.init(1).unwrap();
    // 4 worked + 3 down + 6 remaining.
    simu.run_until(SimTime::none(20.0)).unwrap();
    assert_eq!(log.borrow().as_slice(), ["done@13".to_string()]);
}

/// Another takedown while the agent is going down completes the pending
/// takedown via the default `Down` handler.
struct SoftStop {
    at: Option<SimTime>,
}

impl DowntimeBehavior for SoftStop {
    fn next_downtime(&mut self, _api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        self.at.take()
    }

    fn start_resource_takedown(&mut self, api: &mut DowntimeApi<'_>) {
        self.set_resource_going_down(api, None);
    }
}

struct HardStop {
    at: Option<SimTime>,
    up_after: SimTime,
}

impl DowntimeBehavior for HardStop {
    fn next_downtime(&mut self, _api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        self.at.take()
    }

    fn next_bringup(&mut self, api: &mut DowntimeApi<'_>) -> Option<SimTime> {
        Some(api.now() + self.up_after)
    }
}

#[test]
fn a_peer_takedown_completes_a_pending_soft_stop() {
    let mut bench = SimInit::new();
    let machine = bench
        .add_resource("Machine", None, 1, ResourceClass::new("Machine"))
        .unwrap();
    let soft = bench
        .add_downtime_agent(machine, SoftStop { at: Some(SimTime::none(5.0)) })
        .unwrap();
    bench
        .add_downtime_agent(
            machine,
            HardStop {
                at: Some(SimTime::none(8.0)),
                up_after: SimTime::none(4.0),
            },
        )
        .unwrap();
    let _ = soft;

    let mut simu = bench.init(1).unwrap();
    simu.run_until(SimTime::none(6.0)).unwrap();
    assert!(simu.resource_is_going_down(machine));
    assert!(!simu.resource_is_down(machine));

    // The hard stop at t=8 turns the soft stop into a real takedown; both
    // agents now hold the resource down, and the hard stop's bring-up at
    // t=12 is not enough on its own.
    simu.run_until(SimTime::none(9.0)).unwrap();
    assert!(simu.resource_is_down(machine));
    simu.run_until(SimTime::none(13.0)).unwrap();
    assert!(simu.resource_is_down(machine));
}
