//! Pool assignment: class-filtered selection and the policy seam.

use std::cell::RefCell;
use std::rc::Rc;

use simproc::resource::pool::{AssignmentPolicy, PoolApi, RequestRef};
use simproc::resource::{ResourceClass, ResourceId, ResourceSelector};
use simproc::agent::MessageId;
use simproc::simulation::{SimError, SimInit};
use simproc::time::SimTime;

type Log = Rc<RefCell<Vec<String>>>;

struct TellerBench {
    bench: SimInit,
    merchant: ResourceId,
    regular1: ResourceId,
    regular2: ResourceId,
}

fn teller_bench() -> TellerBench {
    let mut bench = SimInit::new();
    let merchant = bench
        .add_resource("MerchantTeller", None, 1, ResourceClass::new("Teller.Merchant"))
        .unwrap();
    let regular1 = bench
        .add_resource("RegularTeller1", None, 1, ResourceClass::new("Teller.Regular"))
        .unwrap();
    let regular2 = bench
        .add_resource("RegularTeller2", None, 1, ResourceClass::new("Teller.Regular"))
        .unwrap();
    TellerBench {
        bench,
        merchant,
        regular1,
        regular2,
    }
}

/// The bank-teller scenario: a merchant customer picks the merchant teller
/// by class, three regular customers select any teller, and the third one
/// waits for the first released unit.
#[test]
fn class_filtered_selection() {
    let TellerBench {
        mut bench,
        merchant,
        regular1,
        regular2,
    } = teller_bench();
    let lobby = bench.add_location("Lobby", None).unwrap();
    let pool = bench.add_pool([merchant, regular1, regular2]).unwrap();
    let log: Log = Rc::default();

    {
        let log = log.clone();
        bench
            .add_startup_process(lobby, "Merchant", "MerchantVisit", SimTime::none(0.0), move |ctx| async move {
                let assignment = ctx
                    .acquire_from(pool, ResourceClass::new("Teller.Merchant"), 1)
                    .await?;
                log.borrow_mut()
                    .push(format!("merchant->{:?}", assignment.resource()));
                ctx.wait_for(100.0).await?;
                drop(assignment);
                Ok(())
            })
            .unwrap();
    }
    for (i, hold) in [(1, 9.0), (2, 100.0), (3, 100.0)] {
        let log = log.clone();
        bench
            .add_startup_process(
                lobby,
                "Regular",
                "RegularVisit",
                SimTime::none(i as f64),
                move |ctx| async move {
                    let assignment = ctx
                        .acquire_from(pool, ResourceClass::new("Teller"), 1)
                        .await?;
                    log.borrow_mut().push(format!(
                        "reg{i}@{}->{:?}",
                        ctx.now().value(),
                        assignment.resource()
                    ));
                    ctx.wait_for(hold).await?;
                    drop(assignment);
                    Ok(())
                },
            )
            .unwrap();
    }

    let mut simu = bench.init(1).unwrap();
    simu.run_until(SimTime::none(5.0)).unwrap();
    assert_eq!(
        log.borrow().as_slice(),
        [
            format!("merchant->{:?}", Some(merchant)),
            format!("reg1@1->{:?}", Some(regular1)),
            format!("reg2@2->{:?}", Some(regular2)),
        ]
    );

    // reg1 releases at t=10; reg3 inherits the freed regular teller.
    simu.run_until(SimTime::none(11.0)).unwrap();
    assert_eq!(
        log.borrow().last().unwrap(),
        &format!("reg3@10->{:?}", Some(regular1))
    );
}

/// A multi-unit class request gathers units across pool members.
#[test]
fn multi_unit_requests_span_resources() {
    let TellerBench {
        mut bench,
        merchant: _,
        regular1,
        regular2,
    } = teller_bench();
    let lobby = bench.add_location("Lobby", None).unwrap();
    let pool = bench.add_pool([regular1, regular2]).unwrap();
    let log: Log = Rc::default();
    {
        let log = log.clone();
        bench
            .add_startup_process(lobby, "Audit", "AuditVisit", SimTime::none(0.0), move |ctx| async move {
                let assignment = ctx
                    .acquire_from(pool, ResourceClass::new("Teller.Regular"), 2)
                    .await?;
                log.borrow_mut()
                    .push(format!("units={} spread={}", assignment.units(), assignment.resources().len()));
                drop(assignment);
                Ok(())
            })
            .unwrap();
    }
    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();
    assert_eq!(log.borrow().as_slice(), ["units=2 spread=2".to_string()]);
}

/// Requests for a class the pool does not manage are rejected at the call
/// site.
#[test]
fn unknown_class_is_invalid() {
    let TellerBench {
        mut bench,
        merchant,
        regular1,
        regular2: _,
    } = teller_bench();
    let lobby = bench.add_location("Lobby", None).unwrap();
    let pool = bench.add_pool([merchant, regular1]).unwrap();
    let log: Log = Rc::default();
    {
        let log = log.clone();
        bench
            .add_startup_process(lobby, "Lost", "LostVisit", SimTime::none(0.0), move |ctx| async move {
                match ctx.acquire_from(pool, ResourceClass::new("Clerk"), 1).await {
                    Err(SimError::InvalidRequest(_)) => log.borrow_mut().push("rejected".into()),
                    other => log.borrow_mut().push(format!("unexpected: {other:?}")),
                }
                Ok(())
            })
            .unwrap();
    }
    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();
    assert_eq!(log.borrow().as_slice(), ["rejected".to_string()]);
}

/// A stalled class request reserves its units: a later request for an
/// overlapping class is not backfilled, while a disjoint one goes through.
#[test]
fn stalled_requests_reserve_their_class() {
    let TellerBench {
        mut bench,
        merchant,
        regular1,
        regular2,
    } = teller_bench();
    let lobby = bench.add_location("Lobby", None).unwrap();
    let pool = bench.add_pool([merchant, regular1, regular2]).unwrap();
    let log: Log = Rc::default();

    // Occupies one regular teller until t=50.
    bench
        .add_startup_process(lobby, "Regular", "Occupy", SimTime::none(0.0), move |ctx| async move {
            let assignment = ctx
                .acquire_from(pool, ResourceClass::new("Teller.Regular"), 1)
                .await?;
            ctx.wait_for(50.0).await?;
            drop(assignment);
            Ok(())
        })
        .unwrap();
    // Needs both regular tellers; stalls with one occupied.
    {
        let log = log.clone();
        bench
            .add_startup_process(lobby, "Audit", "AuditVisit", SimTime::none(1.0), move |ctx| async move {
                let assignment = ctx
                    .acquire_from_with(pool, ResourceClass::new("Teller.Regular"), 2, 0, None)
                    .await?;
                log.borrow_mut().push(format!("audit@{}", ctx.now().value()));
                drop(assignment);
                Ok(())
            })
            .unwrap();
    }
    // Would fit on the free regular teller, but that unit is reserved for
    // the audit.
    {
        let log = log.clone();
        bench
            .add_startup_process(lobby, "Regular", "Backfill", SimTime::none(2.0), move |ctx| async move {
                let assignment = ctx
                    .acquire_from_with(pool, ResourceClass::new("Teller.Regular"), 1, 1, None)
                    .await?;
                log.borrow_mut().push(format!("backfill@{}", ctx.now().value()));
                drop(assignment);
                Ok(())
            })
            .unwrap();
    }
    // The merchant teller does not overlap the stalled class and is handed
    // out immediately.
    {
        let log = log.clone();
        bench
            .add_startup_process(lobby, "Merchant", "MerchantVisit", SimTime::none(3.0), move |ctx| async move {
                let assignment = ctx
                    .acquire_from_with(pool, ResourceClass::new("Teller.Merchant"), 1, 2, None)
                    .await?;
                log.borrow_mut().push(format!("merchant@{}", ctx.now().value()));
                drop(assignment);
                Ok(())
            })
            .unwrap();
    }

    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();
    assert_eq!(
        log.borrow().as_slice(),
        ["merchant@3", "audit@50", "backfill@50"].map(String::from)
    );
}

/// A custom policy that keeps the merchant teller for merchant work: plain
/// `Teller` requests are only served from `Teller.Regular` members.
struct ReservedMerchantPolicy;

impl AssignmentPolicy for ReservedMerchantPolicy {
    fn process_queued_requests(&mut self, pool: &mut PoolApi<'_>, through: Option<MessageId>) {
        for req in pool.queued_requests() {
            let candidates = match &req.request.selector {
                ResourceSelector::Class(c) if c.path() == "Teller" => {
                    pool.resources(Some(&ResourceClass::new("Teller.Regular")))
                }
                selector => pool.eligible_resources(selector),
            };
            // Keep going on failure: this policy has no reservation needs.
            let _ = pool.try_assign_from(&req, &candidates);
            if Some(req.id) == through {
                return;
            }
        }
    }
}

#[test]
fn custom_policy_reserves_the_merchant_teller() {
    let TellerBench {
        mut bench,
        merchant,
        regular1,
        regular2: _,
    } = teller_bench();
    let lobby = bench.add_location("Lobby", None).unwrap();
    let pool = bench
        .add_pool_with_policy([merchant, regular1], ReservedMerchantPolicy)
        .unwrap();
    let log: Log = Rc::default();

    // Occupies the only regular teller.
    bench
        .add_startup_process(lobby, "Regular", "Occupy", SimTime::none(0.0), move |ctx| async move {
            let assignment = ctx
                .acquire_from(pool, ResourceClass::new("Teller.Regular"), 1)
                .await?;
            ctx.wait_for(20.0).await?;
            drop(assignment);
            Ok(())
        })
        .unwrap();
    // A generic teller request: the merchant teller is free but reserved,
    // so this waits for the regular teller.
    {
        let log = log.clone();
        bench
            .add_startup_process(lobby, "Regular", "Generic", SimTime::none(1.0), move |ctx| async move {
                let assignment = ctx.acquire_from(pool, ResourceClass::new("Teller"), 1).await?;
                log.borrow_mut().push(format!(
                    "generic@{}->{:?}",
                    ctx.now().value(),
                    assignment.resource()
                ));
                drop(assignment);
                Ok(())
            })
            .unwrap();
    }

    let mut simu = bench.init(1).unwrap();
    simu.run().unwrap();
    assert_eq!(
        log.borrow().as_slice(),
        [format!("generic@20->{:?}", Some(regular1))]
    );
}
