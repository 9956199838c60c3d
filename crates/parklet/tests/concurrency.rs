//! Many lanes arriving and departing at once.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

use parklet::{
    AllocationEngine, Amount, ArrivalError, DepartureError, FallbackPolicy, IntegrityKey,
    RateTable, SlotClass, SlotId, SlotRegistry, TicketCodec, TicketStore,
};

const LANES: usize = 8;
const ARRIVALS_PER_LANE: usize = 50;

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn engine(standard: usize, oversized: usize) -> AllocationEngine {
    let slots = (0..standard)
        .map(|n| (SlotId::new(format!("S{n}")), SlotClass::Standard))
        .chain((0..oversized).map(|n| (SlotId::new(format!("O{n}")), SlotClass::Oversized)));
    let registry = SlotRegistry::new(slots, FallbackPolicy::NextLarger).unwrap();
    AllocationEngine::new(
        Arc::new(registry),
        Arc::new(TicketStore::new()),
        TicketCodec::new(IntegrityKey::generate().unwrap()),
        Arc::new(RateTable::uniform(Amount::new(20))),
    )
}

/// Every held slot is held by an active ticket pointing back at it, and vice versa.
fn assert_conserved(engine: &AllocationEngine) {
    let slots = engine.slots();
    let held: Vec<_> = slots
        .iter()
        .filter_map(|slot| slot.current_ticket_id.map(|ticket| (slot.id.clone(), ticket)))
        .collect();
    let active = engine.store().active();

    assert_eq!(held.len(), active.len(), "held slots vs active tickets");

    let distinct: HashSet<_> = held.iter().map(|(_, ticket)| *ticket).collect();
    assert_eq!(distinct.len(), held.len(), "one ticket per held slot");

    for ticket in &active {
        assert_eq!(
            engine.registry().current_ticket(&ticket.slot_id).unwrap(),
            Some(ticket.id),
            "active ticket {} does not hold {}",
            ticket.id,
            ticket.slot_id
        );
    }
}

#[test]
fn concurrent_arrivals_never_share_a_slot() {
    let engine = engine(20, 4);
    let issued = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for lane in 0..LANES {
            let engine = &engine;
            let issued = &issued;
            scope.spawn(move || {
                for n in 0..ARRIVALS_PER_LANE {
                    match engine.handle_arrival(&format!("lane{lane}-car{n}"), SlotClass::Standard, t0()) {
                        Ok(arrival) => issued.lock().unwrap().push(arrival),
                        Err(ArrivalError::NoSlotAvailable(_)) => {}
                        Err(other) => panic!("unexpected arrival error: {other}"),
                    }
                }
            });
        }
    });

    let issued = issued.into_inner().unwrap();
    assert_eq!(issued.len(), 24, "every slot fills, none twice");

    let slots: HashSet<_> = issued.iter().map(|a| a.slot_id.clone()).collect();
    assert_eq!(slots.len(), issued.len());
    assert_eq!(engine.summary().slots.free, 0);
    assert_conserved(&engine);
}

#[test]
fn concurrent_churn_conserves_tickets() {
    let engine = engine(6, 2);

    std::thread::scope(|scope| {
        for lane in 0..LANES {
            let engine = &engine;
            scope.spawn(move || {
                let mut parked = Vec::new();
                for n in 0..ARRIVALS_PER_LANE {
                    let now = t0() + TimeDelta::seconds(n as i64);
                    if let Ok(arrival) =
                        engine.handle_arrival(&format!("lane{lane}-car{n}"), SlotClass::Standard, now)
                    {
                        parked.push(arrival);
                    }
                    if n % 2 == 1
                        && let Some(arrival) = parked.pop()
                    {
                        engine
                            .handle_departure(&arrival.payload, now + TimeDelta::minutes(30))
                            .unwrap();
                    }
                }
            });
        }
    });

    assert_conserved(&engine);
    assert!(engine.reconcile().is_clean());
}

#[test]
fn racing_scans_of_one_ticket_close_it_once() {
    let engine = engine(1, 0);
    let arrival = engine
        .handle_arrival("car-1", SlotClass::Standard, t0())
        .unwrap();
    let outcomes = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..LANES {
            let engine = &engine;
            let payload = arrival.payload.clone();
            let outcomes = &outcomes;
            scope.spawn(move || {
                let outcome = engine.handle_departure(&payload, t0() + TimeDelta::hours(2));
                outcomes.lock().unwrap().push(outcome);
            });
        }
    });

    let outcomes = outcomes.into_inner().unwrap();
    let closed = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(closed, 1);
    assert!(outcomes.iter().all(|o| match o {
        Ok(departure) => departure.fee == Amount::new(40),
        Err(DepartureError::AlreadyClosed { .. }) => true,
        Err(_) => false,
    }));
    assert_eq!(engine.summary().revenue, Amount::new(40));
    assert_eq!(engine.summary().slots.free, 1);
}
