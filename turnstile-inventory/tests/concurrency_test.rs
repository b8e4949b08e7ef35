//! Contention scenarios for the ledger, holds and seat allocator, run
//! against the in-memory store on a multi-threaded runtime.

use std::sync::Arc;
use std::time::Duration;

use turnstile_core::models::run_mask;
use turnstile_core::{
    retry_on_conflict, BlockLabel, EventSku, InventoryError, KeySpace, OrderId, RetryPolicy, Tier,
};
use turnstile_inventory::setup::{self, TierSpec};
use turnstile_inventory::{HoldManager, HoldRequest, SeatAllocator, SeatReservation};
use turnstile_store::app_config::BusinessRules;
use turnstile_store::{Clock, ManualClock, MemoryStore, Store};

const EVENT: &str = "123-ABC";

struct Env {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    keys: KeySpace,
    holds: HoldManager,
    seats: SeatAllocator,
}

async fn env(capacity: u32) -> Env {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let keys = KeySpace::default();
    let rules = BusinessRules::default();
    setup::create_event(
        store.as_ref(),
        &keys,
        &EventSku::new(EVENT),
        "Womens Judo Final",
        &[TierSpec::new("General", capacity, 2_500)],
    )
    .await
    .unwrap();

    let holds = HoldManager::new(
        store.clone(),
        keys.clone(),
        clock.clone(),
        &rules,
        RetryPolicy::immediate(50),
    );
    let seats = SeatAllocator::new(store.clone(), keys.clone(), &rules);
    Env {
        store,
        clock,
        keys,
        holds,
        seats,
    }
}

fn general() -> Tier {
    Tier::new("General")
}

fn request(order: &str, qty: u32) -> HoldRequest {
    HoldRequest::new(EVENT.into(), general(), format!("cust-{order}").as_str().into(), order.into(), qty)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_buyers_of_six_against_ten() {
    let env = env(10).await;
    let policy = RetryPolicy::immediate(50);

    let mut handles = Vec::new();
    for order in ["BUYER1", "BUYER2"] {
        let holds = env.holds.clone();
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            let request = request(order, 6);
            retry_on_conflict(&policy, || holds.create_hold(&request)).await
        }));
    }

    let mut granted = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(InventoryError::Insufficient { requested, available }) => {
                assert_eq!((requested, available), (6, 4));
                refused += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((granted, refused), (1, 1));

    let snapshot = env.holds.verify(&EVENT.into(), &general()).await.unwrap();
    assert_eq!((snapshot.available, snapshot.held), (4, 6));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_never_oversells_under_many_buyers() {
    let env = env(10).await;
    let policy = RetryPolicy::immediate(50);

    let mut handles = Vec::new();
    for i in 0..25 {
        let holds = env.holds.clone();
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            let request = request(&format!("O{i:02}"), 1);
            retry_on_conflict(&policy, || holds.create_hold(&request)).await
        }));
    }

    let mut granted = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(hold) => granted.push(hold),
            Err(err) => assert!(matches!(err, InventoryError::Insufficient { .. }), "{err}"),
        }
    }
    assert_eq!(granted.len(), 10);

    // half the winners pay, half walk away
    for (i, hold) in granted.iter().enumerate() {
        if i % 2 == 0 {
            env.holds.commit(&hold.id).await.unwrap();
        } else {
            env.holds.release(&hold.id).await.unwrap();
        }
    }
    let snapshot = env.holds.verify(&EVENT.into(), &general()).await.unwrap();
    assert_eq!(snapshot.available, 5);
    assert_eq!(snapshot.held, 0);
    assert_eq!(snapshot.sold().unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_seat_has_exactly_one_winner() {
    let env = env(10).await;
    setup::create_seat_map(env.store.as_ref(), &env.keys, &EVENT.into(), &general(), 1, 10)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for order in ["SEAT01", "SEAT02", "SEAT03"] {
        let seats = env.seats.clone();
        handles.push(tokio::spawn(async move {
            seats
                .reserve(&EVENT.into(), &general(), &OrderId::new(order), &BlockLabel::first(), 3, 5)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            SeatReservation::Reserved(run) => {
                assert_eq!((run.first_seat, run.last_seat), (3, 5));
                winners += 1;
            }
            SeatReservation::SeatTaken { seat } => assert!((3..=5).contains(&seat)),
        }
    }
    assert_eq!(winners, 1);

    let block_key = env.keys.seat_block(&EVENT.into(), &general(), &BlockLabel::first());
    assert_eq!(env.store.get_bits(&block_key).await.unwrap(), run_mask(1, 10) & !run_mask(3, 3));
}

#[tokio::test]
async fn test_six_then_four_in_a_block_of_ten() {
    let env = env(10).await;
    let event = EventSku::new(EVENT);
    setup::create_seat_map(env.store.as_ref(), &env.keys, &event, &general(), 1, 10)
        .await
        .unwrap();

    let runs = env.seats.find_runs(&event, &general(), 6).await.unwrap();
    let first = runs.first().unwrap().clone();
    assert_eq!((first.first_seat, first.last_seat), (1, 6));

    let reserved = env
        .seats
        .reserve(&event, &general(), &"ORDER6".into(), &first.block, 1, 6)
        .await
        .unwrap();
    assert_eq!(reserved, SeatReservation::Reserved(first));

    let block_key = env.keys.seat_block(&event, &general(), &BlockLabel::first());
    assert_eq!(env.store.get_bits(&block_key).await.unwrap() & run_mask(1, 6), 0);

    assert!(env.seats.find_runs(&event, &general(), 6).await.unwrap().is_empty());
    let runs = env.seats.find_runs(&event, &general(), 4).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!((runs[0].first_seat, runs[0].last_seat), (7, 10));
}

#[tokio::test]
async fn test_reserve_rejects_bad_ranges() {
    let env = env(10).await;
    let event = EventSku::new(EVENT);
    setup::create_seat_map(env.store.as_ref(), &env.keys, &event, &general(), 1, 10)
        .await
        .unwrap();
    let order = OrderId::new("BAD");

    for (first, last) in [(0, 2), (5, 4), (8, 11)] {
        let err = env
            .seats
            .reserve(&event, &general(), &order, &BlockLabel::first(), first, last)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::InvalidRequest(_)), "{first}..={last}: {err}");
    }

    let missing = BlockLabel::parse("Q").unwrap();
    let err = env.seats.reserve(&event, &general(), &order, &missing, 1, 2).await.unwrap_err();
    assert!(matches!(err, InventoryError::NotFound(_)));
}

#[tokio::test]
async fn test_allocate_moves_past_a_full_block() {
    let env = env(64).await;
    let event = EventSku::new(EVENT);
    setup::create_seat_map(env.store.as_ref(), &env.keys, &event, &general(), 2, 8)
        .await
        .unwrap();

    let first = env.seats.allocate(&event, &general(), &"BIG".into(), 6).await.unwrap();
    let second = env.seats.allocate(&event, &general(), &"BIG2".into(), 6).await.unwrap();
    let SeatReservation::Reserved(second) = second else {
        panic!("expected a reservation in block B");
    };
    assert!(matches!(first, SeatReservation::Reserved(ref run) if run.block.as_str() == "A"));
    assert_eq!(second.block.as_str(), "B");

    let err = env.seats.allocate(&event, &general(), &"BIG3".into(), 3).await.unwrap_err();
    assert!(matches!(err, InventoryError::Insufficient { requested: 3, available: 2 }));

    let map = env.seats.seat_map(&event, &general()).await.unwrap();
    assert_eq!(
        map.iter().map(|block| block.pattern()).collect::<Vec<_>>(),
        vec!["XXXXXXOO", "XXXXXXOO"]
    );
}

#[tokio::test]
async fn test_allocate_skips_a_run_lost_to_another_order() {
    let env = env(10).await;
    let event = EventSku::new(EVENT);
    setup::create_seat_map(env.store.as_ref(), &env.keys, &event, &general(), 1, 4)
        .await
        .unwrap();
    let marker = env.keys.seat_marker(&event, &general(), &BlockLabel::first(), 2);
    assert!(env.store.set_nx_ex(&marker, "OTHER", Duration::from_secs(5)).await.unwrap());

    let reserved = env.seats.allocate(&event, &general(), &"MINE".into(), 2).await.unwrap();
    let SeatReservation::Reserved(run) = reserved else {
        panic!("expected seats 3-4, got {reserved:?}");
    };
    assert_eq!((run.block.as_str(), run.first_seat, run.last_seat), ("A", 3, 4));

    let map = env.seats.seat_map(&event, &general()).await.unwrap();
    assert_eq!(map[0].pattern(), "OOXX");
}

#[tokio::test]
async fn test_allocate_reports_the_taken_seat_when_every_run_is_marked() {
    let env = env(10).await;
    let event = EventSku::new(EVENT);
    setup::create_seat_map(env.store.as_ref(), &env.keys, &event, &general(), 1, 2)
        .await
        .unwrap();
    let marker = env.keys.seat_marker(&event, &general(), &BlockLabel::first(), 2);
    assert!(env.store.set_nx_ex(&marker, "OTHER", Duration::from_secs(5)).await.unwrap());

    let outcome = env.seats.allocate(&event, &general(), &"MINE".into(), 2).await.unwrap();
    assert_eq!(outcome, SeatReservation::SeatTaken { seat: 2 });
}

#[tokio::test]
async fn test_expired_hold_is_swept_back() {
    let env = env(10).await;
    let event = EventSku::new(EVENT);
    let hold = env
        .holds
        .create_hold(&request("SLOW", 5).with_ttl(Duration::from_secs(1)))
        .await
        .unwrap();
    let before = env.holds.ledger().snapshot(&event, &general()).await.unwrap();
    assert_eq!(before.available, 5);

    env.clock.advance(Duration::from_secs(2));
    assert!(hold.is_expired(env.clock.unix_seconds()));
    assert_eq!(env.holds.sweep_expired(&event).await.unwrap(), 1);

    let after = env.holds.ledger().snapshot(&event, &general()).await.unwrap();
    assert_eq!((after.available, after.held), (10, 0));
    assert!(env.holds.get(&hold.id).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sweeps_release_once() {
    let env = env(10).await;
    let event = EventSku::new(EVENT);
    for order in ["A1", "A2", "A3"] {
        env.holds
            .create_hold(&request(order, 2).with_ttl(Duration::from_secs(1)))
            .await
            .unwrap();
    }
    env.clock.advance(Duration::from_secs(3));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let holds = env.holds.clone();
        let event = event.clone();
        handles.push(tokio::spawn(async move { holds.sweep_expired(&event).await.unwrap() }));
    }
    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 3);

    let snapshot = env.holds.verify(&event, &general()).await.unwrap();
    assert_eq!((snapshot.available, snapshot.held), (10, 0));
}
