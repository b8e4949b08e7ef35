//! End-to-end purchase flows against the in-memory store.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use turnstile_core::{BlockLabel, CustomerId, EventSku, InventoryError, KeySpace, OrderId, PurchaseState, RetryPolicy, Tier};
use turnstile_inventory::setup::{self, TierSpec};
use turnstile_inventory::HoldManager;
use turnstile_store::app_config::BusinessRules;
use turnstile_store::{Batch, ManualClock, MemoryStore, Store};
use turnstile_order::{
    AuthDecision, Authorizer, AuthorizeOutcome, CompleteOutcome, FailReason, PurchaseRequest, PurchaseWorkflow,
};

const EVENT: &str = "123-ABC";

struct CountingAuthorizer {
    decision: AuthDecision,
    calls: AtomicUsize,
}

impl CountingAuthorizer {
    fn new(decision: AuthDecision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authorizer for CountingAuthorizer {
    async fn authorize(&self, _customer: &CustomerId, _amount: i64) -> AuthDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.decision
    }
}

struct Env {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    keys: KeySpace,
    workflow: PurchaseWorkflow,
    authorizer: Arc<CountingAuthorizer>,
}

async fn env_with(decision: AuthDecision, rules: BusinessRules) -> Env {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let keys = KeySpace::default();
    setup::create_event(
        store.as_ref(),
        &keys,
        &EventSku::new(EVENT),
        "Womens Judo Final",
        &[TierSpec::new("General", 10, 2_500)],
    )
    .await
    .unwrap();
    setup::create_seat_map(store.as_ref(), &keys, &EventSku::new(EVENT), &general(), 1, 10)
        .await
        .unwrap();

    let authorizer = CountingAuthorizer::new(decision);
    let workflow = PurchaseWorkflow::new(
        store.clone(),
        keys.clone(),
        clock.clone(),
        authorizer.clone(),
        &rules,
        RetryPolicy::immediate(20),
    );
    Env {
        store,
        clock,
        keys,
        workflow,
        authorizer,
    }
}

async fn env(decision: AuthDecision) -> Env {
    env_with(decision, BusinessRules::default()).await
}

fn general() -> Tier {
    Tier::new("General")
}

fn request(order: &str, qty: u32) -> PurchaseRequest {
    PurchaseRequest::new(EVENT.into(), general(), "bill".into(), qty).with_order(order.into())
}

async fn counters(env: &Env) -> (u32, u32, u32) {
    let snapshot = env.workflow.holds().verify(&EVENT.into(), &general()).await.unwrap();
    (snapshot.available, snapshot.held, snapshot.sold().unwrap())
}

async fn state(env: &Env, order: &str) -> PurchaseState {
    env.workflow.purchase(&order.into()).await.unwrap().unwrap().state
}

#[tokio::test]
async fn test_reserve_authorize_complete() {
    let env = env(AuthDecision::Approved).await;
    let mut events = env.workflow.subscribe();

    let reserved = env.workflow.reserve(&request("HAPPY1", 2)).await.unwrap();
    assert_eq!(reserved.cost, 5_000);
    assert_eq!(counters(&env).await, (8, 2, 0));

    let outcome = env.workflow.authorize(&"HAPPY1".into()).await.unwrap();
    assert!(matches!(outcome, AuthorizeOutcome::Authorized(ref p) if p.state == PurchaseState::Authorize));

    let outcome = env.workflow.complete(&"HAPPY1".into()).await.unwrap();
    let CompleteOutcome::Completed(completed) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(completed.state, PurchaseState::Complete);
    assert_eq!(state(&env, "HAPPY1").await, PurchaseState::Complete);
    assert_eq!(counters(&env).await, (8, 0, 2));

    let event = events.recv().await.unwrap();
    assert_eq!(event.order_id, OrderId::new("HAPPY1"));
    assert_eq!(event.state, PurchaseState::Complete);
    assert!(event.reason.is_none());
}

#[tokio::test]
async fn test_complete_straight_from_reserve_is_refused() {
    let env = env(AuthDecision::Approved).await;
    env.workflow.reserve(&request("EARLY1", 3)).await.unwrap();

    let err = env.workflow.complete(&"EARLY1".into()).await.unwrap_err();
    assert!(matches!(
        err,
        InventoryError::StateGuardFailed { actual: PurchaseState::Reserve, .. }
    ));
    assert_eq!(state(&env, "EARLY1").await, PurchaseState::Reserve);
    assert_eq!(counters(&env).await, (7, 3, 0));
}

#[tokio::test]
async fn test_decline_fails_and_releases() {
    let env = env(AuthDecision::Declined).await;
    let mut events = env.workflow.subscribe();
    env.workflow.reserve(&request("POOR01", 4)).await.unwrap();

    let outcome = env.workflow.authorize(&"POOR01".into()).await.unwrap();
    assert!(matches!(outcome, AuthorizeOutcome::Declined(ref p) if p.state == PurchaseState::Fail));
    assert_eq!(counters(&env).await, (10, 0, 0));

    let event = events.recv().await.unwrap();
    assert_eq!(event.reason, Some(FailReason::Declined));

    // terminal: nothing moves it again
    let err = env.workflow.fail(&"POOR01".into()).await.unwrap_err();
    assert!(matches!(err, InventoryError::StateGuardFailed { actual: PurchaseState::Fail, .. }));
}

#[tokio::test]
async fn test_duplicate_authorize_calls_authorizer_once() {
    let env = env(AuthDecision::Approved).await;
    env.workflow.reserve(&request("DUP001", 1)).await.unwrap();

    env.workflow.authorize(&"DUP001".into()).await.unwrap();
    let err = env.workflow.authorize(&"DUP001".into()).await.unwrap_err();
    assert!(matches!(
        err,
        InventoryError::StateGuardFailed { actual: PurchaseState::Authorize, .. }
    ));
    assert_eq!(env.authorizer.calls(), 1);
}

#[tokio::test]
async fn test_late_authorize_after_sweep_fails() {
    let rules = BusinessRules {
        hold_ttl_seconds: 1,
        ..BusinessRules::default()
    };
    let env = env_with(AuthDecision::Approved, rules).await;
    env.workflow.reserve(&request("SLOW01", 5)).await.unwrap();

    env.clock.advance(Duration::from_secs(2));
    assert_eq!(env.workflow.holds().sweep_expired(&EVENT.into()).await.unwrap(), 1);
    assert_eq!(counters(&env).await, (10, 0, 0));

    let outcome = env.workflow.authorize(&"SLOW01".into()).await.unwrap();
    assert!(matches!(
        outcome,
        AuthorizeOutcome::Expired { ref purchase, reversal_required: false } if purchase.state == PurchaseState::Fail
    ));
    assert_eq!(env.authorizer.calls(), 0);
    assert_eq!(counters(&env).await, (10, 0, 0));
}

/// Approves only after the clock has run past the hold and a sweep has
/// reclaimed it.
struct SlowAuthorizer {
    clock: Arc<ManualClock>,
    sweeper: HoldManager,
}

#[async_trait]
impl Authorizer for SlowAuthorizer {
    async fn authorize(&self, _customer: &CustomerId, _amount: i64) -> AuthDecision {
        self.clock.advance(Duration::from_secs(5));
        let reclaimed = self.sweeper.sweep_expired(&EVENT.into()).await.unwrap();
        assert_eq!(reclaimed, 1);
        AuthDecision::Approved
    }
}

#[tokio::test]
async fn test_hold_swept_during_approval_asks_for_reversal() {
    let rules = BusinessRules {
        hold_ttl_seconds: 1,
        ..BusinessRules::default()
    };
    let env = env(AuthDecision::Approved).await;
    let sweeper = HoldManager::new(
        env.store.clone(),
        env.keys.clone(),
        env.clock.clone(),
        &rules,
        RetryPolicy::immediate(20),
    );
    let authorizer = Arc::new(SlowAuthorizer {
        clock: env.clock.clone(),
        sweeper,
    });
    let workflow = PurchaseWorkflow::new(
        env.store.clone(),
        env.keys.clone(),
        env.clock.clone(),
        authorizer,
        &rules,
        RetryPolicy::immediate(20),
    );
    workflow.reserve(&request("SLOW02", 3)).await.unwrap();

    let outcome = workflow.authorize(&"SLOW02".into()).await.unwrap();
    assert!(matches!(
        outcome,
        AuthorizeOutcome::Expired { ref purchase, reversal_required: true } if purchase.state == PurchaseState::Fail
    ));
    assert_eq!(counters(&env).await, (10, 0, 0));
    assert_eq!(state(&env, "SLOW02").await, PurchaseState::Fail);
}

#[tokio::test]
async fn test_authorize_extends_the_hold() {
    let rules = BusinessRules {
        hold_ttl_seconds: 1,
        authorize_extension_seconds: 30,
        ..BusinessRules::default()
    };
    let env = env_with(AuthDecision::Approved, rules).await;
    env.workflow.reserve(&request("EXT001", 2)).await.unwrap();
    env.workflow.authorize(&"EXT001".into()).await.unwrap();

    env.clock.advance(Duration::from_secs(5));
    assert_eq!(env.workflow.holds().sweep_expired(&EVENT.into()).await.unwrap(), 0);
    assert!(matches!(
        env.workflow.complete(&"EXT001".into()).await.unwrap(),
        CompleteOutcome::Completed(_)
    ));
}

#[tokio::test]
async fn test_expired_after_authorize_needs_reversal() {
    let rules = BusinessRules {
        authorize_extension_seconds: 1,
        ..BusinessRules::default()
    };
    let env = env_with(AuthDecision::Approved, rules).await;
    env.workflow.reserve(&request("LATE01", 2)).await.unwrap();
    env.workflow.authorize(&"LATE01".into()).await.unwrap();

    env.clock.advance(Duration::from_secs(3));
    env.workflow.holds().sweep_expired(&EVENT.into()).await.unwrap();

    let outcome = env.workflow.complete(&"LATE01".into()).await.unwrap();
    let CompleteOutcome::Failed {
        purchase,
        reason,
        reversal_required,
    } = outcome
    else {
        panic!("expected a failed completion");
    };
    assert_eq!(purchase.state, PurchaseState::Fail);
    assert_eq!(reason, FailReason::HoldExpired);
    assert!(reversal_required);
    assert_eq!(counters(&env).await, (10, 0, 0));
}

#[tokio::test]
async fn test_quantity_mismatch_is_a_consistency_violation() {
    let env = env(AuthDecision::Approved).await;
    env.workflow.reserve(&request("MISMAT", 2)).await.unwrap();
    env.workflow.authorize(&"MISMAT".into()).await.unwrap();

    // the purchase record now claims more than was held
    let key = env.keys.purchase(&"MISMAT".into());
    env.store
        .execute(&Batch::new().hset(key, vec![("qty".into(), "3".into())]))
        .await
        .unwrap();

    let err = env.workflow.complete(&"MISMAT".into()).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(state(&env, "MISMAT").await, PurchaseState::Fail);
    assert_eq!(counters(&env).await, (10, 0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completes_sell_once() {
    let env = env(AuthDecision::Approved).await;
    env.workflow.reserve(&request("RACE01", 3)).await.unwrap();
    env.workflow.authorize(&"RACE01".into()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let workflow = env.workflow.clone();
        handles.push(tokio::spawn(async move { workflow.complete(&"RACE01".into()).await }));
    }
    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(CompleteOutcome::Completed(_)) => completed += 1,
            Err(InventoryError::StateGuardFailed { actual, .. }) => assert_eq!(actual, PurchaseState::Complete),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(counters(&env).await, (7, 0, 3));
}

#[tokio::test]
async fn test_seated_purchase_and_cancel_frees_seats() {
    let env = env(AuthDecision::Approved).await;
    let block_key = env.keys.seat_block(&EVENT.into(), &general(), &BlockLabel::first());

    let seated = env.workflow.reserve_seats(&request("SEATS1", 4)).await.unwrap();
    let run = seated.seats.clone().unwrap();
    assert_eq!((run.block.as_str(), run.first_seat, run.last_seat), ("A", 1, 4));
    assert_eq!(env.store.get_bits(&block_key).await.unwrap(), 0b11_1111_0000);

    let stored = env.workflow.purchase(&"SEATS1".into()).await.unwrap().unwrap();
    assert_eq!(stored.seats, Some(run));

    env.workflow.fail(&"SEATS1".into()).await.unwrap();
    assert_eq!(env.store.get_bits(&block_key).await.unwrap(), 0b11_1111_1111);
    assert_eq!(counters(&env).await, (10, 0, 0));
}

#[tokio::test]
async fn test_seated_purchase_without_room_releases_hold() {
    let env = env(AuthDecision::Approved).await;
    // seat 5 is out of service, leaving runs of 4 and 5
    let block_key = env.keys.seat_block(&EVENT.into(), &general(), &BlockLabel::first());
    env.store
        .execute(&Batch::new().set_bits(&block_key, 0b11_1110_1111))
        .await
        .unwrap();

    let err = env.workflow.reserve_seats(&request("SEATS3", 6)).await.unwrap_err();
    assert!(matches!(err, InventoryError::Insufficient { requested: 6, available: 5 }));
    assert_eq!(state(&env, "SEATS3").await, PurchaseState::Fail);
    assert_eq!(counters(&env).await, (10, 0, 0));
    assert_eq!(env.store.get_bits(&block_key).await.unwrap(), 0b11_1110_1111);
}
