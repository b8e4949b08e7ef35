use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use turnstile_core::{
    retry_on_conflict, CustomerId, EventSku, HoldId, InventoryError, InventoryResult, KeySpace, OrderId,
    Purchase, PurchaseState, RetryPolicy, SeatRun, Tier,
};
use turnstile_inventory::{AllocationStrategy, HoldManager, HoldRequest, SeatAllocator, SeatReservation};
use turnstile_store::app_config::BusinessRules;
use turnstile_store::{Batch, Clock, Store};

use crate::events::{FailReason, PurchaseEvent};
use crate::payment::{AuthDecision, Authorizer};

const EVENT_CHANNEL_CAPACITY: usize = 100;
const STATE_FIELD: &str = "state";

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub event: EventSku,
    pub tier: Tier,
    pub customer: CustomerId,
    pub qty: u32,
    /// Generated when absent.
    pub order: Option<OrderId>,
}

impl PurchaseRequest {
    pub fn new(event: EventSku, tier: Tier, customer: CustomerId, qty: u32) -> Self {
        Self {
            event,
            tier,
            customer,
            qty,
            order: None,
        }
    }

    pub fn with_order(mut self, order: OrderId) -> Self {
        self.order = Some(order);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    Authorized(Purchase),
    Declined(Purchase),
    /// The hold was gone before authorization landed; the purchase is FAIL.
    /// `reversal_required` means the authorizer had already approved the
    /// payment and the caller must reverse it.
    Expired {
        purchase: Purchase,
        reversal_required: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed(Purchase),
    /// The sale did not happen. `reversal_required` means payment was
    /// already authorized and must be reversed by the caller.
    Failed {
        purchase: Purchase,
        reason: FailReason,
        reversal_required: bool,
    },
}

enum CompleteStep {
    Done(Purchase),
    HoldMissing,
    Mismatch { hold_qty: u32, purchase_qty: u32 },
}

/// Drives a purchase through RESERVE -> AUTHORIZE -> COMPLETE, or to FAIL.
///
/// Every step re-reads the purchase and its hold and writes with one
/// guarded batch, so a stale or duplicate call hits a state guard instead
/// of double-applying.
#[derive(Clone)]
pub struct PurchaseWorkflow {
    store: Arc<dyn Store>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    holds: HoldManager,
    seats: SeatAllocator,
    authorizer: Arc<dyn Authorizer>,
    authorize_extension: Duration,
    retry: RetryPolicy,
    events: broadcast::Sender<PurchaseEvent>,
}

impl PurchaseWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        clock: Arc<dyn Clock>,
        authorizer: Arc<dyn Authorizer>,
        rules: &BusinessRules,
        retry: RetryPolicy,
    ) -> Self {
        let holds = HoldManager::new(store.clone(), keys.clone(), clock.clone(), rules, retry.clone());
        let seats = SeatAllocator::new(store.clone(), keys.clone(), rules);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            keys,
            clock,
            holds,
            seats,
            authorizer,
            authorize_extension: Duration::from_secs(rules.authorize_extension_seconds),
            retry,
            events,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AllocationStrategy>) -> Self {
        self.seats = self.seats.with_strategy(strategy);
        self
    }

    pub fn holds(&self) -> &HoldManager {
        &self.holds
    }

    pub fn seats(&self) -> &SeatAllocator {
        &self.seats
    }

    /// Terminal transitions (COMPLETE and FAIL) from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PurchaseEvent> {
        self.events.subscribe()
    }

    pub async fn purchase(&self, order: &OrderId) -> InventoryResult<Option<Purchase>> {
        let map = self.store.hgetall(&self.keys.purchase(order)).await?;
        Purchase::from_hash(&self.keys, &map)
    }

    async fn require(&self, order: &OrderId) -> InventoryResult<Purchase> {
        self.purchase(order)
            .await?
            .ok_or_else(|| InventoryError::NotFound(format!("order {order}")))
    }

    /// Hold the tickets and create the purchase in RESERVE, in one atomic write.
    /// Nothing is created when there is not enough availability.
    pub async fn reserve(&self, request: &PurchaseRequest) -> InventoryResult<Purchase> {
        let order = request.order.clone().unwrap_or_else(OrderId::generate);
        let order = &order;
        let purchase = retry_on_conflict(&self.retry, || async move {
            if let Some(existing) = self.purchase(order).await? {
                return Err(InventoryError::StateGuardFailed {
                    order: order.to_string(),
                    expected: "no purchase".into(),
                    actual: existing.state,
                });
            }
            let snapshot = self.holds.ledger().snapshot(&request.event, &request.tier).await?;
            let purchase = Purchase {
                order_id: order.clone(),
                state: PurchaseState::Reserve,
                event: request.event.clone(),
                customer: request.customer.clone(),
                tier: request.tier.clone(),
                qty: request.qty,
                cost: snapshot.price * i64::from(request.qty),
                ts: self.clock.unix_seconds(),
                seats: None,
            };
            let key = self.keys.purchase(order);
            let extend = Batch::new()
                .field_absent(&key, STATE_FIELD)
                .hset(&key, purchase.to_fields(&self.keys));
            let hold = HoldRequest::new(
                request.event.clone(),
                request.tier.clone(),
                request.customer.clone(),
                order.clone(),
                request.qty,
            );
            self.holds.create_hold_with(&hold, extend).await?;
            Ok(purchase)
        })
        .await?;

        tracing::info!(
            order = %order,
            event = %purchase.event,
            tier = %purchase.tier,
            qty = purchase.qty,
            cost = purchase.cost,
            "Purchase reserved"
        );
        Ok(purchase)
    }

    /// Reserve, then pick and take `qty` contiguous seats for the order.
    /// If no seats can be had the hold is released and the purchase fails.
    pub async fn reserve_seats(&self, request: &PurchaseRequest) -> InventoryResult<Purchase> {
        let purchase = self.reserve(request).await?;
        let order = &purchase.order_id;

        let run = match self
            .seats
            .allocate(&purchase.event, &purchase.tier, order, purchase.qty)
            .await
        {
            Ok(SeatReservation::Reserved(run)) => run,
            Ok(SeatReservation::SeatTaken { seat }) => {
                self.fail_with(order, None, FailReason::SeatsUnavailable).await?;
                return Err(InventoryError::SeatTaken { seat });
            }
            Err(err) => {
                self.fail_with(order, None, FailReason::SeatsUnavailable).await?;
                return Err(err);
            }
        };

        match self.attach_seats(&purchase, &run).await {
            Ok(seated) => Ok(seated),
            Err(err) => {
                tracing::warn!(order = %order, block = %run.block, error = %err, "Could not record seats, freeing them");
                let block_key = self.keys.seat_block(&purchase.event, &purchase.tier, &run.block);
                self.holds
                    .ledger()
                    .apply(&Batch::new().or_bits(block_key, run.mask()))
                    .await?;
                self.fail_with(order, None, FailReason::SeatsUnavailable).await?;
                Err(err)
            }
        }
    }

    async fn attach_seats(&self, purchase: &Purchase, run: &SeatRun) -> InventoryResult<Purchase> {
        let id = hold_id(purchase);
        let hold = self
            .holds
            .get(&id)
            .await?
            .ok_or_else(|| InventoryError::NotFound(format!("hold {id}")))?;
        let (_, batch) = self.holds.attach_seats_batch(&hold, run);

        let seated = Purchase {
            seats: Some(run.clone()),
            ..purchase.clone()
        };
        let key = self.keys.purchase(&purchase.order_id);
        let fields = seated
            .to_fields(&self.keys)
            .into_iter()
            .filter(|(field, _)| field == "seats")
            .collect();
        let batch = batch
            .field_equals(&key, STATE_FIELD, Some(PurchaseState::Reserve.to_string()))
            .hset(&key, fields);
        self.holds.ledger().apply(&batch).await?;
        Ok(seated)
    }

    /// Ask the authorizer once. Approval moves RESERVE -> AUTHORIZE and
    /// extends the hold; a decline moves RESERVE -> FAIL and releases it.
    pub async fn authorize(&self, order: &OrderId) -> InventoryResult<AuthorizeOutcome> {
        let purchase = self.require(order).await?;
        expect_state(&purchase, PurchaseState::Reserve)?;
        if self.holds.get(&hold_id(&purchase)).await?.is_none() {
            let failed = self
                .fail_with(order, Some(PurchaseState::Reserve), FailReason::HoldExpired)
                .await?;
            return Ok(AuthorizeOutcome::Expired {
                purchase: failed,
                reversal_required: false,
            });
        }

        let decision = self.authorizer.authorize(&purchase.customer, purchase.cost).await;
        tracing::info!(order = %order, amount = purchase.cost, ?decision, "Authorization decided");

        if decision == AuthDecision::Declined {
            let failed = self
                .fail_with(order, Some(PurchaseState::Reserve), FailReason::Declined)
                .await?;
            return Ok(AuthorizeOutcome::Declined(failed));
        }

        let authorized = retry_on_conflict(&self.retry, || async move {
            let purchase = self.require(order).await?;
            let Some(hold) = self.holds.get(&hold_id(&purchase)).await? else {
                return Ok(None);
            };
            let (authorized, batch) = self.transition(&purchase, PurchaseState::Authorize)?;
            let (_, renew) = self.holds.renew_batch(&hold, self.authorize_extension);
            self.holds.ledger().apply(&batch.merge(renew)).await?;
            Ok(Some(authorized))
        })
        .await?;

        match authorized {
            Some(authorized) => {
                tracing::info!(order = %order, "Purchase authorized");
                Ok(AuthorizeOutcome::Authorized(authorized))
            }
            None => {
                let failed = self
                    .fail_with(order, Some(PurchaseState::Reserve), FailReason::HoldExpired)
                    .await?;
                tracing::warn!(order = %order, "Hold expired during authorization, payment needs reversal");
                Ok(AuthorizeOutcome::Expired {
                    purchase: failed,
                    reversal_required: true,
                })
            }
        }
    }

    /// Commit the hold and move AUTHORIZE -> COMPLETE in one atomic write.
    ///
    /// A missing hold fails the purchase and asks for a payment reversal.
    /// A hold whose quantity disagrees with the purchase fails it too and
    /// is reported as a consistency violation.
    pub async fn complete(&self, order: &OrderId) -> InventoryResult<CompleteOutcome> {
        let step = retry_on_conflict(&self.retry, || async move {
            let purchase = self.require(order).await?;
            expect_state(&purchase, PurchaseState::Authorize)?;
            let Some(hold) = self.holds.get(&hold_id(&purchase)).await? else {
                return Ok(CompleteStep::HoldMissing);
            };
            if hold.qty != purchase.qty || hold.tier != purchase.tier {
                return Ok(CompleteStep::Mismatch {
                    hold_qty: hold.qty,
                    purchase_qty: purchase.qty,
                });
            }
            let (completed, batch) = self.transition(&purchase, PurchaseState::Complete)?;
            let batch = batch.merge(self.holds.ledger().commit_batch(&hold));
            self.holds.ledger().apply(&batch).await?;
            Ok(CompleteStep::Done(completed))
        })
        .await?;

        match step {
            CompleteStep::Done(completed) => {
                tracing::info!(order = %order, qty = completed.qty, cost = completed.cost, "Purchase completed");
                self.publish(&completed, None);
                Ok(CompleteOutcome::Completed(completed))
            }
            CompleteStep::HoldMissing => {
                let failed = self
                    .fail_with(order, Some(PurchaseState::Authorize), FailReason::HoldExpired)
                    .await?;
                tracing::warn!(order = %order, "Hold expired before completion, payment needs reversal");
                Ok(CompleteOutcome::Failed {
                    purchase: failed,
                    reason: FailReason::HoldExpired,
                    reversal_required: true,
                })
            }
            CompleteStep::Mismatch { hold_qty, purchase_qty } => {
                self.fail_with(order, Some(PurchaseState::Authorize), FailReason::QuantityMismatch)
                    .await?;
                tracing::error!(order = %order, hold_qty, purchase_qty, "Hold and purchase disagree");
                Err(InventoryError::ConsistencyViolation(format!(
                    "order {order}: hold qty {hold_qty} but purchase qty {purchase_qty}"
                )))
            }
        }
    }

    /// Move a RESERVE or AUTHORIZE purchase to FAIL, releasing its hold if it still has one.
    pub async fn fail(&self, order: &OrderId) -> InventoryResult<Purchase> {
        self.fail_with(order, None, FailReason::Cancelled).await
    }

    async fn fail_with(
        &self,
        order: &OrderId,
        from: Option<PurchaseState>,
        reason: FailReason,
    ) -> InventoryResult<Purchase> {
        let failed = retry_on_conflict(&self.retry, || async move {
            let purchase = self.require(order).await?;
            if let Some(from) = from {
                expect_state(&purchase, from)?;
            }
            let (failed, batch) = self.transition(&purchase, PurchaseState::Fail)?;
            let batch = match self.holds.get(&hold_id(&purchase)).await? {
                Some(hold) => batch.merge(self.holds.ledger().release_batch(&hold)),
                None => batch,
            };
            self.holds.ledger().apply(&batch).await?;
            Ok(failed)
        })
        .await?;

        tracing::info!(order = %order, ?reason, "Purchase failed");
        self.publish(&failed, Some(reason));
        Ok(failed)
    }

    /// Guarded state change: the write only lands if the stored state is
    /// still the one this purchase was read in.
    fn transition(&self, purchase: &Purchase, next: PurchaseState) -> InventoryResult<(Purchase, Batch)> {
        if !purchase.state.can_transition_to(next) {
            return Err(InventoryError::StateGuardFailed {
                order: purchase.order_id.to_string(),
                expected: predecessors(next).into(),
                actual: purchase.state,
            });
        }
        let updated = Purchase {
            state: next,
            ts: self.clock.unix_seconds(),
            ..purchase.clone()
        };
        let key = self.keys.purchase(&purchase.order_id);
        let batch = Batch::new()
            .field_equals(&key, STATE_FIELD, Some(purchase.state.to_string()))
            .hset(
                &key,
                vec![
                    (STATE_FIELD.to_string(), next.to_string()),
                    ("ts".to_string(), updated.ts.to_string()),
                ],
            );
        Ok((updated, batch))
    }

    fn publish(&self, purchase: &Purchase, reason: Option<FailReason>) {
        // no subscribers is fine
        let _ = self.events.send(PurchaseEvent::new(purchase.clone(), reason));
    }
}

fn hold_id(purchase: &Purchase) -> HoldId {
    HoldId::new(purchase.event.clone(), purchase.order_id.clone())
}

fn expect_state(purchase: &Purchase, expected: PurchaseState) -> InventoryResult<()> {
    if purchase.state == expected {
        return Ok(());
    }
    Err(InventoryError::StateGuardFailed {
        order: purchase.order_id.to_string(),
        expected: expected.to_string(),
        actual: purchase.state,
    })
}

fn predecessors(next: PurchaseState) -> &'static str {
    match next {
        PurchaseState::Reserve => "no purchase",
        PurchaseState::Authorize => "RESERVE",
        PurchaseState::Complete => "AUTHORIZE",
        PurchaseState::Fail => "RESERVE or AUTHORIZE",
    }
}
