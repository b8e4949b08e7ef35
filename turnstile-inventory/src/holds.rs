use std::sync::Arc;
use std::time::Duration;

use turnstile_core::keys::HoldField;
use turnstile_core::{
    retry_on_conflict, CustomerId, EventSku, Hold, HoldId, InventoryError, InventoryResult, KeySpace,
    OrderId, RetryPolicy, SeatRun, Tier, TierSnapshot,
};
use turnstile_store::app_config::BusinessRules;
use turnstile_store::{Batch, BatchOutcome, Clock, Store};

use crate::ledger::InventoryLedger;

/// What a buyer asks to hold.
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub event: EventSku,
    pub tier: Tier,
    pub customer: CustomerId,
    pub order: OrderId,
    pub qty: u32,
    /// Overrides the configured hold TTL.
    pub ttl: Option<Duration>,
}

impl HoldRequest {
    pub fn new(event: EventSku, tier: Tier, customer: CustomerId, order: OrderId, qty: u32) -> Self {
        Self {
            event,
            tier,
            customer,
            order,
            qty,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Grants, renews and reclaims time-bounded holds on ledger quantity.
///
/// Expiry is not enforced by a timer here; [`HoldManager::sweep_expired`]
/// finds expired holds and releases them.
#[derive(Clone)]
pub struct HoldManager {
    store: Arc<dyn Store>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    ledger: InventoryLedger,
    hold_ttl: Duration,
    page_size: usize,
    retry: RetryPolicy,
}

impl HoldManager {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        clock: Arc<dyn Clock>,
        rules: &BusinessRules,
        retry: RetryPolicy,
    ) -> Self {
        let ledger = InventoryLedger::new(store.clone(), keys.clone(), clock.clone());
        Self {
            store,
            keys,
            clock,
            ledger,
            hold_ttl: Duration::from_secs(rules.hold_ttl_seconds),
            page_size: rules.sweep_page_size.max(1),
            retry,
        }
    }

    pub fn ledger(&self) -> &InventoryLedger {
        &self.ledger
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn create_hold(&self, request: &HoldRequest) -> InventoryResult<Hold> {
        self.create_hold_with(request, Batch::new()).await
    }

    /// Grant a hold; `extend` is written in the same atomic unit. Not retried.
    pub async fn create_hold_with(&self, request: &HoldRequest, extend: Batch) -> InventoryResult<Hold> {
        let hold = Hold {
            id: HoldId::new(request.event.clone(), request.order.clone()),
            customer: request.customer.clone(),
            tier: request.tier.clone(),
            qty: request.qty,
            created_at: self.clock.unix_seconds(),
            ttl_seconds: request.ttl.unwrap_or(self.hold_ttl).as_secs(),
            seats: None,
        };
        self.ledger.check_and_reserve(&hold, extend).await?;
        Ok(hold)
    }

    pub async fn get(&self, id: &HoldId) -> InventoryResult<Option<Hold>> {
        self.ledger.load_hold(id).await
    }

    /// Restart the hold's clock with a new ttl, guarded on the hold being unchanged.
    /// Returns the renewed hold and the batch that renews it.
    pub fn renew_batch(&self, hold: &Hold, ttl: Duration) -> (Hold, Batch) {
        let renewed = Hold {
            created_at: self.clock.unix_seconds(),
            ttl_seconds: ttl.as_secs(),
            ..hold.clone()
        };
        let order = &hold.id.order;
        let batch = self.ledger.hold_unchanged(hold).hset(
            self.keys.ticket_holds(&hold.id.event),
            vec![
                (
                    self.keys.hold_field(HoldField::CreatedAt, order),
                    renewed.created_at.to_string(),
                ),
                (
                    self.keys.hold_field(HoldField::Ttl, order),
                    renewed.ttl_seconds.to_string(),
                ),
            ],
        );
        (renewed, batch)
    }

    /// `None` if the hold is already gone.
    pub async fn renew(&self, id: &HoldId, ttl: Duration) -> InventoryResult<Option<Hold>> {
        let Some(hold) = self.get(id).await? else {
            return Ok(None);
        };
        let (renewed, batch) = self.renew_batch(&hold, ttl);
        self.ledger.apply(&batch).await?;
        tracing::debug!(hold = %id, ttl_seconds = renewed.ttl_seconds, "Hold renewed");
        Ok(Some(renewed))
    }

    /// Record the seats reserved for a hold so releasing it frees them again.
    pub fn attach_seats_batch(&self, hold: &Hold, seats: &SeatRun) -> (Hold, Batch) {
        let seated = Hold {
            seats: Some(seats.clone()),
            ..hold.clone()
        };
        let fields: Vec<(String, String)> = seated
            .to_fields(&self.keys)
            .into_iter()
            .filter(|(field, _)| *field == self.keys.hold_field(HoldField::Seats, &hold.id.order))
            .collect();
        let batch = self
            .ledger
            .hold_unchanged(hold)
            .hset(self.keys.ticket_holds(&hold.id.event), fields);
        (seated, batch)
    }

    pub async fn commit(&self, id: &HoldId) -> InventoryResult<Option<Hold>> {
        self.ledger.commit_hold(id).await
    }

    pub async fn release(&self, id: &HoldId) -> InventoryResult<Option<Hold>> {
        self.ledger.release_hold(id).await
    }

    /// Every outstanding hold of an event, read one page at a time.
    pub async fn scan_holds(&self, event: &EventSku) -> InventoryResult<Vec<Hold>> {
        let mut holds = Vec::new();
        for order in self.scan_orders(event).await? {
            if let Some(hold) = self.get(&HoldId::new(event.clone(), order)).await? {
                holds.push(hold);
            }
        }
        Ok(holds)
    }

    /// Order ids with a hold on `event`. The whole scan finishes before any
    /// hold is touched so releases can't shift the cursor under it.
    async fn scan_orders(&self, event: &EventSku) -> InventoryResult<Vec<OrderId>> {
        let mut orders = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, page) = self.scan_page(event, cursor).await?;
            orders.extend(page);
            if next == 0 {
                return Ok(orders);
            }
            cursor = next;
        }
    }

    async fn scan_page(&self, event: &EventSku, cursor: u64) -> InventoryResult<(u64, Vec<OrderId>)> {
        let pattern = format!("{}{}*", HoldField::Qty.as_str(), self.keys.separator());
        let page = self
            .store
            .hscan(&self.keys.ticket_holds(event), cursor, &pattern, self.page_size)
            .await?;
        let orders = page
            .entries
            .iter()
            .filter_map(|(field, _)| match self.keys.parse_hold_field(field) {
                Some((HoldField::Qty, order)) => Some(order),
                _ => None,
            })
            .collect();
        Ok((page.cursor, orders))
    }

    /// Release every hold of `event` whose ttl has run out. Safe to run
    /// concurrently with itself and with the purchase workflow: a hold that
    /// was committed, released or renewed in the meantime is skipped. A hold
    /// that still conflicts after every retry is skipped too, and the sweep
    /// moves on to the rest.
    pub async fn sweep_expired(&self, event: &EventSku) -> InventoryResult<usize> {
        let mut reclaimed = 0;
        for order in self.scan_orders(event).await? {
            let id = HoldId::new(event.clone(), order);
            match retry_on_conflict(&self.retry, || self.release_if_expired(&id)).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(err @ InventoryError::RetriesExhausted { .. }) => {
                    tracing::warn!(hold = %id, error = %err, "Expired hold kept losing races, left for the next sweep");
                }
                Err(err) => return Err(err),
            }
        }
        if reclaimed > 0 {
            tracing::info!(event = %event, reclaimed, "Expired holds reclaimed");
        }
        Ok(reclaimed)
    }

    async fn release_if_expired(&self, id: &HoldId) -> InventoryResult<bool> {
        let Some(hold) = self.get(id).await? else {
            return Ok(false);
        };
        let now = self.clock.unix_seconds();
        if !hold.is_expired(now) {
            return Ok(false);
        }
        let batch = self.ledger.release_batch(&hold);
        match self.store.execute(&batch).await? {
            BatchOutcome::Applied => {
                tracing::info!(
                    hold = %id,
                    tier = %hold.tier,
                    qty = hold.qty,
                    expired_at = hold.expires_at(),
                    "Expired hold released"
                );
                Ok(true)
            }
            outcome => Err(self.ledger.write_failure(&batch, outcome)),
        }
    }

    /// Sum of qty over all outstanding holds of one tier.
    pub async fn held_quantity(&self, event: &EventSku, tier: &Tier) -> InventoryResult<u64> {
        Ok(self
            .scan_holds(event)
            .await?
            .iter()
            .filter(|hold| hold.tier == *tier)
            .map(|hold| u64::from(hold.qty))
            .sum())
    }

    /// Check `held` against the holds actually outstanding and
    /// `available + held <= capacity`. Meant for quiet periods; concurrent
    /// writers can make a correct ledger look inconsistent.
    pub async fn verify(&self, event: &EventSku, tier: &Tier) -> InventoryResult<TierSnapshot> {
        let snapshot = self.ledger.snapshot(event, tier).await?;
        snapshot.sold()?;
        let outstanding = self.held_quantity(event, tier).await?;
        if outstanding != u64::from(snapshot.held) {
            tracing::error!(
                event = %event,
                tier = %tier,
                held = snapshot.held,
                outstanding,
                "Held counter disagrees with outstanding holds"
            );
            return Err(InventoryError::ConsistencyViolation(format!(
                "{event}/{tier}: held counter {} but holds total {outstanding}",
                snapshot.held
            )));
        }
        Ok(snapshot)
    }
}
