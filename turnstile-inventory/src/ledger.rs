use std::collections::HashMap;
use std::sync::Arc;

use turnstile_core::keys::{HoldField, REVISION_FIELD};
use turnstile_core::{
    CustomerId, EventSku, Hold, HoldId, InventoryError, InventoryResult, KeySpace, OrderId, Purchase,
    PurchaseState, Tier, TierSnapshot,
};
use turnstile_store::{Batch, BatchOutcome, Clock, Store};

/// Per-tier `available` and `held` counters of an event.
///
/// Never retries. A lost optimistic race comes back as
/// [`InventoryError::ConflictAbort`] and the caller decides what to do.
#[derive(Clone)]
pub struct InventoryLedger {
    store: Arc<dyn Store>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
}

impl InventoryLedger {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub async fn snapshot(&self, event: &EventSku, tier: &Tier) -> InventoryResult<TierSnapshot> {
        let key = self.keys.event(event);
        let map = self.store.hgetall(&key).await?;
        if map.is_empty() {
            return Err(InventoryError::NotFound(format!("event {event}")));
        }
        if !map.contains_key(&self.keys.capacity_field(tier)) {
            return Err(InventoryError::NotFound(format!("tier {tier} of event {event}")));
        }

        let counter = |field: String| -> InventoryResult<u32> {
            match map.get(&field) {
                None => Ok(0),
                Some(raw) => raw
                    .parse()
                    .map_err(|_| InventoryError::malformed(&key, format!("{field}={raw}"))),
            }
        };

        Ok(TierSnapshot {
            event: event.clone(),
            tier: tier.clone(),
            capacity: counter(self.keys.capacity_field(tier))?,
            available: counter(self.keys.available_field(tier))?,
            held: counter(self.keys.held_field(tier))?,
            price: match map.get(&self.keys.price_field(tier)) {
                None => 0,
                Some(raw) => raw
                    .parse()
                    .map_err(|_| InventoryError::malformed(&key, format!("price={raw}")))?,
            },
            revision: map.get(REVISION_FIELD).cloned(),
        })
    }

    /// Move `hold.qty` from available to held and record the hold, guarded on
    /// the event revision read here. `extend` runs in the same atomic unit.
    pub async fn check_and_reserve(&self, hold: &Hold, extend: Batch) -> InventoryResult<()> {
        if hold.qty == 0 {
            return Err(InventoryError::InvalidRequest("quantity must be at least 1".into()));
        }
        let event = &hold.id.event;
        let snapshot = self.snapshot(event, &hold.tier).await?;
        if snapshot.available < hold.qty {
            tracing::debug!(
                event = %event,
                tier = %hold.tier,
                requested = hold.qty,
                available = snapshot.available,
                "Insufficient inventory for hold"
            );
            return Err(InventoryError::Insufficient {
                requested: hold.qty,
                available: snapshot.available,
            });
        }

        let event_key = self.keys.event(event);
        let holds_key = self.keys.ticket_holds(event);
        let qty = i64::from(hold.qty);
        let batch = Batch::new()
            .field_equals(&event_key, REVISION_FIELD, snapshot.revision.clone())
            .field_absent(&holds_key, self.keys.hold_field(HoldField::Qty, &hold.id.order))
            .hincr_non_negative(&event_key, self.keys.available_field(&hold.tier), -qty)
            .hincr(&event_key, self.keys.held_field(&hold.tier), qty)
            .hincr(&event_key, REVISION_FIELD, 1)
            .hset(&holds_key, hold.to_fields(&self.keys))
            .merge(extend);

        match self.store.execute(&batch).await? {
            BatchOutcome::Applied => {
                tracing::info!(
                    event = %event,
                    tier = %hold.tier,
                    order = %hold.id.order,
                    qty = hold.qty,
                    "Hold granted"
                );
                Ok(())
            }
            BatchOutcome::GuardFailed { index: 1 } => Err(InventoryError::InvalidRequest(format!(
                "hold {} already exists",
                hold.id
            ))),
            outcome => Err(self.write_failure(&batch, outcome)),
        }
    }

    /// Read one hold's fields. `None` once the hold is committed or released.
    pub async fn load_hold(&self, id: &HoldId) -> InventoryResult<Option<Hold>> {
        let holds_key = self.keys.ticket_holds(&id.event);
        let mut fields = HashMap::new();
        for kind in HoldField::ALL {
            let field = self.keys.hold_field(kind, &id.order);
            if let Some(value) = self.store.hget(&holds_key, &field).await? {
                fields.insert(kind, value);
            } else if kind == HoldField::Qty {
                return Ok(None);
            }
        }
        Hold::from_fields(&self.keys, id.clone(), &fields)
    }

    /// Guards that the hold still exists exactly as it was read.
    pub fn hold_unchanged(&self, hold: &Hold) -> Batch {
        let holds_key = self.keys.ticket_holds(&hold.id.event);
        Batch::new()
            .field_equals(
                &holds_key,
                self.keys.hold_field(HoldField::Qty, &hold.id.order),
                Some(hold.qty.to_string()),
            )
            .field_equals(
                &holds_key,
                self.keys.hold_field(HoldField::CreatedAt, &hold.id.order),
                Some(hold.created_at.to_string()),
            )
    }

    /// held -= qty and drop the hold. `available` was already taken at reservation.
    pub fn commit_batch(&self, hold: &Hold) -> Batch {
        let event_key = self.keys.event(&hold.id.event);
        self.hold_unchanged(hold)
            .hincr_non_negative(&event_key, self.keys.held_field(&hold.tier), -i64::from(hold.qty))
            .hincr(&event_key, REVISION_FIELD, 1)
            .hdel(self.keys.ticket_holds(&hold.id.event), self.keys.hold_fields(&hold.id.order))
    }

    /// available += qty, held -= qty, drop the hold and free its seats.
    pub fn release_batch(&self, hold: &Hold) -> Batch {
        let event_key = self.keys.event(&hold.id.event);
        let qty = i64::from(hold.qty);
        let mut batch = self
            .hold_unchanged(hold)
            .hincr(&event_key, self.keys.available_field(&hold.tier), qty)
            .hincr_non_negative(&event_key, self.keys.held_field(&hold.tier), -qty)
            .hincr(&event_key, REVISION_FIELD, 1)
            .hdel(self.keys.ticket_holds(&hold.id.event), self.keys.hold_fields(&hold.id.order));
        if let Some(seats) = &hold.seats {
            batch = batch.or_bits(
                self.keys.seat_block(&hold.id.event, &hold.tier, &seats.block),
                seats.mask(),
            );
        }
        batch
    }

    /// Returns the committed hold, or `None` if it no longer exists.
    pub async fn commit_hold(&self, id: &HoldId) -> InventoryResult<Option<Hold>> {
        let Some(hold) = self.load_hold(id).await? else {
            tracing::debug!(hold = %id, "Commit of absent hold skipped");
            return Ok(None);
        };
        self.apply(&self.commit_batch(&hold)).await?;
        tracing::info!(hold = %id, tier = %hold.tier, qty = hold.qty, "Hold committed");
        Ok(Some(hold))
    }

    /// Returns the released hold, or `None` if it no longer exists.
    pub async fn release_hold(&self, id: &HoldId) -> InventoryResult<Option<Hold>> {
        let Some(hold) = self.load_hold(id).await? else {
            tracing::debug!(hold = %id, "Release of absent hold skipped");
            return Ok(None);
        };
        self.apply(&self.release_batch(&hold)).await?;
        tracing::info!(hold = %id, tier = %hold.tier, qty = hold.qty, "Hold released");
        Ok(Some(hold))
    }

    /// Buy `qty` tickets outright: take them from `available` and write a
    /// COMPLETE purchase in one guarded step, with no hold in between.
    pub async fn check_and_purchase(
        &self,
        event: &EventSku,
        tier: &Tier,
        qty: u32,
        customer: &CustomerId,
        order: &OrderId,
    ) -> InventoryResult<Purchase> {
        if qty == 0 {
            return Err(InventoryError::InvalidRequest("quantity must be at least 1".into()));
        }
        let snapshot = self.snapshot(event, tier).await?;
        if snapshot.available < qty {
            return Err(InventoryError::Insufficient {
                requested: qty,
                available: snapshot.available,
            });
        }

        let purchase = Purchase {
            order_id: order.clone(),
            state: PurchaseState::Complete,
            event: event.clone(),
            customer: customer.clone(),
            tier: tier.clone(),
            qty,
            cost: snapshot.price * i64::from(qty),
            ts: self.clock.unix_seconds(),
            seats: None,
        };
        let event_key = self.keys.event(event);
        let purchase_key = self.keys.purchase(order);
        let batch = Batch::new()
            .field_equals(&event_key, REVISION_FIELD, snapshot.revision)
            .field_absent(&purchase_key, "state")
            .hincr_non_negative(&event_key, self.keys.available_field(tier), -i64::from(qty))
            .hincr(&event_key, REVISION_FIELD, 1)
            .hset(&purchase_key, purchase.to_fields(&self.keys));

        match self.store.execute(&batch).await? {
            BatchOutcome::Applied => {
                tracing::info!(event = %event, tier = %tier, order = %order, qty, "Tickets purchased");
                Ok(purchase)
            }
            BatchOutcome::GuardFailed { index: 1 } => Err(InventoryError::InvalidRequest(format!(
                "order {order} already exists"
            ))),
            outcome => Err(self.write_failure(&batch, outcome)),
        }
    }

    /// Execute a batch, mapping anything other than `Applied` to an error.
    pub async fn apply(&self, batch: &Batch) -> InventoryResult<()> {
        match self.store.execute(batch).await? {
            BatchOutcome::Applied => Ok(()),
            outcome => Err(self.write_failure(batch, outcome)),
        }
    }

    /// Guard failures are lost races; a counter going negative is never repaired.
    pub fn write_failure(&self, batch: &Batch, outcome: BatchOutcome) -> InventoryError {
        match outcome {
            BatchOutcome::NegativeCounter { key, field } => {
                tracing::error!(key = %key, field = %field, "Write would drive counter negative");
                InventoryError::ConsistencyViolation(format!("{key}/{field} would go negative"))
            }
            outcome => {
                let key = outcome
                    .failed_guard(batch)
                    .map(|guard| guard.key().to_string())
                    .unwrap_or_default();
                tracing::debug!(key = %key, "Optimistic write lost a race");
                InventoryError::ConflictAbort { key }
            }
        }
    }
}
