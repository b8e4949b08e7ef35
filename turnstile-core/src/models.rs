use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{InventoryError, InventoryResult};
use crate::ids::{BlockLabel, CustomerId, EventSku, OrderId, Tier};
use crate::keys::{HoldField, KeySpace};

/// Widest seat block a u32 bitfield can hold.
pub const MAX_BLOCK_WIDTH: u32 = 32;

/// Purchase lifecycle. Legal edges:
/// RESERVE -> AUTHORIZE, RESERVE -> FAIL, AUTHORIZE -> FAIL, AUTHORIZE -> COMPLETE.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseState {
    Reserve,
    Authorize,
    Complete,
    Fail,
}

impl PurchaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseState::Reserve => "RESERVE",
            PurchaseState::Authorize => "AUTHORIZE",
            PurchaseState::Complete => "COMPLETE",
            PurchaseState::Fail => "FAIL",
        }
    }

    pub fn can_transition_to(&self, next: PurchaseState) -> bool {
        use PurchaseState::*;
        matches!(
            (self, next),
            (Reserve, Authorize) | (Reserve, Fail) | (Authorize, Fail) | (Authorize, Complete)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PurchaseState::Complete | PurchaseState::Fail)
    }
}

impl fmt::Display for PurchaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurchaseState {
    type Err = InventoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESERVE" => Ok(PurchaseState::Reserve),
            "AUTHORIZE" => Ok(PurchaseState::Authorize),
            "COMPLETE" => Ok(PurchaseState::Complete),
            "FAIL" => Ok(PurchaseState::Fail),
            other => Err(InventoryError::ConsistencyViolation(format!(
                "unknown purchase state {other:?}"
            ))),
        }
    }
}

/// A contiguous range of seats inside one block. Seats are 1-based;
/// seat `n` is bit `n - 1` of the block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeatRun {
    pub block: BlockLabel,
    pub first_seat: u32,
    pub last_seat: u32,
}

impl SeatRun {
    pub fn new(block: BlockLabel, first_seat: u32, last_seat: u32) -> InventoryResult<Self> {
        if first_seat == 0 || last_seat < first_seat || last_seat > MAX_BLOCK_WIDTH {
            return Err(InventoryError::InvalidRequest(format!(
                "seat range {first_seat}..={last_seat} is outside 1..={MAX_BLOCK_WIDTH}"
            )));
        }
        Ok(Self {
            block,
            first_seat,
            last_seat,
        })
    }

    pub fn len(&self) -> u32 {
        self.last_seat - self.first_seat + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn seats(&self) -> std::ops::RangeInclusive<u32> {
        self.first_seat..=self.last_seat
    }

    /// Bit mask with 1s exactly at this run's seats.
    pub fn mask(&self) -> u32 {
        run_mask(self.first_seat, self.len())
    }

    fn encode(&self, separator: &str) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.block,
            self.first_seat,
            self.last_seat,
            sep = separator
        )
    }

    fn decode(raw: &str, separator: &str) -> InventoryResult<Self> {
        let parts: Vec<&str> = raw.split(separator).collect();
        let [block, first, last] = parts.as_slice() else {
            return Err(InventoryError::malformed(raw, "seat run"));
        };
        let first = first
            .parse()
            .map_err(|_| InventoryError::malformed(raw, "first seat"))?;
        let last = last
            .parse()
            .map_err(|_| InventoryError::malformed(raw, "last seat"))?;
        Self::new(BlockLabel::parse(block)?, first, last)
    }
}

/// Mask of `len` 1-bits starting at 1-based `first_seat`.
pub fn run_mask(first_seat: u32, len: u32) -> u32 {
    let ones = if len >= 32 { u32::MAX } else { (1u32 << len) - 1 };
    ones << (first_seat - 1)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoldId {
    pub event: EventSku,
    pub order: OrderId,
}

impl HoldId {
    pub fn new(event: EventSku, order: OrderId) -> Self {
        Self { event, order }
    }
}

impl fmt::Display for HoldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.event, self.order)
    }
}

/// Time-bounded claim on ledger quantity. Only exists while HELD;
/// committing or releasing deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub customer: CustomerId,
    pub tier: Tier,
    pub qty: u32,
    /// Unix seconds.
    pub created_at: i64,
    pub ttl_seconds: u64,
    pub seats: Option<SeatRun>,
}

impl Hold {
    /// Expired once strictly more than `ttl_seconds` have passed since creation.
    pub fn is_expired(&self, now: i64) -> bool {
        now.saturating_sub(self.created_at) > self.ttl()
    }

    pub fn expires_at(&self) -> i64 {
        self.created_at.saturating_add(self.ttl())
    }

    fn ttl(&self) -> i64 {
        i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX)
    }

    pub fn to_fields(&self, keys: &KeySpace) -> Vec<(String, String)> {
        let order = &self.id.order;
        let mut fields = vec![
            (keys.hold_field(HoldField::Qty, order), self.qty.to_string()),
            (keys.hold_field(HoldField::Tier, order), self.tier.to_string()),
            (keys.hold_field(HoldField::CreatedAt, order), self.created_at.to_string()),
            (keys.hold_field(HoldField::Ttl, order), self.ttl_seconds.to_string()),
            (keys.hold_field(HoldField::Customer, order), self.customer.to_string()),
        ];
        if let Some(seats) = &self.seats {
            fields.push((
                keys.hold_field(HoldField::Seats, order),
                seats.encode(keys.separator()),
            ));
        }
        fields
    }

    /// Rebuild a hold from its fields. Returns `None` if the hold has no qty,
    /// i.e. it was committed, released or never existed.
    pub fn from_fields(
        keys: &KeySpace,
        id: HoldId,
        fields: &HashMap<HoldField, String>,
    ) -> InventoryResult<Option<Self>> {
        let Some(qty) = fields.get(&HoldField::Qty) else {
            return Ok(None);
        };
        let label = id.to_string();
        let required = |kind: HoldField| {
            fields
                .get(&kind)
                .ok_or_else(|| InventoryError::malformed(&label, format!("hold missing {}", kind.as_str())))
        };

        let qty = qty
            .parse()
            .map_err(|_| InventoryError::malformed(&label, "hold qty"))?;
        let tier = Tier::new(required(HoldField::Tier)?.as_str());
        let created_at = required(HoldField::CreatedAt)?
            .parse()
            .map_err(|_| InventoryError::malformed(&label, "hold ts"))?;
        let ttl_seconds = required(HoldField::Ttl)?
            .parse()
            .map_err(|_| InventoryError::malformed(&label, "hold ttl"))?;
        let customer = CustomerId::new(required(HoldField::Customer)?.as_str());
        let seats = fields
            .get(&HoldField::Seats)
            .map(|raw| SeatRun::decode(raw, keys.separator()))
            .transpose()?;

        Ok(Some(Self {
            id,
            customer,
            tier,
            qty,
            created_at,
            ttl_seconds,
            seats,
        }))
    }
}

/// The sales order record, keyed by order id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub order_id: OrderId,
    pub state: PurchaseState,
    pub event: EventSku,
    pub customer: CustomerId,
    pub tier: Tier,
    pub qty: u32,
    /// qty * tier price, in minor currency units.
    pub cost: i64,
    /// Unix seconds of the last state change.
    pub ts: i64,
    pub seats: Option<SeatRun>,
}

impl Purchase {
    pub fn to_fields(&self, keys: &KeySpace) -> Vec<(String, String)> {
        let mut fields = vec![
            ("order_id".to_string(), self.order_id.to_string()),
            ("state".to_string(), self.state.to_string()),
            ("event_sku".to_string(), self.event.to_string()),
            ("customer".to_string(), self.customer.to_string()),
            ("tier".to_string(), self.tier.to_string()),
            ("qty".to_string(), self.qty.to_string()),
            ("cost".to_string(), self.cost.to_string()),
            ("ts".to_string(), self.ts.to_string()),
        ];
        if let Some(seats) = &self.seats {
            fields.push(("seats".to_string(), seats.encode(keys.separator())));
        }
        fields
    }

    /// `None` if the hash is empty (no such order).
    pub fn from_hash(keys: &KeySpace, map: &HashMap<String, String>) -> InventoryResult<Option<Self>> {
        if map.is_empty() {
            return Ok(None);
        }
        let label = map.get("order_id").cloned().unwrap_or_default();
        let required = |field: &str| {
            map.get(field)
                .ok_or_else(|| InventoryError::malformed(&label, format!("purchase missing {field}")))
        };

        Ok(Some(Self {
            order_id: OrderId::new(required("order_id")?.as_str()),
            state: required("state")?.parse()?,
            event: EventSku::new(required("event_sku")?.as_str()),
            customer: CustomerId::new(required("customer")?.as_str()),
            tier: Tier::new(required("tier")?.as_str()),
            qty: required("qty")?
                .parse()
                .map_err(|_| InventoryError::malformed(&label, "purchase qty"))?,
            cost: required("cost")?
                .parse()
                .map_err(|_| InventoryError::malformed(&label, "purchase cost"))?,
            ts: required("ts")?
                .parse()
                .map_err(|_| InventoryError::malformed(&label, "purchase ts"))?,
            seats: map
                .get("seats")
                .map(|raw| SeatRun::decode(raw, keys.separator()))
                .transpose()?,
        }))
    }
}

/// Counters for one tier of an event, read in a single HGETALL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSnapshot {
    pub event: EventSku,
    pub tier: Tier,
    pub capacity: u32,
    pub available: u32,
    pub held: u32,
    pub price: i64,
    /// Value of the event's revision field when read; `None` if never written.
    pub revision: Option<String>,
}

impl TierSnapshot {
    /// Tickets permanently sold: `capacity - available - held`.
    pub fn sold(&self) -> InventoryResult<u32> {
        self.capacity
            .checked_sub(self.available)
            .and_then(|rest| rest.checked_sub(self.held))
            .ok_or_else(|| {
                InventoryError::ConsistencyViolation(format!(
                    "{}/{}: available {} + held {} exceeds capacity {}",
                    self.event, self.tier, self.available, self.held, self.capacity
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purchase_transitions() {
        use PurchaseState::*;
        assert!(Reserve.can_transition_to(Authorize));
        assert!(Reserve.can_transition_to(Fail));
        assert!(Authorize.can_transition_to(Complete));
        assert!(Authorize.can_transition_to(Fail));

        assert!(!Reserve.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Fail));
        assert!(!Fail.can_transition_to(Reserve));
        assert!(!Authorize.can_transition_to(Reserve));
    }

    #[test]
    fn test_seat_run_mask() {
        let run = SeatRun::new(BlockLabel::first(), 1, 6).unwrap();
        assert_eq!(run.mask(), 0b11_1111);
        assert_eq!(run.len(), 6);

        let run = SeatRun::new(BlockLabel::first(), 7, 10).unwrap();
        assert_eq!(run.mask(), 0b11_1100_0000);

        let full = SeatRun::new(BlockLabel::first(), 1, 32).unwrap();
        assert_eq!(full.mask(), u32::MAX);

        assert!(SeatRun::new(BlockLabel::first(), 0, 3).is_err());
        assert!(SeatRun::new(BlockLabel::first(), 5, 4).is_err());
        assert!(SeatRun::new(BlockLabel::first(), 30, 33).is_err());
    }

    #[test]
    fn test_hold_expiry_is_strict() {
        let hold = Hold {
            id: HoldId::new("E".into(), "O".into()),
            customer: "bill".into(),
            tier: "General".into(),
            qty: 5,
            created_at: 1_000,
            ttl_seconds: 1,
            seats: None,
        };
        assert!(!hold.is_expired(1_001));
        assert!(hold.is_expired(1_002));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let hold = Hold {
            id: HoldId::new("E".into(), "O".into()),
            customer: "bill".into(),
            tier: "General".into(),
            qty: 1,
            created_at: 1_000,
            ttl_seconds: u64::MAX,
            seats: None,
        };
        assert!(!hold.is_expired(i64::MAX));
        assert_eq!(hold.expires_at(), i64::MAX);
    }

    #[test]
    fn test_purchase_record_fields() {
        let keys = KeySpace::default();
        let purchase = Purchase {
            order_id: "VPIR6X".into(),
            state: PurchaseState::Authorize,
            event: "123-ABC".into(),
            customer: "1357".into(),
            tier: "General".into(),
            qty: 5,
            cost: 12_500,
            ts: 1_700_000_000,
            seats: Some(SeatRun::new(BlockLabel::first(), 2, 6).unwrap()),
        };
        let map: HashMap<String, String> = purchase.to_fields(&keys).into_iter().collect();
        assert_eq!(map["state"], "AUTHORIZE");
        assert_eq!(map["seats"], "A:2:6");
        assert_eq!(Purchase::from_hash(&keys, &map).unwrap(), Some(purchase));
        assert_eq!(Purchase::from_hash(&keys, &HashMap::new()).unwrap(), None);
    }

    #[test]
    fn test_oversold_snapshot_is_a_violation() {
        let snapshot = TierSnapshot {
            event: "E".into(),
            tier: "General".into(),
            capacity: 10,
            available: 6,
            held: 5,
            price: 2_500,
            revision: None,
        };
        assert!(snapshot.sold().unwrap_err().is_fatal());
    }
}
