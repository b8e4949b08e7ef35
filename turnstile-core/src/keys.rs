use turnstile_store::app_config::KeysConfig;

use crate::ids::{BlockLabel, EventSku, OrderId, Tier};

/// Version field on every event hash; bumped by each ledger write.
pub const REVISION_FIELD: &str = "rev";

/// Builds every key and hash field name the engine touches.
///
/// Passed to each component at construction; there is no process-wide prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: Option<String>,
    separator: String,
}

impl KeySpace {
    pub fn new(prefix: Option<String>, separator: impl Into<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
            separator: separator.into(),
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    fn key(&self, parts: &[&str]) -> String {
        let body = parts.join(&self.separator);
        match &self.prefix {
            Some(prefix) => format!("{}{}{}", prefix, self.separator, body),
            None => body,
        }
    }

    /// Field names are never prefixed; they live inside an already-prefixed key.
    pub fn field(&self, parts: &[&str]) -> String {
        parts.join(&self.separator)
    }

    pub fn event(&self, event: &EventSku) -> String {
        self.key(&["event", event.as_str()])
    }

    pub fn ticket_holds(&self, event: &EventSku) -> String {
        self.key(&["ticket_hold", event.as_str()])
    }

    pub fn seat_layout(&self, event: &EventSku, tier: &Tier) -> String {
        self.key(&["seatlayout", event.as_str(), tier.as_str()])
    }

    pub fn seat_block(&self, event: &EventSku, tier: &Tier, block: &BlockLabel) -> String {
        self.key(&["seatmap", event.as_str(), tier.as_str(), block.as_str()])
    }

    pub fn seat_marker(&self, event: &EventSku, tier: &Tier, block: &BlockLabel, seat: u32) -> String {
        let seat = seat.to_string();
        self.key(&["seatres", event.as_str(), tier.as_str(), block.as_str(), &seat])
    }

    pub fn seat_commit(&self, event: &EventSku, tier: &Tier, block: &BlockLabel, order: &OrderId) -> String {
        self.key(&["seatcommit", event.as_str(), tier.as_str(), block.as_str(), order.as_str()])
    }

    pub fn purchase(&self, order: &OrderId) -> String {
        self.key(&["sales_order", order.as_str()])
    }

    pub fn capacity_field(&self, tier: &Tier) -> String {
        self.field(&["capacity", tier.as_str()])
    }

    pub fn available_field(&self, tier: &Tier) -> String {
        self.field(&["available", tier.as_str()])
    }

    pub fn held_field(&self, tier: &Tier) -> String {
        self.field(&["held", tier.as_str()])
    }

    pub fn price_field(&self, tier: &Tier) -> String {
        self.field(&["price", tier.as_str()])
    }

    pub fn hold_field(&self, kind: HoldField, order: &OrderId) -> String {
        self.field(&[kind.as_str(), order.as_str()])
    }

    /// All the per-order fields of one hold inside the event's hold hash.
    pub fn hold_fields(&self, order: &OrderId) -> Vec<String> {
        HoldField::ALL
            .iter()
            .map(|kind| self.hold_field(*kind, order))
            .collect()
    }

    /// Split a hold hash field back into its kind and order id.
    pub fn parse_hold_field(&self, field: &str) -> Option<(HoldField, OrderId)> {
        let (kind, order) = field.split_once(self.separator.as_str())?;
        let kind = HoldField::ALL.iter().find(|k| k.as_str() == kind)?;
        Some((*kind, OrderId::new(order)))
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(None, ":")
    }
}

impl From<&KeysConfig> for KeySpace {
    fn from(config: &KeysConfig) -> Self {
        Self::new(config.prefix.clone(), config.separator.clone())
    }
}

/// Per-order fields stored in an event's hold hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldField {
    Qty,
    Tier,
    CreatedAt,
    Ttl,
    Customer,
    Seats,
}

impl HoldField {
    pub const ALL: [HoldField; 6] = [
        HoldField::Qty,
        HoldField::Tier,
        HoldField::CreatedAt,
        HoldField::Ttl,
        HoldField::Customer,
        HoldField::Seats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HoldField::Qty => "qty",
            HoldField::Tier => "tier",
            HoldField::CreatedAt => "ts",
            HoldField::Ttl => "ttl",
            HoldField::Customer => "customer",
            HoldField::Seats => "seats",
        }
    }
}
