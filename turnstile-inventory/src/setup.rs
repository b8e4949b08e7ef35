//! Writes the records the engine later only adjusts: event counters per
//! tier and the all-free seat blocks.

use turnstile_core::keys::REVISION_FIELD;
use turnstile_core::models::{run_mask, MAX_BLOCK_WIDTH};
use turnstile_core::{BlockLabel, EventSku, InventoryError, InventoryResult, KeySpace, Tier};
use turnstile_store::{Batch, BatchOutcome, Store};

#[derive(Debug, Clone)]
pub struct TierSpec {
    pub tier: Tier,
    pub capacity: u32,
    /// Minor currency units per ticket.
    pub price: i64,
}

impl TierSpec {
    pub fn new(tier: impl Into<Tier>, capacity: u32, price: i64) -> Self {
        Self {
            tier: tier.into(),
            capacity,
            price,
        }
    }
}

/// Create an event with every tier fully available. Fails if the event exists.
pub async fn create_event(
    store: &dyn Store,
    keys: &KeySpace,
    event: &EventSku,
    name: &str,
    tiers: &[TierSpec],
) -> InventoryResult<()> {
    if tiers.is_empty() {
        return Err(InventoryError::InvalidRequest(format!("event {event} needs at least one tier")));
    }
    let mut fields = vec![
        ("name".to_string(), name.to_string()),
        (REVISION_FIELD.to_string(), "0".to_string()),
    ];
    for spec in tiers {
        fields.push((keys.capacity_field(&spec.tier), spec.capacity.to_string()));
        fields.push((keys.available_field(&spec.tier), spec.capacity.to_string()));
        fields.push((keys.held_field(&spec.tier), "0".to_string()));
        fields.push((keys.price_field(&spec.tier), spec.price.to_string()));
    }

    let key = keys.event(event);
    let batch = Batch::new().field_absent(&key, REVISION_FIELD).hset(&key, fields);
    match store.execute(&batch).await? {
        BatchOutcome::Applied => {
            tracing::info!(event = %event, tiers = tiers.len(), "Event created");
            Ok(())
        }
        _ => Err(InventoryError::InvalidRequest(format!("event {event} already exists"))),
    }
}

/// Create `blocks` seat blocks labelled A, B, ... for a tier, each with
/// `seats_per_block` free seats (at most 32). Returns the labels. Fails if
/// the tier already has a seat map.
pub async fn create_seat_map(
    store: &dyn Store,
    keys: &KeySpace,
    event: &EventSku,
    tier: &Tier,
    blocks: usize,
    seats_per_block: u32,
) -> InventoryResult<Vec<BlockLabel>> {
    let width = seats_per_block.min(MAX_BLOCK_WIDTH);
    if blocks == 0 || width == 0 {
        return Err(InventoryError::InvalidRequest(
            "seat map needs at least one block of one seat".into(),
        ));
    }

    let labels = BlockLabel::sequence(blocks);
    let layout_key = keys.seat_layout(event, tier);
    let mut batch = Batch::new().field_absent(&layout_key, BlockLabel::first().as_str()).hset(
        &layout_key,
        labels
            .iter()
            .map(|label| (label.to_string(), width.to_string()))
            .collect(),
    );
    for label in &labels {
        batch = batch.set_bits(keys.seat_block(event, tier, label), run_mask(1, width));
    }
    match store.execute(&batch).await? {
        BatchOutcome::Applied => {
            tracing::info!(event = %event, tier = %tier, blocks, width, "Seat map created");
            Ok(labels)
        }
        _ => Err(InventoryError::InvalidRequest(format!(
            "seat map for {event}/{tier} already exists"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_store::MemoryStore;

    #[tokio::test]
    async fn test_event_counters_start_full() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        let event = EventSku::new("123-ABC-723");
        create_event(&store, &keys, &event, "Womens Judo Final", &[TierSpec::new("VIP", 8, 9_900)])
            .await
            .unwrap();

        let map = store.hgetall("event:123-ABC-723").await.unwrap();
        assert_eq!(map["capacity:VIP"], "8");
        assert_eq!(map["available:VIP"], "8");
        assert_eq!(map["held:VIP"], "0");
        assert_eq!(map["price:VIP"], "9900");

        let again = create_event(&store, &keys, &event, "dup", &[TierSpec::new("VIP", 1, 1)]).await;
        assert!(matches!(again, Err(InventoryError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_seat_map_blocks_are_all_free() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        let event = EventSku::new("123-ABC-723");
        let tier = Tier::new("General");
        let labels = create_seat_map(&store, &keys, &event, &tier, 2, 40).await.unwrap();

        assert_eq!(labels.iter().map(BlockLabel::as_str).collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(store.get_bits("seatmap:123-ABC-723:General:B").await.unwrap(), u32::MAX);
        assert_eq!(
            store.hget("seatlayout:123-ABC-723:General", "A").await.unwrap().as_deref(),
            Some("32")
        );
    }

    #[tokio::test]
    async fn test_seat_map_is_created_once() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        let event = EventSku::new("123-ABC-723");
        let tier = Tier::new("General");
        create_seat_map(&store, &keys, &event, &tier, 1, 8).await.unwrap();

        let block = "seatmap:123-ABC-723:General:A";
        let sold = run_mask(1, 8) & !run_mask(2, 3);
        store.execute(&Batch::new().set_bits(block, sold)).await.unwrap();

        let again = create_seat_map(&store, &keys, &event, &tier, 2, 8).await;
        assert!(matches!(again, Err(InventoryError::InvalidRequest(_))));
        assert_eq!(store.get_bits(block).await.unwrap(), sold);
        assert!(!store.exists("seatmap:123-ABC-723:General:B").await.unwrap());
    }
}
