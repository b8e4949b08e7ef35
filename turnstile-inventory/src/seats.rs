use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use turnstile_core::models::MAX_BLOCK_WIDTH;
use turnstile_core::{BlockLabel, EventSku, InventoryError, InventoryResult, KeySpace, OrderId, SeatRun, Tier};
use turnstile_store::app_config::BusinessRules;
use turnstile_store::Store;

use crate::bitset::{self, BitsetBlock, FreeRuns};

/// How many times `allocate` re-reads the seat map after losing a seat.
const DEFAULT_ALLOCATE_ATTEMPTS: usize = 3;

/// Result of trying to take a run of seats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeatReservation {
    Reserved(SeatRun),
    /// Someone else holds `seat`; re-query and choose again.
    SeatTaken { seat: u32 },
}

/// One block as read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockState {
    pub block: BlockLabel,
    pub width: u32,
    pub bits: u32,
}

impl BlockState {
    pub fn free_count(&self) -> u32 {
        (1..=self.width).filter(|seat| bitset::is_free(self.bits, *seat)).count() as u32
    }

    pub fn runs(&self, count: u32) -> FreeRuns {
        FreeRuns::new(self.block.clone(), self.bits, self.width, count)
    }

    /// `O` for free and `X` for taken, seat 1 first.
    pub fn pattern(&self) -> String {
        bitset::pattern(self.bits, self.width)
    }
}

/// Picks which run to take out of the blocks that can fit `count` seats.
pub trait AllocationStrategy: Send + Sync {
    fn choose(&self, blocks: &[BlockState], count: u32) -> Option<SeatRun>;
}

/// Lowest block, lowest seat. Fills a block before moving on to the next.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFit;

impl AllocationStrategy for FirstFit {
    fn choose(&self, blocks: &[BlockState], count: u32) -> Option<SeatRun> {
        blocks.iter().find_map(|block| block.runs(count).next())
    }
}

/// The block with the fewest free seats that still fits the run, so large
/// gaps stay open for large parties. Ties go to the earlier block.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestFit;

impl AllocationStrategy for BestFit {
    fn choose(&self, blocks: &[BlockState], count: u32) -> Option<SeatRun> {
        blocks
            .iter()
            .filter_map(|block| block.runs(count).next().map(|run| (block.free_count(), run)))
            .min_by_key(|(free, _)| *free)
            .map(|(_, run)| run)
    }
}

/// Finds and reserves contiguous seats in a tier's blocks.
#[derive(Clone)]
pub struct SeatAllocator {
    store: Arc<dyn Store>,
    keys: KeySpace,
    strategy: Arc<dyn AllocationStrategy>,
    marker_ttl: Duration,
    commit_ttl: Duration,
    max_attempts: usize,
}

impl SeatAllocator {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace, rules: &BusinessRules) -> Self {
        Self {
            store,
            keys,
            strategy: Arc::new(FirstFit),
            marker_ttl: Duration::from_secs(rules.seat_marker_ttl_seconds),
            commit_ttl: Duration::from_secs(rules.seat_commit_ttl_seconds),
            max_attempts: DEFAULT_ALLOCATE_ATTEMPTS,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AllocationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Block labels and widths for a tier, in block order.
    pub async fn layout(&self, event: &EventSku, tier: &Tier) -> InventoryResult<Vec<(BlockLabel, u32)>> {
        let key = self.keys.seat_layout(event, tier);
        let map = self.store.hgetall(&key).await?;
        let mut blocks = map
            .into_iter()
            .map(|(label, width)| {
                let width: u32 = width
                    .parse()
                    .map_err(|_| InventoryError::malformed(&key, format!("width of block {label}")))?;
                if width == 0 || width > MAX_BLOCK_WIDTH {
                    return Err(InventoryError::malformed(&key, format!("block {label} width {width}")));
                }
                Ok((BlockLabel::parse(&label)?, width))
            })
            .collect::<InventoryResult<Vec<_>>>()?;
        blocks.sort();
        Ok(blocks)
    }

    pub fn block(&self, event: &EventSku, tier: &Tier, label: &BlockLabel, width: u32) -> InventoryResult<BitsetBlock> {
        BitsetBlock::new(self.store.clone(), self.keys.seat_block(event, tier, label), width)
    }

    /// Blocks with at least `count` free seats, read fresh from the store.
    pub async fn availability(&self, event: &EventSku, tier: &Tier, count: u32) -> InventoryResult<Vec<BlockState>> {
        let mut blocks = Vec::new();
        for (label, width) in self.layout(event, tier).await? {
            let block = self.block(event, tier, &label, width)?;
            if block.free_count().await? < count {
                continue;
            }
            blocks.push(BlockState {
                block: label,
                width,
                bits: block.get().await?,
            });
        }
        Ok(blocks)
    }

    /// Every window of `count` free seats, in block order and lowest seat first.
    pub async fn find_runs(&self, event: &EventSku, tier: &Tier, count: u32) -> InventoryResult<Vec<SeatRun>> {
        if count == 0 {
            return Err(InventoryError::InvalidRequest("seat count must be at least 1".into()));
        }
        let blocks = self.availability(event, tier, count).await?;
        Ok(blocks.iter().flat_map(|block| block.runs(count)).collect())
    }

    /// Every block of the tier with its current bit pattern.
    pub async fn seat_map(&self, event: &EventSku, tier: &Tier) -> InventoryResult<Vec<BlockState>> {
        let mut blocks = Vec::new();
        for (label, width) in self.layout(event, tier).await? {
            let bits = self.block(event, tier, &label, width)?.get().await?;
            blocks.push(BlockState {
                block: label,
                width,
                bits,
            });
        }
        Ok(blocks)
    }

    /// Take seats `first_seat..=last_seat` of `block` for `order`.
    ///
    /// Each seat gets a short-lived marker first. If any marker is already
    /// held the attempt stops with `SeatTaken`; markers set so far are left
    /// to expire. The block is then flipped in one guarded commit.
    pub async fn reserve(
        &self,
        event: &EventSku,
        tier: &Tier,
        order: &OrderId,
        block: &BlockLabel,
        first_seat: u32,
        last_seat: u32,
    ) -> InventoryResult<SeatReservation> {
        let width = self
            .layout(event, tier)
            .await?
            .into_iter()
            .find_map(|(label, width)| (label == *block).then_some(width))
            .ok_or_else(|| InventoryError::NotFound(format!("block {block} of {event}/{tier}")))?;
        if first_seat == 0 || last_seat < first_seat || last_seat > width {
            return Err(InventoryError::InvalidRequest(format!(
                "seats {first_seat}..={last_seat} do not fit block {block} of width {width}"
            )));
        }
        let run = SeatRun::new(block.clone(), first_seat, last_seat)?;

        for seat in run.seats() {
            let marker = self.keys.seat_marker(event, tier, block, seat);
            if !self.store.set_nx_ex(&marker, order.as_str(), self.marker_ttl).await? {
                tracing::debug!(event = %event, tier = %tier, block = %block, seat, order = %order, "Seat marker held elsewhere");
                return Ok(SeatReservation::SeatTaken { seat });
            }
        }

        let bitset = self.block(event, tier, block, width)?;
        let commit_key = self.keys.seat_commit(event, tier, block, order);
        if bitset.xor_commit(&commit_key, run.mask(), self.commit_ttl).await? {
            tracing::info!(
                event = %event,
                tier = %tier,
                block = %block,
                first_seat,
                last_seat,
                order = %order,
                "Seats reserved"
            );
            return Ok(SeatReservation::Reserved(run));
        }

        // markers were free but the seats were already sold
        let bits = bitset.get().await?;
        let seat = run
            .seats()
            .find(|seat| !bitset::is_free(bits, *seat))
            .unwrap_or(first_seat);
        tracing::debug!(event = %event, tier = %tier, block = %block, seat, order = %order, "Seat already sold");
        Ok(SeatReservation::SeatTaken { seat })
    }

    /// Choose a run of `count` seats with the configured strategy and reserve it,
    /// choosing again if another buyer gets there first.
    ///
    /// A run that lost is left out of later choices: its seats carry a marker
    /// (another buyer's, or this order's own from the failed attempt) until
    /// the marker expires.
    pub async fn allocate(
        &self,
        event: &EventSku,
        tier: &Tier,
        order: &OrderId,
        count: u32,
    ) -> InventoryResult<SeatReservation> {
        if count == 0 {
            return Err(InventoryError::InvalidRequest("seat count must be at least 1".into()));
        }
        let mut lost: Vec<SeatRun> = Vec::new();
        let mut outcome = None;
        for attempt in 0..self.max_attempts {
            let mut blocks = self.availability(event, tier, count).await?;
            for block in &mut blocks {
                for run in lost.iter().filter(|run| run.block == block.block) {
                    block.bits &= !run.mask();
                }
            }
            let Some(run) = self.strategy.choose(&blocks, count) else {
                if let Some(taken) = outcome {
                    return Ok(taken);
                }
                let longest = self
                    .seat_map(event, tier)
                    .await?
                    .iter()
                    .map(|block| longest_run(block.bits, block.width))
                    .max()
                    .unwrap_or(0);
                return Err(InventoryError::Insufficient {
                    requested: count,
                    available: longest,
                });
            };
            let reservation = self
                .reserve(event, tier, order, &run.block, run.first_seat, run.last_seat)
                .await?;
            if let SeatReservation::SeatTaken { seat } = reservation {
                tracing::debug!(order = %order, seat, attempt, "Chosen seats were taken, choosing again");
                lost.push(run);
                outcome = Some(reservation);
                continue;
            }
            return Ok(reservation);
        }
        Ok(outcome.unwrap_or(SeatReservation::SeatTaken { seat: 0 }))
    }
}

/// Length of the longest stretch of free seats in a block.
fn longest_run(bits: u32, width: u32) -> u32 {
    let mut best = 0;
    let mut current = 0;
    for seat in 1..=width.min(MAX_BLOCK_WIDTH) {
        if bitset::is_free(bits, seat) {
            current += 1;
            best = best.max(current);
        } else {
            current = 0;
        }
    }
    best
}
