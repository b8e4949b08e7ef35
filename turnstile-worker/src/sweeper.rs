use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use turnstile_core::EventSku;
use turnstile_inventory::HoldManager;

/// One pass over every event. A failing event is logged and skipped.
pub async fn sweep_once(holds: &HoldManager, events: &[EventSku]) -> usize {
    let mut total = 0;
    for event in events {
        match holds.sweep_expired(event).await {
            Ok(reclaimed) => total += reclaimed,
            Err(e) => tracing::error!(event = %event, error = %e, "Sweep failed"),
        }
    }
    total
}

/// Sweep on every tick until `shutdown` flips to true. Returns the number
/// of holds reclaimed over the lifetime of the loop.
pub async fn run_sweeper(
    holds: HoldManager,
    events: Vec<EventSku>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(events = events.len(), interval = ?every, "Hold sweeper started");

    let mut total = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reclaimed = sweep_once(&holds, &events).await;
                if reclaimed > 0 {
                    tracing::debug!(reclaimed, "Sweep pass finished");
                }
                total += reclaimed;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    total
}
