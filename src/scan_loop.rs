//! Scan Loop (C6) — the top-level scheduler. Advances every (chain, entity)
//! window in turn, dispatches the resulting events, and sleeps for the poll
//! interval only when nothing progressed this pass (§4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::chains::ChainAdapter;
use crate::cursor::CursorClient;
use crate::dispatch::Dispatcher;
use crate::model::{CursorTable, Event, EntityAddressSet};

/// One (entity, chain) pair the loop drives forward independently.
pub struct Target {
    pub entity: String,
    pub chain: String,
    pub adapter: Arc<dyn ChainAdapter>,
    pub addrs: EntityAddressSet,
}

pub struct ScanLoop {
    targets: Vec<Target>,
    cursors: CursorTable,
    cursor_client: CursorClient,
    dispatcher: Dispatcher,
    poll_interval: std::time::Duration,
    log_every: u64,
    windows_scanned: u64,
}

impl ScanLoop {
    pub fn new(
        targets: Vec<Target>,
        cursors: CursorTable,
        cursor_client: CursorClient,
        dispatcher: Dispatcher,
        poll_interval: std::time::Duration,
        log_every: u64,
    ) -> Self {
        Self {
            targets,
            cursors,
            cursor_client,
            dispatcher,
            poll_interval,
            log_every,
            windows_scanned: 0,
        }
    }

    /// Runs until `shutdown` is set, checked between every target and during
    /// the idle sleep (§5: cooperative shutdown around the poll-interval sleep).
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        loop {
            let mut progressed = false;

            for i in 0..self.targets.len() {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if self.tick(i).await {
                    progressed = true;
                }
            }

            if shutdown.load(Ordering::Relaxed) {
                return;
            }

            if !progressed {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = wait_for_shutdown(&shutdown) => {}
                }
            }
        }
    }

    /// Advances one (entity, chain) pair by at most one window. Returns
    /// whether its cursor advanced this tick.
    async fn tick(&mut self, index: usize) -> bool {
        let (entity, chain) = {
            let t = &self.targets[index];
            (t.entity.clone(), t.chain.clone())
        };

        let tip = match self.targets[index].adapter.tip().await {
            Ok(t) => t,
            Err(e) => {
                warn!(entity = %entity, chain = %chain, error = %e, "failed to fetch tip, skipping this pass");
                return false;
            }
        };

        let cursor = self.cursors.get(&entity, &chain).unwrap_or(0);
        if cursor >= tip {
            return false;
        }

        let window = self.targets[index].adapter.window_size();
        let from = cursor;
        let to = (from + window).min(tip);

        let start = Instant::now();
        let events = {
            let target = &self.targets[index];
            target
                .adapter
                .scan_window(&entity, &target.addrs, from, to)
                .await
        };
        let elapsed = start.elapsed();

        let events = match events {
            Ok(events) => events,
            Err(e) => {
                warn!(entity = %entity, chain = %chain, from, to, error = %e, "window scan failed, will retry next tick");
                return false;
            }
        };

        self.windows_scanned += 1;
        if !events.is_empty() {
            log_window_summary(&entity, &chain, from, to, &events, elapsed);
        } else if self.log_every > 0 && self.windows_scanned % self.log_every == 0 {
            info!(entity = %entity, chain = %chain, from, to, windows_scanned = self.windows_scanned, "progress: no events this window");
        }

        let progressed = self.dispatcher.dispatch(&self.cursor_client, &entity, &chain, &events, to).await;
        if progressed {
            self.cursors.set(&entity, &chain, to + 1);
        }
        progressed
    }
}

async fn wait_for_shutdown(shutdown: &Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

fn log_window_summary(
    entity: &str,
    chain: &str,
    from: u64,
    to: u64,
    events: &[Event],
    elapsed: std::time::Duration,
) {
    let mut by_coin: HashMap<&str, usize> = HashMap::new();
    let mut min_ts = events[0].timestamp;
    let mut max_ts = events[0].timestamp;
    for e in events {
        *by_coin.entry(e.coin.as_str()).or_insert(0) += 1;
        if e.timestamp < min_ts {
            min_ts = e.timestamp;
        }
        if e.timestamp > max_ts {
            max_ts = e.timestamp;
        }
    }
    let mut breakdown: Vec<String> = by_coin.iter().map(|(c, n)| format!("{c}={n}")).collect();
    breakdown.sort();
    info!(
        entity,
        chain,
        from,
        to,
        count = events.len(),
        by_coin = %breakdown.join(","),
        min_ts = %min_ts,
        max_ts = %max_ts,
        duration_ms = elapsed.as_millis(),
        "window produced events"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;
    use chrono::Utc;

    fn event(coin: &str) -> Event {
        Event {
            entity: "acme".into(),
            chain: "ethereum".into(),
            coin: coin.into(),
            direction: Direction::In,
            amount: "1.00000000".into(),
            timestamp: Utc::now(),
            txid: "0x1".into(),
            from: "0xa".into(),
            to: "0xb".into(),
            address: "0xb".into(),
            log_index: -1,
        }
    }

    #[test]
    fn log_window_summary_does_not_panic_on_mixed_coins() {
        let events = vec![event("ETH"), event("USDT")];
        log_window_summary("acme", "ethereum", 100, 105, &events, std::time::Duration::from_millis(50));
    }
}
