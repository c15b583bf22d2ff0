//! LiquidityEngine
//!
//! Maintains a synchronized order book for the primary pair and
//! distills it into a single bid-dominance score.
//!
//! Synchronization protocol:
//!   1. Open the diff-stream subscription first; the channel buffers
//!      incoming messages while the REST snapshot is fetched.
//!   2. Adopt the snapshot as the base state.
//!   3. Discard any diff with `final_update_id <= last_update_id`;
//!      apply the rest (zero quantity deletes the level).
//!   4. Re-fetch a fresh snapshot on a fixed cadence and replace the
//!      book wholesale, self-healing any drift from missed diffs.
//!
//! Stream disconnects are the gateway worker's problem (it owns
//! reconnection); the book is never reset on disconnect.

pub mod book;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{ConfigCell, ConfigError, LiquidityConfig};
use crate::gateway::{DEFAULT_RETRY_SCHEDULE, ExchangeGateway, retry_with_schedule};
use crate::types::{CompactLiquidityState, OrderBookDiff};

use book::{DiffOutcome, OrderBook};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 32;
const DIFF_CHANNEL_CAPACITY: usize = 1_024;

/// Cadence of the wholesale snapshot refresh.
const SNAPSHOT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Dominance served before any data arrives.
pub const PRISTINE_DOMINANCE: f64 = 50.0;

pub struct LiquidityEngine<G> {
    gateway: Arc<G>,
    cell: Arc<dyn ConfigCell<LiquidityConfig>>,
    config: Mutex<Arc<LiquidityConfig>>,
    book: Mutex<Option<OrderBook>>,
    state: Mutex<CompactLiquidityState>,
    subscribers: Mutex<Vec<Sender<CompactLiquidityState>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<G: ExchangeGateway> LiquidityEngine<G> {
    pub fn new(
        gateway: Arc<G>,
        cell: Arc<dyn ConfigCell<LiquidityConfig>>,
        initial: LiquidityConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            cell,
            config: Mutex::new(Arc::new(initial)),
            book: Mutex::new(None),
            state: Mutex::new(CompactLiquidityState::default()),
            subscribers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open the stream, adopt a snapshot, arm the refresh timer.
    pub async fn start(self: &Arc<Self>) {
        self.stop().await;

        // Stream first: the channel buffers diffs while the snapshot
        // is in flight, so nothing between snapshot and stream is lost.
        let (tx, rx) = mpsc::channel(DIFF_CHANNEL_CAPACITY);

        let gateway = Arc::clone(&self.gateway);
        let worker = tokio::spawn(async move {
            if let Err(e) = gateway.subscribe_order_book_diffs(tx).await {
                error!(error = ?e, "order book diff stream worker exited");
            }
        });
        self.tasks.lock().await.push(worker);

        self.refresh_snapshot_once().await;

        let engine = Arc::clone(self);
        let consumer = tokio::spawn(async move {
            engine.consume_diffs(rx).await;
        });

        let engine = Arc::clone(self);
        let refresher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the initial adoption above covered now
            ticker.tick().await;

            loop {
                ticker.tick().await;
                engine.refresh_snapshot_once().await;
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(consumer);
        tasks.push(refresher);
        info!("liquidity engine started");
    }

    /// Abort every spawned task; dropping the diff receiver shuts the
    /// gateway worker down.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    pub async fn get_compact_state(&self) -> CompactLiquidityState {
        *self.state.lock().await
    }

    pub async fn get_configuration(&self) -> LiquidityConfig {
        self.current_config().await.as_ref().clone()
    }

    pub async fn subscribe(&self) -> Receiver<CompactLiquidityState> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Validate, commit, swap, recompute. No restart needed: the
    /// config only shapes the dominance computation.
    pub async fn update_configuration(&self, new: LiquidityConfig) -> Result<(), ConfigError> {
        new.validate()?;

        let version = self.cell.store(new.clone()).await?;
        *self.config.lock().await = Arc::new(new);
        info!(version, "liquidity configuration committed");

        self.recompute_and_publish().await;
        Ok(())
    }

    /// Apply one diff message. Diffs arriving before any snapshot are
    /// dropped; the next snapshot adoption covers them wholesale.
    pub async fn apply_diff_event(&self, diff: &OrderBookDiff) {
        let applied = {
            let mut guard = self.book.lock().await;
            match guard.as_mut() {
                Some(book) => book.apply_diff(diff) == DiffOutcome::Applied,
                None => false,
            }
        };

        if applied {
            self.recompute_and_publish().await;
        } else {
            debug!(
                final_update_id = diff.final_update_id,
                "discarded stale or pre-snapshot diff"
            );
        }
    }

    /// Fetch a fresh snapshot and replace the book wholesale. Failures
    /// keep serving the last-known dominance.
    pub async fn refresh_snapshot_once(&self) {
        let fetched = retry_with_schedule("order book snapshot", &DEFAULT_RETRY_SCHEDULE, || {
            let gateway = Arc::clone(&self.gateway);
            async move { gateway.get_order_book_snapshot().await }
        })
        .await;

        match fetched {
            Ok(snapshot) => {
                {
                    let mut guard = self.book.lock().await;
                    match guard.as_mut() {
                        Some(book) => book.replace(snapshot),
                        None => *guard = Some(OrderBook::from_snapshot(snapshot)),
                    }
                }
                self.recompute_and_publish().await;
            }
            Err(e) => {
                error!(error = ?e, "snapshot refresh failed; serving last-known dominance");
            }
        }
    }

    async fn consume_diffs(self: Arc<Self>, mut rx: Receiver<OrderBookDiff>) {
        while let Some(diff) = rx.recv().await {
            self.apply_diff_event(&diff).await;
        }
    }

    async fn recompute_and_publish(&self) {
        let cfg = self.current_config().await;

        let dominance = {
            let guard = self.book.lock().await;
            guard
                .as_ref()
                .map(|book| compute_bid_dominance(book, &cfg))
                .unwrap_or(PRISTINE_DOMINANCE)
        };

        let snapshot = CompactLiquidityState {
            bid_dominance: dominance,
        };
        *self.state.lock().await = snapshot;

        let mut subs = self.subscribers.lock().await;
        subs.retain(|ch| !ch.is_closed());
        for ch in subs.iter() {
            let _ = ch.send(snapshot).await;
        }
    }

    async fn current_config(&self) -> Arc<LiquidityConfig> {
        Arc::clone(&*self.config.lock().await)
    }
}

/// Weighted bid-side share of the liquidity near the current price.
///
/// Levels outside the `max_distance_from_price_pct` band around the
/// book mid are ignored. Each retained level is tiered 0..=4 against
/// multiples of the mean retained quantity (×1/×2/×4/×8) and weighted
/// by its tier before the sides are compared:
///
/// ```text
/// dominance = weighted_bids / (weighted_bids + weighted_asks) * 100
/// ```
pub fn compute_bid_dominance(book: &OrderBook, cfg: &LiquidityConfig) -> f64 {
    let Some(mid) = book.mid_price() else {
        return PRISTINE_DOMINANCE;
    };
    let Some(distance) = Decimal::from_f64(cfg.max_distance_from_price_pct / 100.0) else {
        return PRISTINE_DOMINANCE;
    };

    let low = mid * (Decimal::ONE - distance);
    let high = mid * (Decimal::ONE + distance);

    let bids = book.bids_in_band(low, high);
    let asks = book.asks_in_band(low, high);
    if bids.is_empty() && asks.is_empty() {
        return PRISTINE_DOMINANCE;
    }

    let quantities = |levels: &[(Decimal, Decimal)]| -> Vec<f64> {
        levels.iter().filter_map(|(_, q)| q.to_f64()).collect()
    };
    let bid_qtys = quantities(&bids);
    let ask_qtys = quantities(&asks);

    let count = bid_qtys.len() + ask_qtys.len();
    let mean: f64 = bid_qtys.iter().chain(ask_qtys.iter()).sum::<f64>() / count as f64;

    let weighted = |qtys: &[f64]| -> f64 {
        qtys.iter()
            .map(|q| q * cfg.weight_for(intensity_tier(*q, mean)))
            .sum()
    };

    let weighted_bids = weighted(&bid_qtys);
    let weighted_asks = weighted(&ask_qtys);
    let total = weighted_bids + weighted_asks;
    if total <= 0.0 {
        return PRISTINE_DOMINANCE;
    }

    (weighted_bids / total * 100.0).clamp(0.0, 100.0)
}

/// Tier a level quantity against the mean retained quantity.
fn intensity_tier(qty: f64, mean: f64) -> u8 {
    if mean <= 0.0 || qty < mean {
        0
    } else if qty >= mean * 8.0 {
        4
    } else if qty >= mean * 4.0 {
        3
    } else if qty >= mean * 2.0 {
        2
    } else {
        1
    }
}
