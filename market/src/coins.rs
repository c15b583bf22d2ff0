//! CoinsEngine
//!
//! Tracks a basket of top-volume symbols in two quote contexts (vs the
//! stable quote asset and vs the primary traded asset) and classifies
//! each symbol's rolling price-bucket series.
//!
//! Responsibilities:
//!   • Resolve basket membership from the whitelist by volume
//!   • Consume one ticker stream per basket
//!   • Sample prices into fixed-cadence OHLC buckets (ticks mutate the
//!     live bucket; a new bucket opens only once the interval elapsed)
//!   • Publish the classified mean of all symbols' per-split means
//!   • Evict symbols whose subscription never delivered a tick
//!
//! Symbol resolution retries persistently: the engine cannot run at
//! all without a basket.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier;
use crate::config::{CoinsConfig, ConfigCell, ConfigError};
use crate::gateway::{DEFAULT_RETRY_SCHEDULE, ExchangeGateway, retry_persistent};
use crate::types::{BasketAsset, CoinsSnapshot, StateResult, TickerEvent};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 32;
const TICKER_CHANNEL_CAPACITY: usize = 512;

/// Delay before the one-shot dead-subscription check fires.
const SELF_CHECK_DELAY: Duration = Duration::from_secs(300);

/// One sampled price bucket. `open_time_ms` anchors the bucket to the
/// fixed wall-clock cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBucket {
    pub open_time_ms: i64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Rolling bucket series plus a lifetime tick counter per symbol.
#[derive(Debug, Default)]
struct SymbolSeries {
    buckets: VecDeque<PriceBucket>,
    updates: u64,
}

impl SymbolSeries {
    fn apply_tick(&mut self, now_ms: i64, price: f64, interval_ms: i64, window_size: usize) {
        self.updates += 1;

        match self.buckets.back_mut() {
            Some(bucket) if now_ms - bucket.open_time_ms < interval_ms => {
                bucket.high = bucket.high.max(price);
                bucket.low = bucket.low.min(price);
                bucket.close = price;
            }
            _ => {
                self.buckets.push_back(PriceBucket {
                    open_time_ms: now_ms,
                    high: price,
                    low: price,
                    close: price,
                });
                while self.buckets.len() > window_size {
                    self.buckets.pop_front();
                }
            }
        }
    }

    fn closes(&self) -> Vec<f64> {
        self.buckets.iter().map(|b| b.close).collect()
    }
}

#[derive(Default)]
struct Baskets {
    quote: HashMap<String, SymbolSeries>,
    base: HashMap<String, SymbolSeries>,
}

impl Baskets {
    fn side(&self, asset: BasketAsset) -> &HashMap<String, SymbolSeries> {
        match asset {
            BasketAsset::Quote => &self.quote,
            BasketAsset::Base => &self.base,
        }
    }

    fn side_mut(&mut self, asset: BasketAsset) -> &mut HashMap<String, SymbolSeries> {
        match asset {
            BasketAsset::Quote => &mut self.quote,
            BasketAsset::Base => &mut self.base,
        }
    }
}

pub struct CoinsEngine<G> {
    gateway: Arc<G>,
    cell: Arc<dyn ConfigCell<CoinsConfig>>,
    config: Mutex<Arc<CoinsConfig>>,
    baskets: Mutex<Baskets>,
    snapshot: Mutex<CoinsSnapshot>,
    subscribers: Mutex<Vec<Sender<CoinsSnapshot>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<G: ExchangeGateway> CoinsEngine<G> {
    pub fn new(
        gateway: Arc<G>,
        cell: Arc<dyn ConfigCell<CoinsConfig>>,
        initial: CoinsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            cell,
            config: Mutex::new(Arc::new(initial)),
            baskets: Mutex::new(Baskets::default()),
            snapshot: Mutex::new(CoinsSnapshot::default()),
            subscribers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Resolve membership, open both basket streams, arm the sampling
    /// and self-check timers. Returns immediately; resolution retries
    /// run inside the bootstrap task.
    pub async fn start(self: &Arc<Self>) {
        self.stop().await;

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.bootstrap().await;
        });
        self.tasks.lock().await.push(handle);
    }

    /// Abort every spawned task. Dropping the ticker receivers closes
    /// the gateway workers' channels, which shuts the workers down.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    /// Latest published basket snapshot.
    pub async fn get_snapshot(&self) -> CoinsSnapshot {
        *self.snapshot.lock().await
    }

    pub async fn get_configuration(&self) -> CoinsConfig {
        self.current_config().await.as_ref().clone()
    }

    /// Basket-level classified mean for one quote context.
    pub async fn get_state(&self, asset: BasketAsset) -> crate::types::State {
        let snapshot = self.get_snapshot().await;
        match asset {
            BasketAsset::Quote => snapshot.quote,
            BasketAsset::Base => snapshot.base,
        }
    }

    /// Full per-symbol classification, computed on demand.
    pub async fn get_state_for_symbol(
        &self,
        asset: BasketAsset,
        symbol: &str,
    ) -> Option<StateResult> {
        let cfg = self.current_config().await;
        let baskets = self.baskets.lock().await;
        let series = baskets.side(asset).get(symbol)?;

        Some(classifier::classify(
            &series.closes(),
            cfg.requirement_pct,
            cfg.strong_requirement_pct,
        ))
    }

    pub async fn subscribe(&self) -> Receiver<CoinsSnapshot> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Validate, commit, atomically swap, and restart with the new
    /// basket parameters.
    pub async fn update_configuration(self: &Arc<Self>, new: CoinsConfig) -> Result<(), ConfigError> {
        new.validate()?;

        let version = self.cell.store(new.clone()).await?;
        *self.config.lock().await = Arc::new(new);
        info!(version, "coins configuration committed; restarting engine");

        self.stop().await;
        *self.baskets.lock().await = Baskets::default();
        self.start().await;

        Ok(())
    }

    /// Fold one ticker event into its basket. Unknown symbols are
    /// dropped (stale events from a stream being torn down).
    pub async fn handle_ticker(&self, asset: BasketAsset, event: TickerEvent, now_ms: i64) {
        let cfg = self.current_config().await;
        let interval_ms = cfg.interval_secs as i64 * 1_000;

        let mut baskets = self.baskets.lock().await;
        if let Some(series) = baskets.side_mut(asset).get_mut(&event.symbol) {
            series.apply_tick(now_ms, event.price, interval_ms, cfg.window_size);
        }
    }

    /// Recompute both basket means and publish a snapshot.
    pub async fn recompute_once(&self) {
        let cfg = self.current_config().await;

        let snapshot = {
            let baskets = self.baskets.lock().await;
            CoinsSnapshot {
                quote: basket_mean(baskets.side(BasketAsset::Quote), &cfg),
                base: basket_mean(baskets.side(BasketAsset::Base), &cfg),
            }
        };

        debug!(quote = %snapshot.quote, base = %snapshot.base, "coins state recomputed");
        *self.snapshot.lock().await = snapshot;

        let mut subs = self.subscribers.lock().await;
        subs.retain(|ch| !ch.is_closed());
        for ch in subs.iter() {
            let _ = ch.send(snapshot).await;
        }
    }

    /// One-shot guard against silently-dead subscriptions: any symbol
    /// that received zero ticks since start is evicted so it cannot
    /// skew the aggregate.
    pub async fn run_self_check(&self) {
        {
            let mut baskets = self.baskets.lock().await;
            for asset in [BasketAsset::Quote, BasketAsset::Base] {
                let side = baskets.side_mut(asset);
                let before = side.len();

                side.retain(|symbol, series| {
                    if series.updates == 0 {
                        warn!(%symbol, ?asset, "evicting symbol with no ticker updates");
                        false
                    } else {
                        true
                    }
                });

                if side.len() != before {
                    warn!(
                        ?asset,
                        evicted = before - side.len(),
                        remaining = side.len(),
                        "basket membership recomputed after self-check"
                    );
                }
            }
        }

        self.recompute_once().await;
    }

    async fn bootstrap(self: Arc<Self>) {
        let cfg = self.current_config().await;

        let top_symbols = retry_persistent("resolve top symbols", &DEFAULT_RETRY_SCHEDULE, || {
            let gateway = Arc::clone(&self.gateway);
            let cfg = Arc::clone(&cfg);
            async move {
                gateway
                    .get_top_symbols_by_volume(&cfg.whitelisted_symbols, cfg.max_symbols)
                    .await
            }
        })
        .await;

        info!(symbols = top_symbols.len(), "coins basket membership resolved");

        for asset in [BasketAsset::Quote, BasketAsset::Base] {
            let pair = match asset {
                BasketAsset::Quote => &cfg.quote_pair,
                BasketAsset::Base => &cfg.base_pair,
            };

            let stream_symbols: Vec<String> = top_symbols
                .iter()
                .map(|s| format!("{}{}", s, pair))
                .collect();

            {
                let mut baskets = self.baskets.lock().await;
                let side = baskets.side_mut(asset);
                for symbol in &stream_symbols {
                    side.insert(symbol.clone(), SymbolSeries::default());
                }
            }

            let (tx, mut rx) = mpsc::channel(TICKER_CHANNEL_CAPACITY);

            let gateway = Arc::clone(&self.gateway);
            let worker = tokio::spawn(async move {
                if let Err(e) = gateway.subscribe_tickers(&stream_symbols, tx).await {
                    error!(?asset, error = ?e, "ticker stream worker exited");
                }
            });

            let engine = Arc::clone(&self);
            let consumer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    engine
                        .handle_ticker(asset, event, Utc::now().timestamp_millis())
                        .await;
                }
            });

            let mut tasks = self.tasks.lock().await;
            tasks.push(worker);
            tasks.push(consumer);
        }

        let engine = Arc::clone(&self);
        let interval_secs = cfg.interval_secs;
        let sampler = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.recompute_once().await;
            }
        });

        let engine = Arc::clone(&self);
        let self_check = tokio::spawn(async move {
            tokio::time::sleep(SELF_CHECK_DELAY).await;
            engine.run_self_check().await;
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(sampler);
        tasks.push(self_check);
    }

    async fn current_config(&self) -> Arc<CoinsConfig> {
        Arc::clone(&*self.config.lock().await)
    }
}

/// Classified mean of all symbols' per-split means (mean-of-means).
/// An empty basket is neutral by definition.
fn basket_mean(side: &HashMap<String, SymbolSeries>, cfg: &CoinsConfig) -> crate::types::State {
    if side.is_empty() {
        return crate::types::State::Neutral;
    }

    let mut sum = 0.0;
    for series in side.values() {
        let result = classifier::classify(
            &series.closes(),
            cfg.requirement_pct,
            cfg.strong_requirement_pct,
        );
        sum += f64::from(result.mean.value());
    }

    classifier::classify_mean(sum / side.len() as f64)
}
