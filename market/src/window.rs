//! WindowEngine
//!
//! Maintains the rolling candlestick buffer for the primary trading
//! pair and classifies its closing-price series on every refetch.
//!
//! Responsibilities:
//!   • Seed the buffer from the gateway on `start()`
//!   • Refetch the newest candles on a fixed cadence (ring-buffer
//!     discipline, oldest evicted)
//!   • Recompute the split-state classification and broadcast an
//!     immutable snapshot to all subscribers
//!
//! The engine is an Arc-managed async service; the refetch loop runs
//! as a spawned task holding `Arc<Self>` and is aborted on `stop()`.
//! Gateway failures are retried on a bounded schedule; exhausting it
//! keeps the previous state (stale-but-available over unavailable).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::classifier;
use crate::config::{ConfigCell, ConfigError, WindowConfig};
use crate::gateway::{DEFAULT_RETRY_SCHEDULE, ExchangeGateway, retry_with_schedule};
use crate::types::{Candlestick, WindowSnapshot};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 32;

/// Engine lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    Uninitialized,
    Syncing,
    Ready,
}

pub struct WindowEngine<G> {
    gateway: Arc<G>,
    cell: Arc<dyn ConfigCell<WindowConfig>>,
    config: Mutex<Arc<WindowConfig>>,
    candles: Mutex<VecDeque<Candlestick>>,
    status: Mutex<WindowStatus>,
    snapshot: Mutex<Option<WindowSnapshot>>,
    subscribers: Mutex<Vec<Sender<WindowSnapshot>>>,
    refetch_task: Mutex<Option<JoinHandle<()>>>,
}

impl<G: ExchangeGateway> WindowEngine<G> {
    pub fn new(
        gateway: Arc<G>,
        cell: Arc<dyn ConfigCell<WindowConfig>>,
        initial: WindowConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            cell,
            config: Mutex::new(Arc::new(initial)),
            candles: Mutex::new(VecDeque::new()),
            status: Mutex::new(WindowStatus::Uninitialized),
            snapshot: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            refetch_task: Mutex::new(None),
        })
    }

    /// Seed the buffer and arm the refetch timer.
    ///
    /// A failed seed is returned to the caller, but the timer is armed
    /// regardless: the loop keeps retrying the seed on every tick until
    /// it lands, then switches to normal refetching. A transient
    /// gateway outage can therefore never leave the engine halted.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.stop().await;

        let seeded = self.try_seed().await;

        let engine = Arc::clone(self);
        let frequency_secs = engine.current_config().await.refetch_frequency_secs;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(frequency_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; the seed attempt above covered now
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if engine.status().await == WindowStatus::Ready {
                    engine.refetch_once().await;
                } else if let Err(e) = engine.try_seed().await {
                    error!(error = ?e, "window re-seed failed; retrying on next tick");
                }
            }
        });

        *self.refetch_task.lock().await = Some(handle);
        info!(frequency_secs, "window engine started");
        seeded
    }

    /// Clear the refetch timer. No callback fires after this returns.
    pub async fn stop(&self) {
        if let Some(handle) = self.refetch_task.lock().await.take() {
            handle.abort();
        }
        *self.status.lock().await = WindowStatus::Uninitialized;
    }

    pub async fn status(&self) -> WindowStatus {
        *self.status.lock().await
    }

    /// Latest published snapshot, `None` before the first seed.
    pub async fn get_state(&self) -> Option<WindowSnapshot> {
        self.snapshot.lock().await.clone()
    }

    pub async fn get_configuration(&self) -> WindowConfig {
        self.current_config().await.as_ref().clone()
    }

    /// Register a subscriber for future snapshots.
    pub async fn subscribe(&self) -> Receiver<WindowSnapshot> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Validate, commit, atomically swap, and restart.
    pub async fn update_configuration(self: &Arc<Self>, new: WindowConfig) -> Result<(), ConfigError> {
        new.validate()?;

        let version = self.cell.store(new.clone()).await?;
        *self.config.lock().await = Arc::new(new);
        info!(version, "window configuration committed; restarting engine");

        self.stop().await;
        if let Err(e) = self.start().await {
            error!(
                error = ?e,
                "window engine restart seed failed; serving previous state until the timer re-seeds"
            );
        }

        Ok(())
    }

    /// Fetch the newest candles and fold them into the buffer.
    /// Public so the refetch loop and tests share one code path.
    pub async fn refetch_once(&self) {
        let cfg = self.current_config().await;

        let fetched = retry_with_schedule("window refetch", &DEFAULT_RETRY_SCHEDULE, || {
            let gateway = Arc::clone(&self.gateway);
            let interval = cfg.interval;
            async move { gateway.get_candlesticks(interval, 2, None).await }
        })
        .await;

        match fetched {
            Ok(latest) => {
                {
                    let mut buf = self.candles.lock().await;
                    for candle in latest {
                        merge_candle(&mut buf, candle, cfg.size);
                    }
                }
                self.recompute_and_publish(&cfg).await;
            }
            Err(e) => {
                error!(error = ?e, "window refetch exhausted retries; serving stale state");
            }
        }
    }

    /// One seeding attempt with status bookkeeping: `Ready` on
    /// success, back to `Uninitialized` on failure.
    async fn try_seed(&self) -> anyhow::Result<()> {
        *self.status.lock().await = WindowStatus::Syncing;

        match self.seed().await {
            Ok(()) => {
                *self.status.lock().await = WindowStatus::Ready;
                Ok(())
            }
            Err(e) => {
                *self.status.lock().await = WindowStatus::Uninitialized;
                Err(e)
            }
        }
    }

    async fn seed(&self) -> anyhow::Result<()> {
        let cfg = self.current_config().await;

        let candles = retry_with_schedule("window seed", &DEFAULT_RETRY_SCHEDULE, || {
            let gateway = Arc::clone(&self.gateway);
            let (interval, size) = (cfg.interval, cfg.size);
            async move { gateway.get_candlesticks(interval, size, None).await }
        })
        .await?;

        {
            let mut buf = self.candles.lock().await;
            *buf = candles.into_iter().collect();
            while buf.len() > cfg.size {
                buf.pop_front();
            }
        }

        self.recompute_and_publish(&cfg).await;
        Ok(())
    }

    async fn recompute_and_publish(&self, cfg: &WindowConfig) {
        let (closes, last_candles) = {
            let buf = self.candles.lock().await;
            let closes: Vec<f64> = buf.iter().map(|c| c.close).collect();
            let tail_start = buf.len().saturating_sub(2);
            let last: Vec<Candlestick> = buf.iter().skip(tail_start).cloned().collect();
            (closes, last)
        };

        let state = classifier::classify(&closes, cfg.requirement_pct, cfg.strong_requirement_pct);
        debug!(mean = %state.mean, candles = closes.len(), "window state recomputed");

        let snapshot = WindowSnapshot { state, last_candles };
        *self.snapshot.lock().await = Some(snapshot.clone());

        let mut subs = self.subscribers.lock().await;
        subs.retain(|ch| !ch.is_closed());
        for ch in subs.iter() {
            let _ = ch.send(snapshot.clone()).await;
        }
    }

    async fn current_config(&self) -> Arc<WindowConfig> {
        Arc::clone(&*self.config.lock().await)
    }
}

/// Fold one fetched candle into the buffer.
///
/// A candle with the buffer tail's open time is the still-forming live
/// candle and replaces the tail in place; a newer candle is appended
/// and the oldest evicted past `size`; anything older is dropped.
fn merge_candle(buf: &mut VecDeque<Candlestick>, candle: Candlestick, size: usize) {
    match buf.back_mut() {
        Some(tail) if tail.open_time_ms == candle.open_time_ms => *tail = candle,
        Some(tail) if candle.open_time_ms > tail.open_time_ms => {
            buf.push_back(candle);
            while buf.len() > size {
                buf.pop_front();
            }
        }
        Some(_) => {}
        None => buf.push_back(candle),
    }
}
