//! ReversalEngine
//!
//! The one fan-in point of the perception core. It watches the window
//! engine for a qualifying price crash, and while an episode is ACTIVE
//! scores the situation from the latest liquidity and coins snapshots.
//!
//! Phase machine:
//!
//! ```text
//! Idle ──(window flips to strong decrease)──▶ Active
//! Active ──(crash duration elapsed)──▶ Cooldown ──(idle elapsed)──▶ Idle
//! ```
//!
//! The durable record is written exactly once, at the Active→Cooldown
//! transition. Each upstream is processed strictly in arrival order by
//! its own consumer task; the handlers take an explicit `now_ms` so
//! transitions are reproducible under test.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender},
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use market::config::{ConfigCell, ConfigError};
use market::types::{CoinsSnapshot, CompactLiquidityState, State, WindowSnapshot};

use crate::history::EventHistoryRecorder;
use crate::model::{
    ActiveCrash, CrashId, Phase, PhaseKind, PriceCrashState, ReversalConfig, ReversalError,
    ReversalSnapshot, ReversalWeights,
};
use crate::store::CrashRecordStore;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 32;

/// Cadence of the expiry sweep, which closes episodes even when no
/// upstream tick arrives near the deadline.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub struct ReversalEngine<S, H> {
    cell: Arc<dyn ConfigCell<ReversalConfig>>,
    config: Mutex<Arc<ReversalConfig>>,
    store: Arc<S>,
    history: Arc<H>,
    phase: Mutex<Phase>,
    prev_window_mean: Mutex<Option<State>>,
    latest_liquidity: Mutex<Option<CompactLiquidityState>>,
    latest_coins: Mutex<Option<CoinsSnapshot>>,
    snapshot: Mutex<ReversalSnapshot>,
    subscribers: Mutex<Vec<Sender<ReversalSnapshot>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, H> ReversalEngine<S, H>
where
    S: CrashRecordStore + 'static,
    H: EventHistoryRecorder + 'static,
{
    pub fn new(
        cell: Arc<dyn ConfigCell<ReversalConfig>>,
        initial: ReversalConfig,
        store: Arc<S>,
        history: Arc<H>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cell,
            config: Mutex::new(Arc::new(initial)),
            store,
            history,
            phase: Mutex::new(Phase::Idle),
            prev_window_mean: Mutex::new(None),
            latest_liquidity: Mutex::new(None),
            latest_coins: Mutex::new(None),
            snapshot: Mutex::new(ReversalSnapshot::default()),
            subscribers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Wire the three upstream subscriptions and arm the expiry sweep.
    /// Each upstream gets its own consumer so per-source ordering is
    /// preserved while sources proceed concurrently.
    pub async fn start(
        self: &Arc<Self>,
        mut window_rx: Receiver<WindowSnapshot>,
        mut liquidity_rx: Receiver<CompactLiquidityState>,
        mut coins_rx: Receiver<CoinsSnapshot>,
    ) {
        self.stop().await;

        let engine = Arc::clone(self);
        let window_task = tokio::spawn(async move {
            while let Some(snapshot) = window_rx.recv().await {
                engine.handle_window(&snapshot, now_ms()).await;
            }
        });

        let engine = Arc::clone(self);
        let liquidity_task = tokio::spawn(async move {
            while let Some(snapshot) = liquidity_rx.recv().await {
                engine.handle_liquidity(snapshot, now_ms()).await;
            }
        });

        let engine = Arc::clone(self);
        let coins_task = tokio::spawn(async move {
            while let Some(snapshot) = coins_rx.recv().await {
                engine.handle_coins(snapshot, now_ms()).await;
            }
        });

        let engine = Arc::clone(self);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                engine.expire_if_due(now_ms()).await;
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.extend([window_task, liquidity_task, coins_task, sweeper]);
        info!("reversal engine started");
    }

    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    pub async fn get_state(&self) -> ReversalSnapshot {
        *self.snapshot.lock().await
    }

    pub async fn get_configuration(&self) -> ReversalConfig {
        self.current_config().await.as_ref().clone()
    }

    pub async fn subscribe(&self) -> Receiver<ReversalSnapshot> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Validate and commit a new configuration. Takes effect from the
    /// next episode; a running episode keeps its original deadlines.
    pub async fn update_configuration(&self, new: ReversalConfig) -> Result<(), ConfigError> {
        new.validate()?;

        let version = self.cell.store(new.clone()).await?;
        *self.config.lock().await = Arc::new(new);
        info!(version, "reversal configuration committed");
        Ok(())
    }

    /// Look a record up by id string. The currently-active episode is
    /// served from memory; everything else goes to durable storage.
    pub async fn get_record(&self, id: &str) -> Result<PriceCrashState, ReversalError> {
        let parsed =
            Uuid::parse_str(id).map_err(|_| ReversalError::InvalidId(id.to_string()))?;

        {
            let phase = self.phase.lock().await;
            if let Phase::Active(active) = &*phase {
                if active.record.id == parsed {
                    return Ok(active.record.clone());
                }
            }
        }

        match self.store.find(parsed).await? {
            Some(record) => Ok(record),
            None => Err(ReversalError::NotFound(parsed)),
        }
    }

    /// Reverse-chronological records with exclusive cursor pagination.
    pub async fn list_records(
        &self,
        limit: u32,
        start_at_event_time: Option<i64>,
    ) -> Result<Vec<PriceCrashState>, ReversalError> {
        Ok(self.store.list(limit, start_at_event_time).await?)
    }

    /// Process one window snapshot: close due episodes, then check the
    /// crash trigger against the previous window state.
    pub async fn handle_window(&self, window: &WindowSnapshot, now_ms: i64) {
        self.expire_if_due(now_ms).await;

        let current = window.state.mean;
        let previous = {
            let mut guard = self.prev_window_mean.lock().await;
            guard.replace(current)
        };

        let crash_trigger = current == State::StrongDecrease
            && previous.map(|p| p != State::StrongDecrease).unwrap_or(false);

        if crash_trigger {
            self.activate(now_ms).await;
        }

        self.rescore(now_ms).await;
    }

    pub async fn handle_liquidity(&self, state: CompactLiquidityState, now_ms: i64) {
        self.expire_if_due(now_ms).await;
        *self.latest_liquidity.lock().await = Some(state);
        self.rescore(now_ms).await;
    }

    pub async fn handle_coins(&self, state: CoinsSnapshot, now_ms: i64) {
        self.expire_if_due(now_ms).await;
        *self.latest_coins.lock().await = Some(state);
        self.rescore(now_ms).await;
    }

    /// Close an ACTIVE episode past its deadline (persisting the
    /// record exactly once) and release an elapsed cooldown.
    pub async fn expire_if_due(&self, now_ms: i64) {
        let (finalized, changed) = {
            let mut phase = self.phase.lock().await;
            match &mut *phase {
                Phase::Active(active) if now_ms > active.active_until_ms => {
                    let mut record = active.record.clone();
                    record.final_points = active.points;
                    let until_ms = active.idle_until_ms;
                    *phase = Phase::Cooldown { until_ms };
                    (Some(record), true)
                }
                Phase::Cooldown { until_ms } if now_ms > *until_ms => {
                    *phase = Phase::Idle;
                    (None, true)
                }
                _ => (None, false),
            }
        };

        if let Some(record) = finalized {
            info!(
                crash_id = %record.id,
                final_points = record.final_points,
                highest_points = record.highest_points,
                "crash episode closed; entering cooldown"
            );

            if let Err(e) = self.store.save(&record).await {
                error!(crash_id = %record.id, error = ?e, "failed to persist crash record");
            }
            if let Err(e) = self.history.close(record.id).await {
                warn!(crash_id = %record.id, error = ?e, "failed to close history session");
            }
        }

        if changed {
            self.publish_snapshot().await;
        }
    }

    async fn activate(&self, now_ms: i64) {
        let cfg = self.current_config().await;
        let id: CrashId = Uuid::new_v4();

        {
            let mut phase = self.phase.lock().await;
            // Cooldown (and an already-active episode) blocks re-triggering.
            if !matches!(*phase, Phase::Idle) {
                return;
            }

            let active_until_ms = now_ms + cfg.crash_duration_ms();
            *phase = Phase::Active(ActiveCrash {
                record: PriceCrashState::new(id, now_ms),
                active_until_ms,
                idle_until_ms: active_until_ms + cfg.crash_idle_duration_ms(),
                points: 0.0,
            });
        }

        info!(crash_id = %id, "price crash detected; reversal scoring active");

        if let Err(e) = self.history.open(id).await {
            warn!(crash_id = %id, error = ?e, "failed to open history session");
        }

        self.publish_snapshot().await;
    }

    /// Recompute points for the active episode from the latest
    /// upstream snapshots. A no-op outside ACTIVE or before all three
    /// upstreams have published.
    async fn rescore(&self, now_ms: i64) {
        let cfg = self.current_config().await;

        let liquidity = *self.latest_liquidity.lock().await;
        let coins = *self.latest_coins.lock().await;
        let (Some(liquidity), Some(coins)) = (liquidity, coins) else {
            return;
        };

        let points = score(&cfg.weights, &liquidity, &coins);

        let history_id = {
            let mut phase = self.phase.lock().await;
            let Phase::Active(active) = &mut *phase else {
                return;
            };
            if now_ms > active.active_until_ms {
                return;
            }

            active.points = points;
            active.record.highest_points = active.record.highest_points.max(points);

            if points >= cfg.points_requirement && active.record.reversal_event_time.is_none() {
                active.record.reversal_event_time = Some(now_ms);
                info!(crash_id = %active.record.id, points, "reversal event stamped");
            }

            active.record.id
        };

        if let Err(e) = self.history.record(history_id, points, now_ms).await {
            warn!(crash_id = %history_id, error = ?e, "failed to record history point");
        }

        self.publish_snapshot().await;
    }

    async fn publish_snapshot(&self) {
        let snapshot = {
            let phase = self.phase.lock().await;
            match &*phase {
                Phase::Idle => ReversalSnapshot::default(),
                Phase::Cooldown { .. } => ReversalSnapshot {
                    phase: PhaseKind::Cooldown,
                    ..ReversalSnapshot::default()
                },
                Phase::Active(active) => ReversalSnapshot {
                    phase: PhaseKind::Active,
                    points: active.points,
                    highest_points: active.record.highest_points,
                    active_id: Some(active.record.id),
                    reversal_event_time: active.record.reversal_event_time,
                },
            }
        };

        *self.snapshot.lock().await = snapshot;

        let mut subs = self.subscribers.lock().await;
        subs.retain(|ch| !ch.is_closed());
        for ch in subs.iter() {
            let _ = ch.send(snapshot).await;
        }
    }

    async fn current_config(&self) -> Arc<ReversalConfig> {
        Arc::clone(&*self.config.lock().await)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Total reversal evidence from the latest upstream snapshots.
///
/// Each contribution is a linear ramp clamped to `[0, weight]`:
/// liquidity maps bid dominance 50→100 onto its weight, each coins
/// basket maps mean state -2→+2 onto its weight. With weights summing
/// to 100 the total is always within `[0, 100]`.
pub fn score(
    weights: &ReversalWeights,
    liquidity: &CompactLiquidityState,
    coins: &CoinsSnapshot,
) -> f64 {
    liquidity_contribution(weights.liquidity, liquidity.bid_dominance)
        + coins_contribution(weights.coins_quote, coins.quote)
        + coins_contribution(weights.coins_base, coins.base)
}

fn liquidity_contribution(weight: f64, bid_dominance: f64) -> f64 {
    let progress = ((bid_dominance - 50.0) / 50.0).clamp(0.0, 1.0);
    weight * progress
}

fn coins_contribution(weight: f64, state: State) -> f64 {
    let progress = ((f64::from(state.value()) + 2.0) / 4.0).clamp(0.0, 1.0);
    weight * progress
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> ReversalWeights {
        ReversalWeights {
            liquidity: 35.0,
            coins_quote: 35.0,
            coins_base: 30.0,
        }
    }

    fn liquidity(dominance: f64) -> CompactLiquidityState {
        CompactLiquidityState {
            bid_dominance: dominance,
        }
    }

    fn coins(quote: State, base: State) -> CoinsSnapshot {
        CoinsSnapshot { quote, base }
    }

    #[test]
    fn fully_reversed_inputs_score_one_hundred() {
        let points = score(
            &weights(),
            &liquidity(100.0),
            &coins(State::StrongIncrease, State::StrongIncrease),
        );

        assert_eq!(points, 100.0);
    }

    #[test]
    fn crash_conditions_score_zero() {
        let points = score(
            &weights(),
            &liquidity(20.0),
            &coins(State::StrongDecrease, State::StrongDecrease),
        );

        assert_eq!(points, 0.0);
    }

    #[test]
    fn each_contribution_is_capped_at_its_weight() {
        assert_eq!(liquidity_contribution(35.0, 250.0), 35.0);
        assert_eq!(coins_contribution(30.0, State::StrongIncrease), 30.0);
    }

    #[test]
    fn contributions_are_monotonic() {
        assert!(liquidity_contribution(35.0, 60.0) < liquidity_contribution(35.0, 80.0));
        assert!(
            coins_contribution(35.0, State::Neutral) < coins_contribution(35.0, State::Increase)
        );
    }

    #[test]
    fn neutral_inputs_score_midway() {
        let points = score(
            &weights(),
            &liquidity(50.0),
            &coins(State::Neutral, State::Neutral),
        );

        // Liquidity at 50 contributes nothing; neutral baskets sit at
        // half their weight.
        assert_eq!(points, 32.5);
    }
}
