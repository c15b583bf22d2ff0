use serde::{Deserialize, Serialize};
use thiserror::Error;

use market::config::ConfigError;

pub type CrashId = uuid::Uuid;

/// Durable record of one price-crash episode.
///
/// Created in memory at IDLE→ACTIVE, mutated on every recomputation
/// while ACTIVE, written to storage exactly once at ACTIVE→COOLDOWN,
/// and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceCrashState {
    pub id: CrashId,
    pub highest_points: f64,
    pub final_points: f64,
    /// Activation timestamp, epoch ms.
    pub event_time: i64,
    /// Stamped at most once, when points first cross the requirement.
    pub reversal_event_time: Option<i64>,
}

impl PriceCrashState {
    pub fn new(id: CrashId, event_time: i64) -> Self {
        Self {
            id,
            highest_points: 0.0,
            final_points: 0.0,
            event_time,
            reversal_event_time: None,
        }
    }
}

/// Contribution weights per upstream source. Must sum to 100.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReversalWeights {
    pub liquidity: f64,
    pub coins_quote: f64,
    pub coins_base: f64,
}

impl ReversalWeights {
    pub fn total(&self) -> f64 {
        self.liquidity + self.coins_quote + self.coins_base
    }
}

/// Reversal engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalConfig {
    /// How long an episode stays ACTIVE.
    pub crash_duration_minutes: u64,

    /// Cooldown appended after deactivation, during which no new
    /// episode may start.
    pub crash_idle_duration_minutes: u64,

    /// Points at which the reversal event fires. Range 50..=100.
    pub points_requirement: f64,

    pub weights: ReversalWeights,
}

impl ReversalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crash_duration_minutes == 0 {
            return Err(ConfigError::Invalid(
                "crash_duration_minutes must be > 0".into(),
            ));
        }
        if !(50.0..=100.0).contains(&self.points_requirement) {
            return Err(ConfigError::Invalid(
                "points_requirement must be within 50..=100".into(),
            ));
        }
        if (self.weights.total() - 100.0).abs() > f64::EPSILON {
            return Err(ConfigError::Invalid(format!(
                "weights must sum to 100, got {}",
                self.weights.total()
            )));
        }
        Ok(())
    }

    pub fn crash_duration_ms(&self) -> i64 {
        self.crash_duration_minutes as i64 * 60_000
    }

    pub fn crash_idle_duration_ms(&self) -> i64 {
        self.crash_idle_duration_minutes as i64 * 60_000
    }
}

/// Live episode state, owned exclusively by the engine.
#[derive(Debug, Clone)]
pub struct ActiveCrash {
    pub record: PriceCrashState,
    pub active_until_ms: i64,
    pub idle_until_ms: i64,
    /// Points from the most recent recomputation.
    pub points: f64,
}

/// Engine phase. The tagged representation is the state machine: no
/// optional-field null checks decide transitions.
#[derive(Debug, Clone)]
pub enum Phase {
    Idle,
    Active(ActiveCrash),
    Cooldown { until_ms: i64 },
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::Idle => PhaseKind::Idle,
            Phase::Active(_) => PhaseKind::Active,
            Phase::Cooldown { .. } => PhaseKind::Cooldown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseKind {
    Idle,
    Active,
    Cooldown,
}

/// Compact engine state published to consumers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReversalSnapshot {
    pub phase: PhaseKind,
    pub points: f64,
    pub highest_points: f64,
    pub active_id: Option<CrashId>,
    pub reversal_event_time: Option<i64>,
}

impl Default for ReversalSnapshot {
    fn default() -> Self {
        Self {
            phase: PhaseKind::Idle,
            points: 0.0,
            highest_points: 0.0,
            active_id: None,
            reversal_event_time: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ReversalError {
    #[error("invalid crash id '{0}'")]
    InvalidId(String),

    #[error("crash record {0} not found")]
    NotFound(CrashId),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
