//! Engine configuration types and the versioned config storage seam.
//!
//! Every engine holds a cached, read-only `Arc` copy of its config and
//! swaps it atomically when `update_configuration` commits a validated
//! value to the backing `ConfigCell`. A recomputation in flight always
//! completes against exactly one config snapshot.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::CandleInterval;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("configuration storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Window engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Seconds between candle refetches.
    pub refetch_frequency_secs: u64,

    /// Number of candles kept in the rolling buffer.
    pub size: usize,

    /// Candle interval requested from the gateway.
    pub interval: CandleInterval,

    /// Percent change at which a split classifies as increase/decrease.
    pub requirement_pct: f64,

    /// Percent change at which a split classifies as strong.
    pub strong_requirement_pct: f64,
}

impl WindowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refetch_frequency_secs == 0 {
            return Err(ConfigError::Invalid(
                "refetch_frequency_secs must be > 0".into(),
            ));
        }
        if self.size < 2 {
            return Err(ConfigError::Invalid("size must be at least 2".into()));
        }
        validate_requirements(self.requirement_pct, self.strong_requirement_pct)
    }
}

/// Coins engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinsConfig {
    /// Number of price buckets kept per symbol.
    pub window_size: usize,

    /// Seconds a bucket stays open before the next one starts.
    pub interval_secs: u64,

    pub requirement_pct: f64,
    pub strong_requirement_pct: f64,

    /// Upper bound on basket size.
    pub max_symbols: usize,

    /// Candidate symbols, filtered by volume through the gateway.
    pub whitelisted_symbols: Vec<String>,

    /// Pair suffix for the quote-denominated basket (e.g. "USDT").
    pub quote_pair: String,

    /// Pair suffix for the base-denominated basket (e.g. "BTC").
    pub base_pair: String,
}

impl CoinsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size < 2 {
            return Err(ConfigError::Invalid("window_size must be at least 2".into()));
        }
        if self.interval_secs == 0 {
            return Err(ConfigError::Invalid("interval_secs must be > 0".into()));
        }
        if self.max_symbols == 0 {
            return Err(ConfigError::Invalid("max_symbols must be > 0".into()));
        }
        if self.whitelisted_symbols.is_empty() {
            return Err(ConfigError::Invalid(
                "whitelisted_symbols must not be empty".into(),
            ));
        }
        if self.quote_pair.is_empty() || self.base_pair.is_empty() {
            return Err(ConfigError::Invalid(
                "quote_pair and base_pair must not be empty".into(),
            ));
        }
        validate_requirements(self.requirement_pct, self.strong_requirement_pct)
    }
}

/// Liquidity engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityConfig {
    /// Half-width of the price band around the current price, percent.
    pub max_distance_from_price_pct: f64,

    /// Weight per intensity tier 1..=4. Tier 0 carries an implicit
    /// weight of 1.
    pub intensity_weights: BTreeMap<u8, f64>,
}

impl LiquidityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_distance_from_price_pct <= 0.0 {
            return Err(ConfigError::Invalid(
                "max_distance_from_price_pct must be > 0".into(),
            ));
        }
        for tier in 1..=4u8 {
            match self.intensity_weights.get(&tier) {
                Some(w) if *w >= 1.0 => {}
                Some(_) => {
                    return Err(ConfigError::Invalid(format!(
                        "intensity weight for tier {} must be >= 1",
                        tier
                    )));
                }
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "missing intensity weight for tier {}",
                        tier
                    )));
                }
            }
        }
        Ok(())
    }

    /// Weight applied to a level of the given intensity tier.
    pub fn weight_for(&self, tier: u8) -> f64 {
        if tier == 0 {
            return 1.0;
        }
        self.intensity_weights.get(&tier).copied().unwrap_or(1.0)
    }
}

fn validate_requirements(requirement: f64, strong: f64) -> Result<(), ConfigError> {
    if requirement <= 0.0 {
        return Err(ConfigError::Invalid("requirement_pct must be > 0".into()));
    }
    if requirement >= strong {
        return Err(ConfigError::Invalid(
            "requirement_pct must be < strong_requirement_pct".into(),
        ));
    }
    Ok(())
}

/// A config value together with its storage version.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Versioned, atomically-updatable configuration storage.
///
/// The cell is the single source of truth; engines only ever hold a
/// cached copy of the latest committed value.
#[async_trait]
pub trait ConfigCell<T: Clone + Send + Sync + 'static>: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<Versioned<T>>>;

    /// Commit a new value, returning the new version.
    async fn store(&self, value: T) -> anyhow::Result<u64>;
}

/// In-memory cell used by tests and by deployments without a real
/// config backend.
#[derive(Default)]
pub struct InMemoryConfigCell<T> {
    inner: Mutex<Option<Versioned<T>>>,
}

impl<T> InMemoryConfigCell<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ConfigCell<T> for InMemoryConfigCell<T> {
    async fn load(&self) -> anyhow::Result<Option<Versioned<T>>> {
        Ok(self.inner.lock().await.clone())
    }

    async fn store(&self, value: T) -> anyhow::Result<u64> {
        let mut guard = self.inner.lock().await;
        let version = guard.as_ref().map(|v| v.version + 1).unwrap_or(1);
        *guard = Some(Versioned { version, value });
        Ok(version)
    }
}
