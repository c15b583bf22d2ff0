use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Five-value trend classification shared by every engine.
///
/// The integer representation (-2..=2) is what gets averaged when a
/// mean-of-splits or mean-of-symbols state is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i8)]
pub enum State {
    StrongDecrease = -2,
    Decrease = -1,
    Neutral = 0,
    Increase = 1,
    StrongIncrease = 2,
}

impl State {
    pub fn value(self) -> i8 {
        self as i8
    }
}

impl TryFrom<i8> for State {
    type Error = anyhow::Error;

    fn try_from(v: i8) -> Result<Self, Self::Error> {
        match v {
            -2 => Ok(State::StrongDecrease),
            -1 => Ok(State::Decrease),
            0 => Ok(State::Neutral),
            1 => Ok(State::Increase),
            2 => Ok(State::StrongIncrease),
            other => Err(anyhow::anyhow!("invalid state value: {}", other)),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::Neutral
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Identifies how much of the tail of a series a split examines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SplitId {
    S100,
    S75,
    S50,
    S25,
    S15,
    S10,
    S5,
    S2,
}

impl SplitId {
    pub const ALL: [SplitId; 8] = [
        SplitId::S100,
        SplitId::S75,
        SplitId::S50,
        SplitId::S25,
        SplitId::S15,
        SplitId::S10,
        SplitId::S5,
        SplitId::S2,
    ];

    /// Fraction of the series tail covered by this split.
    pub fn fraction(self) -> f64 {
        match self {
            SplitId::S100 => 1.0,
            SplitId::S75 => 0.75,
            SplitId::S50 => 0.5,
            SplitId::S25 => 0.25,
            SplitId::S15 => 0.15,
            SplitId::S10 => 0.10,
            SplitId::S5 => 0.05,
            SplitId::S2 => 0.02,
        }
    }
}

/// Per-split classification outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitResult {
    pub state: State,
    /// Signed percent change over the split's sub-series, 2-decimal precision.
    pub change: f64,
}

/// Full classification outcome: one result per split plus the
/// classified mean of the eight per-split states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateResult {
    pub mean: State,
    pub splits: BTreeMap<SplitId, SplitResult>,
}

/// Candle interval used by the window engine when fetching history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleInterval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
}

impl CandleInterval {
    pub fn as_secs(self) -> u64 {
        match self {
            CandleInterval::OneMinute => 60,
            CandleInterval::FiveMinutes => 300,
            CandleInterval::FifteenMinutes => 900,
            CandleInterval::ThirtyMinutes => 1_800,
            CandleInterval::OneHour => 3_600,
        }
    }
}

/// One OHLC candlestick as delivered by the exchange gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candlestick {
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// REST order-book snapshot. Levels are (price, quantity) pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub last_update_id: u64,
    pub asks: Vec<(Decimal, Decimal)>,
    pub bids: Vec<(Decimal, Decimal)>,
}

/// One message from the diff-depth stream. A zero quantity means the
/// price level was removed on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookDiff {
    pub final_update_id: u64,
    pub asks: Vec<(Decimal, Decimal)>,
    pub bids: Vec<(Decimal, Decimal)>,
}

/// Live price tick for a single symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerEvent {
    pub symbol: String,
    pub price: f64,
}

/// Which coins basket a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BasketAsset {
    /// Symbols priced against the stable quote asset (e.g. vs USDT).
    Quote,
    /// Symbols priced against the primary traded asset (e.g. vs BTC).
    Base,
}

/// Immutable snapshot published by the window engine on every
/// recomputation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub state: StateResult,
    /// The two most recent candles (the live one last).
    pub last_candles: Vec<Candlestick>,
}

/// Immutable snapshot published by the coins engine: one classified
/// mean per basket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CoinsSnapshot {
    pub quote: State,
    pub base: State,
}

/// Immutable snapshot published by the liquidity engine.
///
/// `bid_dominance` is always within [0, 100]; 50 is the pristine
/// no-data default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompactLiquidityState {
    pub bid_dominance: f64,
}

impl Default for CompactLiquidityState {
    fn default() -> Self {
        Self {
            bid_dominance: 50.0,
        }
    }
}
