//! Synchronized order-book state.
//!
//! Diff-depth semantics:
//!   • A diff whose `final_update_id` is at or below the snapshot's
//!     `last_update_id` is stale (already reflected in the snapshot)
//!     and must leave the book untouched.
//!   • A zero quantity removes the price level; the maps never store
//!     zero-quantity levels.
//!   • Applying diffs does not advance the staleness bound; only a
//!     wholesale snapshot replacement updates `last_update_id`. The
//!     periodic re-snapshot self-heals any drift from missed diffs.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::types::{OrderBookDiff, OrderBookSnapshot};

/// Outcome of applying one diff message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    Applied,
    /// Older than the snapshot boundary; discarded without touching
    /// the book.
    Stale,
}

#[derive(Debug, Default, Clone)]
pub struct OrderBook {
    asks: BTreeMap<Decimal, Decimal>,
    bids: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
}

impl OrderBook {
    pub fn from_snapshot(snapshot: OrderBookSnapshot) -> Self {
        let mut book = Self::default();
        book.replace(snapshot);
        book
    }

    /// Adopt a fresh REST snapshot wholesale, discarding local state.
    pub fn replace(&mut self, snapshot: OrderBookSnapshot) {
        self.asks.clear();
        self.bids.clear();
        self.last_update_id = snapshot.last_update_id;

        for (price, qty) in snapshot.asks {
            if qty > Decimal::ZERO {
                self.asks.insert(price, qty);
            }
        }
        for (price, qty) in snapshot.bids {
            if qty > Decimal::ZERO {
                self.bids.insert(price, qty);
            }
        }
    }

    /// Apply one diff message, upserting and deleting levels on both
    /// sides. Stale diffs are discarded whole.
    pub fn apply_diff(&mut self, diff: &OrderBookDiff) -> DiffOutcome {
        if diff.final_update_id <= self.last_update_id {
            return DiffOutcome::Stale;
        }

        for (price, qty) in &diff.asks {
            apply_level(&mut self.asks, *price, *qty);
        }
        for (price, qty) in &diff.bids {
            apply_level(&mut self.bids, *price, *qty);
        }

        DiffOutcome::Applied
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// Mid price between the best bid and best ask; `None` while
    /// either side is empty.
    pub fn mid_price(&self) -> Option<Decimal> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        Some((bid + ask) / Decimal::TWO)
    }

    pub fn ask_quantity(&self, price: Decimal) -> Option<Decimal> {
        self.asks.get(&price).copied()
    }

    pub fn bid_quantity(&self, price: Decimal) -> Option<Decimal> {
        self.bids.get(&price).copied()
    }

    pub fn levels(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Bid levels with price inside `[low, high]`, best first.
    pub fn bids_in_band(&self, low: Decimal, high: Decimal) -> Vec<(Decimal, Decimal)> {
        self.bids
            .range(low..=high)
            .rev()
            .map(|(p, q)| (*p, *q))
            .collect()
    }

    /// Ask levels with price inside `[low, high]`, best first.
    pub fn asks_in_band(&self, low: Decimal, high: Decimal) -> Vec<(Decimal, Decimal)> {
        self.asks.range(low..=high).map(|(p, q)| (*p, *q)).collect()
    }
}

fn apply_level(side: &mut BTreeMap<Decimal, Decimal>, price: Decimal, qty: Decimal) {
    if qty == Decimal::ZERO {
        side.remove(&price);
    } else {
        side.insert(price, qty);
    }
}
