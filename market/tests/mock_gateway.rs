#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::mpsc::Sender;

use market::gateway::ExchangeGateway;
use market::types::{
    CandleInterval, Candlestick, OrderBookDiff, OrderBookSnapshot, TickerEvent,
};

/// Scripted gateway for engine tests. Candles and snapshots are served
/// from in-memory fixtures; streaming endpoints stash their senders so
/// the test can push events by hand.
#[derive(Default)]
pub struct MockGateway {
    pub candles: Mutex<Vec<Candlestick>>,
    pub snapshots: Mutex<Vec<OrderBookSnapshot>>,
    pub top_symbols: Mutex<Vec<String>>,
    pub diff_senders: Mutex<Vec<Sender<OrderBookDiff>>>,
    pub ticker_senders: Mutex<Vec<(Vec<String>, Sender<TickerEvent>)>>,
    /// Remaining forced failures per endpoint.
    pub candle_failures: AtomicUsize,
    pub snapshot_failures: AtomicUsize,
    pub candle_calls: AtomicUsize,
    snapshot_cursor: AtomicUsize,
}

impl MockGateway {
    pub async fn set_candles(&self, candles: Vec<Candlestick>) {
        *self.candles.lock().await = candles;
    }

    /// Snapshots are consumed front-first; the last one keeps serving.
    pub async fn push_snapshot(&self, snapshot: OrderBookSnapshot) {
        self.snapshots.lock().await.push(snapshot);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn get_candlesticks(
        &self,
        _interval: CandleInterval,
        limit: usize,
        _start_time_ms: Option<i64>,
    ) -> anyhow::Result<Vec<Candlestick>> {
        self.candle_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.candle_failures) {
            anyhow::bail!("scripted candle failure");
        }

        let candles = self.candles.lock().await;
        let tail = candles.len().saturating_sub(limit);
        Ok(candles[tail..].to_vec())
    }

    async fn get_order_book_snapshot(&self) -> anyhow::Result<OrderBookSnapshot> {
        if Self::take_failure(&self.snapshot_failures) {
            anyhow::bail!("scripted snapshot failure");
        }

        let snapshots = self.snapshots.lock().await;
        if snapshots.is_empty() {
            anyhow::bail!("no snapshot scripted");
        }

        // Serve each scripted snapshot exactly once, in push order,
        // then keep serving the newest.
        let cursor = self.snapshot_cursor.fetch_add(1, Ordering::SeqCst);
        Ok(snapshots[cursor.min(snapshots.len() - 1)].clone())
    }

    async fn subscribe_order_book_diffs(
        &self,
        sender: Sender<OrderBookDiff>,
    ) -> anyhow::Result<()> {
        self.diff_senders.lock().await.push(sender);
        Ok(())
    }

    async fn get_top_symbols_by_volume(
        &self,
        whitelist: &[String],
        limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        let top = self.top_symbols.lock().await;
        Ok(top
            .iter()
            .filter(|s| whitelist.contains(s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn subscribe_tickers(
        &self,
        symbols: &[String],
        sender: Sender<TickerEvent>,
    ) -> anyhow::Result<()> {
        self.ticker_senders
            .lock()
            .await
            .push((symbols.to_vec(), sender));
        Ok(())
    }
}

/// Flat candle fixture with a one-minute span.
pub fn candle(open_time_ms: i64, close: f64) -> Candlestick {
    Candlestick {
        open_time_ms,
        close_time_ms: open_time_ms + 59_999,
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
    }
}
