//! Exchange gateway seam.
//!
//! The engines never talk to an exchange directly; they depend on this
//! trait only. Streaming endpoints follow the channel convention used
//! across the workspace: the caller passes an mpsc `Sender` and the
//! gateway's worker pushes events into it until the receiving side is
//! dropped, at which point the worker shuts itself down. Dropping the
//! receiver is therefore the unsubscribe operation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tracing::warn;

use crate::types::{
    CandleInterval, Candlestick, OrderBookDiff, OrderBookSnapshot, TickerEvent,
};

/// Backoff delays applied between failed gateway calls.
pub const DEFAULT_RETRY_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(7),
];

#[async_trait]
pub trait ExchangeGateway: Send + Sync + 'static {
    /// Fetch up to `limit` candlesticks, oldest first.
    async fn get_candlesticks(
        &self,
        interval: CandleInterval,
        limit: usize,
        start_time_ms: Option<i64>,
    ) -> anyhow::Result<Vec<Candlestick>>;

    /// Fetch a full order-book snapshot for the primary pair.
    async fn get_order_book_snapshot(&self) -> anyhow::Result<OrderBookSnapshot>;

    /// Stream diff-depth messages for the primary pair into `sender`.
    /// The worker owns reconnection; it returns only once `sender` is
    /// closed.
    async fn subscribe_order_book_diffs(
        &self,
        sender: Sender<OrderBookDiff>,
    ) -> anyhow::Result<()>;

    /// Resolve the top `limit` symbols by volume out of `whitelist`.
    async fn get_top_symbols_by_volume(
        &self,
        whitelist: &[String],
        limit: usize,
    ) -> anyhow::Result<Vec<String>>;

    /// Stream price ticks for `symbols` into `sender`. Same lifecycle
    /// contract as `subscribe_order_book_diffs`.
    async fn subscribe_tickers(
        &self,
        symbols: &[String],
        sender: Sender<TickerEvent>,
    ) -> anyhow::Result<()>;
}

/// Run `op` until it succeeds or the schedule is exhausted.
///
/// Attempts = schedule length + 1; the delays are slept between
/// attempts. The last error is returned on exhaustion so the caller
/// can report it and keep serving its previous state.
pub async fn retry_with_schedule<T, F, Fut>(
    op_name: &str,
    schedule: &[Duration],
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last_err = None;

    for (attempt, delay) in schedule
        .iter()
        .map(Some)
        .chain(std::iter::once(None))
        .enumerate()
    {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(op = op_name, attempt, error = ?e, "gateway call failed");
                last_err = Some(e);
            }
        }

        match delay {
            Some(d) => tokio::time::sleep(*d).await,
            None => break,
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry schedule was empty")))
}

/// Run `op` until it succeeds, cycling the schedule forever.
///
/// Used where the caller cannot make progress at all without the
/// result (e.g. basket symbol resolution). Cancellation happens by
/// aborting the owning task.
pub async fn retry_persistent<T, F, Fut>(op_name: &str, schedule: &[Duration], mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut cycle = schedule.iter().cycle();

    loop {
        match op().await {
            Ok(value) => return value,
            Err(e) => {
                warn!(op = op_name, error = ?e, "gateway call failed; retrying");
            }
        }

        // Schedule is a compile-time non-empty list.
        if let Some(d) = cycle.next() {
            tokio::time::sleep(*d).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let schedule = [Duration::from_millis(1), Duration::from_millis(1)];

        let result = retry_with_schedule("test", &schedule, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("transient")
            }
            Ok(7u32)
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_last_error_on_exhaustion() {
        let schedule = [Duration::from_millis(1)];

        let result: anyhow::Result<u32> =
            retry_with_schedule("test", &schedule, || async { anyhow::bail!("down") }).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn persistent_retry_keeps_cycling_until_success() {
        let calls = AtomicUsize::new(0);
        let schedule = [Duration::from_millis(1)];

        let value = retry_persistent("test", &schedule, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 5 {
                anyhow::bail!("down")
            }
            Ok("up")
        })
        .await;

        assert_eq!(value, "up");
    }
}
