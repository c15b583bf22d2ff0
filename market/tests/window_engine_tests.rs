mod mock_gateway;

use std::sync::Arc;
use std::time::Duration;

use common::logger::init_logger;
use market::config::{InMemoryConfigCell, WindowConfig};
use market::types::{CandleInterval, State};
use market::window::{WindowEngine, WindowStatus};

use mock_gateway::{MockGateway, candle};

const MINUTE_MS: i64 = 60_000;

fn config(size: usize) -> WindowConfig {
    WindowConfig {
        refetch_frequency_secs: 3_600,
        size,
        interval: CandleInterval::OneMinute,
        requirement_pct: 1.0,
        strong_requirement_pct: 5.0,
    }
}

fn engine(gateway: Arc<MockGateway>, size: usize) -> Arc<WindowEngine<MockGateway>> {
    WindowEngine::new(gateway, Arc::new(InMemoryConfigCell::new()), config(size))
}

#[tokio::test]
async fn seed_fills_the_buffer_and_publishes_a_snapshot() {
    init_logger("window-engine-tests");
    let gateway = Arc::new(MockGateway::default());
    gateway
        .set_candles((0..100).map(|i| candle(i * MINUTE_MS, 100.0)).collect())
        .await;

    let engine = engine(Arc::clone(&gateway), 100);
    engine.start().await.unwrap();

    assert_eq!(engine.status().await, WindowStatus::Ready);

    let snapshot = engine.get_state().await.expect("seed publishes");
    assert_eq!(snapshot.state.mean, State::Neutral);
    assert_eq!(snapshot.last_candles.len(), 2);
    assert_eq!(snapshot.last_candles[1].open_time_ms, 99 * MINUTE_MS);

    engine.stop().await;
}

#[tokio::test]
async fn refetch_replaces_the_live_candle_in_place() {
    let gateway = Arc::new(MockGateway::default());
    gateway
        .set_candles((0..10).map(|i| candle(i * MINUTE_MS, 100.0)).collect())
        .await;

    let engine = engine(Arc::clone(&gateway), 10);
    engine.start().await.unwrap();

    // Same open time, new close: the still-forming candle moved.
    gateway
        .set_candles(vec![candle(8 * MINUTE_MS, 100.0), candle(9 * MINUTE_MS, 101.5)])
        .await;
    engine.refetch_once().await;

    let snapshot = engine.get_state().await.unwrap();
    assert_eq!(snapshot.last_candles.len(), 2);
    assert_eq!(snapshot.last_candles[1].open_time_ms, 9 * MINUTE_MS);
    assert_eq!(snapshot.last_candles[1].close, 101.5);

    engine.stop().await;
}

#[tokio::test]
async fn sharp_drop_flips_the_classified_mean() {
    let gateway = Arc::new(MockGateway::default());
    // Closes halve over the window: every split sees a strong decrease.
    gateway
        .set_candles(
            (0..50)
                .map(|i| candle(i * MINUTE_MS, 200.0 - 2.0 * i as f64))
                .collect(),
        )
        .await;

    let engine = engine(Arc::clone(&gateway), 50);
    engine.start().await.unwrap();

    let snapshot = engine.get_state().await.unwrap();
    assert_eq!(snapshot.state.mean, State::StrongDecrease);

    engine.stop().await;
}

#[tokio::test]
async fn subscribers_receive_every_recomputation() {
    let gateway = Arc::new(MockGateway::default());
    gateway
        .set_candles((0..10).map(|i| candle(i * MINUTE_MS, 100.0)).collect())
        .await;

    let engine = engine(Arc::clone(&gateway), 10);
    let mut rx = engine.subscribe().await;

    engine.start().await.unwrap();
    let seeded = rx.recv().await.expect("seed broadcast");
    assert_eq!(seeded.state.mean, State::Neutral);

    engine.refetch_once().await;
    let refetched = rx.recv().await.expect("refetch broadcast");
    assert_eq!(refetched.last_candles.len(), 2);

    engine.stop().await;
}

#[tokio::test]
async fn invalid_configuration_is_rejected_without_restart() {
    let gateway = Arc::new(MockGateway::default());
    gateway
        .set_candles((0..10).map(|i| candle(i * MINUTE_MS, 100.0)).collect())
        .await;

    let engine = engine(Arc::clone(&gateway), 10);
    engine.start().await.unwrap();

    let mut bad = config(10);
    bad.requirement_pct = bad.strong_requirement_pct;
    assert!(engine.update_configuration(bad).await.is_err());

    // The running engine and its config were not touched.
    assert_eq!(engine.status().await, WindowStatus::Ready);
    assert_eq!(engine.get_configuration().await.requirement_pct, 1.0);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn refetch_survives_transient_gateway_failures() {
    let gateway = Arc::new(MockGateway::default());
    gateway
        .set_candles((0..10).map(|i| candle(i * MINUTE_MS, 100.0)).collect())
        .await;

    let engine = engine(Arc::clone(&gateway), 10);
    engine.start().await.unwrap();

    gateway
        .candle_failures
        .store(2, std::sync::atomic::Ordering::SeqCst);
    gateway
        .set_candles(vec![candle(9 * MINUTE_MS, 100.0), candle(10 * MINUTE_MS, 99.0)])
        .await;

    // Paused clock: the retry backoff auto-advances.
    engine.refetch_once().await;

    let snapshot = engine.get_state().await.unwrap();
    assert_eq!(snapshot.last_candles[1].open_time_ms, 10 * MINUTE_MS);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_keep_the_previous_state() {
    let gateway = Arc::new(MockGateway::default());
    gateway
        .set_candles((0..10).map(|i| candle(i * MINUTE_MS, 100.0)).collect())
        .await;

    let engine = engine(Arc::clone(&gateway), 10);
    engine.start().await.unwrap();
    let before = engine.get_state().await.unwrap();

    // More failures than the schedule allows attempts.
    gateway
        .candle_failures
        .store(10, std::sync::atomic::Ordering::SeqCst);
    engine.refetch_once().await;

    let after = engine.get_state().await.unwrap();
    assert_eq!(after.last_candles, before.last_candles);
    assert_eq!(after.state.mean, before.state.mean);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_initial_seed_leaves_the_engine_uninitialized() {
    let gateway = Arc::new(MockGateway::default());
    gateway
        .set_candles((0..10).map(|i| candle(i * MINUTE_MS, 100.0)).collect())
        .await;
    // Outage longer than the retry schedule allows attempts.
    gateway
        .candle_failures
        .store(10, std::sync::atomic::Ordering::SeqCst);

    let engine = engine(Arc::clone(&gateway), 10);
    assert!(engine.start().await.is_err());
    assert_eq!(engine.status().await, WindowStatus::Uninitialized);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn engine_recovers_when_a_restart_hits_a_gateway_outage() {
    let gateway = Arc::new(MockGateway::default());
    gateway
        .set_candles((0..10).map(|i| candle(i * MINUTE_MS, 100.0)).collect())
        .await;

    let engine = engine(Arc::clone(&gateway), 10);
    engine.start().await.unwrap();

    // Exactly one exhausted retry schedule's worth of failures: the
    // restart's seed fails, then the outage clears.
    gateway
        .candle_failures
        .store(4, std::sync::atomic::Ordering::SeqCst);

    let mut cfg = config(10);
    cfg.refetch_frequency_secs = 1;
    engine.update_configuration(cfg).await.unwrap();

    // The timer retries the seed on its own; paused clock advances it.
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(engine.status().await, WindowStatus::Ready);
    assert!(engine.get_state().await.is_some());

    engine.stop().await;
}

#[tokio::test]
async fn refetch_loop_runs_on_the_configured_cadence() {
    let gateway = Arc::new(MockGateway::default());
    gateway
        .set_candles((0..10).map(|i| candle(i * MINUTE_MS, 100.0)).collect())
        .await;

    let mut cfg = config(10);
    cfg.refetch_frequency_secs = 1;

    let engine = WindowEngine::new(
        Arc::clone(&gateway),
        Arc::new(InMemoryConfigCell::new()),
        cfg,
    );
    engine.start().await.unwrap();

    let seeded = gateway.candle_calls.load(std::sync::atomic::Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let total = gateway.candle_calls.load(std::sync::atomic::Ordering::SeqCst);

    assert!(total > seeded, "refetch timer never fired");

    engine.stop().await;
}
