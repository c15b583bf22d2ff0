mod mock_gateway;

use std::sync::Arc;
use std::time::Duration;

use market::coins::CoinsEngine;
use market::config::{CoinsConfig, InMemoryConfigCell};
use market::types::{BasketAsset, State, TickerEvent};

use mock_gateway::MockGateway;

fn config() -> CoinsConfig {
    CoinsConfig {
        window_size: 100,
        interval_secs: 10,
        requirement_pct: 1.0,
        strong_requirement_pct: 5.0,
        max_symbols: 2,
        whitelisted_symbols: vec!["ETH".into(), "SOL".into(), "XRP".into()],
        quote_pair: "USDT".into(),
        base_pair: "BTC".into(),
    }
}

async fn started_engine(gateway: Arc<MockGateway>) -> Arc<CoinsEngine<MockGateway>> {
    let engine = CoinsEngine::new(gateway, Arc::new(InMemoryConfigCell::new()), config());
    engine.start().await;

    // Bootstrap runs inside a spawned task; give it a moment to
    // resolve membership and open both streams.
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
}

fn tick(symbol: &str, price: f64) -> TickerEvent {
    TickerEvent {
        symbol: symbol.into(),
        price,
    }
}

const INTERVAL_MS: i64 = 10_000;

#[tokio::test]
async fn bootstrap_resolves_membership_and_opens_both_streams() {
    let gateway = Arc::new(MockGateway::default());
    *gateway.top_symbols.lock().await = vec!["ETH".into(), "SOL".into(), "XRP".into()];

    let engine = started_engine(Arc::clone(&gateway)).await;

    let streams = gateway.ticker_senders.lock().await;
    assert_eq!(streams.len(), 2, "one stream per basket");

    let mut stream_symbols: Vec<Vec<String>> =
        streams.iter().map(|(symbols, _)| symbols.clone()).collect();
    stream_symbols.iter_mut().for_each(|s| s.sort());

    // max_symbols caps membership at two; each basket gets its pair suffix.
    assert!(stream_symbols.contains(&vec!["ETHUSDT".into(), "SOLUSDT".into()]));
    assert!(stream_symbols.contains(&vec!["ETHBTC".into(), "SOLBTC".into()]));

    engine.stop().await;
}

#[tokio::test]
async fn streamed_ticks_reach_the_baskets() {
    let gateway = Arc::new(MockGateway::default());
    *gateway.top_symbols.lock().await = vec!["ETH".into()];

    let engine = started_engine(Arc::clone(&gateway)).await;

    {
        let streams = gateway.ticker_senders.lock().await;
        for (symbols, sender) in streams.iter() {
            sender.send(tick(&symbols[0], 100.0)).await.unwrap();
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(
        engine
            .get_state_for_symbol(BasketAsset::Quote, "ETHUSDT")
            .await
            .is_some()
    );
    assert!(
        engine
            .get_state_for_symbol(BasketAsset::Base, "ETHBTC")
            .await
            .is_some()
    );

    engine.stop().await;
}

#[tokio::test]
async fn declining_basket_classifies_below_neutral() {
    let gateway = Arc::new(MockGateway::default());
    *gateway.top_symbols.lock().await = vec!["ETH".into(), "SOL".into()];

    let engine = started_engine(Arc::clone(&gateway)).await;

    // One tick per bucket, steadily falling, for both quote symbols.
    // Enough buckets that even the smallest split spans two closes.
    for symbol in ["ETHUSDT", "SOLUSDT"] {
        for i in 0..60i64 {
            let price = 1_000.0 - 10.0 * i as f64;
            engine
                .handle_ticker(BasketAsset::Quote, tick(symbol, price), i * INTERVAL_MS)
                .await;
        }
    }

    engine.recompute_once().await;

    let quote = engine.get_state(BasketAsset::Quote).await;
    assert_eq!(quote, State::StrongDecrease);

    // The base basket never ticked and stays neutral.
    assert_eq!(engine.get_state(BasketAsset::Base).await, State::Neutral);

    engine.stop().await;
}

#[tokio::test]
async fn ticks_for_unknown_symbols_are_dropped() {
    let gateway = Arc::new(MockGateway::default());
    *gateway.top_symbols.lock().await = vec!["ETH".into()];

    let engine = started_engine(Arc::clone(&gateway)).await;

    engine
        .handle_ticker(BasketAsset::Quote, tick("DOGEUSDT", 0.1), 0)
        .await;

    assert!(
        engine
            .get_state_for_symbol(BasketAsset::Quote, "DOGEUSDT")
            .await
            .is_none()
    );

    engine.stop().await;
}

#[tokio::test]
async fn self_check_evicts_symbols_that_never_ticked() {
    let gateway = Arc::new(MockGateway::default());
    *gateway.top_symbols.lock().await = vec!["ETH".into(), "SOL".into()];

    let engine = started_engine(Arc::clone(&gateway)).await;

    engine
        .handle_ticker(BasketAsset::Quote, tick("ETHUSDT", 100.0), 0)
        .await;

    engine.run_self_check().await;

    assert!(
        engine
            .get_state_for_symbol(BasketAsset::Quote, "ETHUSDT")
            .await
            .is_some()
    );
    assert!(
        engine
            .get_state_for_symbol(BasketAsset::Quote, "SOLUSDT")
            .await
            .is_none(),
        "silent symbol must be evicted"
    );

    engine.stop().await;
}

#[tokio::test]
async fn snapshots_are_broadcast_on_recomputation() {
    let gateway = Arc::new(MockGateway::default());
    *gateway.top_symbols.lock().await = vec!["ETH".into()];

    let engine = started_engine(Arc::clone(&gateway)).await;
    let mut rx = engine.subscribe().await;

    engine.recompute_once().await;

    let snapshot = rx.recv().await.expect("recompute broadcast");
    assert_eq!(snapshot.quote, State::Neutral);
    assert_eq!(snapshot.base, State::Neutral);

    engine.stop().await;
}

#[tokio::test]
async fn reconfiguration_resets_the_baskets() {
    let gateway = Arc::new(MockGateway::default());
    *gateway.top_symbols.lock().await = vec!["ETH".into()];

    let engine = started_engine(Arc::clone(&gateway)).await;

    engine
        .handle_ticker(BasketAsset::Quote, tick("ETHUSDT", 100.0), 0)
        .await;

    let mut new_cfg = config();
    new_cfg.max_symbols = 1;
    engine.update_configuration(new_cfg).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Old series are gone; the rebuilt membership starts fresh.
    let state = engine
        .get_state_for_symbol(BasketAsset::Quote, "ETHUSDT")
        .await
        .expect("symbol re-resolved after restart");
    assert_eq!(state.mean, State::Neutral);

    engine.stop().await;
}
