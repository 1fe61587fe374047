use mockito::{Matcher, Server};
use payment_reconciler::config::ExchangeConfig;
use payment_reconciler::services::{CacheService, ExchangeService, RateProviderKind};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn service(kind: RateProviderKind, url: String, api_key: Option<&str>) -> ExchangeService {
    let config = ExchangeConfig {
        provider: kind,
        coinmarketcap_api_key: api_key.map(str::to_string),
        cache_ttl: Duration::from_secs(300),
        base_url: Some(url),
    };
    ExchangeService::from_config(&config, Arc::new(CacheService::memory_only("test:"))).unwrap()
}

#[tokio::test]
async fn coingecko_table_is_cached_and_derives_fiat_prices() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v3/simple/price")
        .match_query(Matcher::UrlEncoded("include_24hr_change".into(), "true".into()))
        .with_status(200)
        .with_body(
            json!({
                "bitcoin": {"usd": 50000, "eur": 45000, "usd_24h_change": -2.5},
                "ethereum": {"usd": 2500},
                "tether": {"usd": "1.0"}
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let exchange = service(RateProviderKind::CoinGecko, server.url(), None);

    let table = assert_ok!(exchange.rates().await);
    assert_eq!(table.base, "USD");
    assert_eq!(table.rates["bitcoin"].usd_24h_change, dec!(-2.5));

    assert_eq!(exchange.get_rate("BTC", "eur").await, Some(dec!(45000)));
    // ETH has no EUR quote; derived through bitcoin's quotes.
    assert_eq!(exchange.get_rate("eth", "eur").await, Some(dec!(2250)));
    assert_eq!(exchange.convert(dec!(2), "eth", "btc").await, Some(dec!(0.1)));
    assert_eq!(exchange.convert(dec!(7), "usdt", "usd").await, Some(dec!(7)));

    mock.assert_async().await;
}

#[tokio::test]
async fn coinmarketcap_sends_api_key() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v1/cryptocurrency/quotes/latest")
        .match_query(Matcher::Any)
        .match_header("X-CMC_PRO_API_KEY", "cmc-key")
        .with_status(200)
        .with_body(
            json!({
                "data": {
                    "BTC": {"quote": {"USD": {"price": 61000.5, "percent_change_24h": 0.7}}},
                    "TRX": {"quote": {"USD": {"price": 0.12}}}
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let exchange = service(RateProviderKind::CoinMarketCap, server.url(), Some("cmc-key"));
    assert_eq!(exchange.get_rate("trx", "usd").await, Some(dec!(0.12)));
    assert_eq!(exchange.get_rate("bitcoin", "usd").await, Some(dec!(61000.5)));
    mock.assert_async().await;
}

#[tokio::test]
async fn coinmarketcap_without_key_fails_without_calling_out() {
    let server = Server::new_async().await;
    let exchange = service(RateProviderKind::CoinMarketCap, server.url(), None);
    assert_err!(exchange.rates().await);
    assert_eq!(exchange.get_rate("btc", "usd").await, None);
}

#[tokio::test]
async fn binance_change_comes_from_previous_close() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v3/ticker/price")
        .with_status(200)
        .with_body(
            json!([
                {"symbol": "BTCUSDT", "price": "55000.00"},
                {"symbol": "SOLUSDT", "price": "150.00"},
                {"symbol": "DOGEUSDT", "price": "0.1"}
            ])
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", "/api/v3/ticker/24hr")
        .with_status(200)
        .with_body(
            json!([
                {"symbol": "BTCUSDT", "prevClosePrice": "50000.00"},
                {"symbol": "SOLUSDT", "prevClosePrice": "0"}
            ])
            .to_string(),
        )
        .create_async()
        .await;

    let exchange = service(RateProviderKind::Binance, server.url(), None);
    let table = exchange.rates().await.unwrap();
    assert_eq!(table.rates["bitcoin"].usd_24h_change, dec!(10));
    assert_eq!(table.rates["solana"].usd_24h_change, dec!(0));
    assert!(!table.rates.contains_key("doge"));
}
