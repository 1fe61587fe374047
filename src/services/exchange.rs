//! Crypto/fiat rate tables for reporting. Never consulted when matching
//! payments.

use crate::config::ExchangeConfig;
use crate::models::Network;
use crate::services::cache::{CacheKey, CacheService};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const FIAT_CURRENCIES: [&str; 10] = [
    "usd", "eur", "gbp", "jpy", "cny", "rub", "inr", "brl", "aud", "cad",
];

pub const STABLECOINS: [&str; 4] = ["usdt", "usdc", "dai", "busd"];

const REFERENCE_ASSET: &str = "bitcoin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateProviderKind {
    CoinGecko,
    CoinMarketCap,
    Binance,
}

impl RateProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateProviderKind::CoinGecko => "coingecko",
            RateProviderKind::CoinMarketCap => "coinmarketcap",
            RateProviderKind::Binance => "binance",
        }
    }

    pub fn default_url(&self) -> &'static str {
        match self {
            RateProviderKind::CoinGecko => "https://api.coingecko.com",
            RateProviderKind::CoinMarketCap => "https://pro-api.coinmarketcap.com",
            RateProviderKind::Binance => "https://api.binance.com",
        }
    }
}

impl fmt::Display for RateProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "coingecko" => Ok(RateProviderKind::CoinGecko),
            "coinmarketcap" | "cmc" => Ok(RateProviderKind::CoinMarketCap),
            "binance" => Ok(RateProviderKind::Binance),
            other => Err(format!("Unsupported rate provider: {}", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum RateError {
    #[error("Rate provider unreachable: {0}")]
    Http(String),

    #[error("Rate provider error: {0}")]
    Status(u16),

    #[error("Malformed rate response: {0}")]
    Decode(String),

    #[error("No API key configured for {0}")]
    MissingApiKey(RateProviderKind),
}

impl From<reqwest::Error> for RateError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RateError::Decode(e.to_string())
        } else {
            RateError::Http(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetRate {
    /// Lower-case fiat code to price of one unit.
    pub prices: BTreeMap<String, Decimal>,
    pub usd_24h_change: Decimal,
}

/// Normalized snapshot from any provider, keyed by asset name
/// (`bitcoin`, `polygon`, `usdt`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    pub provider: RateProviderKind,
    pub timestamp: DateTime<Utc>,
    pub base: String,
    pub rates: BTreeMap<String, AssetRate>,
}

impl RateTable {
    pub fn new(provider: RateProviderKind) -> Self {
        Self {
            provider,
            timestamp: Utc::now(),
            base: "USD".to_string(),
            rates: BTreeMap::new(),
        }
    }

    fn price(&self, asset: &str, fiat: &str) -> Option<Decimal> {
        self.rates
            .get(asset)?
            .prices
            .get(fiat)
            .copied()
            .filter(|p| *p > Decimal::ZERO)
    }
}

/// Maps tickers and network aliases onto the asset names rate tables use.
pub fn asset_name(symbol: &str) -> String {
    let lower = symbol.trim().to_lowercase();
    if STABLECOINS.contains(&lower.as_str()) || FIAT_CURRENCIES.contains(&lower.as_str()) {
        return lower;
    }
    match Network::from_str(&lower) {
        Ok(network) => network.as_str().to_string(),
        Err(_) => lower,
    }
}

fn is_fiat(name: &str) -> bool {
    FIAT_CURRENCIES.contains(&name)
}

fn is_stablecoin(name: &str) -> bool {
    STABLECOINS.contains(&name)
}

/// Reads a price that may arrive as a JSON number or string.
fn decimal_from(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    fn kind(&self) -> RateProviderKind;

    async fn fetch(&self) -> Result<RateTable, RateError>;
}

async fn get_json(request: reqwest::RequestBuilder) -> Result<Value, RateError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(RateError::Status(status.as_u16()));
    }
    response
        .json()
        .await
        .map_err(|e| RateError::Decode(e.to_string()))
}

pub struct CoinGeckoProvider {
    http: reqwest::Client,
    base_url: String,
}

impl CoinGeckoProvider {
    const IDS: [(&'static str, &'static str); 10] = [
        ("bitcoin", "bitcoin"),
        ("ethereum", "ethereum"),
        ("bnb", "binancecoin"),
        ("solana", "solana"),
        ("tron", "tron"),
        ("polygon", "matic-network"),
        ("usdt", "tether"),
        ("usdc", "usd-coin"),
        ("dai", "dai"),
        ("busd", "binance-usd"),
    ];

    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RateProvider for CoinGeckoProvider {
    fn kind(&self) -> RateProviderKind {
        RateProviderKind::CoinGecko
    }

    async fn fetch(&self) -> Result<RateTable, RateError> {
        let ids: Vec<&str> = Self::IDS.iter().map(|(_, id)| *id).collect();
        let request = self
            .http
            .get(format!("{}/api/v3/simple/price", self.base_url))
            .query(&[
                ("ids", ids.join(",")),
                ("vs_currencies", FIAT_CURRENCIES.join(",")),
                ("include_24hr_change", "true".to_string()),
            ]);
        let data = get_json(request).await?;

        let mut table = RateTable::new(self.kind());
        for (asset, id) in Self::IDS {
            let Some(coin) = data.get(id) else { continue };
            let prices: BTreeMap<String, Decimal> = FIAT_CURRENCIES
                .iter()
                .filter_map(|fiat| {
                    let price = coin.get(*fiat).and_then(decimal_from)?;
                    (price > Decimal::ZERO).then(|| (fiat.to_string(), price))
                })
                .collect();
            if !prices.contains_key("usd") {
                continue;
            }
            table.rates.insert(
                asset.to_string(),
                AssetRate {
                    prices,
                    usd_24h_change: coin
                        .get("usd_24h_change")
                        .and_then(decimal_from)
                        .unwrap_or_default(),
                },
            );
        }
        Ok(table)
    }
}

pub struct CoinMarketCapProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl CoinMarketCapProvider {
    const SYMBOLS: [(&'static str, &'static str); 10] = [
        ("BTC", "bitcoin"),
        ("ETH", "ethereum"),
        ("BNB", "bnb"),
        ("SOL", "solana"),
        ("TRX", "tron"),
        ("MATIC", "polygon"),
        ("USDT", "usdt"),
        ("USDC", "usdc"),
        ("DAI", "dai"),
        ("BUSD", "busd"),
    ];

    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl RateProvider for CoinMarketCapProvider {
    fn kind(&self) -> RateProviderKind {
        RateProviderKind::CoinMarketCap
    }

    async fn fetch(&self) -> Result<RateTable, RateError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(RateError::MissingApiKey(self.kind()))?;
        let symbols: Vec<&str> = Self::SYMBOLS.iter().map(|(s, _)| *s).collect();
        let request = self
            .http
            .get(format!("{}/v1/cryptocurrency/quotes/latest", self.base_url))
            .header("X-CMC_PRO_API_KEY", api_key)
            .header("Accept", "application/json")
            .query(&[("symbol", symbols.join(",")), ("convert", "USD".to_string())]);
        let data = get_json(request).await?;

        let mut table = RateTable::new(self.kind());
        for (symbol, asset) in Self::SYMBOLS {
            let Some(quote) = data.pointer(&format!("/data/{}/quote/USD", symbol)) else {
                continue;
            };
            let Some(price) = quote.get("price").and_then(decimal_from) else {
                continue;
            };
            if price <= Decimal::ZERO {
                continue;
            }
            table.rates.insert(
                asset.to_string(),
                AssetRate {
                    prices: BTreeMap::from([("usd".to_string(), price)]),
                    usd_24h_change: quote
                        .get("percent_change_24h")
                        .and_then(decimal_from)
                        .unwrap_or_default(),
                },
            );
        }
        Ok(table)
    }
}

pub struct BinanceProvider {
    http: reqwest::Client,
    base_url: String,
}

impl BinanceProvider {
    const PAIRS: [(&'static str, &'static str); 9] = [
        ("BTCUSDT", "bitcoin"),
        ("ETHUSDT", "ethereum"),
        ("BNBUSDT", "bnb"),
        ("SOLUSDT", "solana"),
        ("TRXUSDT", "tron"),
        ("MATICUSDT", "polygon"),
        ("USDCUSDT", "usdc"),
        ("DAIUSDT", "dai"),
        ("BUSDUSDT", "busd"),
    ];

    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RateProvider for BinanceProvider {
    fn kind(&self) -> RateProviderKind {
        RateProviderKind::Binance
    }

    async fn fetch(&self) -> Result<RateTable, RateError> {
        let tickers = get_json(
            self.http
                .get(format!("{}/api/v3/ticker/price", self.base_url)),
        )
        .await?;
        let stats = get_json(
            self.http
                .get(format!("{}/api/v3/ticker/24hr", self.base_url)),
        )
        .await?;

        let prev_close: HashMap<&str, Decimal> = stats
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|s| {
                Some((
                    s.get("symbol")?.as_str()?,
                    s.get("prevClosePrice").and_then(decimal_from)?,
                ))
            })
            .collect();
        let pairs: HashMap<&str, &str> = Self::PAIRS.into_iter().collect();

        let mut table = RateTable::new(self.kind());
        for ticker in tickers.as_array().into_iter().flatten() {
            let Some(symbol) = ticker.get("symbol").and_then(Value::as_str) else {
                continue;
            };
            let Some(asset) = pairs.get(symbol) else { continue };
            let Some(price) = ticker.get("price").and_then(decimal_from) else {
                continue;
            };
            if price <= Decimal::ZERO {
                continue;
            }
            let change = match prev_close.get(symbol) {
                Some(prev) if *prev > Decimal::ZERO => {
                    ((price - prev) / prev * Decimal::ONE_HUNDRED).round_dp(4)
                }
                _ => Decimal::ZERO,
            };
            table.rates.insert(
                asset.to_string(),
                AssetRate {
                    prices: BTreeMap::from([("usd".to_string(), price)]),
                    usd_24h_change: change,
                },
            );
        }
        Ok(table)
    }
}

/// Cache-aside access to one provider's rate table.
pub struct ExchangeService {
    provider: Arc<dyn RateProvider>,
    cache: Arc<CacheService>,
    ttl: Duration,
}

impl ExchangeService {
    pub fn new(provider: Arc<dyn RateProvider>, cache: Arc<CacheService>, ttl: Duration) -> Self {
        Self {
            provider,
            cache,
            ttl,
        }
    }

    pub fn from_config(config: &ExchangeConfig, cache: Arc<CacheService>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build rate provider HTTP client")?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| config.provider.default_url().to_string());

        let provider: Arc<dyn RateProvider> = match config.provider {
            RateProviderKind::CoinGecko => Arc::new(CoinGeckoProvider::new(http, base_url)),
            RateProviderKind::CoinMarketCap => Arc::new(CoinMarketCapProvider::new(
                http,
                base_url,
                config.coinmarketcap_api_key.clone(),
            )),
            RateProviderKind::Binance => Arc::new(BinanceProvider::new(http, base_url)),
        };
        Ok(Self::new(provider, cache, config.cache_ttl))
    }

    pub fn provider(&self) -> RateProviderKind {
        self.provider.kind()
    }

    fn cache_key(&self) -> String {
        CacheKey::new("rates")
            .partition(self.provider.kind().as_str())
            .fingerprint()
    }

    /// Latest table, from cache while fresh.
    pub async fn rates(&self) -> Result<RateTable, RateError> {
        let key = self.cache_key();
        if let Some(table) = self.cache.get::<RateTable>(&key).await {
            debug!(provider = %self.provider.kind(), "Rate table cache hit");
            return Ok(table);
        }
        self.refresh(&key).await
    }

    /// Bypasses the cache and stores the fresh table.
    pub async fn refresh_rates(&self) -> Result<RateTable, RateError> {
        let key = self.cache_key();
        self.refresh(&key).await
    }

    async fn refresh(&self, key: &str) -> Result<RateTable, RateError> {
        let table = self.provider.fetch().await.map_err(|e| {
            warn!(provider = %self.provider.kind(), "Failed to fetch rates: {}", e);
            e
        })?;
        if let Err(e) = self.cache.set(key, &table, self.ttl).await {
            warn!("Failed to cache rate table: {}", e);
        }
        Ok(table)
    }

    /// Price of one unit of `crypto` in `fiat`.
    pub async fn get_rate(&self, crypto: &str, fiat: &str) -> Option<Decimal> {
        let table = self.rates().await.ok()?;
        rate_in(&table, &asset_name(crypto), &fiat.trim().to_lowercase())
    }

    /// Converts between any two of: crypto assets, stablecoins, fiat.
    pub async fn convert(&self, amount: Decimal, from: &str, to: &str) -> Option<Decimal> {
        let from = asset_name(from);
        let to = asset_name(to);
        if let Some(direct) = convert_without_rates(amount, &from, &to) {
            return Some(direct);
        }
        let table = self.rates().await.ok()?;
        convert_with(&table, amount, &from, &to)
    }
}

fn rate_in(table: &RateTable, asset: &str, fiat: &str) -> Option<Decimal> {
    if let Some(price) = table.price(asset, fiat) {
        return Some(price);
    }
    let usd = table
        .price(asset, "usd")
        .or_else(|| is_stablecoin(asset).then_some(Decimal::ONE))?;
    if fiat == "usd" {
        return Some(usd);
    }
    // Derive the fiat price from the reference asset's quotes.
    let reference_fiat = table.price(REFERENCE_ASSET, fiat)?;
    let reference_usd = table.price(REFERENCE_ASSET, "usd")?;
    Some(usd * reference_fiat / reference_usd)
}

fn convert_without_rates(amount: Decimal, from: &str, to: &str) -> Option<Decimal> {
    if from == to {
        return Some(amount);
    }
    let usd_like = |c: &str| c == "usd" || is_stablecoin(c);
    if usd_like(from) && usd_like(to) {
        return Some(amount);
    }
    None
}

/// USD value of one unit of `currency`.
fn usd_value(table: &RateTable, currency: &str) -> Option<Decimal> {
    if currency == "usd" || (is_stablecoin(currency) && table.price(currency, "usd").is_none()) {
        return Some(Decimal::ONE);
    }
    if is_fiat(currency) {
        let btc_usd = table.price(REFERENCE_ASSET, "usd")?;
        let btc_fiat = table.price(REFERENCE_ASSET, currency)?;
        return Some(btc_usd / btc_fiat);
    }
    table.price(currency, "usd")
}

fn convert_with(table: &RateTable, amount: Decimal, from: &str, to: &str) -> Option<Decimal> {
    let from_usd = usd_value(table, from)?;
    let to_usd = usd_value(table, to)?;
    if to_usd.is_zero() {
        return None;
    }
    Some(amount * from_usd / to_usd)
}

/// Rounds toward zero to the currency's display precision.
pub fn format_currency(amount: Decimal, currency: &str, decimal_places: Option<u32>) -> String {
    let places = decimal_places.unwrap_or_else(|| default_places(currency));
    let rounded = amount.round_dp_with_strategy(places, RoundingStrategy::ToZero);
    format!("{:.*}", places as usize, rounded)
}

fn default_places(currency: &str) -> u32 {
    match currency.trim().to_lowercase().as_str() {
        "btc" | "bitcoin" => 8,
        "eth" | "ethereum" | "bnb" => 6,
        "sol" | "solana" | "matic" | "polygon" => 4,
        "jpy" => 0,
        _ => 2,
    }
}
