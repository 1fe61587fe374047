use crate::ledger::{tokens::default_tokens, AmountMatchPolicy};
use crate::models::{Network, WalletAddress};
use crate::services::exchange::RateProviderKind;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Testnet,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Testnet => "testnet",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(format!("Unknown store backend: {}", other)),
        }
    }
}

/// Where one network's explorer lives.
#[derive(Debug, Clone)]
pub struct ExplorerEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExplorerConfig {
    pub api_keys: HashMap<Network, String>,
    pub base_urls: HashMap<Network, String>,
    pub timeout: Duration,
    /// Requests per second, applied separately to each network.
    pub rate_limit_per_second: u32,
    pub cache_ttls: HashMap<Network, Duration>,
    pub match_policy: AmountMatchPolicy,
}

impl ExplorerConfig {
    pub fn endpoint(&self, network: Network) -> ExplorerEndpoint {
        ExplorerEndpoint {
            base_url: self
                .base_urls
                .get(&network)
                .cloned()
                .unwrap_or_else(|| network.default_explorer_url().to_string()),
            api_key: self.api_keys.get(&network).cloned(),
        }
    }
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            api_keys: HashMap::new(),
            base_urls: HashMap::new(),
            timeout: Duration::from_secs(10),
            rate_limit_per_second: 5,
            cache_ttls: Network::ALL
                .iter()
                .map(|n| (*n, n.default_cache_ttl()))
                .collect(),
            match_policy: AmountMatchPolicy::AtLeast,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub redis_url: Option<String>,
    pub prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            prefix: "reconciler:".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub max_age_minutes: i64,
    /// Verifications in flight at once within one sweep.
    pub concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_age_minutes: 60,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub interval: Duration,
    pub payment_link_base_url: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            payment_link_base_url: "http://localhost:8080/pay".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub webhook_url: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub provider: RateProviderKind,
    pub coinmarketcap_api_key: Option<String>,
    pub cache_ttl: Duration,
    /// Overrides the provider's public endpoint.
    pub base_url: Option<String>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            provider: RateProviderKind::CoinGecko,
            coinmarketcap_api_key: None,
            cache_ttl: Duration::from_secs(300),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    pub simulation_mode: bool,

    pub explorer: ExplorerConfig,
    pub cache: CacheConfig,
    pub reconciler: ReconcilerConfig,
    pub billing: BillingConfig,
    pub notifications: NotificationConfig,
    pub exchange: ExchangeConfig,

    pub store_backend: StoreBackend,
    pub redis_url: Option<String>,
    /// Merchant-less receiving addresses seeded at startup.
    pub wallets: Vec<WalletAddress>,

    pub operator_rate_limit_per_second: u32,
    pub worker_shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&var);
        let environment = Self::parse_environment(vars.get("ENVIRONMENT"))?;

        let redis_url = vars.get("REDIS_URL");

        let mut explorer = ExplorerConfig {
            timeout: Duration::from_secs(vars.parse("EXPLORER_TIMEOUT_SECS", 10)?),
            rate_limit_per_second: vars.parse("EXPLORER_RATE_LIMIT_PER_SECOND", 5)?,
            match_policy: vars.parse_with("AMOUNT_MATCH_POLICY", AmountMatchPolicy::AtLeast)?,
            ..ExplorerConfig::default()
        };
        for network in Network::ALL {
            if let Some(key_var) = api_key_var(network) {
                if let Some(key) = vars.get(key_var) {
                    explorer.api_keys.insert(network, key);
                }
            }
            if let Some(url) = vars.get(&format!("{}_EXPLORER_URL", network.env_key())) {
                explorer.base_urls.insert(network, url.trim_end_matches('/').to_string());
            }
            let ttl_var = format!("CACHE_TTL_{}", network.env_key());
            let ttl = vars.parse(&ttl_var, network.default_cache_ttl().as_secs())?;
            explorer.cache_ttls.insert(network, Duration::from_secs(ttl));
        }

        let config = Self {
            environment,
            host: vars.get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: vars.parse("PORT", 8080)?,
            simulation_mode: vars.parse("SIMULATION_MODE", environment != Environment::Production)?,

            explorer,
            cache: CacheConfig {
                enabled: vars.parse("CACHE_ENABLED", true)?,
                redis_url: redis_url.clone(),
                prefix: vars
                    .get("CACHE_PREFIX")
                    .unwrap_or_else(|| CacheConfig::default().prefix),
            },
            reconciler: ReconcilerConfig {
                interval: Duration::from_secs(vars.parse("RECONCILE_INTERVAL_SECS", 60)?),
                max_age_minutes: vars.parse("VERIFY_MAX_AGE_MINUTES", 60)?,
                concurrency: vars.parse("VERIFY_CONCURRENCY", 4)?,
            },
            billing: BillingConfig {
                interval: Duration::from_secs(vars.parse("BILLING_INTERVAL_SECS", 3600)?),
                payment_link_base_url: vars
                    .get("PAYMENT_LINK_BASE_URL")
                    .map(|u| u.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| BillingConfig::default().payment_link_base_url),
            },
            notifications: NotificationConfig {
                max_retries: vars.parse("NOTIFY_MAX_RETRIES", 3)?,
                retry_delay: Duration::from_secs(vars.parse("NOTIFY_RETRY_DELAY_SECS", 5)?),
                webhook_url: vars.get("NOTIFY_WEBHOOK_URL"),
            },
            exchange: ExchangeConfig {
                provider: vars.parse_with("RATE_PROVIDER", RateProviderKind::CoinGecko)?,
                coinmarketcap_api_key: vars.get("COINMARKETCAP_API_KEY"),
                cache_ttl: Duration::from_secs(vars.parse("RATES_CACHE_TTL_SECS", 300)?),
                base_url: vars.get("RATES_API_URL"),
            },

            store_backend: vars.parse_with("STORE_BACKEND", StoreBackend::Memory)?,
            redis_url,
            wallets: Self::parse_wallets(&vars),

            operator_rate_limit_per_second: vars.parse("OPERATOR_RATE_LIMIT_PER_SECOND", 10)?,
            worker_shutdown_timeout: Duration::from_secs(
                vars.parse("WORKER_SHUTDOWN_TIMEOUT_SECS", 5)?,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    fn parse_environment(value: Option<String>) -> Result<Environment> {
        let env = value.unwrap_or_else(|| "development".to_string());

        match env.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testnet" | "test" => Ok(Environment::Testnet),
            "production" | "prod" => Ok(Environment::Production),
            _ => bail!("Unknown environment: {}", env),
        }
    }

    fn parse_wallets(vars: &Vars<'_>) -> Vec<WalletAddress> {
        let mut wallets = Vec::new();
        for network in Network::ALL {
            let base = format!("WALLET_ADDRESS_{}", network.env_key());
            if let Some(address) = vars.get(&base) {
                wallets.push(WalletAddress::new(network, address));
            }
            for token in default_tokens(network) {
                if let Some(address) = vars.get(&format!("{}_{}", base, token.symbol)) {
                    wallets.push(WalletAddress::new(network, address).token(token.symbol));
                }
            }
        }
        wallets
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("PORT must be non-zero");
        }
        for network in Network::ALL {
            let endpoint = self.explorer.endpoint(network);
            if !endpoint.base_url.starts_with("http") {
                bail!("{}_EXPLORER_URL must be HTTP(S) URL", network.env_key());
            }
        }
        if !self.billing.payment_link_base_url.starts_with("http") {
            bail!("PAYMENT_LINK_BASE_URL must be HTTP(S) URL");
        }
        if let Some(url) = &self.notifications.webhook_url {
            if !url.starts_with("http") {
                bail!("NOTIFY_WEBHOOK_URL must be HTTP(S) URL");
            }
        }
        if self.reconciler.interval.is_zero() || self.billing.interval.is_zero() {
            bail!("Worker intervals must be at least one second");
        }
        if self.reconciler.concurrency == 0 {
            bail!("VERIFY_CONCURRENCY must be at least 1");
        }
        if self.store_backend == StoreBackend::Redis && self.redis_url.is_none() {
            bail!("STORE_BACKEND=redis requires REDIS_URL");
        }

        if self.environment == Environment::Production && self.simulation_mode {
            tracing::warn!("Simulation mode is ON in production: payments will not be checked on-chain");
        }

        tracing::info!(
            "Configuration validated for {:?} environment",
            self.environment
        );

        Ok(())
    }
}

fn api_key_var(network: Network) -> Option<&'static str> {
    match network {
        Network::Bitcoin => None,
        Network::Ethereum => Some("ETHERSCAN_API_KEY"),
        Network::Bnb => Some("BSCSCAN_API_KEY"),
        Network::Polygon => Some("POLYGONSCAN_API_KEY"),
        Network::Tron => Some("TRONSCAN_API_KEY"),
        Network::Solana => Some("SOLSCAN_API_KEY"),
    }
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Invalid {}", key)),
            None => Ok(default),
        }
    }

    /// For enums whose parse error is a plain message.
    fn parse_with<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr<Err = String>,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("Invalid {}", key)),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(move |key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_any_variables() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert!(config.simulation_mode);
        assert_eq!(config.reconciler.interval, Duration::from_secs(60));
        assert_eq!(config.notifications.max_retries, 3);
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(
            config.explorer.cache_ttls[&Network::Bitcoin],
            Duration::from_secs(600)
        );
        assert_eq!(
            config.explorer.endpoint(Network::Ethereum).base_url,
            "https://api.etherscan.io"
        );
    }

    #[test]
    fn production_defaults_to_live_verification() {
        let config = config_from(&[("ENVIRONMENT", "production")]).unwrap();
        assert!(!config.simulation_mode);
    }

    #[test]
    fn reads_network_overrides_and_wallets() {
        let config = config_from(&[
            ("ETHERSCAN_API_KEY", "abc"),
            ("TRON_EXPLORER_URL", "http://localhost:9000/"),
            ("CACHE_TTL_SOLANA", "15"),
            ("WALLET_ADDRESS_BITCOIN", "bc1qexample"),
            ("WALLET_ADDRESS_TRON_USDT", "TWalletForUsdt"),
            ("AMOUNT_MATCH_POLICY", "exact"),
        ])
        .unwrap();

        let eth = config.explorer.endpoint(Network::Ethereum);
        assert_eq!(eth.api_key.as_deref(), Some("abc"));
        assert_eq!(
            config.explorer.endpoint(Network::Tron).base_url,
            "http://localhost:9000"
        );
        assert_eq!(config.explorer.cache_ttls[&Network::Solana], Duration::from_secs(15));
        assert_eq!(config.explorer.match_policy, AmountMatchPolicy::Exact);

        assert_eq!(config.wallets.len(), 2);
        let tron = config
            .wallets
            .iter()
            .find(|w| w.network == Network::Tron)
            .unwrap();
        assert_eq!(tron.token_type.as_deref(), Some("USDT"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config_from(&[("PORT", "not-a-port")]).is_err());
        assert!(config_from(&[("ENVIRONMENT", "staging")]).is_err());
        assert!(config_from(&[("STORE_BACKEND", "redis")]).is_err());
        assert!(config_from(&[("RECONCILE_INTERVAL_SECS", "0")]).is_err());
    }
}
