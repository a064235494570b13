//! Runtime configuration.
//!
//! Three sources are combined once at startup into a [`BotConfig`]:
//! - `config.toml` with endpoint, trading, retry and logging settings (every
//!   field has a default, the file itself is optional), overridable with
//!   `BOT_*` environment variables;
//! - `markets.json` with the per-symbol market definitions;
//! - `WALLET_<id>_*` environment variables with the wallet secrets.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::Path,
    time::Duration,
};

use crate::types::{MarketId, MarketKind};

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub settings: Settings,
    pub markets: BTreeMap<String, MarketConfig>,
    pub wallets: Vec<WalletConfig>,
}

impl BotConfig {
    pub fn load(settings_path: impl AsRef<Path>, markets_path: impl AsRef<Path>) -> Result<Self> {
        let settings = Settings::from_file(settings_path)?;
        let markets = load_markets(markets_path)?;
        let wallets = wallets_from_env();
        Ok(Self {
            settings,
            markets,
            wallets,
        })
    }

    pub fn wallet(&self, id: &str) -> Result<&WalletConfig> {
        self.wallets
            .iter()
            .find(|wallet| wallet.id.eq_ignore_ascii_case(id))
            .with_context(|| format!("wallet {id} not configured (set WALLET_{id}_PRIVATE_KEY)"))
    }

    /// Resolves a CLI market selector (`all` or a symbol) to enabled markets.
    pub fn select_markets(&self, selector: &str) -> Result<Vec<MarketSpec>> {
        if selector.eq_ignore_ascii_case("all") {
            let selected: Vec<MarketSpec> = self
                .markets
                .iter()
                .filter(|(_, market)| market.enabled)
                .map(|(symbol, market)| MarketSpec::new(symbol, market))
                .collect();
            anyhow::ensure!(!selected.is_empty(), "no enabled markets in market config");
            return Ok(selected);
        }

        let (symbol, market) = self
            .markets
            .iter()
            .find(|(symbol, _)| symbol.eq_ignore_ascii_case(selector))
            .with_context(|| format!("unknown market symbol {selector}"))?;
        anyhow::ensure!(market.enabled, "market {symbol} is disabled");
        Ok(vec![MarketSpec::new(symbol, market)])
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub endpoints: EndpointsConfig,
    pub trading: TradingConfig,
    pub retry: RetryConfig,
    pub assessor: AssessorConfig,
    pub matching: MatchingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_chain_id")]
    pub testnet_chain_id: String,
    #[serde(default = "default_testnet_lcd")]
    pub testnet_lcd: String,
    #[serde(default = "default_testnet_indexer")]
    pub testnet_indexer: String,
    #[serde(default = "default_mainnet_lcd")]
    pub mainnet_lcd: String,
    #[serde(default = "default_mainnet_indexer")]
    pub mainnet_indexer: String,
    #[serde(default)]
    pub signer_library_path: Option<String>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_fee_denom")]
    pub fee_denom: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            testnet_chain_id: default_chain_id(),
            testnet_lcd: default_testnet_lcd(),
            testnet_indexer: default_testnet_indexer(),
            mainnet_lcd: default_mainnet_lcd(),
            mainnet_indexer: default_mainnet_indexer(),
            signer_library_path: None,
            gas_limit: default_gas_limit(),
            fee_denom: default_fee_denom(),
        }
    }
}

fn default_chain_id() -> String {
    "injective-888".to_string()
}

fn default_testnet_lcd() -> String {
    "https://testnet.sentry.lcd.injective.network".to_string()
}

fn default_testnet_indexer() -> String {
    "https://testnet.sentry.exchange.grpc-web.injective.network".to_string()
}

fn default_mainnet_lcd() -> String {
    "https://sentry.lcd.injective.network".to_string()
}

fn default_mainnet_indexer() -> String {
    "https://sentry.exchange.grpc-web.injective.network".to_string()
}

fn default_gas_limit() -> u64 {
    2_000_000
}

fn default_fee_denom() -> String {
    "inj".to_string()
}

/// One band of distance from the reference price.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TierConfig {
    pub min_distance_pct: f64,
    pub max_distance_pct: f64,
    pub orders_per_side: usize,
    pub size_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub cycle_interval_secs: u64,
    pub cycle_jitter_secs: u64,
    pub jitter_min_pct: f64,
    pub jitter_max_pct: f64,
    pub tiers: Vec<TierConfig>,
    pub push_undercut_pct: f64,
    pub push_levels: usize,
    pub push_size_multiplier: f64,
    pub derivative_margin_ratio: f64,
    pub max_orders_per_batch: usize,
    pub stale_distance_pct: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 20,
            cycle_jitter_secs: 5,
            jitter_min_pct: 0.05,
            jitter_max_pct: 0.15,
            tiers: default_tiers(),
            push_undercut_pct: 0.1,
            push_levels: 3,
            push_size_multiplier: 1.5,
            derivative_margin_ratio: 0.1,
            max_orders_per_batch: 40,
            stale_distance_pct: 5.0,
        }
    }
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            min_distance_pct: 0.05,
            max_distance_pct: 0.5,
            orders_per_side: 8,
            size_multiplier: 0.5,
        },
        TierConfig {
            min_distance_pct: 0.5,
            max_distance_pct: 2.0,
            orders_per_side: 5,
            size_multiplier: 1.0,
        },
        TierConfig {
            min_distance_pct: 2.0,
            max_distance_pct: 5.0,
            orders_per_side: 3,
            size_multiplier: 2.0,
        },
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub timeout_backoff_multiplier: f64,
    pub max_jitter_ms: u64,
    pub consecutive_sequence_threshold: u32,
    pub cooldown_secs: u64,
    pub refresh_throttle_ms: u64,
    pub settle_delay_ms: u64,
    pub query_timeout_secs: u64,
    pub broadcast_timeout_secs: u64,
    pub query_attempts: u32,
    pub query_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            timeout_backoff_multiplier: 2.0,
            max_jitter_ms: 250,
            consecutive_sequence_threshold: 5,
            cooldown_secs: 5,
            refresh_throttle_ms: 2_000,
            settle_delay_ms: 1_000,
            query_timeout_secs: 10,
            broadcast_timeout_secs: 15,
            query_attempts: 3,
            query_backoff_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn refresh_throttle(&self) -> Duration {
        Duration::from_millis(self.refresh_throttle_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssessorConfig {
    pub aggressive_gap_pct: f64,
    pub shift_gap_pct: f64,
    pub min_own_orders: usize,
}

impl Default for AssessorConfig {
    fn default() -> Self {
        Self {
            aggressive_gap_pct: 5.0,
            shift_gap_pct: 2.0,
            min_own_orders: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub enabled: bool,
    pub probability: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Daily,
    Size,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: String,
    pub prefix: String,
    pub rotation: Rotation,
    pub max_bytes: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            prefix: "trader".to_string(),
            rotation: Rotation::Daily,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Settings {
    /// Reads `config.toml` if it exists, otherwise starts from defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let data = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::from_toml_str(&data)?
        } else {
            Settings::default()
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        let raw: toml::Value = toml::from_str(data).context("Failed to parse TOML config")?;
        // Support a nested [bot] table or top-level sections.
        let nested = raw.get("bot").and_then(|v| v.as_table()).cloned();
        let table = match nested {
            Some(table) => toml::Value::Table(table),
            None => raw,
        };
        let settings: Settings = table
            .try_into()
            .context("Invalid bot config structure")?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        override_string("BOT_TESTNET_LCD", &mut self.endpoints.testnet_lcd);
        override_string("BOT_TESTNET_INDEXER", &mut self.endpoints.testnet_indexer);
        override_string("BOT_MAINNET_LCD", &mut self.endpoints.mainnet_lcd);
        override_string("BOT_MAINNET_INDEXER", &mut self.endpoints.mainnet_indexer);
        override_string("BOT_CHAIN_ID", &mut self.endpoints.testnet_chain_id);
        override_u64(
            "BOT_CYCLE_INTERVAL_SECS",
            &mut self.trading.cycle_interval_secs,
        );
        override_f64("BOT_PUSH_UNDERCUT_PCT", &mut self.trading.push_undercut_pct);
        override_u32("BOT_MAX_ATTEMPTS", &mut self.retry.max_attempts);
        override_u64("BOT_BASE_BACKOFF_MS", &mut self.retry.base_backoff_ms);
        override_u32(
            "BOT_SEQUENCE_ERROR_THRESHOLD",
            &mut self.retry.consecutive_sequence_threshold,
        );
        override_u64("BOT_SETTLE_DELAY_MS", &mut self.retry.settle_delay_ms);
        override_f64(
            "BOT_AGGRESSIVE_GAP_PCT",
            &mut self.assessor.aggressive_gap_pct,
        );
        override_f64("BOT_SHIFT_GAP_PCT", &mut self.assessor.shift_gap_pct);
        override_bool("BOT_MATCHING_ENABLED", &mut self.matching.enabled);
        override_f64("BOT_MATCHING_PROBABILITY", &mut self.matching.probability);
        override_string("BOT_LOG_DIR", &mut self.logging.directory);
        if let Ok(value) = env::var("INJ_SIGNER_PATH") {
            if !value.trim().is_empty() {
                self.endpoints.signer_library_path = Some(value.trim().to_string());
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (1..=10).contains(&self.retry.max_attempts),
            "retry.max_attempts must be between 1 and 10"
        );
        anyhow::ensure!(
            self.retry.timeout_backoff_multiplier > 1.0,
            "retry.timeout_backoff_multiplier must be greater than 1.0"
        );
        anyhow::ensure!(
            self.retry.consecutive_sequence_threshold > 0,
            "retry.consecutive_sequence_threshold must be positive"
        );
        anyhow::ensure!(
            self.retry.query_attempts > 0,
            "retry.query_attempts must be positive"
        );
        anyhow::ensure!(
            self.trading.cycle_interval_secs > 0,
            "trading.cycle_interval_secs must be positive"
        );
        anyhow::ensure!(
            self.trading.jitter_min_pct >= 0.0
                && self.trading.jitter_max_pct >= self.trading.jitter_min_pct
                && self.trading.jitter_max_pct < 1.0,
            "trading jitter must satisfy 0 <= min <= max < 1"
        );
        anyhow::ensure!(
            !self.trading.tiers.is_empty(),
            "trading.tiers must contain at least one tier"
        );
        for tier in &self.trading.tiers {
            anyhow::ensure!(
                tier.min_distance_pct >= 0.0 && tier.max_distance_pct >= tier.min_distance_pct,
                "tier distances must satisfy 0 <= min <= max"
            );
            anyhow::ensure!(
                tier.size_multiplier > 0.0,
                "tier size_multiplier must be positive"
            );
        }
        anyhow::ensure!(
            self.trading.derivative_margin_ratio > 0.0 && self.trading.derivative_margin_ratio <= 1.0,
            "trading.derivative_margin_ratio must be within (0, 1]"
        );
        anyhow::ensure!(
            self.trading.max_orders_per_batch > 0,
            "trading.max_orders_per_batch must be positive"
        );
        anyhow::ensure!(
            self.assessor.aggressive_gap_pct >= self.assessor.shift_gap_pct,
            "assessor.aggressive_gap_pct must be >= assessor.shift_gap_pct"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.matching.probability),
            "matching.probability must be within [0, 1]"
        );
        Ok(())
    }
}

/// Market definition as stored in `markets.json`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MarketConfig {
    pub testnet_market_id: MarketId,
    pub mainnet_market_id: MarketId,
    #[serde(rename = "type")]
    pub kind: MarketKind,
    pub spread_percent: f64,
    pub order_size: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A market selected for trading, keyed by its symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSpec {
    pub symbol: String,
    pub testnet_market_id: MarketId,
    pub mainnet_market_id: MarketId,
    pub kind: MarketKind,
    pub spread_percent: f64,
    pub order_size: f64,
}

impl MarketSpec {
    fn new(symbol: &str, market: &MarketConfig) -> Self {
        Self {
            symbol: symbol.to_string(),
            testnet_market_id: market.testnet_market_id.clone(),
            mainnet_market_id: market.mainnet_market_id.clone(),
            kind: market.kind,
            spread_percent: market.spread_percent,
            order_size: market.order_size,
        }
    }
}

pub fn load_markets(path: impl AsRef<Path>) -> Result<BTreeMap<String, MarketConfig>> {
    let path = path.as_ref();
    let data =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    parse_markets(&data)
}

pub fn parse_markets(data: &str) -> Result<BTreeMap<String, MarketConfig>> {
    let markets: BTreeMap<String, MarketConfig> =
        serde_json::from_str(data).context("Failed to parse market config JSON")?;
    for (symbol, market) in &markets {
        anyhow::ensure!(
            market.order_size > 0.0,
            "market {symbol}: order_size must be positive"
        );
        anyhow::ensure!(
            market.spread_percent > 0.0 && market.spread_percent < 100.0,
            "market {symbol}: spread_percent must be within (0, 100)"
        );
        anyhow::ensure!(
            !market.testnet_market_id.as_str().is_empty(),
            "market {symbol}: testnet_market_id is empty"
        );
    }
    Ok(markets)
}

/// Wallet credentials sourced from `WALLET_<id>_*` variables.
#[derive(Clone)]
pub struct WalletConfig {
    pub id: String,
    pub name: String,
    pub private_key: String,
    pub enabled: bool,
}

impl std::fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("private_key", &"<redacted>")
            .field("enabled", &self.enabled)
            .finish()
    }
}

pub fn wallets_from_env() -> Vec<WalletConfig> {
    wallets_from_vars(env::vars())
}

pub fn wallets_from_vars<I>(vars: I) -> Vec<WalletConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let vars: HashMap<String, String> = vars.into_iter().collect();
    let mut wallets: Vec<WalletConfig> = vars
        .iter()
        .filter_map(|(key, value)| {
            let id = key
                .strip_prefix("WALLET_")?
                .strip_suffix("_PRIVATE_KEY")?;
            let private_key = value.trim();
            if id.is_empty() || private_key.is_empty() {
                return None;
            }
            let name = vars
                .get(&format!("WALLET_{id}_NAME"))
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("wallet_{}", id.to_ascii_lowercase()));
            let enabled = vars
                .get(&format!("WALLET_{id}_ENABLED"))
                .map(|flag| parse_flag(flag))
                .unwrap_or(true);
            Some(WalletConfig {
                id: id.to_string(),
                name,
                private_key: private_key.to_string(),
                enabled,
            })
        })
        .collect();
    wallets.sort_by(|a, b| a.id.cmp(&b.id));
    wallets
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn override_string(key: &str, field: &mut String) {
    if let Ok(value) = env::var(key) {
        if !value.trim().is_empty() {
            *field = value.trim().to_string();
        }
    }
}

fn override_f64(key: &str, field: &mut f64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<f64>() {
            *field = parsed;
        }
    }
}

fn override_u32(key: &str, field: &mut u32) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u32>() {
            *field = parsed;
        }
    }
}

fn override_u64(key: &str, field: &mut u64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u64>() {
            *field = parsed;
        }
    }
}

fn override_bool(key: &str, field: &mut bool) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<bool>() {
            *field = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKETS: &str = r#"{
        "INJ/USDT": {
            "testnet_market_id": "0x0611780ba69656949525013d947713300f56c37b6175e02f26bffa495c3208fe",
            "mainnet_market_id": "0xa508cb32923323679f29a032c70342c147c17d0145625922b0ef22e955c844c0",
            "type": "spot",
            "spread_percent": 0.5,
            "order_size": 10.0
        },
        "BTC/USDT PERP": {
            "testnet_market_id": "0x2e94326a421c3f66c15a3b663c7b1ab7fb6a5298b3a57759ecf07f0036793fc9",
            "mainnet_market_id": "0x4ca0f92fc28be0c9761326016b5a1a2177dd6375558365116b5bdda9abc229ce",
            "type": "derivative",
            "spread_percent": 0.3,
            "order_size": 0.01,
            "enabled": false
        }
    }"#;

    fn config_with(markets: &str) -> BotConfig {
        BotConfig {
            settings: Settings::default(),
            markets: parse_markets(markets).unwrap(),
            wallets: Vec::new(),
        }
    }

    #[test]
    fn test_parse_markets() {
        let markets = parse_markets(MARKETS).unwrap();
        assert_eq!(markets.len(), 2);
        let inj = &markets["INJ/USDT"];
        assert_eq!(inj.kind, MarketKind::Spot);
        assert!(inj.enabled);
        assert!(!markets["BTC/USDT PERP"].enabled);
    }

    #[test]
    fn test_select_markets() {
        let config = config_with(MARKETS);
        let all = config.select_markets("all").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].symbol, "INJ/USDT");

        assert!(config.select_markets("inj/usdt").is_ok());
        assert!(config.select_markets("BTC/USDT PERP").is_err());
        assert!(config.select_markets("DOGE/USDT").is_err());
    }

    #[test]
    fn test_invalid_market_rejected() {
        let bad = r#"{"X": {"testnet_market_id": "0x1", "mainnet_market_id": "0x2",
            "type": "spot", "spread_percent": 0.5, "order_size": 0}}"#;
        assert!(parse_markets(bad).is_err());
    }

    #[test]
    fn test_settings_defaults_and_partial_toml() {
        let settings = Settings::from_toml_str(
            r#"
            [retry]
            max_attempts = 4

            [matching]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(settings.retry.max_attempts, 4);
        assert_eq!(settings.retry.base_backoff_ms, 500);
        assert!(settings.matching.enabled);
        assert_eq!(settings.matching.probability, 0.6);
        assert_eq!(settings.trading.tiers.len(), 3);
        settings.validate().unwrap();
    }

    #[test]
    fn test_settings_nested_table() {
        let settings = Settings::from_toml_str(
            r#"
            [bot.assessor]
            min_own_orders = 12
            "#,
        )
        .unwrap();
        assert_eq!(settings.assessor.min_own_orders, 12);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        settings.validate().unwrap();
        settings.assessor.shift_gap_pct = 10.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.trading.cycle_interval_secs = 0;
        settings.trading.cycle_jitter_secs = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("cycle_interval_secs"));
    }

    #[test]
    fn test_settings_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::from_file(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.logging.prefix, "trader");
    }

    #[test]
    fn test_wallets_from_vars() {
        let vars = vec![
            ("WALLET_1_PRIVATE_KEY".to_string(), "0xabc".to_string()),
            ("WALLET_1_NAME".to_string(), "maker-one".to_string()),
            ("WALLET_2_PRIVATE_KEY".to_string(), "def".to_string()),
            ("WALLET_2_ENABLED".to_string(), "false".to_string()),
            ("WALLET_3_PRIVATE_KEY".to_string(), "  ".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let wallets = wallets_from_vars(vars);
        assert_eq!(wallets.len(), 2);
        assert_eq!(wallets[0].id, "1");
        assert_eq!(wallets[0].name, "maker-one");
        assert!(wallets[0].enabled);
        assert_eq!(wallets[1].name, "wallet_2");
        assert!(!wallets[1].enabled);
    }

    #[test]
    fn test_wallet_debug_redacts_key() {
        let wallet = WalletConfig {
            id: "1".into(),
            name: "w".into(),
            private_key: "secret".into(),
            enabled: true,
        };
        assert!(!format!("{wallet:?}").contains("secret"));
    }
}
