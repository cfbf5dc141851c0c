//! Configuration management for the alt season trader.
//!
//! Loads settings from an optional `config.toml`, `ALTS__*` environment
//! variables, and the legacy flat variables (`TRADING_MODE`,
//! `BINANCE_API_KEY`, `BINANCE_API_SECRET`, `INITIAL_BALANCE`,
//! `UPDATE_INTERVAL`). Every strategy number here is a tunable default.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Binance API credentials
    #[serde(default)]
    pub binance: BinanceConfig,
    /// Mode, pairs, balance and loop timing
    #[serde(default)]
    pub trading: TradingConfig,
    /// Market data and alt season detection
    #[serde(default)]
    pub market: MarketConfig,
    /// Indicator and signal parameters
    #[serde(default)]
    pub signal: SignalConfig,
    /// Risk management parameters
    #[serde(default)]
    pub risk: RiskConfig,
    /// Order placement parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinanceConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use the spot testnet instead of production
    #[serde(default)]
    pub testnet: bool,
}

/// How the bot interacts with the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Replay historical candles
    Backtest,
    /// Real orders against Binance
    Live,
    /// Live market data, simulated fills
    Paper,
}

impl FromStr for TradingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "backtest" => Ok(Self::Backtest),
            "live" => Ok(Self::Live),
            "paper" | "mock" => Ok(Self::Paper),
            other => anyhow::bail!("unknown trading mode: {other}"),
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Backtest => write!(f, "backtest"),
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_mode")]
    pub mode: TradingMode,
    /// Pairs in `BASE/QUOTE` form
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,
    /// Starting balance in USDT
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    /// Seconds between live iterations
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    /// Seconds to wait after a failed iteration
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Candle interval (Binance notation)
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    /// Days of history fetched for a backtest
    #[serde(default = "default_backtest_days")]
    pub backtest_days: u32,
    /// Days of history fetched per live iteration
    #[serde(default = "default_live_days")]
    pub live_days: u32,
    /// SQLite file for trade history and open positions
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Directory for rolling log files
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    #[serde(default = "default_coingecko_url")]
    pub coingecko_url: String,
    /// BTC dominance (percent) below which it is alt season
    #[serde(default = "default_btc_dominance_threshold")]
    pub btc_dominance_threshold: Decimal,
    /// Block new entries outside alt season
    #[serde(default = "default_true")]
    pub alt_season_gate: bool,
    /// Fetch BTC candles and apply the correlation filter
    #[serde(default = "default_true")]
    pub correlation_filter: bool,
    /// Pair used as the BTC reference
    #[serde(default = "default_btc_pair")]
    pub btc_pair: String,
    #[serde(default = "default_price_cache_ttl_ms")]
    pub price_cache_ttl_ms: u64,
    /// Candles per kline request
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_volume_ma_period")]
    pub volume_ma_period: usize,
    /// EMA smoothing of RSI inside QQE
    #[serde(default = "default_qqe_smoothing")]
    pub qqe_smoothing: usize,
    #[serde(default = "default_qqe_wilder")]
    pub qqe_wilder: f64,
    /// QQE rsi_ma must be above this to buy
    #[serde(default = "default_qqe_buy_threshold")]
    pub qqe_buy_threshold: f64,
    /// QQE rsi_ma below this triggers an exit
    #[serde(default = "default_qqe_sell_threshold")]
    pub qqe_sell_threshold: f64,
    /// Volume must exceed volume_ma times this to buy
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,
    /// Volume/volume_ma below this triggers an exit
    #[serde(default = "default_weak_volume_ratio")]
    pub weak_volume_ratio: f64,
    #[serde(default = "default_correlation_window")]
    pub correlation_window: usize,
    /// Maximum absolute BTC correlation allowed
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,
    /// Bars used for the volume profile
    #[serde(default = "default_volume_profile_lookback")]
    pub volume_profile_lookback: usize,
    /// Bucket width as a fraction of price
    #[serde(default = "default_volume_profile_bucket")]
    pub volume_profile_bucket: f64,
    /// Std devs of close around POC forming the value area
    #[serde(default = "default_value_area_sd")]
    pub value_area_sd: f64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of balance per position (0.0-1.0)
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    /// Fraction of equity that may be deployed in total (0.0-1.0)
    #[serde(default = "default_max_portfolio_allocation")]
    pub max_portfolio_allocation: Decimal,
    /// Daily loss as fraction of balance that halts new entries
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    #[serde(default = "default_atr_trail_mult")]
    pub atr_trail_mult: Decimal,
    #[serde(default = "default_atr_sl_mult")]
    pub atr_sl_mult: Decimal,
    #[serde(default = "default_atr_tp_mult")]
    pub atr_tp_mult: Decimal,
    /// Minimum order size in USDT
    #[serde(default = "default_min_trade_amount")]
    pub min_trade_amount: Decimal,
    /// Taker fee per side
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// ATR floor as a fraction of price
    #[serde(default = "default_atr_floor_pct")]
    pub atr_floor_pct: Decimal,
    /// Size reduction per unit of ATR/price
    #[serde(default = "default_volatility_scale")]
    pub volatility_scale: Decimal,
    /// Smallest volatility multiplier applied to position size
    #[serde(default = "default_min_volatility_factor")]
    pub min_volatility_factor: Decimal,
    /// Drawdown (0.0-1.0) that triggers warnings
    #[serde(default = "default_max_drawdown_alert")]
    pub max_drawdown_alert: Decimal,
}

/// Order type used for entries and exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStyle {
    Market,
    Limit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_style")]
    pub style: ExecutionStyle,
    /// Limit price offset from the reference price (0.0-1.0)
    #[serde(default = "default_limit_offset")]
    pub limit_offset: Decimal,
    /// Order timeout in seconds
    #[serde(default = "default_order_timeout")]
    pub order_timeout_secs: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_mode() -> TradingMode {
    TradingMode::Backtest
}

fn default_pairs() -> Vec<String> {
    vec!["SOL/USDT".to_string()]
}

fn default_initial_balance() -> Decimal {
    Decimal::new(100, 0)
}

fn default_update_interval() -> u64 {
    900 // 15 minutes, one candle
}

fn default_error_backoff() -> u64 {
    60
}

fn default_timeframe() -> String {
    "15m".to_string()
}

fn default_backtest_days() -> u32 {
    30
}

fn default_live_days() -> u32 {
    1
}

fn default_db_path() -> String {
    "data/trader_state.db".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_coingecko_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

fn default_btc_dominance_threshold() -> Decimal {
    Decimal::new(55, 0) // 55%
}

fn default_btc_pair() -> String {
    "BTC/USDT".to_string()
}

fn default_price_cache_ttl_ms() -> u64 {
    1000
}

fn default_batch_limit() -> u32 {
    500
}

fn default_request_delay_ms() -> u64 {
    500
}

fn default_rate_limit_backoff() -> u64 {
    30
}

fn default_ema_fast() -> usize {
    9
}

fn default_ema_slow() -> usize {
    21
}

fn default_rsi_period() -> usize {
    14
}

fn default_atr_period() -> usize {
    14
}

fn default_volume_ma_period() -> usize {
    20
}

fn default_qqe_smoothing() -> usize {
    5
}

fn default_qqe_wilder() -> f64 {
    0.33
}

fn default_qqe_buy_threshold() -> f64 {
    48.0
}

fn default_qqe_sell_threshold() -> f64 {
    52.0
}

fn default_volume_multiplier() -> f64 {
    1.15
}

fn default_weak_volume_ratio() -> f64 {
    0.7
}

fn default_correlation_window() -> usize {
    24
}

fn default_correlation_threshold() -> f64 {
    0.7
}

fn default_volume_profile_lookback() -> usize {
    14 * 96 // 14 days of 15m candles
}

fn default_volume_profile_bucket() -> f64 {
    0.0025 // 0.25% price increments
}

fn default_value_area_sd() -> f64 {
    1.2
}

fn default_cooldown_minutes() -> i64 {
    30
}

fn default_max_position_size() -> Decimal {
    Decimal::new(1, 1) // 0.10
}

fn default_max_portfolio_allocation() -> Decimal {
    Decimal::new(5, 1) // 0.50
}

fn default_max_daily_loss() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_max_trades_per_day() -> u32 {
    10
}

fn default_max_open_positions() -> usize {
    10
}

fn default_atr_trail_mult() -> Decimal {
    Decimal::new(20, 1) // 2.0
}

fn default_atr_sl_mult() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn default_atr_tp_mult() -> Decimal {
    Decimal::new(30, 1) // 3.0
}

fn default_min_trade_amount() -> Decimal {
    Decimal::new(10, 0) // 10 USDT
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3) // 0.001 (0.1%)
}

fn default_atr_floor_pct() -> Decimal {
    Decimal::new(1, 4) // 0.0001 (0.01%)
}

fn default_volatility_scale() -> Decimal {
    Decimal::new(5, 0)
}

fn default_min_volatility_factor() -> Decimal {
    Decimal::new(2, 1) // 0.2
}

fn default_max_drawdown_alert() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_execution_style() -> ExecutionStyle {
    ExecutionStyle::Market
}

fn default_limit_offset() -> Decimal {
    Decimal::new(3, 4) // 0.0003 (0.03%)
}

fn default_order_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("ALTS"))
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply the flat legacy variables on top of the layered config.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("TRADING_MODE") {
            self.trading.mode = mode.parse()?;
        }
        if let Some(key) = lookup("BINANCE_API_KEY") {
            self.binance.api_key = key;
        }
        if let Some(secret) = lookup("BINANCE_API_SECRET") {
            self.binance.secret_key = secret;
        }
        if let Some(balance) = lookup("INITIAL_BALANCE") {
            self.trading.initial_balance = crate::utils::parse_decimal(&balance)
                .with_context(|| format!("Invalid INITIAL_BALANCE: {balance}"))?;
        }
        if let Some(interval) = lookup("UPDATE_INTERVAL") {
            self.trading.update_interval_secs = parse_interval(&interval)?;
        }
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.trading.pairs.is_empty(), "at least one trading pair is required");

        anyhow::ensure!(
            self.trading.pairs.iter().all(|p| p.contains('/')),
            "trading pairs must use BASE/QUOTE form"
        );

        anyhow::ensure!(
            self.trading.initial_balance > Decimal::ZERO,
            "initial_balance must be positive"
        );

        anyhow::ensure!(
            self.risk.max_position_size > Decimal::ZERO && self.risk.max_position_size <= Decimal::ONE,
            "max_position_size must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.max_portfolio_allocation > Decimal::ZERO
                && self.risk.max_portfolio_allocation <= Decimal::ONE,
            "max_portfolio_allocation must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.fee_rate >= Decimal::ZERO && self.risk.fee_rate < Decimal::ONE,
            "fee_rate must be in [0, 1)"
        );

        anyhow::ensure!(
            self.signal.ema_fast >= 1 && self.signal.ema_fast < self.signal.ema_slow,
            "ema_fast must be >= 1 and < ema_slow"
        );

        let signal = &self.signal;
        for (name, period) in [
            ("rsi_period", signal.rsi_period),
            ("atr_period", signal.atr_period),
            ("volume_ma_period", signal.volume_ma_period),
            ("qqe_smoothing", signal.qqe_smoothing),
            ("correlation_window", signal.correlation_window),
            ("volume_profile_lookback", signal.volume_profile_lookback),
        ] {
            anyhow::ensure!(period >= 1, "{name} must be at least 1");
        }

        anyhow::ensure!(
            signal.qqe_wilder > 0.0 && signal.qqe_wilder <= 1.0,
            "qqe_wilder must be in (0, 1]"
        );
        anyhow::ensure!(
            signal.volume_profile_bucket > 0.0 && signal.volume_profile_bucket.is_finite(),
            "volume_profile_bucket must be positive"
        );
        anyhow::ensure!(
            signal.value_area_sd > 0.0 && signal.value_area_sd.is_finite(),
            "value_area_sd must be positive"
        );

        anyhow::ensure!(
            self.trading.update_interval_secs > 0,
            "update_interval_secs must be positive"
        );

        Ok(())
    }
}

/// Parse an interval in seconds, ignoring a trailing `# comment`.
pub fn parse_interval(raw: &str) -> Result<u64> {
    let value = raw.split('#').next().unwrap_or_default().trim();
    value
        .parse()
        .with_context(|| format!("Invalid update interval: {raw:?}"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binance: BinanceConfig::default(),
            trading: TradingConfig::default(),
            market: MarketConfig::default(),
            signal: SignalConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            pairs: default_pairs(),
            initial_balance: default_initial_balance(),
            update_interval_secs: default_update_interval(),
            error_backoff_secs: default_error_backoff(),
            timeframe: default_timeframe(),
            backtest_days: default_backtest_days(),
            live_days: default_live_days(),
            db_path: default_db_path(),
            log_dir: default_log_dir(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            coingecko_url: default_coingecko_url(),
            btc_dominance_threshold: default_btc_dominance_threshold(),
            alt_season_gate: true,
            correlation_filter: true,
            btc_pair: default_btc_pair(),
            price_cache_ttl_ms: default_price_cache_ttl_ms(),
            batch_limit: default_batch_limit(),
            request_delay_ms: default_request_delay_ms(),
            rate_limit_backoff_secs: default_rate_limit_backoff(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ema_fast: default_ema_fast(),
            ema_slow: default_ema_slow(),
            rsi_period: default_rsi_period(),
            atr_period: default_atr_period(),
            volume_ma_period: default_volume_ma_period(),
            qqe_smoothing: default_qqe_smoothing(),
            qqe_wilder: default_qqe_wilder(),
            qqe_buy_threshold: default_qqe_buy_threshold(),
            qqe_sell_threshold: default_qqe_sell_threshold(),
            volume_multiplier: default_volume_multiplier(),
            weak_volume_ratio: default_weak_volume_ratio(),
            correlation_window: default_correlation_window(),
            correlation_threshold: default_correlation_threshold(),
            volume_profile_lookback: default_volume_profile_lookback(),
            volume_profile_bucket: default_volume_profile_bucket(),
            value_area_sd: default_value_area_sd(),
            cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: default_max_position_size(),
            max_portfolio_allocation: default_max_portfolio_allocation(),
            max_daily_loss: default_max_daily_loss(),
            max_trades_per_day: default_max_trades_per_day(),
            max_open_positions: default_max_open_positions(),
            atr_trail_mult: default_atr_trail_mult(),
            atr_sl_mult: default_atr_sl_mult(),
            atr_tp_mult: default_atr_tp_mult(),
            min_trade_amount: default_min_trade_amount(),
            fee_rate: default_fee_rate(),
            atr_floor_pct: default_atr_floor_pct(),
            volatility_scale: default_volatility_scale(),
            min_volatility_factor: default_min_volatility_factor(),
            max_drawdown_alert: default_max_drawdown_alert(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            style: default_execution_style(),
            limit_offset: default_limit_offset(),
            order_timeout_secs: default_order_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.risk.fee_rate, dec!(0.001));
        assert_eq!(config.trading.pairs, vec!["SOL/USDT"]);
    }

    #[test]
    fn test_parse_interval_strips_comment() {
        assert_eq!(parse_interval("900").unwrap(), 900);
        assert_eq!(parse_interval(" 300  # five minutes").unwrap(), 300);
        assert!(parse_interval("# only a comment").is_err());
    }

    #[test]
    fn test_legacy_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TRADING_MODE", "LIVE"),
            ("BINANCE_API_KEY", "key"),
            ("BINANCE_API_SECRET", "secret"),
            ("INITIAL_BALANCE", "1000"),
            ("UPDATE_INTERVAL", "600 # ten minutes"),
        ]);

        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.trading.mode, TradingMode::Live);
        assert_eq!(config.binance.api_key, "key");
        assert_eq!(config.binance.secret_key, "secret");
        assert_eq!(config.trading.initial_balance, dec!(1000));
        assert_eq!(config.trading.update_interval_secs, 600);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let mut config = Config::default();
        assert!(config
            .apply_overrides(|k| (k == "TRADING_MODE").then(|| "yolo".to_string()))
            .is_err());
    }

    #[test]
    fn test_validate_rejects_bad_emas() {
        let mut config = Config::default();
        config.signal.ema_fast = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_degenerate_signal_settings() {
        let mut config = Config::default();
        config.signal.value_area_sd = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.signal.volume_profile_bucket = -0.01;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.signal.rsi_period = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rsi_period"));

        let mut config = Config::default();
        config.signal.qqe_smoothing = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.signal.qqe_wilder = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("paper".parse::<TradingMode>().unwrap(), TradingMode::Paper);
        assert_eq!("mock".parse::<TradingMode>().unwrap(), TradingMode::Paper);
        assert_eq!(TradingMode::Backtest.to_string(), "backtest");
    }
}
