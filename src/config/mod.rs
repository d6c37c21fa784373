//! Configuration for the intraday trader.
//!
//! Loads settings from an optional `config.toml` and environment variables
//! (prefix `TRADER`, `__` separator), with a `.env` overlay for credentials.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Brokerage session credentials
    #[serde(default)]
    pub kite: KiteConfig,
    /// Strategy parameters
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Engine timing and safety limits
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KiteConfig {
    /// API key issued with the app
    #[serde(default)]
    pub api_key: String,
    /// API secret, only needed to generate a session
    #[serde(default)]
    pub api_secret: String,
    /// Daily access token
    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Underlying index for the option-leg strategy
    #[serde(default = "default_underlying")]
    pub underlying: String,
    /// CE or PE
    #[serde(default = "default_option_type")]
    pub option_type: String,
    /// Stop-loss distance from the fill, in points
    #[serde(default = "default_stoploss_points")]
    pub stoploss_points: Decimal,
    /// Take-profit distance from the fill, in points
    #[serde(default = "default_takeprofit_points")]
    pub takeprofit_points: Decimal,
    /// Lots per entry
    #[serde(default = "default_lots")]
    pub lots: u32,
    /// Index into the sorted expiries (0 = nearest)
    #[serde(default)]
    pub expiry_offset: usize,
    /// Strikes away from at-the-money, towards out-of-the-money
    #[serde(default = "default_atm_offset")]
    pub atm_offset: i64,
    /// Rupee capital per equity symbol; quantity = capital / last close
    #[serde(default = "default_capital_per_symbol")]
    pub capital_per_symbol: Decimal,
    /// Equity symbols tracked by the renko and supertrend strategies
    #[serde(default = "default_tickers")]
    pub tickers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Reconciliation cadence in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Total run duration before the automatic square-off
    #[serde(default = "default_run_duration")]
    pub run_duration_secs: u64,
    /// Entry allowed while required margin < this fraction of free cash
    #[serde(default = "default_margin_utilization")]
    pub margin_utilization: Decimal,
    /// Fill poll cadence in milliseconds
    #[serde(default = "default_fill_poll_interval")]
    pub fill_poll_interval_ms: u64,
    /// Overall bound on the fill poll before the entry is cancelled
    #[serde(default = "default_fill_timeout")]
    pub fill_timeout_secs: u64,
    /// Immediate retries per snapshot fetch
    #[serde(default = "default_snapshot_retries")]
    pub snapshot_retries: u32,
}

// Default value functions
fn default_underlying() -> String {
    "NIFTY".to_string()
}

fn default_option_type() -> String {
    "CE".to_string()
}

fn default_stoploss_points() -> Decimal {
    Decimal::new(5, 0)
}

fn default_takeprofit_points() -> Decimal {
    Decimal::new(5, 0)
}

fn default_lots() -> u32 {
    2
}

fn default_atm_offset() -> i64 {
    3
}

fn default_capital_per_symbol() -> Decimal {
    Decimal::new(5000, 0)
}

fn default_tickers() -> Vec<String> {
    ["IRFC", "RVNL", "HUDCO", "SUZLON", "NBCC", "IRCON", "PNB", "BHEL"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_run_duration() -> u64 {
    5 * 60 * 60
}

fn default_margin_utilization() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_fill_poll_interval() -> u64 {
    500
}

fn default_fill_timeout() -> u64 {
    60
}

fn default_snapshot_retries() -> u32 {
    10
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("TRADER"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.kite.api_key.is_empty(), "kite.api_key is required");
        anyhow::ensure!(
            !self.kite.access_token.is_empty() || !self.kite.api_secret.is_empty(),
            "either kite.access_token or kite.api_secret is required"
        );

        anyhow::ensure!(
            self.engine.margin_utilization > Decimal::ZERO
                && self.engine.margin_utilization <= Decimal::ONE,
            "margin_utilization must be between 0 and 1"
        );

        anyhow::ensure!(self.strategy.lots >= 1, "lots must be at least 1");
        anyhow::ensure!(
            self.strategy.stoploss_points > Decimal::ZERO
                && self.strategy.takeprofit_points > Decimal::ZERO,
            "bracket distances must be positive"
        );
        anyhow::ensure!(
            self.engine.fill_timeout_secs > 0,
            "fill_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.engine.poll_interval_secs > 0,
            "poll_interval_secs must be positive"
        );

        self.strategy
            .option_type
            .parse::<crate::signal::OptionType>()
            .map_err(|e| anyhow::anyhow!(e))?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kite: KiteConfig::default(),
            strategy: StrategyConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            underlying: default_underlying(),
            option_type: default_option_type(),
            stoploss_points: default_stoploss_points(),
            takeprofit_points: default_takeprofit_points(),
            lots: default_lots(),
            expiry_offset: 0,
            atm_offset: default_atm_offset(),
            capital_per_symbol: default_capital_per_symbol(),
            tickers: default_tickers(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            run_duration_secs: default_run_duration(),
            margin_utilization: default_margin_utilization(),
            fill_poll_interval_ms: default_fill_poll_interval(),
            fill_timeout_secs: default_fill_timeout(),
            snapshot_retries: default_snapshot_retries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.kite.api_key = "key".to_string();
        config.kite.access_token = "token".to_string();
        config
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.margin_utilization, dec!(0.5));
        assert_eq!(config.engine.fill_poll_interval_ms, 500);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_margin_utilization_rejected() {
        let mut config = valid_config();
        config.engine.margin_utilization = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_option_type_rejected() {
        let mut config = valid_config();
        config.strategy.option_type = "CALL".to_string();
        assert!(config.validate().is_err());
    }
}
