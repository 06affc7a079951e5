//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section has defaults matching the platform's known-good constants, so a
//! config file only needs to name what it changes. The API token is
//! referenced by env-var name and resolved at runtime.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::types::LiqfarmError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub mode: RunMode,
    pub api: ApiConfig,
    pub strategy: StrategyConfig,
    pub timing: TimingConfig,
    pub fallback: FallbackConfig,
    pub collateral: CollateralConfig,
    pub run: RunConfig,
}

/// Which operation families a run performs.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Lock & unlock only.
    Lock,
    /// Borrow & repay only.
    Borrow,
    #[default]
    Both,
    /// Print wallet, points and loans once, then exit.
    Info,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Env var holding the bearer token.
    pub token_env: String,
    /// File read when the env var is unset.
    pub token_file: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub origin: String,
    pub referer: String,
    /// Asset staked and borrowed (the principal currency).
    pub asset: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.testnet.liqfinity.com/v1".into(),
            token_env: "LIQFARM_TOKEN".into(),
            token_file: "token.txt".into(),
            timeout_secs: 30,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .into(),
            origin: "https://app.testnet.liqfinity.com".into(),
            referer: "https://app.testnet.liqfinity.com/".into(),
            asset: "USDT".into(),
        }
    }
}

impl ApiConfig {
    /// Resolve the bearer token from `token_env`, falling back to `token_file`.
    pub fn load_token(&self) -> Result<SecretString> {
        if let Ok(token) = std::env::var(&self.token_env) {
            let token = token.trim().to_string();
            if !token.is_empty() {
                return Ok(SecretString::new(token));
            }
        }

        match fs::read_to_string(&self.token_file) {
            Ok(contents) if !contents.trim().is_empty() => {
                Ok(SecretString::new(contents.trim().to_string()))
            }
            _ => Err(LiqfarmError::MissingToken {
                env: self.token_env.clone(),
                file: self.token_file.clone(),
            }
            .into()),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Strategy knobs. Immutable for the duration of a run.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StrategyConfig {
    /// Set from `mode`, not read from the file.
    #[serde(skip)]
    pub lock_enabled: bool,
    #[serde(skip)]
    pub borrow_enabled: bool,
    /// Share of (available − buffer) to lock, in (0, 1].
    pub lock_fraction: Decimal,
    /// Balance always left untouched for fees.
    pub safety_buffer: Decimal,
    /// Smallest lock/unlock worth submitting.
    pub min_operation_amount: Decimal,
    pub max_active_loans: usize,
    /// Minimum time a self-opened loan is held before repayment.
    pub min_hold_secs: u64,
    /// Share of available balance kept back from locking when borrowing.
    pub borrow_reserve_fraction: Decimal,
    pub borrow_reserve_cap: Decimal,
    /// Reserve only applies when available exceeds reserve + buffer + this.
    pub reserve_headroom: Decimal,
    /// Fee sent with an unlock when its quote carries none.
    pub default_unlock_fee: Decimal,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            lock_enabled: true,
            borrow_enabled: true,
            lock_fraction: dec!(1.0),
            safety_buffer: dec!(1),
            min_operation_amount: dec!(10),
            max_active_loans: 5,
            min_hold_secs: 600,
            borrow_reserve_fraction: dec!(0.2),
            borrow_reserve_cap: dec!(10000),
            reserve_headroom: dec!(10),
            default_unlock_fee: dec!(0.00057),
        }
    }
}

impl StrategyConfig {
    pub fn min_hold(&self) -> Duration {
        Duration::from_secs(self.min_hold_secs)
    }

    /// Enable the operation families selected by `mode`.
    pub fn apply_mode(&mut self, mode: RunMode) {
        let (lock, borrow) = match mode {
            RunMode::Lock => (true, false),
            RunMode::Borrow => (false, true),
            RunMode::Both => (true, true),
            RunMode::Info => (false, false),
        };
        self.lock_enabled = lock;
        self.borrow_enabled = borrow;
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause after a lock attempt and after a failed wallet fetch.
    pub operation_delay_secs: u64,
    pub cycle_delay_secs: u64,
    /// Pause after an unexpected fault inside a cycle.
    pub error_penalty_secs: u64,
    /// Extended pause once `max_consecutive_errors` is reached.
    pub cooldown_secs: u64,
    pub max_consecutive_errors: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            operation_delay_secs: 30,
            cycle_delay_secs: 30,
            error_penalty_secs: 60,
            cooldown_secs: 300,
            max_consecutive_errors: 5,
        }
    }
}

impl TimingConfig {
    pub fn operation_delay(&self) -> Duration {
        Duration::from_secs(self.operation_delay_secs)
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.cycle_delay_secs)
    }

    pub fn error_penalty(&self) -> Duration {
        Duration::from_secs(self.error_penalty_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Borrow-amount discovery ladder. These are empirical values from the
/// platform, not derived limits.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FallbackConfig {
    /// Multipliers of the exact collateral value, tried in order.
    pub ratios: Vec<Decimal>,
    /// Absolute principal tried last for high-value collateral.
    pub fixed_candidate: Decimal,
    /// The fixed candidate is only added when the exact value exceeds this.
    pub fixed_candidate_threshold: Decimal,
    pub retry_delay_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            ratios: vec![dec!(1), dec!(0.999), dec!(0.99), dec!(0.95), dec!(0.90)],
            fixed_candidate: dec!(15),
            fixed_candidate_threshold: dec!(20),
            retry_delay_secs: 2,
        }
    }
}

impl FallbackConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CollateralConfig {
    /// Codes probed one by one when the bulk listing is unusable.
    pub probe_codes: Vec<String>,
}

impl Default for CollateralConfig {
    fn default() -> Self {
        Self {
            probe_codes: vec!["LTC".into(), "BTC".into(), "ETH".into()],
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RunConfig {
    /// Stop after this many cycles. Unset runs until cancelled.
    pub max_cycles: Option<u64>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse, apply the run mode and validate.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: AppConfig =
            toml::from_str(contents).context("Failed to parse config")?;
        config.strategy.apply_mode(config.mode);
        config.validate()?;
        Ok(config)
    }

    /// Reject values outside the ranges the engine's arithmetic assumes.
    pub fn validate(&self) -> Result<(), LiqfarmError> {
        let s = &self.strategy;
        if s.lock_fraction <= Decimal::ZERO || s.lock_fraction > Decimal::ONE {
            return Err(LiqfarmError::Config(format!(
                "strategy.lock_fraction must be in (0, 1], got {}",
                s.lock_fraction
            )));
        }
        if s.safety_buffer < Decimal::ZERO {
            return Err(LiqfarmError::Config("strategy.safety_buffer must be >= 0".into()));
        }
        if s.min_operation_amount <= Decimal::ZERO {
            return Err(LiqfarmError::Config(
                "strategy.min_operation_amount must be > 0".into(),
            ));
        }
        if s.borrow_reserve_fraction < Decimal::ZERO || s.borrow_reserve_fraction > Decimal::ONE {
            return Err(LiqfarmError::Config(
                "strategy.borrow_reserve_fraction must be in [0, 1]".into(),
            ));
        }
        if self.fallback.ratios.is_empty() {
            return Err(LiqfarmError::Config("fallback.ratios must not be empty".into()));
        }
        if self.fallback.ratios.iter().any(|r| *r <= Decimal::ZERO) {
            return Err(LiqfarmError::Config("fallback.ratios must be positive".into()));
        }
        if self.timing.max_consecutive_errors == 0 {
            return Err(LiqfarmError::Config(
                "timing.max_consecutive_errors must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
