//! Shared types for the LIQFARM engine.
//!
//! These types form the data model used across all modules: the
//! platform's wallet, loan and quote records as they come off the wire,
//! plus the engine's own snapshot, counter and report types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Treats an explicit `null` the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

// ---------------------------------------------------------------------------
// Wallet & account
// ---------------------------------------------------------------------------

/// A wallet entry as returned by the platform's `/user/wallets` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub code: String,
    /// Spendable balance.
    #[serde(default, deserialize_with = "null_as_default")]
    pub balance: Decimal,
    /// Balance currently locked in the staking pool. Absent or null on
    /// wallets that never staked.
    #[serde(default, deserialize_with = "null_as_default")]
    pub active_stake_balance: Decimal,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_revenue: Decimal,
}

impl fmt::Display for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: balance={:.2} staked={:.2} revenue={:.2}",
            self.code, self.balance, self.active_stake_balance, self.total_revenue,
        )
    }
}

/// Balances read at a single decision point. Never cached across cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub available_balance: Decimal,
    pub staked_balance: Decimal,
}

impl From<&Wallet> for AccountSnapshot {
    fn from(wallet: &Wallet) -> Self {
        Self {
            available_balance: wallet.balance,
            staked_balance: wallet.active_stake_balance,
        }
    }
}

impl fmt::Display for AccountSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "available={:.2} staked={:.2}",
            self.available_balance, self.staked_balance
        )
    }
}

/// Loyalty points summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Points {
    #[serde(default)]
    pub rank: Option<u64>,
    #[serde(default)]
    pub borrow_points: Decimal,
    #[serde(default)]
    pub liquidity_points: Decimal,
    #[serde(default)]
    pub referral_points: Decimal,
    #[serde(default)]
    pub sum_points: Decimal,
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rank = self
            .rank
            .map(|r| format!("#{r}"))
            .unwrap_or_else(|| "unranked".to_string());
        write!(
            f,
            "{rank} | borrow={:.2} liquidity={:.2} referral={:.2} total={:.2}",
            self.borrow_points, self.liquidity_points, self.referral_points, self.sum_points,
        )
    }
}

// ---------------------------------------------------------------------------
// Staking
// ---------------------------------------------------------------------------

/// Quote returned by the stake / liquidation `validate` endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeQuote {
    pub amount: Decimal,
    #[serde(default)]
    pub fee: Option<Decimal>,
}

/// Record returned by the stake / liquidation `create` endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub pre_balance: Option<Decimal>,
    #[serde(default)]
    pub post_balance: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Lending
// ---------------------------------------------------------------------------

/// A collateral currency as listed by `/user/loans/currencies`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Currency {
    pub code: String,
    /// Price of one unit in the principal currency.
    #[serde(default, deserialize_with = "null_as_default")]
    pub rate: Decimal,
    /// Amount of this currency the account can pledge right now.
    #[serde(default, deserialize_with = "null_as_default")]
    pub collateral_available: Decimal,
}

impl Currency {
    /// Value of the pledgeable collateral in the principal currency.
    pub fn collateral_value(&self) -> Decimal {
        self.collateral_available.saturating_mul(self.rate)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} available={} rate={} value={:.2}",
            self.code,
            self.collateral_available,
            self.rate,
            self.collateral_value(),
        )
    }
}

/// Body of both `validate-borrow` and `confirm-borrow`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowRequest {
    pub collateral_currency_code: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub collateral_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub principal_amount: Decimal,
    pub principal_currency_code: String,
}

/// Quote returned by `validate-borrow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowQuote {
    #[serde(default)]
    pub collateral_amount: Option<Decimal>,
    pub principal_amount: Decimal,
    #[serde(default)]
    pub activation_amount: Option<Decimal>,
    /// Activation fee in percent.
    #[serde(default)]
    pub activation_fee: Option<Decimal>,
}

/// Loan lifecycle status as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LoanStatus {
    Active,
    Closed,
    Other(String),
}

impl Default for LoanStatus {
    fn default() -> Self {
        LoanStatus::Other("UNKNOWN".into())
    }
}

impl From<String> for LoanStatus {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => LoanStatus::Active,
            "CLOSED" => LoanStatus::Closed,
            _ => LoanStatus::Other(s),
        }
    }
}

impl From<LoanStatus> for String {
    fn from(status: LoanStatus) -> Self {
        status.to_string()
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoanStatus::Active => write!(f, "ACTIVE"),
            LoanStatus::Closed => write!(f, "CLOSED"),
            LoanStatus::Other(s) => write!(f, "{s}"),
        }
    }
}

/// An open (or historical) loan. Owned by the platform; the engine only
/// holds a read-through copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loan {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub collateral_currency_code: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub collateral_amount: Decimal,
    #[serde(default, deserialize_with = "null_as_default")]
    pub principal_amount: Decimal,
    /// Principal plus accrued fee.
    #[serde(default, deserialize_with = "null_as_default")]
    pub repayment_amount: Decimal,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: LoanStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Loan {
    pub fn is_active(&self) -> bool {
        self.status == LoanStatus::Active
    }
}

impl fmt::Display for Loan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} -> {:.2} (repay {:.2})",
            self.status,
            self.collateral_amount,
            self.collateral_currency_code,
            self.principal_amount,
            self.repayment_amount,
        )
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Counters mutated only by the orchestrator and its governor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub cycle_count: u64,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
}

impl fmt::Display for RunCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cycles={} errors={} successes={}",
            self.cycle_count, self.consecutive_errors, self.consecutive_successes,
        )
    }
}

/// Summary of a single lock→unlock→repay→borrow cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    /// The cycle stopped after a failed wallet fetch.
    pub skipped: bool,
    pub locked: Option<Decimal>,
    pub unlocked: Option<Decimal>,
    pub repaid_loan: Option<String>,
    pub borrowed_loan: Option<String>,
    pub counters: RunCounters,
}

impl CycleReport {
    pub fn new(cycle_number: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_number,
            started_at,
            skipped: false,
            locked: None,
            unlocked: None,
            repaid_loan: None,
            borrowed_loan: None,
            counters: RunCounters::default(),
        }
    }

    /// Number of operations that executed successfully this cycle.
    pub fn operations_executed(&self) -> usize {
        [
            self.locked.is_some(),
            self.unlocked.is_some(),
            self.repaid_loan.is_some(),
            self.borrowed_loan.is_some(),
        ]
        .iter()
        .filter(|done| **done)
        .count()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skipped {
            return write!(f, "Cycle #{}: skipped ({})", self.cycle_number, self.counters);
        }
        let fmt_amount = |a: Option<Decimal>| a.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".into());
        write!(
            f,
            "Cycle #{}: locked={} unlocked={} repaid={} borrowed={} ({})",
            self.cycle_number,
            fmt_amount(self.locked),
            fmt_amount(self.unlocked),
            self.repaid_loan.as_deref().unwrap_or("-"),
            self.borrowed_loan.as_deref().unwrap_or("-"),
            self.counters,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Application-level errors raised outside the cycle loop.
#[derive(Debug, thiserror::Error)]
pub enum LiqfarmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No API token: set ${env} or create {file}")]
    MissingToken { env: String, file: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
