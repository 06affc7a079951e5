//! Lending platform integration.
//!
//! Defines the `LendingPlatform` trait, the only way the engine talks to
//! the outside world, and the Liqfinity REST implementation.

pub mod liqfinity;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{
    BorrowQuote, BorrowRequest, Currency, Loan, Points, StakeQuote, StakeRecord, Wallet,
};

/// Failure of a single platform call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// Network or HTTP layer failure; the platform never answered.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The platform answered `success: false`.
    #[error("rejected: {}", .message.as_deref().unwrap_or("no message"))]
    Rejected { message: Option<String> },

    /// The platform answered but a required field is missing.
    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn rejected(message: impl Into<String>) -> Self {
        ApiError::Rejected {
            message: Some(message.into()),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Shape of the bulk currency listing.
#[derive(Debug, Clone, PartialEq)]
pub enum CurrencyListing {
    Listed(Vec<Currency>),
    /// The listing answered but in neither known shape.
    Unrecognized,
}

/// Abstraction over the lending/staking platform.
///
/// Every monetary operation is split into a validate call returning a quote
/// and an execute call that must be given that quote's exact numbers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LendingPlatform: Send + Sync {
    /// Wallet for the configured asset.
    async fn wallet(&self) -> ApiResult<Wallet>;

    async fn points(&self) -> ApiResult<Points>;

    async fn validate_lock(&self, amount: Decimal) -> ApiResult<StakeQuote>;

    async fn create_lock(&self, amount: Decimal, fee: Decimal) -> ApiResult<StakeRecord>;

    async fn validate_unlock(&self, amount: Decimal) -> ApiResult<StakeQuote>;

    async fn create_unlock(&self, amount: Decimal, fee: Decimal) -> ApiResult<StakeRecord>;

    async fn list_currencies(&self) -> ApiResult<CurrencyListing>;

    /// Single collateral currency with its current rate.
    async fn currency(&self, code: &str) -> ApiResult<Currency>;

    async fn validate_borrow(&self, request: &BorrowRequest) -> ApiResult<BorrowQuote>;

    async fn confirm_borrow(&self, request: &BorrowRequest) -> ApiResult<Loan>;

    /// All loans, newest first, in any status.
    async fn loans(&self) -> ApiResult<Vec<Loan>>;

    async fn repay(&self, loan_id: &str, amount: Decimal) -> ApiResult<Loan>;
}
