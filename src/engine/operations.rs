//! Two-phase operation primitives.
//!
//! Every monetary operation is validate-then-execute. A successful validate
//! produces a [`Quoted`] value that can only be built here; execute consumes
//! it and sends its numbers back verbatim. There is no way to execute
//! without a validated quote, or to execute the same quote twice.

use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::platforms::{ApiError, ApiResult, CurrencyListing, LendingPlatform};
use crate::types::{
    AccountSnapshot, BorrowRequest, Currency, Loan, Points, StakeRecord,
};

// ---------------------------------------------------------------------------
// Operation state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Lock,
    Unlock,
    Borrow,
    Repay,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Lock => write!(f, "lock"),
            OperationKind::Unlock => write!(f, "unlock"),
            OperationKind::Borrow => write!(f, "borrow"),
            OperationKind::Repay => write!(f, "repay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Validate,
    Execute,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Validate => write!(f, "validate"),
            Step::Execute => write!(f, "execute"),
        }
    }
}

/// Lifecycle of one operation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Validated,
    Executed,
    Failed,
}

impl Stage {
    /// Stage after `step` finishes. A step taken out of order fails.
    pub fn advance(self, step: Step, ok: bool) -> Stage {
        match (self, step, ok) {
            (Stage::Idle, Step::Validate, true) => Stage::Validated,
            (Stage::Validated, Step::Execute, true) => Stage::Executed,
            _ => Stage::Failed,
        }
    }
}

/// A validated quote. Only this module can construct one, and it is
/// consumed by the matching execute call.
#[derive(Debug)]
pub struct Quoted<T> {
    terms: T,
    stage: Stage,
}

impl<T> Quoted<T> {
    fn new(terms: T, stage: Stage) -> Self {
        Self { terms, stage }
    }

    pub fn terms(&self) -> &T {
        &self.terms
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }
}

/// Terms of a validated lock or unlock.
#[derive(Debug, Clone, PartialEq)]
pub struct StakeTerms {
    pub amount: Decimal,
    pub fee: Decimal,
}

/// Terms of a validated borrow, echoed verbatim to confirm-borrow.
#[derive(Debug, Clone, PartialEq)]
pub struct BorrowTerms {
    pub collateral_code: String,
    pub collateral_amount: Decimal,
    pub principal_amount: Decimal,
    pub activation_amount: Option<Decimal>,
}

/// A failed validate or execute call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} {step} failed: {cause}")]
pub struct OperationError {
    pub kind: OperationKind,
    pub step: Step,
    #[source]
    pub cause: ApiError,
}

impl OperationError {
    fn new(kind: OperationKind, step: Step, cause: ApiError) -> Self {
        Self { kind, step, cause }
    }

    /// Execute failures and transport failures count against the run.
    /// A validate rejection only means "not this time".
    pub fn counts_as_failure(&self) -> bool {
        self.step == Step::Execute || self.cause.is_transport()
    }
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

pub struct Operations {
    platform: Arc<dyn LendingPlatform>,
    asset: String,
    default_unlock_fee: Decimal,
}

impl Operations {
    pub fn new(
        platform: Arc<dyn LendingPlatform>,
        asset: impl Into<String>,
        default_unlock_fee: Decimal,
    ) -> Self {
        Self {
            platform,
            asset: asset.into(),
            default_unlock_fee,
        }
    }

    /// Fresh balances for one decision point.
    pub async fn snapshot(&self) -> ApiResult<AccountSnapshot> {
        self.platform.wallet().await.map(|w| AccountSnapshot::from(&w))
    }

    pub async fn points(&self) -> ApiResult<Points> {
        self.platform.points().await
    }

    // -- Lock / unlock ---------------------------------------------------

    pub async fn validate_lock(&self, amount: Decimal) -> Result<Quoted<StakeTerms>, OperationError> {
        let result = self.platform.validate_lock(amount).await.and_then(|quote| {
            let fee = quote
                .fee
                .ok_or_else(|| ApiError::Malformed("lock quote has no fee".into()))?;
            Ok(StakeTerms {
                amount: quote.amount,
                fee,
            })
        });

        let (terms, stage) = settle(OperationKind::Lock, Stage::Idle, Step::Validate, result)?;
        Ok(Quoted::new(terms, stage))
    }

    pub async fn execute_lock(&self, quote: Quoted<StakeTerms>) -> Result<StakeRecord, OperationError> {
        let StakeTerms { amount, fee } = quote.terms;
        let result = self.platform.create_lock(amount, fee).await;
        settle(OperationKind::Lock, quote.stage, Step::Execute, result).map(|(record, _)| record)
    }

    /// Unlock quotes sometimes omit the fee; the configured default is sent
    /// in that case.
    pub async fn validate_unlock(
        &self,
        amount: Decimal,
    ) -> Result<Quoted<StakeTerms>, OperationError> {
        let result = self
            .platform
            .validate_unlock(amount)
            .await
            .map(|quote| StakeTerms {
                amount: quote.amount,
                fee: quote.fee.unwrap_or(self.default_unlock_fee),
            });

        let (terms, stage) = settle(OperationKind::Unlock, Stage::Idle, Step::Validate, result)?;
        Ok(Quoted::new(terms, stage))
    }

    pub async fn execute_unlock(
        &self,
        quote: Quoted<StakeTerms>,
    ) -> Result<StakeRecord, OperationError> {
        let StakeTerms { amount, fee } = quote.terms;
        let result = self.platform.create_unlock(amount, fee).await;
        settle(OperationKind::Unlock, quote.stage, Step::Execute, result).map(|(record, _)| record)
    }

    // -- Borrow / repay --------------------------------------------------

    pub async fn list_currencies(&self) -> ApiResult<CurrencyListing> {
        self.platform.list_currencies().await
    }

    pub async fn currency(&self, code: &str) -> ApiResult<Currency> {
        self.platform.currency(code).await
    }

    pub async fn validate_borrow(
        &self,
        collateral_code: &str,
        collateral_amount: Decimal,
        principal_amount: Decimal,
    ) -> Result<Quoted<BorrowTerms>, OperationError> {
        let request = BorrowRequest {
            collateral_currency_code: collateral_code.to_string(),
            collateral_amount,
            principal_amount,
            principal_currency_code: self.asset.clone(),
        };
        let result = self
            .platform
            .validate_borrow(&request)
            .await
            .map(|quote| BorrowTerms {
                collateral_code: request.collateral_currency_code.clone(),
                collateral_amount: quote.collateral_amount.unwrap_or(collateral_amount),
                principal_amount: quote.principal_amount,
                activation_amount: quote.activation_amount,
            });

        let (terms, stage) = settle(OperationKind::Borrow, Stage::Idle, Step::Validate, result)?;
        Ok(Quoted::new(terms, stage))
    }

    pub async fn confirm_borrow(&self, quote: Quoted<BorrowTerms>) -> Result<Loan, OperationError> {
        let Quoted { terms, stage } = quote;
        let request = BorrowRequest {
            collateral_currency_code: terms.collateral_code,
            collateral_amount: terms.collateral_amount,
            principal_amount: terms.principal_amount,
            principal_currency_code: self.asset.clone(),
        };
        let result = self.platform.confirm_borrow(&request).await;
        settle(OperationKind::Borrow, stage, Step::Execute, result).map(|(loan, _)| loan)
    }

    /// Loans currently in ACTIVE status, in platform order (newest first).
    pub async fn active_loans(&self) -> ApiResult<Vec<Loan>> {
        let loans = self.platform.loans().await?;
        Ok(loans.into_iter().filter(Loan::is_active).collect())
    }

    /// Repay a loan in full. Repayment has no validate step, so it starts
    /// out as if validated.
    pub async fn repay(&self, loan: &Loan) -> Result<Loan, OperationError> {
        let result = self.platform.repay(&loan.id, loan.repayment_amount).await;
        settle(OperationKind::Repay, Stage::Validated, Step::Execute, result).map(|(loan, _)| loan)
    }
}

/// Advance `from` by the outcome of `step` and wrap a failure.
fn settle<T>(
    kind: OperationKind,
    from: Stage,
    step: Step,
    result: ApiResult<T>,
) -> Result<(T, Stage), OperationError> {
    let stage = from.advance(step, result.is_ok());
    match result {
        Ok(value) if stage != Stage::Failed => {
            debug!(operation = %kind, %step, stage = ?stage, "Operation advanced");
            Ok((value, stage))
        }
        Ok(_) => {
            debug!(operation = %kind, %step, from = ?from, "Operation step out of order");
            Err(OperationError::new(
                kind,
                step,
                ApiError::Malformed(format!("{step} is not allowed from {from:?}")),
            ))
        }
        Err(cause) => {
            debug!(operation = %kind, %step, stage = ?stage, error = %cause, "Operation failed");
            Err(OperationError::new(kind, step, cause))
        }
    }
}
