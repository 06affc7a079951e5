//! Borrow-amount discovery.
//!
//! The largest principal the platform will lend against a collateral can't
//! be computed client-side, so it is found by trial: the exact collateral
//! value first, then a descending ladder of fractions, then a small fixed
//! amount for high-value collateral. The first candidate that validates wins.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;
use tracing::{info, warn};

use super::clock::Clock;
use super::operations::{BorrowTerms, Operations, Quoted};
use crate::config::FallbackConfig;

/// One trial principal.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub label: String,
    pub principal: Decimal,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.principal, self.label)
    }
}

#[derive(Debug)]
pub enum SearchOutcome {
    Found {
        candidate: Candidate,
        quote: Quoted<BorrowTerms>,
        attempts: usize,
    },
    /// Every candidate failed validation.
    Exhausted {
        attempts: usize,
        transport_failures: usize,
    },
}

/// Ordered candidates for a collateral worth `exact_value`.
pub fn candidate_ladder(exact_value: Decimal, cfg: &FallbackConfig) -> Vec<Candidate> {
    let mut ladder: Vec<Candidate> = cfg
        .ratios
        .iter()
        .map(|ratio| Candidate {
            label: ratio_label(*ratio),
            principal: exact_value.saturating_mul(*ratio),
        })
        .collect();

    if exact_value > cfg.fixed_candidate_threshold {
        ladder.push(Candidate {
            label: "fixed".into(),
            principal: cfg.fixed_candidate,
        });
    }

    ladder
}

fn ratio_label(ratio: Decimal) -> String {
    if ratio == Decimal::ONE {
        "exact value".into()
    } else {
        format!("{}% of value", (ratio * dec!(100)).normalize())
    }
}

/// Validate candidates in order until one is accepted.
///
/// Waits `cfg.retry_delay()` between failed attempts (not after the last).
pub async fn search(
    ops: &Operations,
    clock: &dyn Clock,
    cfg: &FallbackConfig,
    collateral_code: &str,
    collateral_amount: Decimal,
    rate: Decimal,
) -> SearchOutcome {
    let exact_value = collateral_amount.saturating_mul(rate);
    let ladder = candidate_ladder(exact_value, cfg);
    info!(
        collateral = %collateral_code,
        amount = %collateral_amount,
        rate = %rate,
        exact_value = %exact_value,
        candidates = ladder.len(),
        "Searching borrowable principal"
    );

    let total = ladder.len();
    let mut transport_failures = 0;

    for (i, candidate) in ladder.into_iter().enumerate() {
        match ops
            .validate_borrow(collateral_code, collateral_amount, candidate.principal)
            .await
        {
            Ok(quote) => {
                info!(
                    candidate = %candidate,
                    principal = %quote.terms().principal_amount,
                    activation = ?quote.terms().activation_amount,
                    "Borrow validated"
                );
                return SearchOutcome::Found {
                    candidate,
                    quote,
                    attempts: i + 1,
                };
            }
            Err(e) => {
                if e.cause.is_transport() {
                    transport_failures += 1;
                }
                warn!(candidate = %candidate, error = %e.cause, "Borrow candidate rejected");
                if i + 1 < total {
                    clock.sleep(cfg.retry_delay()).await;
                }
            }
        }
    }

    SearchOutcome::Exhausted {
        attempts: total,
        transport_failures,
    }
}
