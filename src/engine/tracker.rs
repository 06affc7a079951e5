//! Local open-time annotations for loans this process opened.
//!
//! The platform owns every loan; the tracker only remembers when *we*
//! opened one so it is held for the minimum duration before repayment.
//! A loan we never saw open (pre-existing at start-up) is eligible
//! immediately.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::types::Loan;

#[derive(Debug, Default)]
pub struct PositionTracker {
    opened: HashMap<String, DateTime<Utc>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_open(&mut self, loan_id: &str, at: DateTime<Utc>) {
        self.opened.insert(loan_id.to_string(), at);
    }

    /// Forget a repaid loan. Returns whether an entry was removed; an
    /// unknown id is a no-op.
    pub fn record_repaid(&mut self, loan_id: &str) -> bool {
        self.opened.remove(loan_id).is_some()
    }

    /// Drop entries for loans no longer in the platform's active list
    /// (closed or liquidated elsewhere). Returns how many were dropped.
    pub fn retain_active(&mut self, active: &[Loan]) -> usize {
        let before = self.opened.len();
        self.opened
            .retain(|id, _| active.iter().any(|loan| &loan.id == id));
        before - self.opened.len()
    }

    pub fn opened_at(&self, loan_id: &str) -> Option<DateTime<Utc>> {
        self.opened.get(loan_id).copied()
    }

    pub fn is_repay_eligible(&self, loan_id: &str, now: DateTime<Utc>, min_hold: Duration) -> bool {
        match self.opened.get(loan_id) {
            Some(opened) => now.signed_duration_since(*opened) >= min_hold,
            None => true,
        }
    }

    /// Oldest eligible loan by `created_at`. Loans without a creation time
    /// sort after all dated ones; ties keep list order.
    pub fn select_repayment<'a>(
        &self,
        loans: &'a [Loan],
        now: DateTime<Utc>,
        min_hold: Duration,
    ) -> Option<&'a Loan> {
        loans
            .iter()
            .filter(|loan| self.is_repay_eligible(&loan.id, now, min_hold))
            .min_by_key(|loan| (loan.created_at.is_none(), loan.created_at))
    }

    pub fn len(&self) -> usize {
        self.opened.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opened.is_empty()
    }
}
