//! Structured cycle events.
//!
//! The orchestrator reports what happened through an [`EventSink`]; it
//! never decides how anything is displayed. [`TracingSink`] renders events
//! as log lines, [`RecordingSink`] keeps them for assertions.

use rust_decimal::Decimal;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

use super::operations::{OperationKind, Step};
use crate::types::{AccountSnapshot, CycleReport, Points, RunCounters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Snapshot,
    Lock,
    Unlock,
    Repay,
    Borrow,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePhase::Snapshot => write!(f, "snapshot"),
            CyclePhase::Lock => write!(f, "lock"),
            CyclePhase::Unlock => write!(f, "unlock"),
            CyclePhase::Repay => write!(f, "repay"),
            CyclePhase::Borrow => write!(f, "borrow"),
        }
    }
}

/// Why a phase did nothing this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    SnapshotUnavailable,
    /// Stake exists and nothing meaningful is left to lock.
    PreservingStake,
    InsufficientBalance,
    BelowMinimum { amount: Decimal },
    ValidationRejected { message: String },
    NothingStaked,
    LoansUnavailable,
    NoEligibleLoan,
    InsufficientRepayBalance { needed: Decimal, available: Decimal },
    LoanLimitReached { active: usize },
    NoCollateral,
    RateUnavailable,
    CandidatesExhausted { attempts: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::SnapshotUnavailable => write!(f, "wallet unavailable"),
            SkipReason::PreservingStake => write!(f, "preserving existing stake"),
            SkipReason::InsufficientBalance => write!(f, "insufficient balance"),
            SkipReason::BelowMinimum { amount } => {
                write!(f, "amount {amount:.2} below minimum")
            }
            SkipReason::ValidationRejected { message } => {
                write!(f, "validation rejected: {message}")
            }
            SkipReason::NothingStaked => write!(f, "nothing staked"),
            SkipReason::LoansUnavailable => write!(f, "loan list unavailable"),
            SkipReason::NoEligibleLoan => write!(f, "no loan eligible for repayment"),
            SkipReason::InsufficientRepayBalance { needed, available } => {
                write!(f, "need {needed:.2} to repay, have {available:.2}")
            }
            SkipReason::LoanLimitReached { active } => {
                write!(f, "{active} active loans, limit reached")
            }
            SkipReason::NoCollateral => write!(f, "no collateral available"),
            SkipReason::RateUnavailable => write!(f, "collateral rate unavailable"),
            SkipReason::CandidatesExhausted { attempts } => {
                write!(f, "all {attempts} borrow candidates rejected")
            }
        }
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    CycleLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::CycleLimit => write!(f, "cycle limit reached"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleEvent {
    CycleStarted {
        cycle: u64,
        counters: RunCounters,
    },
    Snapshot {
        phase: CyclePhase,
        snapshot: AccountSnapshot,
    },
    Points(Points),
    PhaseSkipped {
        phase: CyclePhase,
        reason: SkipReason,
    },
    OperationSucceeded {
        kind: OperationKind,
        amount: Decimal,
        reference: Option<String>,
    },
    OperationFailed {
        kind: OperationKind,
        step: Step,
        message: String,
    },
    /// Unexpected fault caught at the loop boundary.
    Fault {
        cycle: u64,
        message: String,
    },
    Cooldown {
        errors: u32,
        duration: Duration,
    },
    CycleCompleted(CycleReport),
    Stopped(StopReason),
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &CycleEvent);
}

/// Renders events as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &CycleEvent) {
        match event {
            CycleEvent::CycleStarted { cycle, counters } => info!(
                cycle,
                errors = counters.consecutive_errors,
                successes = counters.consecutive_successes,
                "Starting cycle"
            ),
            CycleEvent::Snapshot { phase, snapshot } => info!(
                phase = %phase,
                available = %snapshot.available_balance,
                staked = %snapshot.staked_balance,
                "Balances"
            ),
            CycleEvent::Points(points) => info!(points = %points, "Points"),
            CycleEvent::PhaseSkipped { phase, reason } => match reason {
                SkipReason::NoEligibleLoan | SkipReason::LoanLimitReached { .. } => {
                    info!(phase = %phase, reason = %reason, "Phase skipped")
                }
                _ => warn!(phase = %phase, reason = %reason, "Phase skipped"),
            },
            CycleEvent::OperationSucceeded {
                kind,
                amount,
                reference,
            } => info!(
                operation = %kind,
                amount = %amount,
                reference = reference.as_deref().unwrap_or("-"),
                "Operation succeeded"
            ),
            CycleEvent::OperationFailed {
                kind,
                step,
                message,
            } => error!(operation = %kind, step = %step, error = %message, "Operation failed"),
            CycleEvent::Fault { cycle, message } => {
                error!(cycle, error = %message, "Cycle failed, continuing after penalty")
            }
            CycleEvent::Cooldown { errors, duration } => warn!(
                errors,
                cooldown_secs = duration.as_secs(),
                "Too many consecutive errors, cooling down"
            ),
            CycleEvent::CycleCompleted(report) => info!(
                cycle = report.cycle_number,
                operations = report.operations_executed(),
                summary = %report,
                "Cycle complete"
            ),
            CycleEvent::Stopped(reason) => info!(reason = %reason, "Cycle loop stopped"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &CycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
