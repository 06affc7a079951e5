//! Cycle orchestrator.
//!
//! Runs the lock → unlock → repay → borrow cycle until cancelled (or until
//! `run.max_cycles`). Each phase returns an explicit outcome and never
//! stops the next one; only an unexpected fault propagates out of a cycle,
//! and it is caught at the loop boundary, counted and penalised.
//!
//! All state that outlives a cycle (run counters, loan open times) is owned
//! here. Balances are re-read at every decision point.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::collateral::select_collateral;
use super::events::{CycleEvent, CyclePhase, EventSink, SkipReason, StopReason};
use super::fallback::{self, SearchOutcome};
use super::governor::Governor;
use super::operations::{OperationError, OperationKind, Operations};
use super::tracker::PositionTracker;
use crate::config::{AppConfig, FallbackConfig, StrategyConfig, TimingConfig};
use crate::platforms::LendingPlatform;
use crate::types::{AccountSnapshot, CycleReport, Loan, RunCounters};

// ---------------------------------------------------------------------------
// Lock sizing
// ---------------------------------------------------------------------------

/// What the lock phase should do with a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum LockPlan {
    /// Stake exists and the free balance is only the fee buffer.
    PreserveStake,
    InsufficientBalance,
    BelowMinimum { amount: Decimal },
    Lock { amount: Decimal, reserved: Decimal },
}

pub fn plan_lock(cfg: &StrategyConfig, snapshot: &AccountSnapshot) -> LockPlan {
    let available = snapshot.available_balance;
    let floor = cfg.safety_buffer + Decimal::ONE;

    if available <= floor {
        return if snapshot.staked_balance >= cfg.min_operation_amount {
            LockPlan::PreserveStake
        } else {
            LockPlan::InsufficientBalance
        };
    }

    let mut base = available - cfg.safety_buffer;
    let mut reserved = Decimal::ZERO;
    if cfg.borrow_enabled {
        let reserve = (available * cfg.borrow_reserve_fraction).min(cfg.borrow_reserve_cap);
        if available > reserve + cfg.safety_buffer + cfg.reserve_headroom {
            base -= reserve;
            reserved = reserve;
        }
    }

    let amount = base * cfg.lock_fraction;
    if amount < cfg.min_operation_amount {
        LockPlan::BelowMinimum { amount }
    } else {
        LockPlan::Lock { amount, reserved }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Final state of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub reason: StopReason,
    pub counters: RunCounters,
    /// Loans opened by this run and not yet repaid.
    pub open_tracked: usize,
}

pub struct CycleOrchestrator {
    ops: Operations,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    strategy: StrategyConfig,
    timing: TimingConfig,
    fallback: FallbackConfig,
    probe_codes: Vec<String>,
    max_cycles: Option<u64>,
    governor: Governor,
    tracker: PositionTracker,
    shutdown: watch::Receiver<bool>,
}

impl CycleOrchestrator {
    pub fn new(
        platform: Arc<dyn LendingPlatform>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
        config: &AppConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ops: Operations::new(
                platform,
                config.api.asset.clone(),
                config.strategy.default_unlock_fee,
            ),
            clock,
            sink,
            strategy: config.strategy.clone(),
            timing: config.timing.clone(),
            fallback: config.fallback.clone(),
            probe_codes: config.collateral.probe_codes.clone(),
            max_cycles: config.run.max_cycles,
            governor: Governor::new(config.timing.max_consecutive_errors, config.timing.cooldown()),
            tracker: PositionTracker::new(),
            shutdown,
        }
    }

    pub fn counters(&self) -> RunCounters {
        self.governor.counters()
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    /// Cycle until cancelled or the cycle limit is reached.
    pub async fn run(&mut self) -> RunSummary {
        info!(
            lock = self.strategy.lock_enabled,
            borrow = self.strategy.borrow_enabled,
            lock_fraction = %self.strategy.lock_fraction,
            max_active_loans = self.strategy.max_active_loans,
            max_cycles = ?self.max_cycles,
            "Entering cycle loop"
        );

        let reason = loop {
            if self.is_cancelled() {
                break StopReason::Cancelled;
            }
            if self.limit_reached() {
                break StopReason::CycleLimit;
            }

            let cycle = self.governor.begin_cycle();
            self.emit(CycleEvent::CycleStarted {
                cycle,
                counters: self.governor.counters(),
            });

            match self.run_cycle(cycle).await {
                Ok(report) => {
                    let skipped = report.skipped;
                    self.emit(CycleEvent::CycleCompleted(report));
                    self.govern().await;
                    if !skipped && !self.limit_reached() {
                        self.pause(self.timing.cycle_delay()).await;
                    }
                }
                Err(fault) => {
                    self.governor.record_failure();
                    self.emit(CycleEvent::Fault {
                        cycle,
                        message: format!("{fault:#}"),
                    });
                    if self.is_cancelled() {
                        break StopReason::Cancelled;
                    }
                    self.pause(self.timing.error_penalty()).await;
                    self.govern().await;
                }
            }
        };

        self.emit(CycleEvent::Stopped(reason));
        RunSummary {
            reason,
            counters: self.governor.counters(),
            open_tracked: self.tracker.len(),
        }
    }

    async fn run_cycle(&mut self, cycle: u64) -> Result<CycleReport> {
        let mut report = CycleReport::new(cycle, self.clock.now());

        let snapshot = match self.ops.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(cycle, error = %e, "Wallet fetch failed, skipping cycle");
                self.governor.record_failure();
                self.skip(CyclePhase::Snapshot, SkipReason::SnapshotUnavailable);
                self.pause(self.timing.operation_delay()).await;
                report.skipped = true;
                report.counters = self.governor.counters();
                return Ok(report);
            }
        };
        self.emit(CycleEvent::Snapshot {
            phase: CyclePhase::Snapshot,
            snapshot,
        });
        self.refresh_points().await;

        if self.strategy.lock_enabled {
            report.locked = self.lock_phase(&snapshot).await;
            report.unlocked = self.unlock_phase().await;
        }

        if self.strategy.borrow_enabled {
            self.borrow_phase(&mut report).await?;
        }

        report.counters = self.governor.counters();
        Ok(report)
    }

    // -- Lock / unlock ---------------------------------------------------

    async fn lock_phase(&mut self, snapshot: &AccountSnapshot) -> Option<Decimal> {
        let (amount, reserved) = match plan_lock(&self.strategy, snapshot) {
            LockPlan::PreserveStake => {
                self.skip(CyclePhase::Lock, SkipReason::PreservingStake);
                return None;
            }
            LockPlan::InsufficientBalance => {
                self.skip(CyclePhase::Lock, SkipReason::InsufficientBalance);
                return None;
            }
            LockPlan::BelowMinimum { amount } => {
                self.skip(CyclePhase::Lock, SkipReason::BelowMinimum { amount });
                return None;
            }
            LockPlan::Lock { amount, reserved } => (amount, reserved),
        };

        if reserved > Decimal::ZERO {
            info!(reserved = %reserved, "Reserving balance for borrowing");
        }

        let quote = match self.ops.validate_lock(amount).await {
            Ok(quote) => quote,
            Err(e) => {
                self.operation_failed(&e);
                return None;
            }
        };

        let locked = quote.terms().amount;
        let outcome = match self.ops.execute_lock(quote).await {
            Ok(record) => {
                self.operation_succeeded(OperationKind::Lock, locked, record.id);
                self.refresh_points().await;
                Some(locked)
            }
            Err(e) => {
                self.operation_failed(&e);
                None
            }
        };

        // Give the stake time to register before unlocking.
        self.pause(self.timing.operation_delay()).await;
        outcome
    }

    async fn unlock_phase(&mut self) -> Option<Decimal> {
        let snapshot = match self.ops.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Wallet re-fetch failed, skipping unlock");
                self.governor.record_failure();
                self.skip(CyclePhase::Unlock, SkipReason::SnapshotUnavailable);
                return None;
            }
        };
        self.emit(CycleEvent::Snapshot {
            phase: CyclePhase::Unlock,
            snapshot,
        });

        if snapshot.staked_balance < self.strategy.min_operation_amount {
            self.skip(CyclePhase::Unlock, SkipReason::NothingStaked);
            return None;
        }

        // Always the full stake.
        let quote = match self.ops.validate_unlock(snapshot.staked_balance).await {
            Ok(quote) => quote,
            Err(e) => {
                self.operation_failed(&e);
                return None;
            }
        };

        let unlocked = quote.terms().amount;
        match self.ops.execute_unlock(quote).await {
            Ok(record) => {
                self.operation_succeeded(OperationKind::Unlock, unlocked, record.id);
                self.refresh_points().await;
                Some(unlocked)
            }
            Err(e) => {
                self.operation_failed(&e);
                None
            }
        }
    }

    // -- Repay / borrow --------------------------------------------------

    async fn borrow_phase(&mut self, report: &mut CycleReport) -> Result<()> {
        let min_hold = chrono::Duration::from_std(self.strategy.min_hold())
            .context("strategy.min_hold_secs is out of range")?;

        let snapshot = match self.ops.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Wallet re-fetch failed, skipping borrow");
                self.governor.record_failure();
                self.skip(CyclePhase::Borrow, SkipReason::SnapshotUnavailable);
                return Ok(());
            }
        };
        self.emit(CycleEvent::Snapshot {
            phase: CyclePhase::Borrow,
            snapshot,
        });

        let active = match self.ops.active_loans().await {
            Ok(loans) => loans,
            Err(e) => {
                warn!(error = %e, "Loan list unavailable, skipping borrow");
                self.governor.record_failure();
                self.skip(CyclePhase::Borrow, SkipReason::LoansUnavailable);
                return Ok(());
            }
        };
        let pruned = self.tracker.retain_active(&active);
        if pruned > 0 {
            debug!(pruned, "Forgot loans closed outside this process");
        }
        debug!(
            active = active.len(),
            tracked = self.tracker.len(),
            "Active loans"
        );

        // Repay first so a closure this cycle frees a slot for the new loan.
        report.repaid_loan = self.repay_oldest(&snapshot, &active, min_hold).await;
        let active_count = active.len() - usize::from(report.repaid_loan.is_some());

        if active_count >= self.strategy.max_active_loans {
            self.skip(
                CyclePhase::Borrow,
                SkipReason::LoanLimitReached {
                    active: active_count,
                },
            );
            return Ok(());
        }

        report.borrowed_loan = self.open_loan().await;
        Ok(())
    }

    async fn repay_oldest(
        &mut self,
        snapshot: &AccountSnapshot,
        active: &[Loan],
        min_hold: chrono::Duration,
    ) -> Option<String> {
        if active.is_empty() {
            return None;
        }

        let Some(loan) = self
            .tracker
            .select_repayment(active, self.clock.now(), min_hold)
        else {
            self.skip(CyclePhase::Repay, SkipReason::NoEligibleLoan);
            return None;
        };

        if snapshot.available_balance < loan.repayment_amount {
            self.skip(
                CyclePhase::Repay,
                SkipReason::InsufficientRepayBalance {
                    needed: loan.repayment_amount,
                    available: snapshot.available_balance,
                },
            );
            return None;
        }

        match self.ops.repay(loan).await {
            Ok(_) => {
                self.tracker.record_repaid(&loan.id);
                self.operation_succeeded(
                    OperationKind::Repay,
                    loan.repayment_amount,
                    Some(loan.id.clone()),
                );
                self.refresh_points().await;
                Some(loan.id.clone())
            }
            Err(e) => {
                self.operation_failed(&e);
                None
            }
        }
    }

    async fn open_loan(&mut self) -> Option<String> {
        let Some(collateral) = select_collateral(&self.ops, &self.probe_codes).await else {
            self.skip(CyclePhase::Borrow, SkipReason::NoCollateral);
            return None;
        };

        let rate = match self.ops.currency(&collateral.code).await {
            Ok(current) if current.rate > Decimal::ZERO => current.rate,
            Ok(current) => {
                warn!(code = %current.code, rate = %current.rate, "Collateral has no usable rate");
                self.skip(CyclePhase::Borrow, SkipReason::RateUnavailable);
                return None;
            }
            Err(e) => {
                warn!(code = %collateral.code, error = %e, "Rate lookup failed");
                if e.is_transport() {
                    self.governor.record_failure();
                }
                self.skip(CyclePhase::Borrow, SkipReason::RateUnavailable);
                return None;
            }
        };

        let outcome = fallback::search(
            &self.ops,
            self.clock.as_ref(),
            &self.fallback,
            &collateral.code,
            collateral.collateral_available,
            rate,
        )
        .await;

        let quote = match outcome {
            SearchOutcome::Found { quote, .. } => quote,
            SearchOutcome::Exhausted {
                attempts,
                transport_failures,
            } => {
                if transport_failures > 0 {
                    self.governor.record_failure();
                }
                self.skip(CyclePhase::Borrow, SkipReason::CandidatesExhausted { attempts });
                return None;
            }
        };

        let principal = quote.terms().principal_amount;
        match self.ops.confirm_borrow(quote).await {
            Ok(loan) => {
                self.tracker.record_open(&loan.id, self.clock.now());
                self.operation_succeeded(OperationKind::Borrow, principal, Some(loan.id.clone()));
                self.refresh_points().await;
                Some(loan.id)
            }
            Err(e) => {
                self.operation_failed(&e);
                None
            }
        }
    }

    // -- Helpers ---------------------------------------------------------

    async fn refresh_points(&self) {
        match self.ops.points().await {
            Ok(points) => self.emit(CycleEvent::Points(points)),
            Err(e) => debug!(error = %e, "Points unavailable"),
        }
    }

    fn operation_succeeded(&mut self, kind: OperationKind, amount: Decimal, reference: Option<String>) {
        self.governor.record_success();
        self.emit(CycleEvent::OperationSucceeded {
            kind,
            amount,
            reference,
        });
    }

    /// Validate rejections skip the phase; anything else counts against
    /// the run.
    fn operation_failed(&mut self, err: &OperationError) {
        if err.counts_as_failure() {
            self.governor.record_failure();
            self.emit(CycleEvent::OperationFailed {
                kind: err.kind,
                step: err.step,
                message: err.cause.to_string(),
            });
        } else {
            self.skip(
                phase_of(err.kind),
                SkipReason::ValidationRejected {
                    message: err.cause.to_string(),
                },
            );
        }
    }

    async fn govern(&mut self) {
        let errors = self.governor.counters().consecutive_errors;
        if let Some(cooldown) = self.governor.check() {
            self.emit(CycleEvent::Cooldown {
                errors,
                duration: cooldown,
            });
            self.pause(cooldown).await;
        }
    }

    /// Sleep, cut short by cancellation.
    async fn pause(&self, duration: Duration) {
        let clock = Arc::clone(&self.clock);
        let shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            _ = cancelled(shutdown) => debug!("Pause interrupted by shutdown"),
            _ = clock.sleep(duration) => {}
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn limit_reached(&self) -> bool {
        self.max_cycles
            .is_some_and(|max| self.governor.counters().cycle_count >= max)
    }

    fn skip(&self, phase: CyclePhase, reason: SkipReason) {
        self.emit(CycleEvent::PhaseSkipped { phase, reason });
    }

    fn emit(&self, event: CycleEvent) {
        self.sink.emit(&event);
    }
}

/// Resolves once cancellation is requested. A dropped sender never cancels.
async fn cancelled(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn phase_of(kind: OperationKind) -> CyclePhase {
    match kind {
        OperationKind::Lock => CyclePhase::Lock,
        OperationKind::Unlock => CyclePhase::Unlock,
        OperationKind::Borrow => CyclePhase::Borrow,
        OperationKind::Repay => CyclePhase::Repay,
    }
}
