//! End-to-end cycle loop tests against the scripted platform.
//!
//! Time is driven by a `ManualClock`, so every pause is recorded instead
//! of waited on.

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use liqfarm::config::{AppConfig, RunMode};
use liqfarm::engine::events::{CyclePhase, SkipReason};
use liqfarm::engine::operations::{OperationKind, Step};
use liqfarm::engine::{
    CycleEvent, CycleOrchestrator, EventSink, ManualClock, RecordingSink, RunSummary, StopReason,
};
use liqfarm::platforms::LendingPlatform;

use crate::mock_platform::{Call, ScriptedPlatform};

fn config(mode: RunMode, max_cycles: Option<u64>) -> AppConfig {
    let mut cfg = AppConfig {
        mode,
        ..AppConfig::default()
    };
    cfg.strategy.apply_mode(mode);
    cfg.run.max_cycles = max_cycles;
    cfg
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
    ))
}

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|s| Duration::from_secs(*s)).collect()
}

async fn run(
    platform: Arc<ScriptedPlatform>,
    clock: Arc<ManualClock>,
    sink: Arc<dyn EventSink>,
    cfg: &AppConfig,
    shutdown: watch::Receiver<bool>,
) -> RunSummary {
    let platform: Arc<dyn LendingPlatform> = platform;
    let mut orchestrator = CycleOrchestrator::new(platform, clock, sink, cfg, shutdown);
    orchestrator.run().await
}

fn skipped(events: &[CycleEvent], phase: CyclePhase) -> Vec<SkipReason> {
    events
        .iter()
        .filter_map(|e| match e {
            CycleEvent::PhaseSkipped { phase: p, reason } if *p == phase => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

fn completed(events: &[CycleEvent]) -> Vec<liqfarm::types::CycleReport> {
    events
        .iter()
        .filter_map(|e| match e {
            CycleEvent::CycleCompleted(report) => Some(report.clone()),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Lock / unlock
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_lock_then_unlock_full_balance() {
    let clock = clock();
    let platform = Arc::new(
        ScriptedPlatform::new(Arc::clone(&clock))
            .with_balance(dec!(1000), dec!(0))
            .with_lock_fee(dec!(0.5)),
    );
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);

    let summary = run(
        Arc::clone(&platform),
        Arc::clone(&clock),
        sink.clone(),
        &config(RunMode::Lock, Some(1)),
        rx,
    )
    .await;

    assert_eq!(summary.reason, StopReason::CycleLimit);
    assert_eq!(summary.counters.cycle_count, 1);
    assert_eq!(summary.counters.consecutive_successes, 2);
    assert_eq!(summary.counters.consecutive_errors, 0);

    let money: Vec<Call> = platform
        .calls()
        .into_iter()
        .filter(|c| !matches!(c, Call::Wallet | Call::Points))
        .collect();
    assert_eq!(
        money,
        vec![
            Call::ValidateLock(dec!(999)),
            Call::CreateLock(dec!(999), dec!(0.5)),
            Call::ValidateUnlock(dec!(999)),
            Call::CreateUnlock(dec!(999), dec!(0.00057)),
        ]
    );

    // One pause between lock and unlock; none after the final cycle.
    assert_eq!(clock.sleeps(), secs(&[30]));

    let reports = completed(&sink.events());
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].locked, Some(dec!(999)));
    assert_eq!(reports[0].unlocked, Some(dec!(999)));
    assert!(skipped(&sink.events(), CyclePhase::Lock).is_empty());
}

#[tokio::test]
async fn test_existing_stake_skips_lock() {
    let clock = clock();
    let platform = Arc::new(
        ScriptedPlatform::new(Arc::clone(&clock)).with_balance(dec!(1.5), dec!(50)),
    );
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);

    run(
        Arc::clone(&platform),
        Arc::clone(&clock),
        sink.clone(),
        &config(RunMode::Lock, Some(1)),
        rx,
    )
    .await;

    let calls = platform.calls();
    assert!(!calls.iter().any(|c| matches!(c, Call::ValidateLock(_))));
    assert!(calls.contains(&Call::ValidateUnlock(dec!(50))));
    assert_eq!(
        skipped(&sink.events(), CyclePhase::Lock),
        vec![SkipReason::PreservingStake]
    );
    // No lock attempted, so no inter-operation pause.
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_rejected_lock_execution_counts_as_error() {
    let clock = clock();
    let platform = Arc::new(
        ScriptedPlatform::new(Arc::clone(&clock))
            .with_balance(dec!(500), dec!(0))
            .rejecting_create_lock(),
    );
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);

    let summary = run(
        Arc::clone(&platform),
        Arc::clone(&clock),
        sink.clone(),
        &config(RunMode::Lock, Some(1)),
        rx,
    )
    .await;

    assert_eq!(summary.counters.consecutive_errors, 1);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        CycleEvent::OperationFailed {
            kind: OperationKind::Lock,
            step: Step::Execute,
            ..
        }
    )));
    // The lock attempt still waits before moving on; unlock finds nothing staked.
    assert_eq!(clock.sleeps(), secs(&[30]));
    assert_eq!(
        skipped(&sink.events(), CyclePhase::Unlock),
        vec![SkipReason::NothingStaked]
    );
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cooldown_after_five_failed_cycles() {
    let clock = clock();
    let platform = Arc::new(ScriptedPlatform::new(Arc::clone(&clock)).failing_wallet(usize::MAX));
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);

    let summary = run(
        Arc::clone(&platform),
        Arc::clone(&clock),
        sink.clone(),
        &config(RunMode::Both, Some(5)),
        rx,
    )
    .await;

    assert_eq!(clock.sleeps(), secs(&[30, 30, 30, 30, 30, 300]));
    assert_eq!(summary.counters.consecutive_errors, 0);
    assert_eq!(summary.counters.consecutive_successes, 0);
    assert!(sink.events().contains(&CycleEvent::Cooldown {
        errors: 5,
        duration: Duration::from_secs(300),
    }));
}

#[tokio::test]
async fn test_no_cooldown_after_four_failed_cycles() {
    let clock = clock();
    let platform = Arc::new(ScriptedPlatform::new(Arc::clone(&clock)).failing_wallet(usize::MAX));
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);

    let summary = run(
        Arc::clone(&platform),
        Arc::clone(&clock),
        sink.clone(),
        &config(RunMode::Both, Some(4)),
        rx,
    )
    .await;

    assert_eq!(clock.sleeps(), secs(&[30, 30, 30, 30]));
    assert_eq!(summary.counters.consecutive_errors, 4);
    assert!(!sink
        .events()
        .iter()
        .any(|e| matches!(e, CycleEvent::Cooldown { .. })));
    // Only wallet reads: no cycle went past the first fetch.
    assert!(platform.calls().iter().all(|c| *c == Call::Wallet));
}

#[tokio::test]
async fn test_unexpected_fault_gets_penalty() {
    let clock = clock();
    let platform = Arc::new(ScriptedPlatform::new(Arc::clone(&clock)).with_balance(dec!(10), dec!(0)));
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);

    let mut cfg = config(RunMode::Borrow, Some(1));
    cfg.strategy.min_hold_secs = u64::MAX;

    let summary = run(Arc::clone(&platform), Arc::clone(&clock), sink.clone(), &cfg, rx).await;

    assert_eq!(summary.reason, StopReason::CycleLimit);
    assert_eq!(summary.counters.consecutive_errors, 1);
    assert_eq!(clock.sleeps(), secs(&[60]));
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, CycleEvent::Fault { cycle: 1, .. })));
}

// ---------------------------------------------------------------------------
// Borrow / repay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_borrow_hold_then_repay() {
    let clock = clock();
    let platform = Arc::new(
        ScriptedPlatform::new(Arc::clone(&clock))
            .with_balance(dec!(10), dec!(0))
            .with_currency("LTC", dec!(2), dec!(50))
            .accepting_principal(|p| p == dec!(95)),
    );
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);

    let mut cfg = config(RunMode::Borrow, Some(3));
    cfg.strategy.min_hold_secs = 60;

    let summary = run(Arc::clone(&platform), Arc::clone(&clock), sink.clone(), &cfg, rx).await;

    // Cycle 1: three rejected candidates then a borrow at 95.
    // Cycle 2: loan is 30 s old, not yet repayable; collateral is all pledged.
    // Cycle 3: loan is 60 s old, repaid, and a new one is opened.
    assert_eq!(clock.sleeps(), secs(&[2, 2, 2, 30, 30, 2, 2, 2]));

    let reports = completed(&sink.events());
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].borrowed_loan.as_deref(), Some("loan-1"));
    assert_eq!(reports[1].repaid_loan, None);
    assert_eq!(reports[1].borrowed_loan, None);
    assert_eq!(reports[2].repaid_loan.as_deref(), Some("loan-1"));
    assert_eq!(reports[2].borrowed_loan.as_deref(), Some("loan-2"));

    let repay_skips = skipped(&sink.events(), CyclePhase::Repay);
    assert_eq!(repay_skips, vec![SkipReason::NoEligibleLoan]);
    assert_eq!(
        skipped(&sink.events(), CyclePhase::Borrow),
        vec![SkipReason::NoCollateral]
    );

    let calls = platform.calls();
    assert!(calls.contains(&Call::ConfirmBorrow {
        collateral: dec!(2),
        principal: dec!(95),
    }));
    assert!(calls.contains(&Call::Repay("loan-1".into(), dec!(95.19))));

    assert_eq!(summary.open_tracked, 1);
    assert_eq!(summary.counters.consecutive_successes, 3);
    assert_eq!(summary.counters.consecutive_errors, 0);
    let (available, _) = platform.balances();
    assert_eq!(available, dec!(10) + dec!(95) - dec!(95.19) + dec!(95));
}

#[tokio::test]
async fn test_pre_existing_loan_repaid_immediately() {
    let clock = clock();
    let platform = Arc::new(
        ScriptedPlatform::new(Arc::clone(&clock))
            .with_balance(dec!(200), dec!(0))
            .with_currency("LTC", dec!(2), dec!(50))
            .accepting_principal(|p| p == dec!(100)),
    );

    // A loan opened before this process started: it has no local open time.
    {
        let (_tx, rx) = watch::channel(false);
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::new());
        run(
            Arc::clone(&platform),
            Arc::clone(&clock),
            sink,
            &config(RunMode::Borrow, Some(1)),
            rx,
        )
        .await;
    }
    assert_eq!(platform.loans().len(), 1);

    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);
    let mut cfg = config(RunMode::Borrow, Some(1));
    cfg.strategy.max_active_loans = 1;
    run(Arc::clone(&platform), Arc::clone(&clock), sink.clone(), &cfg, rx).await;

    let reports = completed(&sink.events());
    assert_eq!(reports[0].repaid_loan.as_deref(), Some("loan-1"));
    // The repayment freed the only slot, so a new loan was opened.
    assert_eq!(reports[0].borrowed_loan.as_deref(), Some("loan-2"));
}

#[tokio::test]
async fn test_repay_skipped_when_balance_short() {
    let clock = clock();
    let platform = Arc::new(
        ScriptedPlatform::new(Arc::clone(&clock))
            .with_balance(dec!(10), dec!(0))
            .with_active_loan("loan-old", dec!(95)),
    );
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);

    let summary = run(
        Arc::clone(&platform),
        Arc::clone(&clock),
        sink.clone(),
        &config(RunMode::Borrow, Some(1)),
        rx,
    )
    .await;

    assert_eq!(
        skipped(&sink.events(), CyclePhase::Repay),
        vec![SkipReason::InsufficientRepayBalance {
            needed: dec!(95.19),
            available: dec!(10),
        }]
    );
    assert!(!platform.calls().iter().any(|c| matches!(c, Call::Repay(..))));
    assert_eq!(summary.counters.consecutive_errors, 0);
    assert!(platform.loans()[0].is_active());
}

#[tokio::test]
async fn test_borrow_gated_at_loan_limit() {
    let clock = clock();
    let platform = Arc::new(
        ScriptedPlatform::new(Arc::clone(&clock))
            .with_balance(dec!(0), dec!(0))
            .with_currency("LTC", dec!(2), dec!(50))
            .with_active_loan("loan-a", dec!(50))
            .with_active_loan("loan-b", dec!(50)),
    );
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);

    let mut cfg = config(RunMode::Borrow, Some(1));
    cfg.strategy.max_active_loans = 2;

    let summary = run(Arc::clone(&platform), Arc::clone(&clock), sink.clone(), &cfg, rx).await;

    assert_eq!(
        skipped(&sink.events(), CyclePhase::Borrow),
        vec![SkipReason::LoanLimitReached { active: 2 }]
    );
    let calls = platform.calls();
    assert!(!calls.iter().any(|c| matches!(
        c,
        Call::ListCurrencies | Call::ValidateBorrow(_) | Call::ConfirmBorrow { .. } | Call::Repay(..)
    )));
    assert_eq!(summary.counters.consecutive_errors, 0);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_exhausted_candidates_skip_borrow_quietly() {
    let clock = clock();
    let platform = Arc::new(
        ScriptedPlatform::new(Arc::clone(&clock))
            .with_balance(dec!(10), dec!(0))
            .with_currency("LTC", dec!(2), dec!(50))
            .accepting_principal(|_| false),
    );
    let sink = Arc::new(RecordingSink::new());
    let (_tx, rx) = watch::channel(false);

    let summary = run(
        Arc::clone(&platform),
        Arc::clone(&clock),
        sink.clone(),
        &config(RunMode::Borrow, Some(1)),
        rx,
    )
    .await;

    // 100, 99.9, 99, 95, 90 and the fixed 15: six attempts, five retry waits.
    assert_eq!(
        skipped(&sink.events(), CyclePhase::Borrow),
        vec![SkipReason::CandidatesExhausted { attempts: 6 }]
    );
    assert_eq!(clock.sleeps(), secs(&[2, 2, 2, 2, 2]));

    let tried: Vec<_> = platform
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::ValidateBorrow(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(tried.len(), 6);
    assert_eq!(tried.last(), Some(&dec!(15)));
    assert!(!platform
        .calls()
        .iter()
        .any(|c| matches!(c, Call::ConfirmBorrow { .. })));

    assert_eq!(summary.counters.consecutive_errors, 0);
    assert!(!sink.events().iter().any(|e| matches!(
        e,
        CycleEvent::Fault { .. } | CycleEvent::OperationFailed { .. }
    )));
}

/// Liquidates a loan once the first cycle completes.
struct LiquidateAfterFirstCycle {
    platform: Arc<ScriptedPlatform>,
    loan_id: &'static str,
    inner: RecordingSink,
}

impl EventSink for LiquidateAfterFirstCycle {
    fn emit(&self, event: &CycleEvent) {
        self.inner.emit(event);
        if matches!(event, CycleEvent::CycleCompleted(r) if r.cycle_number == 1) {
            self.platform.liquidate(self.loan_id);
        }
    }
}

#[tokio::test]
async fn test_loans_closed_by_platform_are_forgotten() {
    let clock = clock();
    let platform = Arc::new(
        ScriptedPlatform::new(Arc::clone(&clock))
            .with_balance(dec!(10), dec!(0))
            .with_currency("LTC", dec!(2), dec!(50))
            .accepting_principal(|p| p == dec!(100)),
    );
    let sink = Arc::new(LiquidateAfterFirstCycle {
        platform: Arc::clone(&platform),
        loan_id: "loan-1",
        inner: RecordingSink::new(),
    });
    let (_tx, rx) = watch::channel(false);

    let mut cfg = config(RunMode::Borrow, Some(2));
    cfg.strategy.min_hold_secs = 3600;

    let summary = run(Arc::clone(&platform), Arc::clone(&clock), sink.clone(), &cfg, rx).await;

    let reports = completed(&sink.inner.events());
    assert_eq!(reports[0].borrowed_loan.as_deref(), Some("loan-1"));
    assert!(!platform.loans()[0].is_active());
    assert_eq!(summary.open_tracked, 0);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancelled_before_start() {
    let clock = clock();
    let platform = Arc::new(ScriptedPlatform::new(Arc::clone(&clock)).with_balance(dec!(1000), dec!(0)));
    let sink = Arc::new(RecordingSink::new());
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let summary = run(
        Arc::clone(&platform),
        Arc::clone(&clock),
        sink.clone(),
        &config(RunMode::Both, None),
        rx,
    )
    .await;

    assert_eq!(summary.reason, StopReason::Cancelled);
    assert_eq!(summary.counters.cycle_count, 0);
    assert!(platform.calls().is_empty());
    assert_eq!(sink.events(), vec![CycleEvent::Stopped(StopReason::Cancelled)]);
}

/// Requests shutdown as soon as the first cycle completes.
struct CancelAfterFirstCycle {
    tx: watch::Sender<bool>,
    inner: RecordingSink,
}

impl EventSink for CancelAfterFirstCycle {
    fn emit(&self, event: &CycleEvent) {
        self.inner.emit(event);
        if matches!(event, CycleEvent::CycleCompleted(_)) {
            let _ = self.tx.send(true);
        }
    }
}

#[tokio::test]
async fn test_cancel_interrupts_inter_cycle_pause() {
    let clock = clock();
    let platform = Arc::new(
        ScriptedPlatform::new(Arc::clone(&clock))
            .with_balance(dec!(1000), dec!(0))
            .with_lock_fee(dec!(0.5)),
    );
    let (tx, rx) = watch::channel(false);
    let sink = Arc::new(CancelAfterFirstCycle {
        tx,
        inner: RecordingSink::new(),
    });

    let summary = run(
        Arc::clone(&platform),
        Arc::clone(&clock),
        sink.clone(),
        &config(RunMode::Lock, None),
        rx,
    )
    .await;

    assert_eq!(summary.reason, StopReason::Cancelled);
    assert_eq!(summary.counters.cycle_count, 1);
    // Only the lock → unlock pause; the 30 s inter-cycle wait was cut short.
    assert_eq!(clock.sleeps(), secs(&[30]));
    assert_eq!(
        sink.inner.events().last(),
        Some(&CycleEvent::Stopped(StopReason::Cancelled))
    );
}
