//! Error-storm governor.
//!
//! Owns the run counters. After every cycle the orchestrator asks it
//! whether too many consecutive failures have piled up; if so it hands back
//! the cooldown to sleep and starts both streaks over.

use std::time::Duration;

use crate::types::RunCounters;

#[derive(Debug)]
pub struct Governor {
    counters: RunCounters,
    max_consecutive_errors: u32,
    cooldown: Duration,
}

impl Governor {
    pub fn new(max_consecutive_errors: u32, cooldown: Duration) -> Self {
        Self {
            counters: RunCounters::default(),
            max_consecutive_errors,
            cooldown,
        }
    }

    /// Returns the new cycle number.
    pub fn begin_cycle(&mut self) -> u64 {
        self.counters.cycle_count += 1;
        self.counters.cycle_count
    }

    pub fn record_success(&mut self) {
        self.counters.consecutive_successes = self.counters.consecutive_successes.saturating_add(1);
        self.counters.consecutive_errors = 0;
    }

    pub fn record_failure(&mut self) {
        self.counters.consecutive_errors = self.counters.consecutive_errors.saturating_add(1);
        self.counters.consecutive_successes = 0;
    }

    pub fn counters(&self) -> RunCounters {
        self.counters
    }

    /// Cooldown to apply now, if the error threshold is reached. Resets
    /// both streak counters when it fires.
    pub fn check(&mut self) -> Option<Duration> {
        if self.counters.consecutive_errors < self.max_consecutive_errors {
            return None;
        }
        self.counters.consecutive_errors = 0;
        self.counters.consecutive_successes = 0;
        Some(self.cooldown)
    }
}
