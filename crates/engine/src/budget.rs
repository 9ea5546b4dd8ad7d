//! Spend ceiling for paid calls
//!
//! A [`BudgetGuard`] tracks cumulative spend against a ceiling, either over a
//! rolling time window or for the lifetime of the guard (per-cycle budgets).
//! Admission and commit are made atomic for concurrent callers through
//! [`Reservation`]s: an admitted amount is held until the call either commits
//! it or drops the reservation.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::types::{BudgetState, PriceQuote};

/// Source of "now" for window accounting
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
struct Ledger {
    spent: u64,
    reserved: u64,
    window_start: DateTime<Utc>,
}

pub struct BudgetGuard {
    ceiling: u64,
    window: Option<chrono::Duration>,
    ledger: Mutex<Ledger>,
    clock: Arc<dyn Clock>,
}

impl BudgetGuard {
    /// Ceiling that resets every `window`
    pub fn new(ceiling_atomic: u64, window: Duration) -> Self {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        Self::build(ceiling_atomic, Some(window), Arc::new(SystemClock))
    }

    /// Ceiling for a single pipeline cycle; never rolls over
    pub fn per_cycle(ceiling_atomic: u64) -> Self {
        Self::build(ceiling_atomic, None, Arc::new(SystemClock))
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self::build(self.ceiling, self.window, clock)
    }

    fn build(ceiling: u64, window: Option<chrono::Duration>, clock: Arc<dyn Clock>) -> Self {
        let window_start = clock.now();
        Self {
            ceiling,
            window,
            ledger: Mutex::new(Ledger {
                spent: 0,
                reserved: 0,
                window_start,
            }),
            clock,
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// True iff the quote fits in what is left of the active window.
    /// Only a due window rollover is applied; nothing is held.
    pub fn admit(&self, quote: &PriceQuote) -> bool {
        self.admit_amount(quote.amount_atomic)
    }

    pub fn admit_amount(&self, amount_atomic: u64) -> bool {
        let ledger = self.ledger();
        fits(self.ceiling, &ledger, amount_atomic)
    }

    /// Admit and hold `amount_atomic` in one step. `None` when it does not fit.
    pub fn reserve(&self, amount_atomic: u64) -> Option<Reservation<'_>> {
        let mut ledger = self.ledger();
        if !fits(self.ceiling, &ledger, amount_atomic) {
            debug!(
                amount = amount_atomic,
                spent = ledger.spent,
                reserved = ledger.reserved,
                ceiling = self.ceiling,
                "Budget admission refused"
            );
            return None;
        }
        ledger.reserved += amount_atomic;
        Some(Reservation {
            guard: self,
            amount: amount_atomic,
            settled: false,
        })
    }

    pub fn current_state(&self) -> BudgetState {
        let ledger = self.ledger();
        BudgetState {
            spent_atomic: ledger.spent,
            reserved_atomic: ledger.reserved,
            ceiling_atomic: self.ceiling,
            window_start: ledger.window_start,
            window_duration_secs: self.window.map(|w| w.num_seconds().max(0) as u64),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.current_state().remaining()
    }

    /// Lock the ledger, rolling the window over first when it has elapsed
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(window) = self.window {
            let now = self.clock.now();
            let due = ledger
                .window_start
                .checked_add_signed(window)
                .map(|end| now >= end)
                .unwrap_or(false);
            if due {
                debug!(spent = ledger.spent, "Budget window elapsed, resetting");
                ledger.spent = 0;
                ledger.window_start = now;
            }
        }
        ledger
    }

    fn settle(&self, amount: u64, spend: bool) {
        let mut ledger = self.ledger();
        ledger.reserved = ledger.reserved.saturating_sub(amount);
        if spend {
            ledger.spent = ledger.spent.saturating_add(amount);
        }
    }
}

fn fits(ceiling: u64, ledger: &Ledger, amount: u64) -> bool {
    ledger
        .spent
        .checked_add(ledger.reserved)
        .and_then(|held| held.checked_add(amount))
        .map(|total| total <= ceiling)
        .unwrap_or(false)
}

/// Admitted amount held for one in-flight call.
///
/// [`Reservation::commit`] turns it into spend; dropping it releases the hold.
#[must_use = "dropping a reservation releases it immediately"]
pub struct Reservation<'a> {
    guard: &'a BudgetGuard,
    amount: u64,
    settled: bool,
}

impl Reservation<'_> {
    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn commit(mut self) {
        self.settled = true;
        self.guard.settle(self.amount, true);
        debug!(amount = self.amount, "Reservation committed");
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.guard.settle(self.amount, false);
            debug!(amount = self.amount, "Reservation released");
        }
    }
}
