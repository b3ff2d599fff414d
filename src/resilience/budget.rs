//! Global retry budget: a capped number of retries per fixed time window.
//!
//! The budget is shared by every call through one retry layer and caps total
//! retry volume independently of any single call's retry limit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct BudgetWindow {
    used: u32,
    window_start: Instant,
}

/// Point-in-time view of the budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub used: u32,
    pub limit: u32,
    pub available: u32,
    pub reset_time: DateTime<Utc>,
}

/// Retry allowance per window.
#[derive(Debug)]
pub struct RetryBudget {
    limit: u32,
    window: Duration,
    state: Mutex<BudgetWindow>,
}

impl RetryBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(BudgetWindow {
                used: 0,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Units used in the current window, counting an elapsed window as empty.
    fn effective_used(&self, state: &BudgetWindow, now: Instant) -> u32 {
        if now >= state.window_start + self.window {
            0
        } else {
            state.used
        }
    }

    /// Whether a retry could be granted right now. Does not modify the budget.
    pub fn has_capacity(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.effective_used(&state, Instant::now()) < self.limit
    }

    /// Take one unit if any remain. Rolling the window, checking the limit and
    /// incrementing happen under one lock, so concurrent callers can never
    /// overdraw the budget.
    pub fn try_consume(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now >= state.window_start + self.window {
            state.used = 0;
            state.window_start = now;
        }
        if state.used < self.limit {
            state.used += 1;
            true
        } else {
            false
        }
    }

    pub fn status(&self) -> BudgetStatus {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let used = self.effective_used(&state, now);
        let reset_in = if used == 0 && now >= state.window_start + self.window {
            self.window
        } else {
            (state.window_start + self.window).saturating_duration_since(now)
        };
        let reset_in = chrono::Duration::from_std(reset_in).unwrap_or_else(|_| chrono::Duration::zero());
        BudgetStatus {
            used,
            limit: self.limit,
            available: self.limit.saturating_sub(used),
            reset_time: Utc::now() + reset_in,
        }
    }

    /// Start a fresh, empty window.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.used = 0;
        state.window_start = Instant::now();
    }
}
