//! Per-client usage ceilings.
//!
//! A [`ResourceQuota`] enforces two limits at once: a daily task budget that
//! resets at the local calendar-day boundary, and a ceiling on tasks admitted
//! but not yet completed.

mod client;

pub use client::{ClientContext, ClientManager};

use std::sync::Mutex;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::QuotaError;
use crate::sync::lock;

/// Subscription tier. Each maps to fixed ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserLevel {
    #[default]
    Basic,
    Premium,
    Business,
}

impl UserLevel {
    /// `(max_total_tasks, max_concurrent_tasks)` for this tier.
    pub fn limits(&self) -> (u32, u32) {
        match self {
            Self::Basic => (100, 5),
            Self::Premium => (500, 15),
            Self::Business => (2000, 50),
        }
    }
}

impl std::fmt::Display for UserLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Business => "business",
        };
        write!(f, "{s}")
    }
}

/// Serializable view of a quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub user_level: UserLevel,
    pub max_total_tasks: u32,
    pub max_concurrent_tasks: u32,
    pub total_used: u32,
    pub running: u32,
    pub last_reset: NaiveDate,
}

#[derive(Debug)]
struct QuotaState {
    max_total_tasks: u32,
    max_concurrent_tasks: u32,
    total_used: u32,
    running: u32,
    user_level: UserLevel,
    last_reset: NaiveDate,
}

impl QuotaState {
    fn reset_if_new_day(&mut self, today: NaiveDate) -> bool {
        if today > self.last_reset {
            self.total_used = 0;
            self.last_reset = today;
            true
        } else {
            false
        }
    }
}

/// Daily and concurrent task ceilings for one client.
///
/// Invariants: `running <= max_concurrent_tasks` and
/// `total_used <= max_total_tasks` after every admission. The ceilings are
/// enforced at admission: lowering them below current usage refuses new
/// tasks until usage falls back under the new ceiling, it never evicts
/// running ones.
#[derive(Debug)]
pub struct ResourceQuota {
    state: Mutex<QuotaState>,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self::for_level(UserLevel::Basic)
    }
}

impl ResourceQuota {
    /// Quota with the ceilings of `level`.
    pub fn for_level(level: UserLevel) -> Self {
        let (max_total, max_concurrent) = level.limits();
        Self {
            state: Mutex::new(QuotaState {
                max_total_tasks: max_total,
                max_concurrent_tasks: max_concurrent,
                total_used: 0,
                running: 0,
                user_level: level,
                last_reset: Local::now().date_naive(),
            }),
        }
    }

    /// Quota with explicit ceilings.
    pub fn with_limits(max_total_tasks: u32, max_concurrent_tasks: u32) -> Self {
        let quota = Self::default();
        quota.set_limits(max_total_tasks, max_concurrent_tasks);
        quota
    }

    /// Admit one task: both counters are checked and incremented atomically.
    pub fn try_increment(&self) -> Result<(), QuotaError> {
        self.try_increment_on(Local::now().date_naive())
    }

    pub(crate) fn try_increment_on(&self, today: NaiveDate) -> Result<(), QuotaError> {
        let mut state = lock(&self.state);
        state.reset_if_new_day(today);

        if state.total_used >= state.max_total_tasks {
            return Err(QuotaError::DailyLimitReached {
                used: state.total_used,
                max: state.max_total_tasks,
            });
        }
        if state.running >= state.max_concurrent_tasks {
            return Err(QuotaError::ConcurrencyLimitReached {
                running: state.running,
                max: state.max_concurrent_tasks,
            });
        }

        state.total_used += 1;
        state.running += 1;
        Ok(())
    }

    /// Release the concurrency slot of a finished task. Must be called once
    /// per admitted task.
    pub fn complete_task(&self) {
        let mut state = lock(&self.state);
        if state.running == 0 {
            tracing::warn!("complete_task called with no running tasks");
            return;
        }
        state.running -= 1;
    }

    /// Undo an admission whose enqueue failed.
    pub fn rollback(&self) {
        let mut state = lock(&self.state);
        state.running = state.running.saturating_sub(1);
        state.total_used = state.total_used.saturating_sub(1);
    }

    /// Remap ceilings to the tier of `level`. Takes effect at the next
    /// admission.
    pub fn set_user_level(&self, level: UserLevel) {
        let (max_total, max_concurrent) = level.limits();
        let mut state = lock(&self.state);
        state.user_level = level;
        state.max_total_tasks = max_total;
        state.max_concurrent_tasks = max_concurrent;
    }

    /// Override the ceilings without changing the tier. Takes effect at the
    /// next admission.
    pub fn set_limits(&self, max_total_tasks: u32, max_concurrent_tasks: u32) {
        let mut state = lock(&self.state);
        state.max_total_tasks = max_total_tasks;
        state.max_concurrent_tasks = max_concurrent_tasks;
    }

    /// Zero the daily counter when the local date has moved past the last
    /// reset. Running tasks are left alone. Returns whether a reset happened.
    pub fn check_and_reset_daily_quota(&self) -> bool {
        self.reset_on(Local::now().date_naive())
    }

    pub(crate) fn reset_on(&self, today: NaiveDate) -> bool {
        lock(&self.state).reset_if_new_day(today)
    }

    pub fn running(&self) -> u32 {
        lock(&self.state).running
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let state = lock(&self.state);
        QuotaSnapshot {
            user_level: state.user_level,
            max_total_tasks: state.max_total_tasks,
            max_concurrent_tasks: state.max_concurrent_tasks,
            total_used: state.total_used,
            running: state.running,
            last_reset: state.last_reset,
        }
    }
}
