//! Per-user daily usage counter gating the assistant.
//!
//! One `UsageRecord` per user, keyed by user id. A record whose date is not
//! today is reset on its next access rather than incremented (calendar-day
//! rollover, UTC). Records are created lazily and only removed by
//! [`QuotaTracker::prune_stale`], which the service calls periodically.
//!
//! The tracker knows nothing about what it gates; it is a counter and a
//! gate keyed by (user, day).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use tracing::{debug, info};

use crate::plans::{DailyQuota, PlanTier};

/// Source of the canonical "today".
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Wall clock, UTC calendar days.
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    pub date: NaiveDate,
    pub count: u32,
}

pub struct QuotaTracker {
    usage: Mutex<HashMap<String, UsageRecord>>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            usage: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UsageRecord>> {
        // A panic while holding the lock can't leave a record half-written
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records one use for `user_id` if the plan allows it.
    ///
    /// Returns `false`, without mutating anything, when today's quota is
    /// exhausted. The first use of a day always succeeds.
    pub fn consume(&self, user_id: &str, tier: PlanTier) -> bool {
        let today = self.clock.today();
        let mut usage = self.lock();

        let record = usage
            .entry(user_id.to_string())
            .or_insert(UsageRecord {
                date: today,
                count: 0,
            });
        if record.date != today || record.count == 0 {
            *record = UsageRecord {
                date: today,
                count: 1,
            };
            debug!("Quota: first use today for {user_id}");
            return true;
        }

        if let DailyQuota::Limited(limit) = tier.policy().daily_quota {
            if record.count >= limit {
                info!("Quota exhausted for {user_id} ({}/{limit}, plan {tier})", record.count);
                return false;
            }
        }
        record.count += 1;
        true
    }

    /// Today's record for `user_id`, if any. Stale records read as `None`.
    #[cfg(test)]
    pub fn usage(&self, user_id: &str) -> Option<UsageRecord> {
        let today = self.clock.today();
        self.lock()
            .get(user_id)
            .copied()
            .filter(|record| record.date == today)
    }

    /// Drops records from previous days. Returns how many were removed.
    pub fn prune_stale(&self) -> usize {
        let today = self.clock.today();
        let mut usage = self.lock();
        let before = usage.len();
        usage.retain(|_, record| record.date == today);
        before - usage.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.lock().len()
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}
