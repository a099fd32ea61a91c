//! Per-user daily notification budget.
//!
//! Only judged (Signal / LLM-evaluated) notifications are budgeted. The
//! counter is the one piece of state contended by concurrent escalations of
//! the same user, so consumption is a single atomic increment-with-ceiling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_types::UserId;

use crate::clock::SharedClock;
use crate::config::BudgetConfig;

/// Snapshot of one user's budget for the current day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub user: UserId,
    pub day: NaiveDate,
    pub count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// One consumed unit of budget; can be refunded if the notification was
/// never dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetTicket {
    pub user: UserId,
    pub day: NaiveDate,
    pub count: u32,
}

/// Counters keyed by (user, day).
pub struct NotificationBudget {
    counters: DashMap<(UserId, NaiveDate), Arc<AtomicU32>>,
    limit: u32,
    offset: FixedOffset,
    clock: SharedClock,
}

impl NotificationBudget {
    pub fn new(config: &BudgetConfig, clock: SharedClock) -> Self {
        let offset =
            FixedOffset::east_opt(config.reset_offset_secs).unwrap_or_else(|| Utc.fix());
        Self {
            counters: DashMap::new(),
            limit: config.daily_limit,
            offset,
            clock,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Day in the reference timezone that `at` falls on.
    pub fn day_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// Next midnight in the reference timezone after `at`, in UTC.
    pub fn reset_at(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let next_day = self.day_of(at) + Duration::days(1);
        next_day
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| self.offset.from_local_datetime(&midnight).single())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or(at + Duration::days(1))
    }

    fn counter(&self, user: &UserId, day: NaiveDate) -> Arc<AtomicU32> {
        let key = (user.clone(), day);
        if let Some(counter) = self.counters.get(&key) {
            return counter.clone();
        }
        self.counters.entry(key).or_default().clone()
    }

    /// Consume one unit if the ceiling allows it.
    pub fn try_consume(&self, user: &UserId) -> Option<BudgetTicket> {
        let day = self.day_of(self.clock.now());
        let limit = self.limit;
        let previous = self
            .counter(user, day)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < limit).then_some(count + 1)
            })
            .ok()?;

        debug!(user = %user, count = previous + 1, limit, "Budget consumed");
        Some(BudgetTicket {
            user: user.clone(),
            day,
            count: previous + 1,
        })
    }

    /// Return a ticket whose notification was not dispatched.
    pub fn refund(&self, ticket: &BudgetTicket) {
        if let Some(counter) = self.counters.get(&(ticket.user.clone(), ticket.day)) {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        }
    }

    pub fn count(&self, user: &UserId) -> u32 {
        let day = self.day_of(self.clock.now());
        self.counters
            .get(&(user.clone(), day))
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn remaining(&self, user: &UserId) -> u32 {
        self.limit.saturating_sub(self.count(user))
    }

    pub fn is_exhausted(&self, user: &UserId) -> bool {
        self.remaining(user) == 0
    }

    pub fn status(&self, user: &UserId) -> BudgetStatus {
        let now = self.clock.now();
        let count = self.count(user);
        BudgetStatus {
            user: user.clone(),
            day: self.day_of(now),
            count,
            limit: self.limit,
            remaining: self.limit.saturating_sub(count),
            reset_at: self.reset_at(now),
        }
    }

    /// Drop one user's counters for days before today.
    pub fn prune_user(&self, user: &UserId) -> usize {
        let today = self.day_of(self.clock.now());
        let before = self.counters.len();
        self.counters
            .retain(|(owner, day), _| owner != user || *day >= today);
        before.saturating_sub(self.counters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn budget(limit: u32, offset: i32) -> (NotificationBudget, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::fixed());
        let config = BudgetConfig {
            daily_limit: limit,
            reset_offset_secs: offset,
        };
        (NotificationBudget::new(&config, clock.clone()), clock)
    }

    #[test]
    fn test_ceiling_is_enforced() {
        let (budget, _) = budget(5, 0);
        let user = UserId::new("u1");
        for expected in 1..=5 {
            assert_eq!(budget.try_consume(&user).unwrap().count, expected);
        }
        assert!(budget.try_consume(&user).is_none());
        assert!(budget.is_exhausted(&user));
        assert_eq!(budget.remaining(&UserId::new("u2")), 5);
    }

    #[test]
    fn test_refund_returns_unit() {
        let (budget, _) = budget(1, 0);
        let user = UserId::new("u1");
        let ticket = budget.try_consume(&user).unwrap();
        assert!(budget.try_consume(&user).is_none());
        budget.refund(&ticket);
        assert!(budget.try_consume(&user).is_some());
    }

    #[test]
    fn test_resets_at_midnight_in_reference_zone() {
        // UTC+9: the fixed clock's 00:00 UTC is 09:00 local.
        let (budget, clock) = budget(1, 9 * 3600);
        let user = UserId::new("u1");
        assert!(budget.try_consume(&user).is_some());

        let status = budget.status(&user);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.reset_at - clock.now(), Duration::hours(15));

        clock.advance(Duration::hours(15));
        assert_eq!(budget.remaining(&user), 1);
        assert_eq!(budget.prune_user(&user), 1);
    }

    #[test]
    fn test_concurrent_consumption_never_exceeds_limit() {
        let (budget, _) = budget(5, 0);
        let budget = Arc::new(budget);
        let user = UserId::new("u1");

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let budget = budget.clone();
                let user = user.clone();
                std::thread::spawn(move || budget.try_consume(&user).is_some())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 5);
        assert_eq!(budget.count(&user), 5);
    }
}
