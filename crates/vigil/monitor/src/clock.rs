//! Wall-clock source.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Source of the current time. Every component reads time through this.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use manual::ManualClock;

#[cfg(any(test, feature = "test-utils"))]
mod manual {
    use super::*;
    use std::sync::Mutex;

    use crate::lock;

    /// Clock that only moves when told to.
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(start),
            }
        }

        /// A clock starting at 2026-01-05 00:00:00 UTC.
        pub fn fixed() -> Self {
            let start = DateTime::parse_from_rfc3339("2026-01-05T00:00:00Z")
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            Self::new(start)
        }

        pub fn set(&self, now: DateTime<Utc>) {
            *lock(&self.now) = now;
        }

        pub fn advance(&self, by: chrono::Duration) {
            let mut now = lock(&self.now);
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *lock(&self.now)
        }
    }
}
