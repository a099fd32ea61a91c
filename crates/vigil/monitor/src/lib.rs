//! # Vigil Monitor - Stream Surveillance, Trigger Evaluation and Escalation
//!
//! The monitoring core decides, for many independent users, when an external
//! market event is worth telling them about.
//!
//! ## Overview
//!
//! - **Streams** are watched (user, topic) pairs whose polling cadence follows
//!   their temperature (Hot / Warm / Cold).
//! - **Conditions** are rules over streams in one of three tiers: closed-form
//!   Alerts, composite Signals, and LLM-evaluated judgments.
//! - **Escalation** turns a newly satisfied condition into a notification,
//!   via deep collection and judgment for the costlier tiers, under a daily
//!   per-user budget.
//! - **Patrol** periodically sweeps temperatures, samples Cold streams for
//!   anomalies, judges LLM conditions and purges stale system conditions.
//!
//! ## Key Components
//!
//! - [`StreamRegistry`]: stream catalog, temperature and change policy
//! - [`ConditionStore`]: condition arena with stream and tier/state indexes
//! - [`TriggerEvaluator`]: pure, edge-triggered predicate evaluation
//! - [`EscalationCoordinator`]: occurrence state machine and deduplication
//! - [`NotificationBudget`]: atomic per-user daily ceiling
//! - [`PatrolScheduler`]: independent per-user patrol loops
//! - [`MonitorEngine`]: wires the above together
//!
//! ## Example
//!
//! ```rust,no_run
//! use vigil_monitor::{Collaborators, MonitorConfig, MonitorEngine, Profile};
//! use vigil_types::{
//!     AlertPredicate, Comparison, ConditionOrigin, ConditionPayload, Quantity, SampleValue,
//!     TopicKey, UserId,
//! };
//!
//! # async fn example() -> vigil_monitor::MonitorResult<()> {
//! let engine = MonitorEngine::new(
//!     MonitorConfig::for_profile(Profile::Development),
//!     Collaborators::default(),
//! );
//!
//! let user = UserId::new("alice");
//! engine.create_condition(
//!     &user,
//!     ConditionPayload::Alert(AlertPredicate::new(
//!         TopicKey::funding("BTC"),
//!         Comparison::Below(Quantity::Percent(-0.1)),
//!     )),
//!     ConditionOrigin::UserRequest,
//!     None,
//! )?;
//!
//! let report = engine.ingest(&user, &TopicKey::funding("BTC"), SampleValue::percent(-0.12))?;
//! for outcome in report.settle().await {
//!     println!("{:?}", outcome);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod anomaly;
pub mod breaker;
pub mod budget;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod evaluator;
pub mod ingest;
pub mod patrol;
pub mod registry;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types
pub use anomaly::{Anomaly, AnomalyDetector, AnomalyKind, Direction, Severity};
pub use breaker::{CircuitBreaker, CircuitState};
pub use budget::{BudgetStatus, BudgetTicket, NotificationBudget};
pub use clock::{Clock, SharedClock, SystemClock};
pub use collaborators::{
    ClassifiedIntent, CollectRequest, CollectedContext, Collaborators, DeepCollector,
    IntentClassifier, Judge, JudgeRequest, Judgment, Notifier, StreamSource,
};
pub use config::{
    AnomalyConfig, BudgetConfig, CadenceConfig, CircuitBreakerConfig, DeltaConfig,
    EscalationConfig, MonitorConfig, PatrolConfig, Profile, RetentionConfig, SignalConfig,
    TemperatureConfig,
};
pub use engine::MonitorEngine;
pub use error::{MonitorError, MonitorResult};
pub use escalation::{EscalationCoordinator, InFlightGuard};
pub use evaluator::{Edge, Evaluation, Reading, Readings, SkipReason, TriggerEvaluator, Verdict};
pub use ingest::{IngestPipeline, IngestReport};
pub use patrol::{PatrolReport, PatrolScheduler, PatrolStep};
pub use registry::{SampleDelta, StreamRegistry, TemperatureTransition, DEFAULT_PRESET};
pub use store::{ConditionStore, NewCondition};

#[cfg(any(test, feature = "test-utils"))]
pub use clock::ManualClock;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
