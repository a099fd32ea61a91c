//! Escalation coordinator.
//!
//! Drives one satisfied occurrence to its outcome:
//!
//! ```text
//! Alert:           Satisfied -> Fire -> Notify
//! Signal / LLM:    Satisfied -> Budget? -> DeepCollect -> Judge -> Fire -> Notify
//!                                 \-> exhausted: Fire (suppressed)
//! ```
//!
//! Collaborator failures leave the condition Active so the next evaluation
//! retries. Exactly one attempt per occurrence may be in flight.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use vigil_types::{
    Condition, ConditionId, ConditionPayload, ConditionState, ConditionTier, DataCategory,
    EscalationOutcome, EscalationRecord, MonitorEvent, Notification, NotificationDetail,
    Occurrence, SampleValue, UserId,
};

use crate::breaker::CircuitBreaker;
use crate::budget::NotificationBudget;
use crate::clock::SharedClock;
use crate::collaborators::{
    CollectRequest, DeepCollector, Judge, JudgeRequest, Judgment, Notifier,
};
use crate::config::EscalationConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::lock;
use crate::store::ConditionStore;

/// Marks one occurrence as in flight; released on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    occurrence: Occurrence,
    in_flight: Arc<DashSet<Occurrence>>,
}

impl InFlightGuard {
    pub fn occurrence(&self) -> Occurrence {
        self.occurrence
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.occurrence);
    }
}

/// Coordinates escalations for every user.
pub struct EscalationCoordinator {
    store: Arc<ConditionStore>,
    budget: Arc<NotificationBudget>,

    collector: Arc<dyn DeepCollector>,
    judge: Arc<dyn Judge>,
    notifier: Arc<dyn Notifier>,

    collect_breaker: CircuitBreaker,
    judge_breaker: CircuitBreaker,

    config: EscalationConfig,
    clock: SharedClock,
    event_tx: broadcast::Sender<MonitorEvent>,

    in_flight: Arc<DashSet<Occurrence>>,

    /// Conditions whose last attempt failed retryably.
    retry: DashSet<ConditionId>,

    log: Mutex<VecDeque<EscalationRecord>>,
}

impl EscalationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &EscalationConfig,
        store: Arc<ConditionStore>,
        budget: Arc<NotificationBudget>,
        collector: Arc<dyn DeepCollector>,
        judge: Arc<dyn Judge>,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
        event_tx: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            store,
            budget,
            collector,
            judge,
            notifier,
            collect_breaker: CircuitBreaker::new("deep_collect", config.circuit_breaker.clone()),
            judge_breaker: CircuitBreaker::new("judge", config.circuit_breaker.clone()),
            config: config.clone(),
            clock,
            event_tx,
            in_flight: Arc::new(DashSet::new()),
            retry: DashSet::new(),
            log: Mutex::new(VecDeque::new()),
        }
    }

    /// Claim the condition's current occurrence. `None` if an attempt for it
    /// is already in flight.
    pub fn try_begin(&self, condition: &Condition) -> Option<InFlightGuard> {
        let occurrence = condition.occurrence();
        if !self.in_flight.insert(occurrence) {
            return None;
        }
        Some(InFlightGuard {
            occurrence,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_in_flight(&self, occurrence: &Occurrence) -> bool {
        self.in_flight.contains(occurrence)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether the condition's last escalation failed and awaits retry.
    pub fn is_pending_retry(&self, id: &ConditionId) -> bool {
        self.retry.contains(id)
    }

    /// Escalate a newly satisfied occurrence.
    ///
    /// `trigger` is the sample that satisfied an Alert-tier condition.
    #[instrument(skip(self, condition, trigger, guard), fields(condition_id = %condition.id, episode = condition.episode))]
    pub async fn escalate(
        &self,
        condition: Condition,
        trigger: Option<SampleValue>,
        guard: InFlightGuard,
    ) -> EscalationOutcome {
        let outcome = match self.recheck(&condition) {
            Err(outcome) => outcome,
            Ok(current) => match current.tier() {
                ConditionTier::Alert => self.notify_alert(&current, trigger).await,
                ConditionTier::Signal | ConditionTier::LlmEvaluated => {
                    self.escalate_budgeted(&current).await
                }
            },
        };
        let outcome = self.record_outcome(&condition, outcome);
        drop(guard);
        outcome
    }

    /// Finish an occurrence whose judgment was already obtained (patrol's
    /// LLM-evaluated pass).
    #[instrument(skip(self, condition, judgment, missing, guard), fields(condition_id = %condition.id))]
    pub async fn escalate_judged(
        &self,
        condition: Condition,
        judgment: Judgment,
        missing: Vec<DataCategory>,
        guard: InFlightGuard,
    ) -> EscalationOutcome {
        let outcome = match self.recheck(&condition) {
            Err(outcome) => outcome,
            Ok(current) => {
                let now = self.clock.now();
                self.conclude(&current, judgment, missing, now).await
            }
        };
        let outcome = self.record_outcome(&condition, outcome);
        drop(guard);
        outcome
    }

    /// Consume an occurrence as suppressed without collecting or judging.
    /// Used when the user's budget is already spent before any work starts.
    pub fn suppress_exhausted(&self, condition: Condition, guard: InFlightGuard) -> EscalationOutcome {
        let outcome = match self.recheck(&condition) {
            Err(outcome) => outcome,
            Ok(current) => self.suppress(&current, self.clock.now()),
        };
        let outcome = self.record_outcome(&condition, outcome);
        drop(guard);
        outcome
    }

    /// Deep-collect then judge, under timeouts and circuit breakers.
    pub async fn collect_and_judge(
        &self,
        condition: &Condition,
    ) -> MonitorResult<(Judgment, Vec<DataCategory>)> {
        let request = CollectRequest {
            condition_id: condition.id,
            user: condition.user.clone(),
            data_needed: condition.payload.data_needed(),
            description: condition.description.clone(),
        };
        let context = self
            .guarded(
                &self.collect_breaker,
                self.config.collect_timeout,
                self.collector.collect(&request),
            )
            .await?;

        let missing = context.missing.clone();
        if !missing.is_empty() {
            debug!(condition_id = %condition.id, missing = ?missing, "Deep collect incomplete");
        }

        let request = JudgeRequest {
            condition_id: condition.id,
            user: condition.user.clone(),
            description: condition.description.clone(),
            payload: condition.payload.clone(),
            context,
            missing: missing.clone(),
        };
        let judgment = self
            .guarded(
                &self.judge_breaker,
                self.config.judge_timeout,
                self.judge.judge(&request),
            )
            .await?;

        Ok((judgment, missing))
    }

    /// Record an outcome produced outside [`escalate`], e.g. a deduplicated
    /// evaluation or a failed patrol judgment.
    ///
    /// [`escalate`]: EscalationCoordinator::escalate
    pub fn record_outcome(&self, condition: &Condition, outcome: EscalationOutcome) -> EscalationOutcome {
        match &outcome {
            EscalationOutcome::RetryableFailure { .. } => {
                self.retry.insert(condition.id);
            }
            EscalationOutcome::Deduplicated => {}
            _ => {
                self.retry.remove(&condition.id);
            }
        }

        log_outcome(condition, &outcome);

        let record = EscalationRecord {
            occurrence: condition.occurrence(),
            user: condition.user.clone(),
            tier: condition.tier(),
            outcome: outcome.clone(),
            at: self.clock.now(),
        };
        {
            let mut log = lock(&self.log);
            log.push_back(record.clone());
            while log.len() > self.config.outcome_log_capacity.max(1) {
                log.pop_front();
            }
        }
        let _ = self.event_tx.send(MonitorEvent::Escalated(record));
        outcome
    }

    /// Most recent escalation records, oldest first.
    pub fn records(&self) -> Vec<EscalationRecord> {
        lock(&self.log).iter().cloned().collect()
    }

    pub fn records_for(&self, user: &UserId) -> Vec<EscalationRecord> {
        lock(&self.log)
            .iter()
            .filter(|r| &r.user == user)
            .cloned()
            .collect()
    }

    pub fn collect_breaker(&self) -> &CircuitBreaker {
        &self.collect_breaker
    }

    pub fn judge_breaker(&self) -> &CircuitBreaker {
        &self.judge_breaker
    }

    // ═══════════════════════════════════════════════════════════════════
    // PATHS
    // ═══════════════════════════════════════════════════════════════════

    /// Re-read the condition once the occurrence is claimed. Anything other
    /// than Active on the same episode means the occurrence is already gone.
    fn recheck(&self, snapshot: &Condition) -> Result<Condition, EscalationOutcome> {
        let Some(current) = self.store.get(&snapshot.id) else {
            return Err(EscalationOutcome::InvariantViolation {
                reason: format!("{} is not in the store", snapshot.id),
            });
        };
        if current.state.is_terminal() {
            return Err(EscalationOutcome::Withdrawn);
        }
        if current.state != ConditionState::Active || current.episode != snapshot.episode {
            return Err(EscalationOutcome::Deduplicated);
        }
        if current.is_expired(self.clock.now()) {
            let _ = self.store.mark_stale(&current.id);
            return Err(EscalationOutcome::Expired);
        }
        Ok(current)
    }

    async fn notify_alert(
        &self,
        condition: &Condition,
        trigger: Option<SampleValue>,
    ) -> EscalationOutcome {
        let ConditionPayload::Alert(alert) = &condition.payload else {
            return EscalationOutcome::InvariantViolation {
                reason: format!("{} is not alert-tier", condition.id),
            };
        };
        let Some(value) = trigger else {
            return EscalationOutcome::InvariantViolation {
                reason: format!("{} escalated without a triggering sample", condition.id),
            };
        };

        let now = self.clock.now();
        if let Err(outcome) = self.fire(condition, now) {
            return outcome;
        }
        self.deliver(
            condition,
            NotificationDetail::Alert {
                topic: alert.topic.clone(),
                value,
            },
            now,
        )
        .await
    }

    async fn escalate_budgeted(&self, condition: &Condition) -> EscalationOutcome {
        if self.budget.is_exhausted(&condition.user) {
            return self.suppress(condition, self.clock.now());
        }

        let (judgment, missing) = match self.collect_and_judge(condition).await {
            Ok(result) => result,
            Err(e) => {
                return EscalationOutcome::RetryableFailure {
                    reason: e.to_string(),
                }
            }
        };

        let now = self.clock.now();
        self.conclude(condition, judgment, missing, now).await
    }

    async fn conclude(
        &self,
        condition: &Condition,
        judgment: Judgment,
        missing: Vec<DataCategory>,
        now: DateTime<Utc>,
    ) -> EscalationOutcome {
        if !judgment.satisfied {
            return match self.fire(condition, now) {
                Ok(()) => EscalationOutcome::DeclinedByJudge {
                    rationale: judgment.rationale,
                },
                Err(outcome) => outcome,
            };
        }

        let Some(ticket) = self.budget.try_consume(&condition.user) else {
            return self.suppress(condition, now);
        };
        if let Err(outcome) = self.fire(condition, now) {
            self.budget.refund(&ticket);
            return outcome;
        }

        self.deliver(
            condition,
            NotificationDetail::Judged {
                rationale: judgment.rationale,
                confidence: judgment.confidence,
                missing,
            },
            now,
        )
        .await
    }

    fn suppress(&self, condition: &Condition, now: DateTime<Utc>) -> EscalationOutcome {
        match self.fire(condition, now) {
            Ok(()) => EscalationOutcome::SuppressedByBudget,
            Err(outcome) => outcome,
        }
    }

    /// Compare-and-set to Fired. On failure the occurrence is abandoned.
    fn fire(&self, condition: &Condition, now: DateTime<Utc>) -> Result<(), EscalationOutcome> {
        match self.store.mark_fired(&condition.id, condition.episode, now) {
            Ok(true) => Ok(()),
            Ok(false) => Err(EscalationOutcome::Withdrawn),
            Err(e) => {
                error!(condition_id = %condition.id, error = %e, "Abandoning occurrence");
                let _ = self.store.force_active(&condition.id);
                Err(EscalationOutcome::InvariantViolation {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn deliver(
        &self,
        condition: &Condition,
        detail: NotificationDetail,
        now: DateTime<Utc>,
    ) -> EscalationOutcome {
        let notification = Notification::new(
            condition.user.clone(),
            condition.occurrence(),
            condition.tier(),
            condition.description.clone(),
            detail,
            now,
        );

        let timeout = self.config.notify_timeout;
        match tokio::time::timeout(timeout, self.notifier.notify(&notification)).await {
            Ok(Ok(())) => EscalationOutcome::Notified,
            Ok(Err(e)) => EscalationOutcome::DeliveryFailed {
                reason: e.to_string(),
            },
            Err(_) => EscalationOutcome::DeliveryFailed {
                reason: MonitorError::CollaboratorTimeout {
                    collaborator: "notify",
                    timeout_ms: millis(timeout),
                }
                .to_string(),
            },
        }
    }

    async fn guarded<T, F>(
        &self,
        breaker: &CircuitBreaker,
        limit: Duration,
        call: F,
    ) -> MonitorResult<T>
    where
        F: Future<Output = MonitorResult<T>>,
    {
        if !breaker.allow_request() {
            return Err(MonitorError::CircuitOpen(breaker.name()));
        }

        match tokio::time::timeout(limit, call).await {
            Ok(Ok(value)) => {
                breaker.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                breaker.record_failure();
                Err(e)
            }
            Err(_) => {
                breaker.record_failure();
                Err(MonitorError::CollaboratorTimeout {
                    collaborator: breaker.name(),
                    timeout_ms: millis(limit),
                })
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn log_outcome(condition: &Condition, outcome: &EscalationOutcome) {
    let occurrence = condition.occurrence();
    match outcome {
        EscalationOutcome::Notified => {
            info!(user = %condition.user, occurrence = %occurrence, tier = %condition.tier(), "Notified")
        }
        EscalationOutcome::SuppressedByBudget => {
            info!(user = %condition.user, occurrence = %occurrence, "Suppressed by daily budget")
        }
        EscalationOutcome::DeclinedByJudge { rationale } => {
            info!(occurrence = %occurrence, rationale = %rationale, "Declined by judge")
        }
        EscalationOutcome::RetryableFailure { reason } => {
            warn!(occurrence = %occurrence, reason = %reason, "Escalation failed, will retry")
        }
        EscalationOutcome::DeliveryFailed { reason } => {
            warn!(user = %condition.user, occurrence = %occurrence, reason = %reason, "Delivery failed")
        }
        EscalationOutcome::Deduplicated => {
            debug!(occurrence = %occurrence, "Escalation already in flight")
        }
        EscalationOutcome::Expired => info!(occurrence = %occurrence, "Condition expired"),
        EscalationOutcome::Withdrawn => debug!(occurrence = %occurrence, "Condition withdrawn"),
        EscalationOutcome::InvariantViolation { reason } => {
            error!(occurrence = %occurrence, reason = %reason, "Invariant violation")
        }
    }
}
