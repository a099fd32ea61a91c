//! Per-user patrol.
//!
//! Each run performs four independent steps; a failure in one never blocks
//! the others:
//!
//! 1. temperature sweep of the user's streams
//! 2. one-shot sampling of Cold streams, then anomaly detection
//! 3. judgment of LLM-evaluated conditions
//! 4. expiry, retention purge and budget pruning
//!
//! Steps 2 and 3 share the run deadline. Step 4 always runs.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use vigil_types::{
    Condition, ConditionId, ConditionOrigin, ConditionPayload, ConditionState, ConditionTier,
    EscalationOutcome, MonitorEvent, StreamKey, UserId,
};

use crate::anomaly::{Anomaly, AnomalyDetector};
use crate::budget::NotificationBudget;
use crate::clock::SharedClock;
use crate::collaborators::StreamSource;
use crate::config::{span, MonitorConfig, PatrolConfig};
use crate::error::{MonitorError, MonitorResult};
use crate::escalation::EscalationCoordinator;
use crate::ingest::IngestPipeline;
use crate::registry::StreamRegistry;
use crate::store::{ConditionStore, NewCondition};

/// One patrol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatrolStep {
    Sweep,
    ColdSample,
    Judge,
    Purge,
}

impl std::fmt::Display for PatrolStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatrolStep::Sweep => write!(f, "sweep"),
            PatrolStep::ColdSample => write!(f, "cold_sample"),
            PatrolStep::Judge => write!(f, "judge"),
            PatrolStep::Purge => write!(f, "purge"),
        }
    }
}

/// Summary of one patrol run.
#[derive(Debug, Clone, Serialize)]
pub struct PatrolReport {
    pub user: UserId,
    pub demoted: usize,
    pub cold_sampled: usize,
    pub anomalies: Vec<ConditionId>,
    pub judged: usize,
    pub rearmed: Vec<ConditionId>,
    pub outcomes: Vec<EscalationOutcome>,
    pub expired: Vec<ConditionId>,
    pub purged: Vec<ConditionId>,
    pub failed_steps: Vec<PatrolStep>,
    pub deadline_exceeded: bool,
}

impl PatrolReport {
    fn new(user: UserId) -> Self {
        Self {
            user,
            demoted: 0,
            cold_sampled: 0,
            anomalies: Vec::new(),
            judged: 0,
            rearmed: Vec::new(),
            outcomes: Vec::new(),
            expired: Vec::new(),
            purged: Vec::new(),
            failed_steps: Vec::new(),
            deadline_exceeded: false,
        }
    }

    fn fail(&mut self, step: PatrolStep) {
        if !self.failed_steps.contains(&step) {
            self.failed_steps.push(step);
        }
    }
}

enum JudgedCondition {
    Escalated(EscalationOutcome),
    Rearmed(ConditionId),
    Unchanged,
    Failed,
}

/// Schedules and runs patrols, one independent task per user.
pub struct PatrolScheduler {
    registry: Arc<StreamRegistry>,
    store: Arc<ConditionStore>,
    coordinator: Arc<EscalationCoordinator>,
    pipeline: Arc<IngestPipeline>,
    budget: Arc<NotificationBudget>,
    source: Arc<dyn StreamSource>,
    detector: AnomalyDetector,
    config: PatrolConfig,
    retention: Duration,
    clock: SharedClock,
    event_tx: broadcast::Sender<MonitorEvent>,
    tasks: DashMap<UserId, JoinHandle<()>>,
}

impl PatrolScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &MonitorConfig,
        registry: Arc<StreamRegistry>,
        store: Arc<ConditionStore>,
        coordinator: Arc<EscalationCoordinator>,
        pipeline: Arc<IngestPipeline>,
        budget: Arc<NotificationBudget>,
        source: Arc<dyn StreamSource>,
        clock: SharedClock,
        event_tx: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            registry,
            store,
            coordinator,
            pipeline,
            budget,
            source,
            detector: AnomalyDetector::new(&config.anomaly),
            config: config.patrol.clone(),
            retention: config.retention.system_originated,
            clock,
            event_tx,
            tasks: DashMap::new(),
        }
    }

    /// Run one full patrol for a user.
    #[instrument(skip(self))]
    pub async fn run_once(&self, user: &UserId) -> PatrolReport {
        let deadline = Instant::now() + self.config.deadline;
        let mut report = PatrolReport::new(user.clone());

        report.demoted = self.registry.sweep_user(user).len();

        match tokio::time::timeout_at(deadline, self.sample_cold(user, &mut report)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(user = %user, error = %e, "Cold sampling failed");
                report.fail(PatrolStep::ColdSample);
            }
            Err(_) => {
                report.deadline_exceeded = true;
                report.fail(PatrolStep::ColdSample);
            }
        }

        if report.deadline_exceeded {
            report.fail(PatrolStep::Judge);
        } else {
            match tokio::time::timeout_at(deadline, self.judge_conditions(user, &mut report)).await {
                Ok(()) => {}
                Err(_) => {
                    report.deadline_exceeded = true;
                    report.fail(PatrolStep::Judge);
                }
            }
        }

        self.housekeep(user, &mut report);

        info!(
            user = %user,
            demoted = report.demoted,
            cold_sampled = report.cold_sampled,
            anomalies = report.anomalies.len(),
            judged = report.judged,
            purged = report.purged.len(),
            deadline_exceeded = report.deadline_exceeded,
            "Patrol completed"
        );
        let _ = self.event_tx.send(MonitorEvent::PatrolCompleted {
            user: user.clone(),
            failed_steps: report.failed_steps.iter().map(|s| s.to_string()).collect(),
            deadline_exceeded: report.deadline_exceeded,
            at: self.clock.now(),
        });
        report
    }

    /// Run the patrol for tick number `tick`. Inactive users are patrolled
    /// on even ticks only; `None` when this tick was skipped.
    pub async fn run_tick(&self, user: &UserId, tick: u64) -> Option<PatrolReport> {
        if tick % 2 == 1 && self.is_inactive(user) {
            debug!(user = %user, tick, "Skipping patrol for inactive user");
            return None;
        }
        Some(self.run_once(user).await)
    }

    /// Whether the user has not referenced any stream recently.
    pub fn is_inactive(&self, user: &UserId) -> bool {
        match self.registry.last_activity(user) {
            Some(last) => self.clock.now() - last >= span(self.config.inactive_user_after),
            None => true,
        }
    }

    /// Start the user's patrol loop. Returns false if it is already running.
    pub fn spawn_user(self: &Arc<Self>, user: &UserId) -> bool {
        let entry = match self.tasks.entry(user.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(entry) => entry,
        };

        let interval = self.config.interval.max(Duration::from_millis(1));
        let max_jitter = u64::try_from(interval.as_millis() / 10).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter));

        let scheduler = Arc::clone(self);
        let owner = user.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + jitter, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick: u64 = 0;
            loop {
                ticker.tick().await;
                scheduler.run_tick(&owner, tick).await;
                tick = tick.wrapping_add(1);
            }
        });
        entry.insert(handle);
        info!(user = %user, jitter_ms = jitter.as_millis() as u64, "Patrol started");
        true
    }

    pub fn stop_user(&self, user: &UserId) -> bool {
        match self.tasks.remove(user) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn active_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.tasks.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    /// Stop every patrol loop.
    pub fn shutdown(&self) {
        let users: Vec<UserId> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for user in users {
            self.stop_user(&user);
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // STEPS
    // ═══════════════════════════════════════════════════════════════════

    async fn sample_cold(&self, user: &UserId, report: &mut PatrolReport) -> MonitorResult<()> {
        let cold: Vec<StreamKey> = self
            .registry
            .cold_streams(user)
            .into_iter()
            .take(self.config.max_cold_samples)
            .collect();

        let fetches = cold.into_iter().map(|key| async move {
            let fetched =
                tokio::time::timeout(self.config.cold_sample_timeout, self.source.fetch(&key.topic))
                    .await
                    .unwrap_or_else(|_| {
                        Err(MonitorError::SourceUnavailable {
                            topic: key.topic.clone(),
                            reason: "timed out".to_string(),
                        })
                    });
            (key, fetched)
        });

        let mut escalations = Vec::new();
        let mut sampled = Vec::new();
        let mut failures = 0usize;
        for (key, fetched) in join_all(fetches).await {
            let value = match fetched {
                Ok(value) => value,
                Err(e) => {
                    failures += 1;
                    self.registry.record_failure(&key, &e.to_string())?;
                    continue;
                }
            };
            match self.pipeline.ingest(&key, value) {
                Ok(ingested) => {
                    report.cold_sampled += 1;
                    escalations.push(ingested);
                    sampled.push(key);
                }
                Err(e) => {
                    failures += 1;
                    warn!(stream = %key, error = %e, "Cold sample rejected");
                }
            }
        }
        for ingested in escalations {
            report.outcomes.extend(ingested.settle().await);
        }

        self.scan_anomalies(user, &sampled, report)?;

        if failures > 0 {
            report.fail(PatrolStep::ColdSample);
        }
        Ok(())
    }

    /// Check the Cold samples this patrol just took for anomalies and open
    /// a patrol condition for each new one. When the user has referenced
    /// any subjects directly, only anomalies on those subjects count.
    fn scan_anomalies(
        &self,
        user: &UserId,
        sampled: &[StreamKey],
        report: &mut PatrolReport,
    ) -> MonitorResult<()> {
        let referenced = self.registry.referenced_subjects(user);
        for key in sampled {
            if !referenced.is_empty() && !referenced.contains(&key.topic.subject) {
                continue;
            }
            let Some(stream) = self.registry.get(key) else {
                continue;
            };
            let Some(value) = stream.last_value() else {
                continue;
            };
            let history: Vec<f64> = stream.history.iter().copied().collect();
            let prior = &history[..history.len().saturating_sub(1)];
            let Some(anomaly) = self.detector.detect(&key.topic, value, prior) else {
                continue;
            };
            if let Some(id) = self.open_anomaly_condition(user, anomaly)? {
                report.anomalies.push(id);
            }
        }
        Ok(())
    }

    fn open_anomaly_condition(
        &self,
        user: &UserId,
        anomaly: Anomaly,
    ) -> MonitorResult<Option<ConditionId>> {
        let existing = self.store.find_live_by_description(
            user,
            ConditionOrigin::PatrolGenerated,
            &anomaly.description,
        );
        if let Some(existing) = existing {
            debug!(condition_id = %existing.id, "Anomaly already watched");
            return Ok(None);
        }

        let condition = self.store.create(
            user,
            NewCondition::new(
                ConditionPayload::Signal(anomaly.condition()),
                ConditionOrigin::PatrolGenerated,
            )
            .described(anomaly.description.clone()),
        )?;

        info!(
            user = %user,
            topic = %anomaly.topic,
            kind = ?anomaly.kind,
            severity = ?anomaly.severity,
            value = anomaly.value,
            "Anomaly detected"
        );
        let _ = self.event_tx.send(MonitorEvent::AnomalyDetected {
            user: user.clone(),
            topic: anomaly.topic,
            description: anomaly.description,
            condition_id: Some(condition.id),
        });
        Ok(Some(condition.id))
    }

    async fn judge_conditions(&self, user: &UserId, report: &mut PatrolReport) {
        let conditions = self
            .store
            .list_live_for_user(user, ConditionTier::LlmEvaluated);
        report.judged = conditions.len();

        let results = join_all(conditions.into_iter().map(|c| self.judge_one(c))).await;
        for result in results {
            match result {
                JudgedCondition::Escalated(outcome) => report.outcomes.push(outcome),
                JudgedCondition::Rearmed(id) => report.rearmed.push(id),
                JudgedCondition::Unchanged => {}
                JudgedCondition::Failed => report.fail(PatrolStep::Judge),
            }
        }
    }

    async fn judge_one(&self, condition: Condition) -> JudgedCondition {
        match condition.state {
            ConditionState::Active => self.judge_active(condition).await,
            ConditionState::Fired => self.judge_fired(condition).await,
            ConditionState::Stale | ConditionState::Deleted => JudgedCondition::Unchanged,
        }
    }

    async fn judge_active(&self, condition: Condition) -> JudgedCondition {
        let Some(guard) = self.coordinator.try_begin(&condition) else {
            return JudgedCondition::Unchanged;
        };
        if self.budget.is_exhausted(&condition.user) {
            return JudgedCondition::Escalated(self.coordinator.suppress_exhausted(condition, guard));
        }
        match self.coordinator.collect_and_judge(&condition).await {
            Ok((judgment, missing)) if judgment.satisfied => JudgedCondition::Escalated(
                self.coordinator
                    .escalate_judged(condition, judgment, missing, guard)
                    .await,
            ),
            Ok(_) => JudgedCondition::Unchanged,
            Err(e) => {
                self.coordinator.record_outcome(
                    &condition,
                    EscalationOutcome::RetryableFailure {
                        reason: e.to_string(),
                    },
                );
                drop(guard);
                JudgedCondition::Failed
            }
        }
    }

    /// Re-judge a Fired condition to see whether it can re-arm. Skipped while
    /// its firing is still being delivered, and while the user's budget is
    /// spent since a re-armed condition could only be suppressed again.
    async fn judge_fired(&self, condition: Condition) -> JudgedCondition {
        let Some(_guard) = self.coordinator.try_begin(&condition) else {
            debug!(condition_id = %condition.id, "Firing still in flight, not re-judging");
            return JudgedCondition::Unchanged;
        };
        if self.budget.is_exhausted(&condition.user) {
            return JudgedCondition::Unchanged;
        }
        match self.coordinator.collect_and_judge(&condition).await {
            Ok((judgment, _)) if !judgment.satisfied => {
                match self.store.rearm(&condition.id, condition.episode) {
                    Ok(true) => JudgedCondition::Rearmed(condition.id),
                    Ok(false) => JudgedCondition::Unchanged,
                    Err(e) => {
                        warn!(condition_id = %condition.id, error = %e, "Re-arm failed");
                        JudgedCondition::Failed
                    }
                }
            }
            Ok(_) => JudgedCondition::Unchanged,
            Err(e) => {
                warn!(condition_id = %condition.id, error = %e, "Judgment failed");
                JudgedCondition::Failed
            }
        }
    }

    fn housekeep(&self, user: &UserId, report: &mut PatrolReport) {
        report.expired = self.store.expire_for_user(user);
        report.purged = self.store.purge_expired_for_user(user, self.retention);
        let pruned = self.budget.prune_user(user);
        if pruned > 0 {
            debug!(user = %user, pruned, "Pruned budget counters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::MonitorEngine;
    use crate::testing::{fakes, Fakes};
    use vigil_types::{JudgmentSpec, SampleValue, Temperature, TopicKey, TopicKind};

    fn engine() -> (MonitorEngine, Fakes, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::fixed());
        let fakes = fakes();
        let engine =
            MonitorEngine::with_clock(MonitorConfig::default(), fakes.collaborators(), clock.clone());
        (engine, fakes, clock)
    }

    fn user() -> UserId {
        UserId::new("u1")
    }

    fn llm_condition(engine: &MonitorEngine) -> Condition {
        engine
            .create_condition(
                &user(),
                ConditionPayload::LlmEvaluated(JudgmentSpec {
                    prompt: "is the market euphoric".into(),
                    data_needed: vec![],
                }),
                ConditionOrigin::UserRequest,
                None,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_cold_anomaly_opens_patrol_condition_once() {
        let (engine, fakes, clock) = engine();
        let topic = TopicKey::new(TopicKind::PriceChange, "SOL");
        engine.touch(&user(), &topic);
        clock.advance(chrono::Duration::days(40));
        engine.registry().sweep_user(&user());
        engine.registry().sweep_user(&user());
        fakes.source.set(topic.clone(), SampleValue::percent(15.0));

        let report = engine.patrol_user(&user()).await;
        assert_eq!(report.cold_sampled, 1);
        assert_eq!(report.anomalies.len(), 1);
        let condition = engine.store().get(&report.anomalies[0]).unwrap();
        assert_eq!(condition.origin, ConditionOrigin::PatrolGenerated);
        assert_eq!(condition.tier(), ConditionTier::Signal);

        let key = StreamKey::new(user(), topic);
        assert_eq!(
            engine.registry().get(&key).unwrap().temperature,
            Temperature::Hot
        );

        let again = engine.patrol_user(&user()).await;
        assert!(again.anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_cold_source_failure_is_isolated() {
        let (engine, _fakes, clock) = engine();
        let topic = TopicKey::price("DOGE");
        engine.touch(&user(), &topic);
        clock.advance(chrono::Duration::days(40));
        engine.registry().sweep_user(&user());
        engine.registry().sweep_user(&user());

        let report = engine.patrol_user(&user()).await;
        assert_eq!(report.failed_steps, vec![PatrolStep::ColdSample]);
        let stream = engine.registry().get(&StreamKey::new(user(), topic)).unwrap();
        assert_eq!(stream.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_llm_condition_fires_and_rearms() {
        let (engine, fakes, _) = engine();
        let condition = llm_condition(&engine);

        let report = engine.patrol_user(&user()).await;
        assert_eq!(report.outcomes, vec![EscalationOutcome::Notified]);
        assert_eq!(fakes.notifier.count(), 1);
        assert_eq!(
            engine.store().get(&condition.id).unwrap().state,
            ConditionState::Fired
        );

        let held = engine.patrol_user(&user()).await;
        assert!(held.outcomes.is_empty());

        fakes.judge.set_satisfied(false);
        let report = engine.patrol_user(&user()).await;
        assert_eq!(report.rearmed, vec![condition.id]);

        fakes.judge.set_satisfied(true);
        engine.patrol_user(&user()).await;
        assert_eq!(fakes.notifier.count(), 2);
    }

    #[tokio::test]
    async fn test_judge_failure_does_not_block_purge() {
        let (engine, fakes, clock) = engine();
        let condition = llm_condition(&engine);
        let patrol_made = engine
            .create_condition(
                &user(),
                ConditionPayload::LlmEvaluated(JudgmentSpec {
                    prompt: "whale accumulation".into(),
                    data_needed: vec![],
                }),
                ConditionOrigin::PatrolGenerated,
                None,
            )
            .unwrap();
        clock.advance(chrono::Duration::hours(72));
        fakes.collector.fail_next(2);

        let report = engine.patrol_user(&user()).await;
        assert_eq!(report.failed_steps, vec![PatrolStep::Judge]);
        assert_eq!(report.purged, vec![patrol_made.id]);
        assert_eq!(
            engine.store().get(&condition.id).unwrap().state,
            ConditionState::Active
        );
        assert!(engine.coordinator().is_pending_retry(&condition.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_leaves_partial_progress() {
        let mut config = MonitorConfig::default();
        config.patrol.deadline = Duration::from_secs(5);
        let clock = Arc::new(ManualClock::fixed());
        let fakes = fakes();
        let engine = MonitorEngine::with_clock(config, fakes.collaborators(), clock.clone());
        llm_condition(&engine);
        fakes.collector.stall_next(1, Duration::from_secs(20));

        let report = engine.patrol_user(&user()).await;
        assert!(report.deadline_exceeded);
        assert!(report.failed_steps.contains(&PatrolStep::Judge));
        assert_eq!(fakes.notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips_llm_judgment() {
        let (engine, fakes, _) = engine();
        for _ in 0..engine.config().budget.daily_limit {
            assert!(engine.budget().try_consume(&user()).is_some());
        }
        let condition = llm_condition(&engine);

        let report = engine.patrol_user(&user()).await;
        assert_eq!(report.outcomes, vec![EscalationOutcome::SuppressedByBudget]);
        assert_eq!(fakes.collector.calls(), 0);
        assert_eq!(fakes.judge.calls(), 0);
        assert_eq!(
            engine.store().get(&condition.id).unwrap().state,
            ConditionState::Fired
        );

        // Nothing to gain from re-judging while the budget stays spent.
        let again = engine.patrol_user(&user()).await;
        assert!(again.rearmed.is_empty());
        assert_eq!(fakes.collector.calls(), 0);
        assert_eq!(fakes.judge.calls(), 0);
    }

    #[tokio::test]
    async fn test_fired_condition_is_not_rejudged_while_in_flight() {
        let (engine, fakes, _) = engine();
        let condition = llm_condition(&engine);
        engine.patrol_user(&user()).await;
        let fired = engine.store().get(&condition.id).unwrap();
        assert_eq!(fired.state, ConditionState::Fired);

        let guard = engine.coordinator().try_begin(&fired).unwrap();
        fakes.judge.set_satisfied(false);
        let judged = fakes.judge.calls();

        let report = engine.patrol_user(&user()).await;
        assert!(report.rearmed.is_empty());
        assert_eq!(fakes.judge.calls(), judged);
        assert_eq!(
            engine.store().get(&condition.id).unwrap().state,
            ConditionState::Fired
        );

        drop(guard);
        let report = engine.patrol_user(&user()).await;
        assert_eq!(report.rearmed, vec![condition.id]);
        assert_eq!(engine.store().get(&condition.id).unwrap().episode, 1);
    }

    #[tokio::test]
    async fn test_polled_streams_are_not_scanned_for_anomalies() {
        let (engine, _, _) = engine();
        let topic = TopicKey::new(TopicKind::PriceChange, "SOL");
        engine.touch(&user(), &topic);
        engine
            .ingest(&user(), &topic, SampleValue::percent(25.0))
            .unwrap();

        let report = engine.patrol_user(&user()).await;
        assert_eq!(report.cold_sampled, 0);
        assert!(report.anomalies.is_empty());
        assert!(engine.conditions_for(&user()).is_empty());
    }

    #[tokio::test]
    async fn test_anomalies_limited_to_referenced_subjects() {
        let (engine, fakes, clock) = engine();
        let btc = TopicKey::new(TopicKind::PriceChange, "BTC");
        let sol = TopicKey::new(TopicKind::PriceChange, "SOL");
        engine.touch(&user(), &btc);
        engine.registry().ensure_stream(&user(), &sol);
        clock.advance(chrono::Duration::days(40));
        engine.registry().sweep_user(&user());
        engine.registry().sweep_user(&user());
        fakes.source.set(btc.clone(), SampleValue::percent(15.0));
        fakes.source.set(sol.clone(), SampleValue::percent(15.0));

        let report = engine.patrol_user(&user()).await;
        assert_eq!(report.cold_sampled, 2);
        assert_eq!(report.anomalies.len(), 1);
        let condition = engine.store().get(&report.anomalies[0]).unwrap();
        assert!(condition.payload.topics().contains(&btc));
        assert!(!condition.payload.topics().contains(&sol));
    }

    #[tokio::test]
    async fn test_inactive_user_is_thinned() {
        let (engine, _, clock) = engine();
        let patrol = engine.patrol();
        assert!(patrol.is_inactive(&user()));
        assert!(patrol.run_tick(&user(), 1).await.is_none());
        assert!(patrol.run_tick(&user(), 2).await.is_some());

        engine.touch(&user(), &TopicKey::price("BTC"));
        assert!(!patrol.is_inactive(&user()));
        assert!(patrol.run_tick(&user(), 1).await.is_some());

        clock.advance(chrono::Duration::hours(24));
        assert!(patrol.is_inactive(&user()));
    }

    #[tokio::test]
    async fn test_spawn_user_is_idempotent() {
        let (engine, _, _) = engine();
        let patrol = engine.patrol();
        assert!(patrol.spawn_user(&user()));
        assert!(!patrol.spawn_user(&user()));
        assert_eq!(patrol.active_users(), vec![user()]);
        assert!(patrol.stop_user(&user()));
        assert!(patrol.active_users().is_empty());
    }
}
