//! Sample ingestion: sample -> evaluate -> re-arm / escalate.
//!
//! Samples of one stream are processed in arrival order under that stream's
//! lane. Evaluation is synchronous and brief; escalations are spawned off the
//! sampling path so a slow judgment never stalls other streams.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vigil_types::{
    Condition, ConditionId, ConditionPayload, ConditionState, EscalationOutcome, SampleValue,
    StreamKey, TopicKey,
};

use crate::error::MonitorResult;
use crate::escalation::EscalationCoordinator;
use crate::evaluator::{Edge, Evaluation, Readings, TriggerEvaluator};
use crate::lock;
use crate::registry::StreamRegistry;
use crate::store::ConditionStore;

/// What one ingested sample caused.
#[derive(Debug)]
pub struct IngestReport {
    pub key: StreamKey,

    /// Whether the sample was a meaningful change.
    pub meaningful: bool,

    pub evaluations: Vec<Evaluation>,

    /// Fired conditions re-armed because their predicate went false.
    pub rearmed: Vec<ConditionId>,

    /// Escalations spawned for newly satisfied conditions.
    pub escalations: Vec<JoinHandle<EscalationOutcome>>,

    /// Newly satisfied conditions whose occurrence was already in flight.
    pub deduplicated: Vec<ConditionId>,
}

impl IngestReport {
    /// Wait for every spawned escalation and return their outcomes.
    pub async fn settle(self) -> Vec<EscalationOutcome> {
        futures::future::join_all(self.escalations)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(error = %e, "Escalation task failed");
                    None
                }
            })
            .collect()
    }
}

/// Per-stream sample processing.
pub struct IngestPipeline {
    registry: Arc<StreamRegistry>,
    store: Arc<ConditionStore>,
    coordinator: Arc<EscalationCoordinator>,
    evaluator: TriggerEvaluator,
    lanes: DashMap<StreamKey, Arc<Mutex<()>>>,
}

impl IngestPipeline {
    pub fn new(
        registry: Arc<StreamRegistry>,
        store: Arc<ConditionStore>,
        coordinator: Arc<EscalationCoordinator>,
    ) -> Self {
        Self {
            registry,
            store,
            coordinator,
            evaluator: TriggerEvaluator,
            lanes: DashMap::new(),
        }
    }

    /// Record a sample and act on the conditions bound to its stream.
    ///
    /// Must be called from within a tokio runtime; escalations are spawned.
    pub fn ingest(&self, key: &StreamKey, value: SampleValue) -> MonitorResult<IngestReport> {
        let lane = self.lane(key);
        let _ordered = lock(&lane);

        let delta = self.registry.sample(key, value)?;

        let bound = self.store.list_active_for_stream(key);
        let candidates: Vec<Condition> = if delta.meaningful {
            bound
        } else {
            // Unchanged value: only retry escalations that failed last time.
            bound
                .into_iter()
                .filter(|c| {
                    c.state == ConditionState::Active && self.coordinator.is_pending_retry(&c.id)
                })
                .collect()
        };

        let mut report = IngestReport {
            key: key.clone(),
            meaningful: delta.meaningful,
            evaluations: Vec::new(),
            rearmed: Vec::new(),
            escalations: Vec::new(),
            deduplicated: Vec::new(),
        };
        if candidates.is_empty() {
            return Ok(report);
        }

        let topics: BTreeSet<TopicKey> = candidates
            .iter()
            .flat_map(|c| c.payload.topics())
            .collect();
        let readings = self.registry.readings(&key.user, &topics);
        let evaluations = self.evaluator.evaluate(&candidates, &readings);

        for (condition, evaluation) in candidates.into_iter().zip(evaluations.iter()) {
            match &evaluation.edge {
                Edge::Rearm => {
                    if self.store.rearm(&condition.id, condition.episode)? {
                        report.rearmed.push(condition.id);
                    }
                }
                Edge::Rising => match self.coordinator.try_begin(&condition) {
                    Some(guard) => {
                        let trigger = alert_trigger(&condition, &readings);
                        let coordinator = self.coordinator.clone();
                        report.escalations.push(tokio::spawn(async move {
                            coordinator.escalate(condition, trigger, guard).await
                        }));
                    }
                    None => {
                        report.deduplicated.push(condition.id);
                        self.coordinator
                            .record_outcome(&condition, EscalationOutcome::Deduplicated);
                    }
                },
                Edge::Skipped(reason) => {
                    debug!(condition_id = %condition.id, reason = ?reason, "Evaluation skipped");
                }
                Edge::Held | Edge::Idle => {}
            }
        }

        report.evaluations = evaluations;
        Ok(report)
    }

    fn lane(&self, key: &StreamKey) -> Arc<Mutex<()>> {
        if let Some(lane) = self.lanes.get(key) {
            return lane.clone();
        }
        self.lanes.entry(key.clone()).or_default().clone()
    }
}

fn alert_trigger(condition: &Condition, readings: &Readings) -> Option<SampleValue> {
    match &condition.payload {
        ConditionPayload::Alert(alert) => readings.get(&alert.topic).map(|r| r.value.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::NotificationBudget;
    use crate::clock::ManualClock;
    use crate::config::MonitorConfig;
    use crate::store::NewCondition;
    use crate::testing::{fakes, Fakes};
    use tokio::sync::broadcast;
    use vigil_types::{AlertPredicate, Comparison, ConditionOrigin, Quantity, UserId};

    struct Fixture {
        pipeline: IngestPipeline,
        store: Arc<ConditionStore>,
        fakes: Fakes,
    }

    fn fixture() -> Fixture {
        let config = MonitorConfig::default();
        let clock = Arc::new(ManualClock::fixed());
        let (tx, _) = broadcast::channel(256);
        let registry = Arc::new(StreamRegistry::new(&config, clock.clone(), tx.clone()));
        let store = Arc::new(ConditionStore::new(
            &config,
            registry.clone(),
            clock.clone(),
            tx.clone(),
        ));
        let budget = Arc::new(NotificationBudget::new(&config.budget, clock.clone()));
        let fakes = fakes();
        let coordinator = Arc::new(EscalationCoordinator::new(
            &config.escalation,
            store.clone(),
            budget,
            fakes.collector.clone(),
            fakes.judge.clone(),
            fakes.notifier.clone(),
            clock,
            tx,
        ));
        Fixture {
            pipeline: IngestPipeline::new(registry, store.clone(), coordinator),
            store,
            fakes,
        }
    }

    fn btc_key() -> StreamKey {
        StreamKey::new(UserId::new("u1"), TopicKey::price("BTC"))
    }

    fn btc_above(f: &Fixture, value: f64) -> Condition {
        f.store
            .create(
                &btc_key().user,
                NewCondition::new(
                    ConditionPayload::Alert(AlertPredicate::new(
                        TopicKey::price("BTC"),
                        Comparison::Above(Quantity::Absolute(value)),
                    )),
                    ConditionOrigin::UserRequest,
                ),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_rising_edge_escalates_once_while_held() {
        let f = fixture();
        let condition = btc_above(&f, 100.0);

        let report = f.pipeline.ingest(&btc_key(), SampleValue::absolute(101.0)).unwrap();
        assert_eq!(report.settle().await, vec![EscalationOutcome::Notified]);

        let report = f.pipeline.ingest(&btc_key(), SampleValue::absolute(102.0)).unwrap();
        assert_eq!(report.evaluations[0].edge, Edge::Held);
        assert!(report.escalations.is_empty());

        let report = f.pipeline.ingest(&btc_key(), SampleValue::absolute(99.0)).unwrap();
        assert_eq!(report.rearmed, vec![condition.id]);
        assert_eq!(f.fakes.notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_sample_skips_evaluation() {
        let f = fixture();
        btc_above(&f, 100.0);

        let first = f.pipeline.ingest(&btc_key(), SampleValue::absolute(50.0)).unwrap();
        assert_eq!(first.evaluations.len(), 1);

        let second = f.pipeline.ingest(&btc_key(), SampleValue::absolute(50.0)).unwrap();
        assert!(!second.meaningful);
        assert!(second.evaluations.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_stream_is_rejected() {
        let f = fixture();
        let key = StreamKey::new(UserId::new("nobody"), TopicKey::price("BTC"));
        assert!(f.pipeline.ingest(&key, SampleValue::absolute(1.0)).is_err());
    }

    #[tokio::test]
    async fn test_wrong_unit_sample_does_not_evaluate() {
        let f = fixture();
        btc_above(&f, 100.0);
        assert!(f
            .pipeline
            .ingest(&btc_key(), SampleValue::percent(101.0))
            .is_err());
        assert_eq!(f.fakes.notifier.count(), 0);
    }
}
