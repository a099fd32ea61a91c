//! Monitor engine: wires the components together.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, instrument, warn};
use vigil_types::{
    AlertPredicate, Condition, ConditionId, ConditionOrigin, ConditionPayload, EscalationRecord,
    MonitorEvent, SampleValue, Stream, StreamKey, TopicKey, UserId,
};

use crate::budget::{BudgetStatus, NotificationBudget};
use crate::clock::{SharedClock, SystemClock};
use crate::collaborators::{Collaborators, IntentClassifier, StreamSource};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::escalation::EscalationCoordinator;
use crate::ingest::{IngestPipeline, IngestReport};
use crate::patrol::{PatrolReport, PatrolScheduler};
use crate::registry::{StreamRegistry, TemperatureTransition};
use crate::store::{ConditionStore, NewCondition};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The monitoring core.
pub struct MonitorEngine {
    config: MonitorConfig,
    clock: SharedClock,

    registry: Arc<StreamRegistry>,
    store: Arc<ConditionStore>,
    budget: Arc<NotificationBudget>,
    coordinator: Arc<EscalationCoordinator>,
    pipeline: Arc<IngestPipeline>,
    patrol: Arc<PatrolScheduler>,

    classifier: Arc<dyn IntentClassifier>,
    source: Arc<dyn StreamSource>,

    event_tx: broadcast::Sender<MonitorEvent>,
}

impl MonitorEngine {
    pub fn new(config: MonitorConfig, collaborators: Collaborators) -> Self {
        Self::with_clock(config, collaborators, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: MonitorConfig,
        collaborators: Collaborators,
        clock: SharedClock,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let registry = Arc::new(StreamRegistry::new(&config, clock.clone(), event_tx.clone()));
        let store = Arc::new(ConditionStore::new(
            &config,
            registry.clone(),
            clock.clone(),
            event_tx.clone(),
        ));
        let budget = Arc::new(NotificationBudget::new(&config.budget, clock.clone()));
        let coordinator = Arc::new(EscalationCoordinator::new(
            &config.escalation,
            store.clone(),
            budget.clone(),
            collaborators.collector,
            collaborators.judge,
            collaborators.notifier,
            clock.clone(),
            event_tx.clone(),
        ));
        let pipeline = Arc::new(IngestPipeline::new(
            registry.clone(),
            store.clone(),
            coordinator.clone(),
        ));
        let patrol = Arc::new(PatrolScheduler::new(
            &config,
            registry.clone(),
            store.clone(),
            coordinator.clone(),
            pipeline.clone(),
            budget.clone(),
            collaborators.source.clone(),
            clock.clone(),
            event_tx.clone(),
        ));

        Self {
            config,
            clock,
            registry,
            store,
            budget,
            coordinator,
            pipeline,
            patrol,
            classifier: collaborators.classifier,
            source: collaborators.source,
            event_tx,
        }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ConditionStore> {
        &self.store
    }

    pub fn budget(&self) -> &Arc<NotificationBudget> {
        &self.budget
    }

    pub fn coordinator(&self) -> &Arc<EscalationCoordinator> {
        &self.coordinator
    }

    pub fn patrol(&self) -> &Arc<PatrolScheduler> {
        &self.patrol
    }

    // ═══════════════════════════════════════════════════════════════════
    // STREAMS
    // ═══════════════════════════════════════════════════════════════════

    /// Register a new user with the default preset streams.
    pub fn onboard(&self, user: &UserId) -> Vec<Stream> {
        let streams = self.registry.ensure_default_preset(user);
        info!(user = %user, streams = streams.len(), "User onboarded");
        streams
    }

    /// Record that the user referenced a topic.
    pub fn touch(&self, user: &UserId, topic: &TopicKey) -> Stream {
        self.registry.touch(user, topic)
    }

    pub fn streams_for(&self, user: &UserId) -> Vec<Stream> {
        self.registry.streams_for(user)
    }

    /// Feed one observed value into a user's stream.
    pub fn ingest(
        &self,
        user: &UserId,
        topic: &TopicKey,
        value: SampleValue,
    ) -> MonitorResult<IngestReport> {
        self.ingest_key(&StreamKey::new(user.clone(), topic.clone()), value)
    }

    pub fn ingest_key(&self, key: &StreamKey, value: SampleValue) -> MonitorResult<IngestReport> {
        self.pipeline.ingest(key, value)
    }

    /// Fetch a stream's current value from the source and ingest it. A
    /// fetch failure or timeout is recorded against that stream only.
    pub async fn sample_stream(&self, key: &StreamKey) -> MonitorResult<IngestReport> {
        let limit = self.config.cadence.sample_timeout;
        let fetched = tokio::time::timeout(limit, self.source.fetch(&key.topic))
            .await
            .unwrap_or_else(|_| {
                Err(MonitorError::SourceUnavailable {
                    topic: key.topic.clone(),
                    reason: format!("timed out after {}ms", limit.as_millis()),
                })
            });
        match fetched {
            Ok(value) => self.ingest_key(key, value),
            Err(e) => {
                self.record_source_failure(key, &e.to_string())?;
                Err(e)
            }
        }
    }

    pub fn record_source_failure(&self, key: &StreamKey, reason: &str) -> MonitorResult<u32> {
        self.registry.record_failure(key, reason)
    }

    /// Demote idle streams across every user.
    pub fn sweep_temperature(&self) -> Vec<TemperatureTransition> {
        self.registry.sweep_temperature()
    }

    // ═══════════════════════════════════════════════════════════════════
    // CONDITIONS
    // ═══════════════════════════════════════════════════════════════════

    pub fn create_condition(
        &self,
        user: &UserId,
        payload: ConditionPayload,
        origin: ConditionOrigin,
        description: Option<String>,
    ) -> MonitorResult<Condition> {
        let mut request = NewCondition::new(payload, origin);
        request.description = description;
        self.store.create(user, request)
    }

    pub fn create(&self, user: &UserId, request: NewCondition) -> MonitorResult<Condition> {
        self.store.create(user, request)
    }

    /// Classify a user message and create the resulting condition. Topics
    /// the message refers to count as user references.
    #[instrument(skip(self, message))]
    pub async fn create_from_message(
        &self,
        user: &UserId,
        message: &str,
    ) -> MonitorResult<Condition> {
        let intent = self.classifier.classify(user, message).await?;

        // Validate before touching anything so a rejected payload leaves no trace.
        self.store.validate(&intent.payload)?;
        for topic in intent.payload.topics() {
            self.registry.touch(user, &topic);
        }

        let description = intent
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| message.trim().to_string());
        self.store.create(
            user,
            NewCondition::new(intent.payload, ConditionOrigin::UserRequest).described(description),
        )
    }

    pub fn supersede(
        &self,
        old: &ConditionId,
        refinement: AlertPredicate,
        description: Option<String>,
    ) -> MonitorResult<Condition> {
        self.store.supersede(old, refinement, description)
    }

    pub fn confirm(&self, id: &ConditionId) -> MonitorResult<Condition> {
        self.store.confirm(id)
    }

    pub fn delete(&self, id: &ConditionId) -> MonitorResult<bool> {
        self.store.delete(id)
    }

    pub fn condition(&self, id: &ConditionId) -> MonitorResult<Condition> {
        self.store.get(id).ok_or(MonitorError::ConditionNotFound(*id))
    }

    pub fn conditions_for(&self, user: &UserId) -> Vec<Condition> {
        self.store.list_for_user(user)
    }

    /// Purge unconfirmed system-originated conditions past retention.
    pub fn purge_expired(&self) -> Vec<ConditionId> {
        self.store
            .purge_expired_system_originated(self.config.retention.system_originated)
    }

    // ═══════════════════════════════════════════════════════════════════
    // BUDGET, ESCALATIONS, PATROL
    // ═══════════════════════════════════════════════════════════════════

    pub fn budget_status(&self, user: &UserId) -> BudgetStatus {
        self.budget.status(user)
    }

    pub fn escalations_for(&self, user: &UserId) -> Vec<EscalationRecord> {
        self.coordinator.records_for(user)
    }

    /// Run one patrol for the user now.
    pub async fn patrol_user(&self, user: &UserId) -> PatrolReport {
        self.patrol.run_once(user).await
    }

    /// Start patrol loops for every known user not yet patrolled.
    pub fn spawn_patrols(&self) -> usize {
        self.registry
            .users()
            .iter()
            .filter(|user| self.patrol.spawn_user(user))
            .count()
    }

    pub fn shutdown(&self) {
        self.patrol.shutdown();
        if self.coordinator.in_flight_count() > 0 {
            warn!(
                in_flight = self.coordinator.in_flight_count(),
                "Shutting down with escalations in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::ClassifiedIntent;
    use crate::testing::fakes;
    use vigil_types::{Comparison, ConditionState, Quantity};

    #[tokio::test]
    async fn test_create_from_message_touches_topics() {
        let fakes = fakes();
        let engine = MonitorEngine::with_clock(
            MonitorConfig::default(),
            fakes.collaborators(),
            Arc::new(ManualClock::fixed()),
        );
        let user = UserId::new("u1");
        fakes.classifier.set(ClassifiedIntent {
            payload: ConditionPayload::Alert(AlertPredicate::new(
                TopicKey::funding("BTC"),
                Comparison::Below(Quantity::Percent(-0.1)),
            )),
            description: None,
        });

        let condition = engine
            .create_from_message(&user, "ping me when BTC funding drops below -0.1%")
            .await
            .unwrap();
        assert_eq!(condition.origin, ConditionOrigin::UserRequest);
        assert_eq!(condition.state, ConditionState::Active);
        assert_eq!(
            condition.description,
            "ping me when BTC funding drops below -0.1%"
        );
        assert!(engine.registry().last_activity(&user).is_some());
        assert_eq!(engine.streams_for(&user).len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_intent_leaves_no_trace() {
        let fakes = fakes();
        let engine = MonitorEngine::with_clock(
            MonitorConfig::default(),
            fakes.collaborators(),
            Arc::new(ManualClock::fixed()),
        );
        let user = UserId::new("u1");
        fakes.classifier.set(ClassifiedIntent {
            payload: ConditionPayload::Alert(AlertPredicate::new(
                TopicKey::funding("BTC"),
                Comparison::Below(Quantity::Absolute(-0.001)),
            )),
            description: None,
        });

        let err = engine
            .create_from_message(&user, "funding below -0.001")
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(engine.streams_for(&user).is_empty());
        assert!(engine.conditions_for(&user).is_empty());
    }

    #[tokio::test]
    async fn test_sample_stream_records_source_failure() {
        let fakes = fakes();
        let engine = MonitorEngine::with_clock(
            MonitorConfig::default(),
            fakes.collaborators(),
            Arc::new(ManualClock::fixed()),
        );
        let user = UserId::new("u1");
        let streams = engine.onboard(&user);
        let key = streams[0].key.clone();

        assert!(engine.sample_stream(&key).await.is_err());
        assert_eq!(engine.registry().get(&key).unwrap().consecutive_failures, 1);

        fakes.source.set(key.topic.clone(), SampleValue::absolute(97_000.0));
        let report = engine.sample_stream(&key).await.unwrap();
        assert!(report.meaningful);
        assert_eq!(engine.registry().get(&key).unwrap().consecutive_failures, 0);
    }

    struct StalledSource;

    #[async_trait::async_trait]
    impl StreamSource for StalledSource {
        async fn fetch(&self, _topic: &TopicKey) -> MonitorResult<SampleValue> {
            tokio::time::sleep(std::time::Duration::from_secs(90)).await;
            Ok(SampleValue::absolute(1.0))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_stream_times_out_slow_source() {
        let mut collaborators = fakes().collaborators();
        collaborators.source = Arc::new(StalledSource);
        let engine = MonitorEngine::with_clock(
            MonitorConfig::default(),
            collaborators,
            Arc::new(ManualClock::fixed()),
        );
        let user = UserId::new("u1");
        let key = engine.touch(&user, &TopicKey::price("ETH")).key;

        let started = tokio::time::Instant::now();
        let err = engine.sample_stream(&key).await.unwrap_err();
        assert!(started.elapsed() >= engine.config().cadence.sample_timeout);
        assert!(started.elapsed() < engine.config().cadence.hot_interval);
        assert!(matches!(err, MonitorError::SourceUnavailable { .. }));

        let stream = engine.registry().get(&key).unwrap();
        assert_eq!(stream.consecutive_failures, 1);
        assert!(stream.last_error.unwrap().contains("timed out"));
    }
}
