//! Scriptable collaborator fakes for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use vigil_types::{Notification, SampleValue, TopicKey, UserId};

use crate::collaborators::{
    ClassifiedIntent, CollectRequest, CollectedContext, Collaborators, DeepCollector,
    IntentClassifier, Judge, JudgeRequest, Judgment, Notifier, StreamSource,
};
use crate::error::{MonitorError, MonitorResult};
use crate::lock;

/// Notifier that keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        lock(&self.sent).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.sent).len()
    }

    /// Reject every delivery while set.
    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> MonitorResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MonitorError::CollaboratorFailed {
                collaborator: "notify",
                reason: "delivery rejected".to_string(),
            });
        }
        lock(&self.sent).push(notification.clone());
        Ok(())
    }
}

/// Deep collector that can stall or fail its next calls.
#[derive(Debug, Default)]
pub struct ScriptedCollector {
    calls: AtomicUsize,
    stalls: AtomicUsize,
    stall_for: Mutex<Duration>,
    failures: AtomicUsize,
}

impl ScriptedCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `duration` on each of the next `count` calls.
    pub fn stall_next(&self, count: usize, duration: Duration) {
        *lock(&self.stall_for) = duration;
        self.stalls.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` calls.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DeepCollector for ScriptedCollector {
    async fn collect(&self, request: &CollectRequest) -> MonitorResult<CollectedContext> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.stalls) {
            let duration = *lock(&self.stall_for);
            tokio::time::sleep(duration).await;
        }
        if take_one(&self.failures) {
            return Err(MonitorError::CollaboratorFailed {
                collaborator: "deep_collect",
                reason: "rate limited".to_string(),
            });
        }

        let sections = request
            .data_needed
            .iter()
            .map(|category| (*category, serde_json::json!({ "collected": true })))
            .collect();
        Ok(CollectedContext {
            sections,
            missing: Vec::new(),
        })
    }
}

/// Judge with a switchable verdict.
#[derive(Debug)]
pub struct ScriptedJudge {
    satisfied: AtomicBool,
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl Default for ScriptedJudge {
    fn default() -> Self {
        Self {
            satisfied: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_satisfied(&self, satisfied: bool) {
        self.satisfied.store(satisfied, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn judge(&self, _request: &JudgeRequest) -> MonitorResult<Judgment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures) {
            return Err(MonitorError::CollaboratorFailed {
                collaborator: "judge",
                reason: "model unavailable".to_string(),
            });
        }
        let satisfied = self.satisfied.load(Ordering::SeqCst);
        Ok(Judgment {
            satisfied,
            rationale: if satisfied { "confirmed" } else { "not convinced" }.to_string(),
            confidence: 0.9,
        })
    }
}

/// Classifier returning a preset intent.
#[derive(Debug, Default)]
pub struct FixedClassifier {
    intent: Mutex<Option<ClassifiedIntent>>,
}

impl FixedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, intent: ClassifiedIntent) {
        *lock(&self.intent) = Some(intent);
    }
}

#[async_trait]
impl IntentClassifier for FixedClassifier {
    async fn classify(&self, _user: &UserId, message: &str) -> MonitorResult<ClassifiedIntent> {
        lock(&self.intent)
            .clone()
            .ok_or_else(|| MonitorError::InvalidPayload(format!("cannot classify {:?}", message)))
    }
}

/// Source serving values set by the test.
#[derive(Debug, Default)]
pub struct StaticSource {
    values: DashMap<TopicKey, SampleValue>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, topic: TopicKey, value: SampleValue) {
        self.values.insert(topic, value);
    }
}

#[async_trait]
impl StreamSource for StaticSource {
    async fn fetch(&self, topic: &TopicKey) -> MonitorResult<SampleValue> {
        self.values
            .get(topic)
            .map(|v| v.clone())
            .ok_or_else(|| MonitorError::SourceUnavailable {
                topic: topic.clone(),
                reason: "no value".to_string(),
            })
    }
}

/// A full set of fakes, kept addressable for assertions.
#[derive(Clone)]
pub struct Fakes {
    pub notifier: Arc<RecordingNotifier>,
    pub collector: Arc<ScriptedCollector>,
    pub judge: Arc<ScriptedJudge>,
    pub classifier: Arc<FixedClassifier>,
    pub source: Arc<StaticSource>,
}

impl Fakes {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            classifier: self.classifier.clone(),
            collector: self.collector.clone(),
            judge: self.judge.clone(),
            notifier: self.notifier.clone(),
            source: self.source.clone(),
        }
    }
}

pub fn fakes() -> Fakes {
    Fakes {
        notifier: Arc::new(RecordingNotifier::new()),
        collector: Arc::new(ScriptedCollector::new()),
        judge: Arc::new(ScriptedJudge::new()),
        classifier: Arc::new(FixedClassifier::new()),
        source: Arc::new(StaticSource::new()),
    }
}
