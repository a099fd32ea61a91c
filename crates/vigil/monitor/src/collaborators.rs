//! External collaborator contracts.
//!
//! The core never talks to a model, a data vendor or a messaging channel
//! directly. Those live behind these traits; the daemon provides HTTP
//! adapters and tests provide fakes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use vigil_types::{
    ConditionId, ConditionPayload, DataCategory, Notification, SampleValue, TopicKey, UserId,
};

use crate::error::{MonitorError, MonitorResult};

/// Result of classifying a user message into a condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedIntent {
    pub payload: ConditionPayload,

    /// Human label for the condition, if the classifier produced one.
    #[serde(default)]
    pub description: Option<String>,
}

/// Request for deep data collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectRequest {
    pub condition_id: ConditionId,
    pub user: UserId,
    pub data_needed: Vec<DataCategory>,
    pub description: String,
}

/// Context gathered by the deep collector. Categories that could not be
/// collected are listed in `missing`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectedContext {
    #[serde(default)]
    pub sections: BTreeMap<DataCategory, serde_json::Value>,

    #[serde(default)]
    pub missing: Vec<DataCategory>,
}

impl CollectedContext {
    /// Context where every requested category is missing.
    pub fn empty(requested: &[DataCategory]) -> Self {
        Self {
            sections: BTreeMap::new(),
            missing: requested.to_vec(),
        }
    }
}

/// Request for a judgment over collected context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeRequest {
    pub condition_id: ConditionId,
    pub user: UserId,
    pub description: String,
    pub payload: ConditionPayload,
    pub context: CollectedContext,

    /// Categories the judge should know were not collected.
    pub missing: Vec<DataCategory>,
}

/// Verdict of the judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub satisfied: bool,
    pub rationale: String,
    pub confidence: f64,
}

/// Turns a free-form user message into a typed condition payload.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, user: &UserId, message: &str) -> MonitorResult<ClassifiedIntent>;
}

/// Gathers the data categories a condition declares it needs.
#[async_trait]
pub trait DeepCollector: Send + Sync {
    async fn collect(&self, request: &CollectRequest) -> MonitorResult<CollectedContext>;
}

/// Decides whether a Signal or LLM-evaluated condition is satisfied.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, request: &JudgeRequest) -> MonitorResult<Judgment>;
}

/// Delivers a notification to a user. Fire-and-acknowledge.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> MonitorResult<()>;
}

/// Fetches the current value of a topic from market data.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn fetch(&self, topic: &TopicKey) -> MonitorResult<SampleValue>;
}

/// The set of collaborators an engine is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub classifier: Arc<dyn IntentClassifier>,
    pub collector: Arc<dyn DeepCollector>,
    pub judge: Arc<dyn Judge>,
    pub notifier: Arc<dyn Notifier>,
    pub source: Arc<dyn StreamSource>,
}

impl Default for Collaborators {
    /// Offline collaborators: nothing is classified or fetched, Signal
    /// conditions pass judgment unchanged and notifications go to the log.
    fn default() -> Self {
        Self {
            classifier: Arc::new(UnsupportedClassifier),
            collector: Arc::new(EmptyCollector),
            judge: Arc::new(PassThroughJudge),
            notifier: Arc::new(LoggingNotifier),
            source: Arc::new(NoSource),
        }
    }
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, notification: &Notification) -> MonitorResult<()> {
        info!(
            user = %notification.user,
            occurrence = %notification.occurrence,
            tier = %notification.tier,
            description = %notification.description,
            "Notification"
        );
        Ok(())
    }
}

/// Collector that collects nothing and reports every category missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCollector;

#[async_trait]
impl DeepCollector for EmptyCollector {
    async fn collect(&self, request: &CollectRequest) -> MonitorResult<CollectedContext> {
        Ok(CollectedContext::empty(&request.data_needed))
    }
}

/// Judge that confirms Signal conditions (already true by closed-form
/// evaluation) and declines anything it cannot evaluate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughJudge;

#[async_trait]
impl Judge for PassThroughJudge {
    async fn judge(&self, request: &JudgeRequest) -> MonitorResult<Judgment> {
        let satisfied = matches!(request.payload, ConditionPayload::Signal(_));
        Ok(Judgment {
            satisfied,
            rationale: if satisfied {
                "signal predicate holds".to_string()
            } else {
                "no judge configured".to_string()
            },
            confidence: if satisfied { 1.0 } else { 0.0 },
        })
    }
}

/// Classifier used when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedClassifier;

#[async_trait]
impl IntentClassifier for UnsupportedClassifier {
    async fn classify(&self, _user: &UserId, _message: &str) -> MonitorResult<ClassifiedIntent> {
        Err(MonitorError::CollaboratorFailed {
            collaborator: "classifier",
            reason: "no intent classifier configured".to_string(),
        })
    }
}

/// Source used when no market data feed is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSource;

#[async_trait]
impl StreamSource for NoSource {
    async fn fetch(&self, topic: &TopicKey) -> MonitorResult<SampleValue> {
        Err(MonitorError::SourceUnavailable {
            topic: topic.clone(),
            reason: "no data source configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::{
        AlertPredicate, CompareOp, Comparison, JudgmentSpec, Operand, Quantity, SignalExpr,
    };

    fn request(payload: ConditionPayload) -> JudgeRequest {
        JudgeRequest {
            condition_id: ConditionId::generate(),
            user: UserId::new("u1"),
            description: "test".into(),
            payload,
            context: CollectedContext::default(),
            missing: vec![],
        }
    }

    #[tokio::test]
    async fn test_pass_through_judge_only_confirms_signals() {
        let signal = ConditionPayload::Signal(SignalExpr::compare(
            Operand::Topic(TopicKey::price("BTC")),
            CompareOp::Gt,
            Operand::Constant(Quantity::Absolute(1.0)),
        ));
        let judgment = PassThroughJudge.judge(&request(signal)).await.unwrap();
        assert!(judgment.satisfied);

        let llm = ConditionPayload::LlmEvaluated(JudgmentSpec {
            prompt: "is the market euphoric".into(),
            data_needed: vec![DataCategory::Sentiment],
        });
        assert!(!PassThroughJudge.judge(&request(llm)).await.unwrap().satisfied);

        let alert = ConditionPayload::Alert(AlertPredicate::new(
            TopicKey::price("BTC"),
            Comparison::Above(Quantity::Absolute(1.0)),
        ));
        assert!(!PassThroughJudge.judge(&request(alert)).await.unwrap().satisfied);
    }

    #[tokio::test]
    async fn test_offline_collaborators() {
        let collaborators = Collaborators::default();
        let context = collaborators
            .collector
            .collect(&CollectRequest {
                condition_id: ConditionId::generate(),
                user: UserId::new("u1"),
                data_needed: vec![DataCategory::News, DataCategory::Market],
                description: "test".into(),
            })
            .await
            .unwrap();
        assert_eq!(context.missing.len(), 2);

        let err = collaborators
            .source
            .fetch(&TopicKey::price("BTC"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        assert!(collaborators
            .classifier
            .classify(&UserId::new("u1"), "alert me")
            .await
            .is_err());
    }
}
