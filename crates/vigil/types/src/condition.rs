//! Conditions: user- or system-authored rules to watch for.
//!
//! The payload is a tagged variant over the three tiers. A condition's tier
//! is fixed at creation; refinement creates a replacement condition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::ids::{ConditionId, UserId};
use crate::topic::TopicKey;
use crate::value::Quantity;

/// Evaluation tier of a condition, ordered by cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionTier {
    /// Closed-form predicate over one stream. Free to evaluate and notify.
    Alert,
    /// Composite predicate over several streams; judged before notifying.
    Signal,
    /// Natural-language condition; evaluated only by the judge during patrol.
    LlmEvaluated,
}

impl ConditionTier {
    /// Whether notifications for this tier count against the daily budget.
    pub fn is_budgeted(&self) -> bool {
        !matches!(self, ConditionTier::Alert)
    }
}

impl fmt::Display for ConditionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionTier::Alert => write!(f, "alert"),
            ConditionTier::Signal => write!(f, "signal"),
            ConditionTier::LlmEvaluated => write!(f, "llm_evaluated"),
        }
    }
}

/// Who authored a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOrigin {
    UserRequest,
    SystemInferred,
    PatrolGenerated,
}

impl ConditionOrigin {
    /// System-authored conditions expire unless the user confirms them.
    pub fn is_system(&self) -> bool {
        !matches!(self, ConditionOrigin::UserRequest)
    }
}

/// Lifecycle state of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionState {
    /// Armed: a false -> true edge will escalate.
    Active,
    /// Notified for the current satisfaction episode; re-arms on a false reading.
    Fired,
    /// Past its own deadline.
    Stale,
    /// Removed by the user, superseded, or purged.
    Deleted,
}

impl ConditionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConditionState::Stale | ConditionState::Deleted)
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ConditionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionState::Active => write!(f, "active"),
            ConditionState::Fired => write!(f, "fired"),
            ConditionState::Stale => write!(f, "stale"),
            ConditionState::Deleted => write!(f, "deleted"),
        }
    }
}

/// Closed-form comparison against a single sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "operand", rename_all = "snake_case")]
pub enum Comparison {
    /// `sample > threshold`
    Above(Quantity),
    /// `sample >= threshold`
    AtOrAbove(Quantity),
    /// `sample < threshold`
    Below(Quantity),
    /// `sample <= threshold`
    AtOrBelow(Quantity),
    /// Ranking contains the member, or a headline contains the keyword.
    Contains(String),
    /// Change since the previous sample is at least this many percent
    /// (relative change for absolute series, point change for percent series).
    ChangeExceeds(f64),
}

impl Comparison {
    /// Threshold quantity, for numeric comparisons.
    pub fn threshold(&self) -> Option<&Quantity> {
        match self {
            Comparison::Above(q)
            | Comparison::AtOrAbove(q)
            | Comparison::Below(q)
            | Comparison::AtOrBelow(q) => Some(q),
            Comparison::Contains(_) | Comparison::ChangeExceeds(_) => None,
        }
    }
}

/// Alert-tier payload: one comparison over one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPredicate {
    pub topic: TopicKey,
    pub comparison: Comparison,
}

impl AlertPredicate {
    pub fn new(topic: TopicKey, comparison: Comparison) -> Self {
        Self { topic, comparison }
    }
}

/// Binary comparison operator used inside signal expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl CompareOp {
    pub fn apply(&self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Eq => (left - right).abs() <= f64::EPSILON * left.abs().max(1.0),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
        };
        f.write_str(symbol)
    }
}

/// Side of a signal comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Current value of a stream.
    Topic(TopicKey),
    /// Fixed value.
    Constant(Quantity),
}

/// Signal-tier payload: a boolean/comparison tree over stream values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalExpr {
    All(Vec<SignalExpr>),
    Any(Vec<SignalExpr>),
    Not(Box<SignalExpr>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    /// An alert predicate used as a leaf.
    Holds(AlertPredicate),
}

impl SignalExpr {
    pub fn compare(left: Operand, op: CompareOp, right: Operand) -> Self {
        SignalExpr::Compare { left, op, right }
    }

    /// Every topic the expression reads.
    pub fn topics(&self) -> BTreeSet<TopicKey> {
        let mut topics = BTreeSet::new();
        self.collect_topics(&mut topics);
        topics
    }

    fn collect_topics(&self, out: &mut BTreeSet<TopicKey>) {
        match self {
            SignalExpr::All(children) | SignalExpr::Any(children) => {
                for child in children {
                    child.collect_topics(out);
                }
            }
            SignalExpr::Not(inner) => inner.collect_topics(out),
            SignalExpr::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Topic(topic) = operand {
                        out.insert(topic.clone());
                    }
                }
            }
            SignalExpr::Holds(alert) => {
                out.insert(alert.topic.clone());
            }
        }
    }
}

/// Category of data the deep-collect collaborator can gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Market,
    Derivatives,
    News,
    Social,
    Sentiment,
    Chart,
    Positions,
    General,
}

/// LLM-evaluated payload: what to ask and what to collect first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentSpec {
    pub prompt: String,
    #[serde(default)]
    pub data_needed: Vec<DataCategory>,
}

/// Tier-specific payload; the variant *is* the tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", content = "spec", rename_all = "snake_case")]
pub enum ConditionPayload {
    Alert(AlertPredicate),
    Signal(SignalExpr),
    LlmEvaluated(JudgmentSpec),
}

impl ConditionPayload {
    pub fn tier(&self) -> ConditionTier {
        match self {
            ConditionPayload::Alert(_) => ConditionTier::Alert,
            ConditionPayload::Signal(_) => ConditionTier::Signal,
            ConditionPayload::LlmEvaluated(_) => ConditionTier::LlmEvaluated,
        }
    }

    /// Topics the payload is bound to (empty for LLM-evaluated conditions).
    pub fn topics(&self) -> BTreeSet<TopicKey> {
        match self {
            ConditionPayload::Alert(alert) => BTreeSet::from([alert.topic.clone()]),
            ConditionPayload::Signal(expr) => expr.topics(),
            ConditionPayload::LlmEvaluated(_) => BTreeSet::new(),
        }
    }

    /// Data the deep-collect collaborator should gather for escalation.
    pub fn data_needed(&self) -> Vec<DataCategory> {
        match self {
            ConditionPayload::LlmEvaluated(spec) => spec.data_needed.clone(),
            ConditionPayload::Signal(_) => vec![
                DataCategory::Market,
                DataCategory::Derivatives,
                DataCategory::News,
            ],
            ConditionPayload::Alert(_) => Vec::new(),
        }
    }
}

/// One satisfaction episode of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Occurrence {
    pub condition_id: ConditionId,
    pub episode: u64,
}

impl fmt::Display for Occurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.condition_id, self.episode)
    }
}

/// A rule to watch for on behalf of one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub id: ConditionId,
    pub user: UserId,
    pub payload: ConditionPayload,
    pub origin: ConditionOrigin,
    pub state: ConditionState,

    /// Human-readable label used in notifications.
    pub description: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,

    /// Set when the user confirms a system-originated condition.
    pub confirmed_at: Option<DateTime<Utc>>,

    /// Optional deadline after which the condition goes Stale.
    pub expires_at: Option<DateTime<Utc>>,

    /// Incremented every time a Fired condition re-arms.
    pub episode: u64,

    pub fire_count: u32,

    pub supersedes: Option<ConditionId>,
    pub superseded_by: Option<ConditionId>,
}

impl Condition {
    pub fn new(
        user: UserId,
        payload: ConditionPayload,
        origin: ConditionOrigin,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConditionId::generate(),
            user,
            payload,
            origin,
            state: ConditionState::Active,
            description: description.into(),
            created_at: now,
            updated_at: now,
            last_fired_at: None,
            confirmed_at: None,
            expires_at: None,
            episode: 0,
            fire_count: 0,
            supersedes: None,
            superseded_by: None,
        }
    }

    pub fn tier(&self) -> ConditionTier {
        self.payload.tier()
    }

    pub fn occurrence(&self) -> Occurrence {
        Occurrence {
            condition_id: self.id,
            episode: self.episode,
        }
    }

    /// Start of the retention window for system-originated conditions.
    pub fn retention_anchor(&self) -> DateTime<Utc> {
        match self.last_fired_at {
            Some(fired) if fired > self.created_at => fired,
            _ => self.created_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|deadline| now >= deadline).unwrap_or(false)
    }
}
