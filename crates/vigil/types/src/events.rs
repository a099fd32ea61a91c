//! Events emitted by the monitoring core.
//!
//! Events are fire-and-forget observability records; no component depends on
//! them being received.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::{ConditionOrigin, ConditionState, ConditionTier, Occurrence};
use crate::ids::{ConditionId, UserId};
use crate::stream::Temperature;
use crate::topic::{StreamKey, TopicKey};

/// Final outcome of one escalation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EscalationOutcome {
    /// Notification dispatched and acknowledged.
    Notified,
    /// Daily budget exhausted; occurrence consumed without notifying.
    SuppressedByBudget,
    /// Judge found the condition not satisfied; occurrence consumed.
    DeclinedByJudge { rationale: String },
    /// Collaborator failure or timeout; condition left Active for retry.
    RetryableFailure { reason: String },
    /// Notification collaborator rejected delivery; occurrence consumed.
    DeliveryFailed { reason: String },
    /// Another attempt for the same occurrence was already in flight.
    Deduplicated,
    /// Condition passed its deadline before escalation.
    Expired,
    /// Condition was deleted or went stale while the attempt was running.
    Withdrawn,
    /// Internal inconsistency; occurrence abandoned, condition forced Active.
    InvariantViolation { reason: String },
}

impl EscalationOutcome {
    /// Whether the occurrence was consumed (condition now Fired).
    pub fn consumes_occurrence(&self) -> bool {
        matches!(
            self,
            EscalationOutcome::Notified
                | EscalationOutcome::SuppressedByBudget
                | EscalationOutcome::DeclinedByJudge { .. }
                | EscalationOutcome::DeliveryFailed { .. }
        )
    }
}

/// Audit entry for one escalation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub occurrence: Occurrence,
    pub user: UserId,
    pub tier: ConditionTier,
    pub outcome: EscalationOutcome,
    pub at: DateTime<Utc>,
}

/// Observability events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    // ═══════════════════════════════════════════════════════════════════
    // STREAM EVENTS
    // ═══════════════════════════════════════════════════════════════════
    StreamCreated {
        key: StreamKey,
    },
    TemperatureChanged {
        key: StreamKey,
        from: Temperature,
        to: Temperature,
    },
    SourceFailed {
        key: StreamKey,
        reason: String,
        consecutive_failures: u32,
    },

    // ═══════════════════════════════════════════════════════════════════
    // CONDITION EVENTS
    // ═══════════════════════════════════════════════════════════════════
    ConditionCreated {
        condition_id: ConditionId,
        user: UserId,
        tier: ConditionTier,
        origin: ConditionOrigin,
    },
    ConditionStateChanged {
        condition_id: ConditionId,
        from: ConditionState,
        to: ConditionState,
    },
    ConditionSuperseded {
        old: ConditionId,
        new: ConditionId,
    },
    ConditionsPurged {
        user: Option<UserId>,
        condition_ids: Vec<ConditionId>,
    },

    // ═══════════════════════════════════════════════════════════════════
    // ESCALATION / PATROL EVENTS
    // ═══════════════════════════════════════════════════════════════════
    Escalated(EscalationRecord),
    AnomalyDetected {
        user: UserId,
        topic: TopicKey,
        description: String,
        condition_id: Option<ConditionId>,
    },
    PatrolCompleted {
        user: UserId,
        failed_steps: Vec<String>,
        deadline_exceeded: bool,
        at: DateTime<Utc>,
    },
}
