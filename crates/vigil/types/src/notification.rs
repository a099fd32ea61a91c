//! Notifications dispatched to users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::{ConditionTier, DataCategory, Occurrence};
use crate::ids::UserId;
use crate::topic::TopicKey;
use crate::value::SampleValue;

/// Tier-specific body of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationDetail {
    /// Closed-form alert: the triggering sample.
    Alert { topic: TopicKey, value: SampleValue },

    /// Judged signal: the judge's reasoning.
    Judged {
        rationale: String,
        confidence: f64,
        /// Categories the deep-collect step could not gather.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        missing: Vec<DataCategory>,
    },
}

/// A message for one user about one condition occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user: UserId,
    pub occurrence: Occurrence,
    pub tier: ConditionTier,
    pub description: String,
    pub detail: NotificationDetail,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user: UserId,
        occurrence: Occurrence,
        tier: ConditionTier,
        description: impl Into<String>,
        detail: NotificationDetail,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            occurrence,
            tier,
            description: description.into(),
            detail,
            created_at: now,
        }
    }
}
