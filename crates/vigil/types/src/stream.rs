//! Watched data streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::topic::StreamKey;
use crate::value::SampleValue;

/// Freshness tier of a stream; controls its polling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Temperature {
    /// Referenced recently, polled on the short cadence.
    Hot,
    /// Idle for a while, polled on the long cadence.
    Warm,
    /// Idle for a long time, sampled only during patrol.
    Cold,
}

impl Temperature {
    /// The next colder tier, if any.
    pub fn demoted(&self) -> Option<Temperature> {
        match self {
            Temperature::Hot => Some(Temperature::Warm),
            Temperature::Warm => Some(Temperature::Cold),
            Temperature::Cold => None,
        }
    }

    /// Whether the stream has an active polling cadence.
    pub fn is_polled(&self) -> bool {
        !matches!(self, Temperature::Cold)
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Temperature::Hot => write!(f, "hot"),
            Temperature::Warm => write!(f, "warm"),
            Temperature::Cold => write!(f, "cold"),
        }
    }
}

/// One observation of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: SampleValue,
    pub observed_at: DateTime<Utc>,
}

/// A (user, topic) pair under watch. Never deleted once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub key: StreamKey,

    pub temperature: Temperature,

    pub created_at: DateTime<Utc>,

    /// Last time the topic was referenced, by the user or a condition.
    pub last_referenced_at: DateTime<Utc>,

    /// Times the user referenced the topic directly.
    #[serde(default)]
    pub user_references: u32,

    pub last_sample: Option<Sample>,

    /// Sample before `last_sample`, used for change-based predicates.
    pub previous_sample: Option<Sample>,

    /// When the next poll is due; `None` while Cold.
    pub next_due_at: Option<DateTime<Utc>>,

    /// Recent numeric values, oldest first.
    pub history: VecDeque<f64>,

    /// Consecutive failed fetches from the data source.
    pub consecutive_failures: u32,

    pub last_error: Option<String>,
}

impl Stream {
    /// A freshly created stream: Hot and due immediately.
    pub fn new(key: StreamKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            temperature: Temperature::Hot,
            created_at: now,
            last_referenced_at: now,
            user_references: 0,
            last_sample: None,
            previous_sample: None,
            next_due_at: Some(now),
            history: VecDeque::new(),
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn last_value(&self) -> Option<&SampleValue> {
        self.last_sample.as_ref().map(|s| &s.value)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.temperature.is_polled() && self.next_due_at.map(|due| due <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use crate::topic::TopicKey;

    #[test]
    fn test_demotion_chain() {
        assert_eq!(Temperature::Hot.demoted(), Some(Temperature::Warm));
        assert_eq!(Temperature::Warm.demoted(), Some(Temperature::Cold));
        assert_eq!(Temperature::Cold.demoted(), None);
        assert!(!Temperature::Cold.is_polled());
    }

    #[test]
    fn test_new_stream_is_hot_and_due() {
        let now = Utc::now();
        let stream = Stream::new(StreamKey::new(UserId::new("u1"), TopicKey::price("BTC")), now);
        assert_eq!(stream.temperature, Temperature::Hot);
        assert!(stream.is_due(now));
        assert!(stream.last_value().is_none());
    }
}
