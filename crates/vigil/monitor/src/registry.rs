//! Stream registry.
//!
//! Owns every (user, topic) stream: its temperature, cadence and last
//! observed value. Streams are created on first reference and never removed;
//! temperature degrades one step per sweep on inactivity and jumps back to
//! Hot on any reference.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use vigil_types::{
    MonitorEvent, Sample, SampleValue, Stream, StreamKey, Temperature, TopicKey, TopicKind,
    UserId,
};

use crate::clock::SharedClock;
use crate::config::{span, CadenceConfig, DeltaConfig, MonitorConfig, TemperatureConfig};
use crate::error::{MonitorError, MonitorResult};
use crate::evaluator::{Reading, Readings};

/// Streams every new user watches from onboarding.
pub const DEFAULT_PRESET: [(TopicKind, &str); 9] = [
    (TopicKind::Price, "BTC"),
    (TopicKind::Price, "ETH"),
    (TopicKind::Funding, "BTC"),
    (TopicKind::Funding, "ETH"),
    (TopicKind::OpenInterestChange, "BTC"),
    (TopicKind::OpenInterestChange, "ETH"),
    (TopicKind::News, "all"),
    (TopicKind::Indicator, "fear_greed"),
    (TopicKind::Premium, "kimchi"),
];

/// Result of recording one sample.
#[derive(Debug, Clone)]
pub struct SampleDelta {
    pub key: StreamKey,

    /// Whether the value changed enough to be worth evaluating.
    pub meaningful: bool,

    pub previous: Option<SampleValue>,
    pub current: SampleValue,
    pub temperature: Temperature,
    pub observed_at: DateTime<Utc>,
}

/// One temperature change applied by a sweep or a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemperatureTransition {
    pub key: StreamKey,
    pub from: Temperature,
    pub to: Temperature,
}

/// Catalog of watched streams.
pub struct StreamRegistry {
    streams: DashMap<StreamKey, Stream>,

    /// Topics per user, for per-user sweeps and listings.
    user_topics: DashMap<UserId, BTreeSet<TopicKey>>,

    /// Last explicit reference per user.
    last_activity: DashMap<UserId, DateTime<Utc>>,

    cadence: CadenceConfig,
    temperature: TemperatureConfig,
    delta: DeltaConfig,
    history_window: usize,

    clock: SharedClock,
    event_tx: broadcast::Sender<MonitorEvent>,
}

impl StreamRegistry {
    pub fn new(
        config: &MonitorConfig,
        clock: SharedClock,
        event_tx: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            streams: DashMap::new(),
            user_topics: DashMap::new(),
            last_activity: DashMap::new(),
            cadence: config.cadence.clone(),
            temperature: config.temperature.clone(),
            delta: config.delta.clone(),
            history_window: config.anomaly.history_window.max(1),
            clock,
            event_tx,
        }
    }

    /// Get or create a stream. New streams start Hot and due immediately.
    pub fn ensure_stream(&self, user: &UserId, topic: &TopicKey) -> Stream {
        let key = StreamKey::new(user.clone(), topic.clone());
        let now = self.clock.now();
        let mut created = false;

        let stream = self
            .streams
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                Stream::new(key.clone(), now)
            })
            .clone();

        if created {
            self.on_created(&key);
        }
        stream
    }

    /// Record a user reference: the stream becomes Hot regardless of its
    /// prior temperature.
    #[instrument(skip(self))]
    pub fn touch(&self, user: &UserId, topic: &TopicKey) -> Stream {
        let stream = self.reference(user, topic, true);
        self.record_activity(user);
        stream
    }

    /// Promote a stream to Hot on behalf of a condition. Same as [`touch`]
    /// but does not count as user activity.
    ///
    /// [`touch`]: StreamRegistry::touch
    pub fn promote(&self, user: &UserId, topic: &TopicKey) -> Stream {
        self.reference(user, topic, false)
    }

    fn reference(&self, user: &UserId, topic: &TopicKey, by_user: bool) -> Stream {
        let key = StreamKey::new(user.clone(), topic.clone());
        let now = self.clock.now();
        let mut created = false;
        let mut transition = None;

        let stream = {
            let mut stream = self.streams.entry(key.clone()).or_insert_with(|| {
                created = true;
                Stream::new(key.clone(), now)
            });
            stream.last_referenced_at = now;
            if by_user {
                stream.user_references = stream.user_references.saturating_add(1);
            }
            if stream.temperature != Temperature::Hot {
                transition = Some(TemperatureTransition {
                    key: key.clone(),
                    from: stream.temperature,
                    to: Temperature::Hot,
                });
                stream.temperature = Temperature::Hot;
                stream.next_due_at = Some(now);
            }
            stream.clone()
        };

        if created {
            self.on_created(&key);
        }
        if let Some(transition) = transition {
            info!(
                stream = %transition.key,
                from = %transition.from,
                "Stream promoted to hot"
            );
            self.emit_transition(transition);
        }
        stream
    }

    /// Record a new observed value and advance the stream's next-due time.
    ///
    /// Rejects values that are not in the topic's native unit.
    pub fn sample(&self, key: &StreamKey, value: SampleValue) -> MonitorResult<SampleDelta> {
        let expected = key.topic.unit();
        if value.unit() != expected {
            return Err(MonitorError::UnitMismatch {
                topic: key.topic.clone(),
                expected,
                found: value.unit(),
            });
        }
        if let Some(quantity) = value.as_quantity() {
            if !quantity.is_finite() {
                return Err(MonitorError::InvalidPayload(format!(
                    "non-finite sample for {}",
                    key.topic
                )));
            }
        }

        let now = self.clock.now();
        let mut stream = self
            .streams
            .get_mut(key)
            .ok_or_else(|| MonitorError::StreamNotFound(key.clone()))?;

        let meaningful = is_meaningful(
            stream.last_value(),
            &value,
            self.delta.min_relative_change,
        );

        let previous = stream.last_sample.take();
        let previous_value = previous.as_ref().map(|s| s.value.clone());
        stream.previous_sample = previous;
        stream.last_sample = Some(Sample {
            value: value.clone(),
            observed_at: now,
        });

        if let Some(numeric) = value.numeric() {
            stream.history.push_back(numeric);
            while stream.history.len() > self.history_window {
                stream.history.pop_front();
            }
        }

        stream.consecutive_failures = 0;
        stream.last_error = None;
        stream.next_due_at = self
            .cadence
            .interval(stream.temperature)
            .map(|interval| now + span(interval));

        Ok(SampleDelta {
            key: key.clone(),
            meaningful,
            previous: previous_value,
            current: value,
            temperature: stream.temperature,
            observed_at: now,
        })
    }

    /// Record a failed fetch. The stream retries on its own cadence.
    pub fn record_failure(&self, key: &StreamKey, reason: &str) -> MonitorResult<u32> {
        let now = self.clock.now();
        let failures = {
            let mut stream = self
                .streams
                .get_mut(key)
                .ok_or_else(|| MonitorError::StreamNotFound(key.clone()))?;
            stream.consecutive_failures = stream.consecutive_failures.saturating_add(1);
            stream.last_error = Some(reason.to_string());
            stream.next_due_at = self
                .cadence
                .interval(stream.temperature)
                .map(|interval| now + span(interval));
            stream.consecutive_failures
        };

        warn!(stream = %key, failures, reason, "Stream sample failed");
        let _ = self.event_tx.send(MonitorEvent::SourceFailed {
            key: key.clone(),
            reason: reason.to_string(),
            consecutive_failures: failures,
        });
        Ok(failures)
    }

    /// Claim up to `limit` polled streams that are due, advancing their
    /// next-due time so a stream is never handed out twice per cadence.
    pub fn claim_due(&self, limit: usize) -> Vec<StreamKey> {
        let now = self.clock.now();
        let mut claimed = Vec::new();

        for mut stream in self.streams.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if !stream.is_due(now) {
                continue;
            }
            stream.next_due_at = self
                .cadence
                .interval(stream.temperature)
                .map(|interval| now + span(interval));
            claimed.push(stream.key().clone());
        }

        claimed
    }

    /// Demote idle streams across all users, at most one step per stream.
    #[instrument(skip(self))]
    pub fn sweep_temperature(&self) -> Vec<TemperatureTransition> {
        let now = self.clock.now();
        let mut transitions = Vec::new();
        for mut stream in self.streams.iter_mut() {
            if let Some(transition) = self.demote_if_idle(&mut stream, now) {
                transitions.push(transition);
            }
        }
        self.finish_sweep(transitions)
    }

    /// Demote one user's idle streams, at most one step per stream.
    pub fn sweep_user(&self, user: &UserId) -> Vec<TemperatureTransition> {
        let now = self.clock.now();
        let mut transitions = Vec::new();
        for topic in self.topics_for(user) {
            let key = StreamKey::new(user.clone(), topic);
            if let Some(mut stream) = self.streams.get_mut(&key) {
                if let Some(transition) = self.demote_if_idle(&mut stream, now) {
                    transitions.push(transition);
                }
            }
        }
        self.finish_sweep(transitions)
    }

    fn demote_if_idle(&self, stream: &mut Stream, now: DateTime<Utc>) -> Option<TemperatureTransition> {
        let idle = now - stream.last_referenced_at;
        let target = match stream.temperature {
            Temperature::Hot if idle >= span(self.temperature.hot_to_warm) => Temperature::Warm,
            Temperature::Warm if idle >= span(self.temperature.warm_to_cold) => Temperature::Cold,
            _ => return None,
        };

        let from = stream.temperature;
        stream.temperature = target;
        stream.next_due_at = self
            .cadence
            .interval(target)
            .map(|interval| now + span(interval));

        Some(TemperatureTransition {
            key: stream.key.clone(),
            from,
            to: target,
        })
    }

    fn finish_sweep(&self, transitions: Vec<TemperatureTransition>) -> Vec<TemperatureTransition> {
        for transition in &transitions {
            debug!(
                stream = %transition.key,
                from = %transition.from,
                to = %transition.to,
                "Stream demoted"
            );
            self.emit_transition(transition.clone());
        }
        transitions
    }

    /// Current values of `topics` for one user, with freshness.
    pub fn readings(&self, user: &UserId, topics: &BTreeSet<TopicKey>) -> Readings {
        let now = self.clock.now();
        let mut readings = HashMap::with_capacity(topics.len());

        for topic in topics {
            let key = StreamKey::new(user.clone(), topic.clone());
            let Some(stream) = self.streams.get(&key) else {
                continue;
            };
            let Some(sample) = stream.last_sample.as_ref() else {
                continue;
            };
            let window = span(self.cadence.freshness_window(stream.temperature));
            readings.insert(
                topic.clone(),
                Reading {
                    value: sample.value.clone(),
                    previous: stream.previous_sample.as_ref().map(|s| s.value.clone()),
                    observed_at: sample.observed_at,
                    fresh: now - sample.observed_at <= window,
                },
            );
        }

        readings
    }

    /// Ensure the onboarding preset for a user.
    pub fn ensure_default_preset(&self, user: &UserId) -> Vec<Stream> {
        self.record_activity(user);
        DEFAULT_PRESET
            .iter()
            .map(|(kind, subject)| self.ensure_stream(user, &TopicKey::new(*kind, *subject)))
            .collect()
    }

    pub fn get(&self, key: &StreamKey) -> Option<Stream> {
        self.streams.get(key).map(|s| s.clone())
    }

    /// All streams of one user, ordered by topic.
    pub fn streams_for(&self, user: &UserId) -> Vec<Stream> {
        self.topics_for(user)
            .into_iter()
            .filter_map(|topic| self.get(&StreamKey::new(user.clone(), topic)))
            .collect()
    }

    /// Subjects the user has referenced directly, e.g. `BTC` for a touch
    /// of `funding/BTC`.
    pub fn referenced_subjects(&self, user: &UserId) -> BTreeSet<String> {
        self.streams_for(user)
            .into_iter()
            .filter(|s| s.user_references > 0)
            .map(|s| s.key.topic.subject)
            .collect()
    }

    /// Cold streams of one user (sampled only by patrol).
    pub fn cold_streams(&self, user: &UserId) -> Vec<StreamKey> {
        self.streams_for(user)
            .into_iter()
            .filter(|s| s.temperature == Temperature::Cold)
            .map(|s| s.key)
            .collect()
    }

    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.user_topics.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    pub fn last_activity(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.last_activity.get(user).map(|t| *t)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn topics_for(&self, user: &UserId) -> Vec<TopicKey> {
        self.user_topics
            .get(user)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_activity(&self, user: &UserId) {
        let now = self.clock.now();
        self.last_activity
            .entry(user.clone())
            .and_modify(|last| {
                if now > *last {
                    *last = now;
                }
            })
            .or_insert(now);
    }

    fn on_created(&self, key: &StreamKey) {
        self.user_topics
            .entry(key.user.clone())
            .or_default()
            .insert(key.topic.clone());
        debug!(stream = %key, "Stream created");
        let _ = self
            .event_tx
            .send(MonitorEvent::StreamCreated { key: key.clone() });
    }

    fn emit_transition(&self, transition: TemperatureTransition) {
        let _ = self.event_tx.send(MonitorEvent::TemperatureChanged {
            key: transition.key,
            from: transition.from,
            to: transition.to,
        });
    }
}

/// Change policy: numeric by relative threshold, rankings by set difference,
/// headline feeds by presence of a new headline. First samples always count.
pub fn is_meaningful(previous: Option<&SampleValue>, current: &SampleValue, min_relative: f64) -> bool {
    let Some(previous) = previous else {
        return true;
    };

    match (previous, current) {
        (SampleValue::Quantity(prev), SampleValue::Quantity(cur)) => {
            if !prev.same_unit(cur) {
                return true;
            }
            let (prev, cur) = (prev.value(), cur.value());
            if min_relative <= 0.0 || prev == 0.0 {
                return cur != prev;
            }
            ((cur - prev) / prev).abs() >= min_relative
        }
        (SampleValue::Ranking(prev), SampleValue::Ranking(cur)) => {
            let prev: BTreeSet<&String> = prev.iter().collect();
            let cur: BTreeSet<&String> = cur.iter().collect();
            prev.symmetric_difference(&cur).next().is_some()
        }
        (SampleValue::Headlines(prev), SampleValue::Headlines(cur)) => {
            cur.iter().any(|headline| !prev.contains(headline))
        }
        _ => true,
    }
}
