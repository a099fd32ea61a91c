//! Condition store.
//!
//! Arena of every condition ever created. Nothing is physically removed;
//! lifecycle states bound the active scan cost through secondary indexes on
//! bound stream, (tier, state) and user.
//!
//! Lock order: an arena entry guard may be held while touching an index,
//! never the other way around.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use vigil_types::{
    AlertPredicate, Comparison, Condition, ConditionId, ConditionOrigin, ConditionPayload,
    ConditionState, ConditionTier, MonitorEvent, Operand, SignalExpr, StreamKey, TopicKey, Unit,
    UserId,
};

use crate::clock::SharedClock;
use crate::config::{span, MonitorConfig};
use crate::error::{MonitorError, MonitorResult};
use crate::registry::StreamRegistry;

const MAX_SIGNAL_DEPTH: usize = 16;

const LIVE_STATES: [ConditionState; 2] = [ConditionState::Active, ConditionState::Fired];

/// Request to create a condition.
#[derive(Debug, Clone)]
pub struct NewCondition {
    pub payload: ConditionPayload,
    pub origin: ConditionOrigin,
    pub description: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub supersedes: Option<ConditionId>,
}

impl NewCondition {
    pub fn new(payload: ConditionPayload, origin: ConditionOrigin) -> Self {
        Self {
            payload,
            origin,
            description: None,
            expires_at: None,
            supersedes: None,
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn expiring_at(mut self, deadline: DateTime<Utc>) -> Self {
        self.expires_at = Some(deadline);
        self
    }
}

/// Store of all conditions.
pub struct ConditionStore {
    arena: DashMap<ConditionId, Condition>,

    /// Live conditions bound to each stream.
    by_stream: DashMap<StreamKey, HashSet<ConditionId>>,

    by_tier_state: DashMap<(ConditionTier, ConditionState), HashSet<ConditionId>>,

    by_user: DashMap<UserId, HashSet<ConditionId>>,

    registry: Arc<StreamRegistry>,
    max_signal_streams: usize,
    clock: SharedClock,
    event_tx: broadcast::Sender<MonitorEvent>,
}

impl ConditionStore {
    pub fn new(
        config: &MonitorConfig,
        registry: Arc<StreamRegistry>,
        clock: SharedClock,
        event_tx: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            arena: DashMap::new(),
            by_stream: DashMap::new(),
            by_tier_state: DashMap::new(),
            by_user: DashMap::new(),
            registry,
            max_signal_streams: config.signal.max_streams,
            clock,
            event_tx,
        }
    }

    /// Validate and persist a condition, ensuring the streams it reads.
    ///
    /// Alert conditions ensure their stream; Signal conditions ensure and
    /// promote every referenced stream to Hot. Rejected payloads are never
    /// persisted.
    #[instrument(skip(self, request), fields(user = %user))]
    pub fn create(&self, user: &UserId, request: NewCondition) -> MonitorResult<Condition> {
        self.validate(&request.payload)?;

        let topics = request.payload.topics();
        match request.payload.tier() {
            ConditionTier::Alert => {
                for topic in &topics {
                    self.registry.ensure_stream(user, topic);
                }
            }
            ConditionTier::Signal => {
                for topic in &topics {
                    self.registry.promote(user, topic);
                }
            }
            ConditionTier::LlmEvaluated => {}
        }

        let now = self.clock.now();
        let description = request
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| describe(&request.payload));
        let mut condition = Condition::new(
            user.clone(),
            request.payload,
            request.origin,
            description,
            now,
        );
        condition.expires_at = request.expires_at;
        condition.supersedes = request.supersedes;

        let id = condition.id;
        let tier = condition.tier();
        self.arena.insert(id, condition.clone());
        self.by_user.entry(user.clone()).or_default().insert(id);
        self.by_tier_state
            .entry((tier, ConditionState::Active))
            .or_default()
            .insert(id);
        for topic in topics {
            self.by_stream
                .entry(StreamKey::new(user.clone(), topic))
                .or_default()
                .insert(id);
        }

        info!(
            condition_id = %id,
            tier = %tier,
            origin = ?condition.origin,
            "Condition created"
        );
        let _ = self.event_tx.send(MonitorEvent::ConditionCreated {
            condition_id: id,
            user: user.clone(),
            tier,
            origin: condition.origin,
        });

        Ok(condition)
    }

    pub fn get(&self, id: &ConditionId) -> Option<Condition> {
        self.arena.get(id).map(|c| c.clone())
    }

    /// Live (Active or Fired) conditions bound to a stream, oldest first.
    ///
    /// Cost is proportional to the conditions bound to that stream.
    pub fn list_active_for_stream(&self, key: &StreamKey) -> Vec<Condition> {
        let ids: Vec<ConditionId> = self
            .by_stream
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        self.collect_live(ids)
    }

    /// Every condition of a user, in any state, oldest first.
    pub fn list_for_user(&self, user: &UserId) -> Vec<Condition> {
        let mut conditions: Vec<Condition> = self
            .user_ids(user)
            .into_iter()
            .filter_map(|id| self.get(&id))
            .collect();
        sort(&mut conditions);
        conditions
    }

    /// Live conditions of one user in one tier.
    pub fn list_live_for_user(&self, user: &UserId, tier: ConditionTier) -> Vec<Condition> {
        let ids = self.user_ids(user);
        let mut conditions: Vec<Condition> = self
            .collect_live(ids)
            .into_iter()
            .filter(|c| c.tier() == tier)
            .collect();
        sort(&mut conditions);
        conditions
    }

    /// Conditions in a (tier, state) bucket.
    pub fn list_by_tier_state(&self, tier: ConditionTier, state: ConditionState) -> Vec<Condition> {
        let ids: Vec<ConditionId> = self
            .by_tier_state
            .get(&(tier, state))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let mut conditions: Vec<Condition> = ids
            .into_iter()
            .filter_map(|id| self.get(&id))
            .filter(|c| c.state == state)
            .collect();
        sort(&mut conditions);
        conditions
    }

    /// Live condition of a user with the given origin and description.
    pub fn find_live_by_description(
        &self,
        user: &UserId,
        origin: ConditionOrigin,
        description: &str,
    ) -> Option<Condition> {
        self.collect_live(self.user_ids(user))
            .into_iter()
            .find(|c| c.origin == origin && c.description == description)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    // ═══════════════════════════════════════════════════════════════════
    // STATE TRANSITIONS
    // ═══════════════════════════════════════════════════════════════════

    /// Atomic compare-and-set Active -> Fired for one episode.
    ///
    /// Returns `Ok(false)` when the condition is already terminal. A
    /// condition that is Fired, or Active on another episode, means two
    /// escalations raced for one occurrence and is reported as an invariant
    /// violation.
    pub fn mark_fired(
        &self,
        id: &ConditionId,
        episode: u64,
        occurred_at: DateTime<Utc>,
    ) -> MonitorResult<bool> {
        let mut condition = self
            .arena
            .get_mut(id)
            .ok_or(MonitorError::ConditionNotFound(*id))?;

        if condition.state.is_terminal() {
            return Ok(false);
        }
        if condition.state != ConditionState::Active || condition.episode != episode {
            return Err(MonitorError::InvariantViolation(format!(
                "{} is {} on episode {}, expected active on episode {}",
                id, condition.state, condition.episode, episode
            )));
        }

        condition.last_fired_at = Some(occurred_at);
        condition.fire_count = condition.fire_count.saturating_add(1);
        self.apply_state(&mut condition, ConditionState::Fired);
        Ok(true)
    }

    /// Re-arm a condition that fired on `episode` after its predicate was
    /// observed false. `Ok(false)` when it is no longer Fired on that
    /// episode, so a late observation cannot re-arm a newer firing.
    pub fn rearm(&self, id: &ConditionId, episode: u64) -> MonitorResult<bool> {
        let mut condition = self
            .arena
            .get_mut(id)
            .ok_or(MonitorError::ConditionNotFound(*id))?;
        if condition.state != ConditionState::Fired || condition.episode != episode {
            return Ok(false);
        }
        condition.episode += 1;
        self.apply_state(&mut condition, ConditionState::Active);
        debug!(condition_id = %id, episode = condition.episode, "Condition re-armed");
        Ok(true)
    }

    /// Force a non-terminal condition back to Active after an abandoned
    /// occurrence.
    pub fn force_active(&self, id: &ConditionId) -> MonitorResult<bool> {
        let mut condition = self
            .arena
            .get_mut(id)
            .ok_or(MonitorError::ConditionNotFound(*id))?;
        match condition.state {
            ConditionState::Fired => {
                warn!(condition_id = %id, "Forcing condition back to active");
                self.apply_state(&mut condition, ConditionState::Active);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Move a condition past its deadline to Stale. No-op when terminal.
    pub fn mark_stale(&self, id: &ConditionId) -> MonitorResult<bool> {
        self.terminate(id, ConditionState::Stale)
    }

    /// Logically delete a condition. No-op when terminal.
    pub fn delete(&self, id: &ConditionId) -> MonitorResult<bool> {
        self.terminate(id, ConditionState::Deleted)
    }

    fn terminate(&self, id: &ConditionId, to: ConditionState) -> MonitorResult<bool> {
        let mut condition = self
            .arena
            .get_mut(id)
            .ok_or(MonitorError::ConditionNotFound(*id))?;
        if condition.state.is_terminal() {
            return Ok(false);
        }
        self.apply_state(&mut condition, to);
        Ok(true)
    }

    /// Record user confirmation; exempts a system-originated condition from
    /// the retention purge.
    pub fn confirm(&self, id: &ConditionId) -> MonitorResult<Condition> {
        let now = self.clock.now();
        let mut condition = self
            .arena
            .get_mut(id)
            .ok_or(MonitorError::ConditionNotFound(*id))?;
        if condition.state.is_terminal() {
            return Err(MonitorError::InvalidTransition {
                condition_id: *id,
                state: condition.state,
                operation: "confirm",
            });
        }
        condition.confirmed_at = Some(now);
        condition.updated_at = now;
        Ok(condition.clone())
    }

    /// Replace a condition with a quantified Alert-tier refinement.
    ///
    /// The replacement is a new condition; the old one is marked Deleted
    /// with a link to its successor. Tier is never changed in place.
    #[instrument(skip(self, refinement, description))]
    pub fn supersede(
        &self,
        old: &ConditionId,
        refinement: AlertPredicate,
        description: Option<String>,
    ) -> MonitorResult<Condition> {
        let previous = self.get(old).ok_or(MonitorError::ConditionNotFound(*old))?;
        if previous.state.is_terminal() {
            return Err(MonitorError::InvalidTransition {
                condition_id: *old,
                state: previous.state,
                operation: "supersede",
            });
        }

        let mut request = NewCondition::new(
            ConditionPayload::Alert(refinement),
            ConditionOrigin::UserRequest,
        );
        request.description = description;
        request.supersedes = Some(*old);
        let replacement = self.create(&previous.user, request)?;

        let retired = match self.arena.get_mut(old) {
            Some(mut condition) if condition.state.is_live() => {
                condition.superseded_by = Some(replacement.id);
                self.apply_state(&mut condition, ConditionState::Deleted);
                None
            }
            Some(condition) => Some(condition.state),
            None => Some(ConditionState::Deleted),
        };

        if let Some(state) = retired {
            // Lost a race with a concurrent delete; drop the replacement.
            let _ = self.delete(&replacement.id);
            return Err(MonitorError::InvalidTransition {
                condition_id: *old,
                state,
                operation: "supersede",
            });
        }

        info!(old = %old, new = %replacement.id, "Condition superseded");
        let _ = self.event_tx.send(MonitorEvent::ConditionSuperseded {
            old: *old,
            new: replacement.id,
        });
        Ok(replacement)
    }

    // ═══════════════════════════════════════════════════════════════════
    // HOUSEKEEPING
    // ═══════════════════════════════════════════════════════════════════

    /// Delete unconfirmed system-originated conditions whose retention anchor
    /// (created-at, or last-fired-at if re-fired) is older than `retention`.
    pub fn purge_expired_system_originated(&self, retention: std::time::Duration) -> Vec<ConditionId> {
        let ids: Vec<ConditionId> = [ConditionTier::Alert, ConditionTier::Signal, ConditionTier::LlmEvaluated]
            .into_iter()
            .flat_map(|tier| LIVE_STATES.map(|state| (tier, state)))
            .flat_map(|bucket| {
                self.by_tier_state
                    .get(&bucket)
                    .map(|ids| ids.iter().copied().collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .collect();
        self.purge(ids, retention, None)
    }

    /// Same as [`purge_expired_system_originated`] for one user.
    ///
    /// [`purge_expired_system_originated`]: ConditionStore::purge_expired_system_originated
    pub fn purge_expired_for_user(
        &self,
        user: &UserId,
        retention: std::time::Duration,
    ) -> Vec<ConditionId> {
        self.purge(self.user_ids(user), retention, Some(user))
    }

    fn purge(
        &self,
        ids: Vec<ConditionId>,
        retention: std::time::Duration,
        user: Option<&UserId>,
    ) -> Vec<ConditionId> {
        let now = self.clock.now();
        let retention = span(retention);
        let mut purged = Vec::new();

        for id in ids {
            let Some(mut condition) = self.arena.get_mut(&id) else {
                continue;
            };
            let expired = condition.state.is_live()
                && condition.origin.is_system()
                && condition.confirmed_at.is_none()
                && now - condition.retention_anchor() >= retention;
            if expired {
                self.apply_state(&mut condition, ConditionState::Deleted);
                purged.push(id);
            }
        }

        if !purged.is_empty() {
            info!(count = purged.len(), "Purged unconfirmed system conditions");
            let _ = self.event_tx.send(MonitorEvent::ConditionsPurged {
                user: user.cloned(),
                condition_ids: purged.clone(),
            });
        }
        purged
    }

    /// Move one user's conditions past their deadline to Stale.
    pub fn expire_for_user(&self, user: &UserId) -> Vec<ConditionId> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        for id in self.user_ids(user) {
            let Some(mut condition) = self.arena.get_mut(&id) else {
                continue;
            };
            if condition.state.is_live() && condition.is_expired(now) {
                self.apply_state(&mut condition, ConditionState::Stale);
                expired.push(id);
            }
        }
        expired
    }

    // ═══════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════

    /// Set state, keep indexes current and emit the change. Caller holds the
    /// arena guard for `condition`.
    fn apply_state(&self, condition: &mut Condition, to: ConditionState) {
        let from = condition.state;
        if from == to {
            return;
        }
        let tier = condition.tier();
        condition.state = to;
        condition.updated_at = self.clock.now();

        if let Some(mut ids) = self.by_tier_state.get_mut(&(tier, from)) {
            ids.remove(&condition.id);
        }
        self.by_tier_state
            .entry((tier, to))
            .or_default()
            .insert(condition.id);

        if to.is_terminal() {
            for topic in condition.payload.topics() {
                let key = StreamKey::new(condition.user.clone(), topic);
                if let Some(mut ids) = self.by_stream.get_mut(&key) {
                    ids.remove(&condition.id);
                }
            }
        }

        debug!(condition_id = %condition.id, from = %from, to = %to, "Condition state changed");
        let _ = self.event_tx.send(MonitorEvent::ConditionStateChanged {
            condition_id: condition.id,
            from,
            to,
        });
    }

    fn user_ids(&self, user: &UserId) -> Vec<ConditionId> {
        self.by_user
            .get(user)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn collect_live(&self, ids: Vec<ConditionId>) -> Vec<Condition> {
        let mut conditions: Vec<Condition> = ids
            .into_iter()
            .filter_map(|id| self.get(&id))
            .filter(|c| c.state.is_live())
            .collect();
        sort(&mut conditions);
        conditions
    }

    // ═══════════════════════════════════════════════════════════════════
    // VALIDATION
    // ═══════════════════════════════════════════════════════════════════

    /// Check that a payload has the shape its tier requires.
    pub fn validate(&self, payload: &ConditionPayload) -> MonitorResult<()> {
        match payload {
            ConditionPayload::Alert(alert) => validate_alert(alert),
            ConditionPayload::Signal(expr) => {
                validate_expr(expr, 0)?;
                let count = expr.topics().len();
                if count == 0 {
                    return Err(MonitorError::InvalidPayload(
                        "signal references no streams".into(),
                    ));
                }
                if count > self.max_signal_streams {
                    return Err(MonitorError::TooManySignalStreams {
                        count,
                        max: self.max_signal_streams,
                    });
                }
                Ok(())
            }
            ConditionPayload::LlmEvaluated(spec) => {
                if spec.prompt.trim().is_empty() {
                    return Err(MonitorError::InvalidPayload(
                        "evaluation prompt is empty".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn sort(conditions: &mut [Condition]) {
    conditions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

fn validate_topic(topic: &TopicKey) -> MonitorResult<()> {
    if topic.subject.trim().is_empty() {
        return Err(MonitorError::InvalidPayload(format!(
            "topic {} has no subject",
            topic
        )));
    }
    Ok(())
}

fn is_numeric(unit: Unit) -> bool {
    matches!(unit, Unit::Absolute | Unit::Percent)
}

fn validate_alert(alert: &AlertPredicate) -> MonitorResult<()> {
    let topic = &alert.topic;
    validate_topic(topic)?;

    match &alert.comparison {
        Comparison::Above(threshold)
        | Comparison::AtOrAbove(threshold)
        | Comparison::Below(threshold)
        | Comparison::AtOrBelow(threshold) => {
            if !threshold.is_finite() {
                return Err(MonitorError::InvalidPayload("threshold is not finite".into()));
            }
            if threshold.unit() != topic.unit() {
                return Err(MonitorError::UnitMismatch {
                    topic: topic.clone(),
                    expected: topic.unit(),
                    found: threshold.unit(),
                });
            }
        }
        Comparison::Contains(needle) => {
            if needle.trim().is_empty() {
                return Err(MonitorError::InvalidPayload("membership needle is empty".into()));
            }
            if is_numeric(topic.unit()) {
                return Err(MonitorError::InvalidPayload(format!(
                    "membership comparison on numeric topic {}",
                    topic
                )));
            }
        }
        Comparison::ChangeExceeds(percent) => {
            if !percent.is_finite() || *percent <= 0.0 {
                return Err(MonitorError::InvalidPayload(
                    "change threshold must be a positive percentage".into(),
                ));
            }
            if !is_numeric(topic.unit()) {
                return Err(MonitorError::InvalidPayload(format!(
                    "change comparison on non-numeric topic {}",
                    topic
                )));
            }
        }
    }
    Ok(())
}

fn operand_unit(operand: &Operand) -> MonitorResult<Unit> {
    match operand {
        Operand::Topic(topic) => {
            validate_topic(topic)?;
            if !is_numeric(topic.unit()) {
                return Err(MonitorError::InvalidPayload(format!(
                    "comparison on non-numeric topic {}",
                    topic
                )));
            }
            Ok(topic.unit())
        }
        Operand::Constant(quantity) => {
            if !quantity.is_finite() {
                return Err(MonitorError::InvalidPayload("constant is not finite".into()));
            }
            Ok(quantity.unit())
        }
    }
}

fn validate_expr(expr: &SignalExpr, depth: usize) -> MonitorResult<()> {
    if depth > MAX_SIGNAL_DEPTH {
        return Err(MonitorError::InvalidPayload("signal is nested too deeply".into()));
    }

    match expr {
        SignalExpr::All(children) | SignalExpr::Any(children) => {
            if children.is_empty() {
                return Err(MonitorError::InvalidPayload("empty boolean group".into()));
            }
            children
                .iter()
                .try_for_each(|child| validate_expr(child, depth + 1))
        }
        SignalExpr::Not(inner) => validate_expr(inner, depth + 1),
        SignalExpr::Compare { left, right, .. } => {
            let (left_unit, right_unit) = (operand_unit(left)?, operand_unit(right)?);
            let topic = [left, right].into_iter().find_map(|operand| match operand {
                Operand::Topic(topic) => Some(topic),
                Operand::Constant(_) => None,
            });
            let Some(topic) = topic else {
                return Err(MonitorError::InvalidPayload(
                    "comparison between two constants".into(),
                ));
            };
            if left_unit != right_unit {
                let found = if left_unit == topic.unit() {
                    right_unit
                } else {
                    left_unit
                };
                return Err(MonitorError::UnitMismatch {
                    topic: topic.clone(),
                    expected: topic.unit(),
                    found,
                });
            }
            Ok(())
        }
        SignalExpr::Holds(alert) => validate_alert(alert),
    }
}

/// Default human label for a payload.
pub fn describe(payload: &ConditionPayload) -> String {
    match payload {
        ConditionPayload::Alert(alert) => describe_alert(alert),
        ConditionPayload::Signal(expr) => describe_expr(expr),
        ConditionPayload::LlmEvaluated(spec) => spec.prompt.trim().to_string(),
    }
}

fn describe_alert(alert: &AlertPredicate) -> String {
    match &alert.comparison {
        Comparison::Above(q) => format!("{} > {}", alert.topic, q),
        Comparison::AtOrAbove(q) => format!("{} >= {}", alert.topic, q),
        Comparison::Below(q) => format!("{} < {}", alert.topic, q),
        Comparison::AtOrBelow(q) => format!("{} <= {}", alert.topic, q),
        Comparison::Contains(needle) => format!("{} contains \"{}\"", alert.topic, needle),
        Comparison::ChangeExceeds(p) => format!("{} moves {}%", alert.topic, p),
    }
}

fn describe_operand(operand: &Operand) -> String {
    match operand {
        Operand::Topic(topic) => topic.to_string(),
        Operand::Constant(q) => q.to_string(),
    }
}

fn describe_expr(expr: &SignalExpr) -> String {
    let join = |children: &[SignalExpr], sep: &str| {
        children
            .iter()
            .map(describe_expr)
            .collect::<Vec<_>>()
            .join(sep)
    };
    match expr {
        SignalExpr::All(children) => format!("({})", join(children, " and ")),
        SignalExpr::Any(children) => format!("({})", join(children, " or ")),
        SignalExpr::Not(inner) => format!("not {}", describe_expr(inner)),
        SignalExpr::Compare { left, op, right } => format!(
            "{} {} {}",
            describe_operand(left),
            op,
            describe_operand(right)
        ),
        SignalExpr::Holds(alert) => describe_alert(alert),
    }
}
