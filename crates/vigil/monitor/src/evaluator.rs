//! Trigger evaluation.
//!
//! Pure functions: given current stream readings and the conditions bound to
//! them, decide which conditions hold and which state edge that implies. No
//! I/O and no state mutation; callers apply the returned edges.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use vigil_types::{
    AlertPredicate, Comparison, Condition, ConditionId, ConditionPayload, ConditionState,
    Operand, Quantity, SampleValue, SignalExpr, TopicKey,
};

/// Current value of one topic as seen by the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: SampleValue,

    /// Value before `value`, for change-based comparisons.
    pub previous: Option<SampleValue>,

    pub observed_at: DateTime<Utc>,

    /// Whether the sample is within its cadence-expected freshness.
    pub fresh: bool,
}

impl Reading {
    /// A fresh reading with no previous value.
    pub fn fresh(value: SampleValue, observed_at: DateTime<Utc>) -> Self {
        Self {
            value,
            previous: None,
            observed_at,
            fresh: true,
        }
    }
}

/// Readings keyed by topic, for one user.
pub type Readings = HashMap<TopicKey, Reading>;

/// Why a condition could not be evaluated this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "topic", rename_all = "snake_case")]
pub enum SkipReason {
    /// No sample has been observed for a required topic.
    MissingData(TopicKey),
    /// A required topic's sample is older than its freshness window.
    StaleData(TopicKey),
    /// Sample and threshold units differ.
    UnitMismatch(TopicKey),
    /// A change comparison needs a previous sample.
    NoPrevious(TopicKey),
    /// Only the judge can evaluate this condition.
    RequiresJudgment,
}

/// Truth value of a condition's predicate for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Satisfied,
    NotSatisfied,
    Skipped(SkipReason),
}

impl Verdict {
    fn from_bool(value: bool) -> Self {
        if value {
            Verdict::Satisfied
        } else {
            Verdict::NotSatisfied
        }
    }
}

/// State edge implied by a verdict and the condition's current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Edge {
    /// Active and now satisfied: escalate.
    Rising,
    /// Fired and still satisfied: stay silent.
    Held,
    /// Fired and now false: re-arm.
    Rearm,
    /// Active and not satisfied.
    Idle,
    /// Not evaluated this cycle; state is left untouched.
    Skipped(SkipReason),
}

/// Evaluation result for one condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub condition_id: ConditionId,
    pub episode: u64,
    pub edge: Edge,
}

impl Evaluation {
    /// Only not-satisfied to satisfied transitions are actionable.
    pub fn is_newly_satisfied(&self) -> bool {
        self.edge == Edge::Rising
    }
}

/// Stateless evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    /// Evaluate `conditions` in order, producing one entry per live condition.
    pub fn evaluate(&self, conditions: &[Condition], readings: &Readings) -> Vec<Evaluation> {
        conditions
            .iter()
            .filter(|c| c.state.is_live())
            .map(|condition| Evaluation {
                condition_id: condition.id,
                episode: condition.episode,
                edge: edge_for(condition.state, self.verdict(&condition.payload, readings)),
            })
            .collect()
    }

    /// Truth value of a payload against current readings.
    pub fn verdict(&self, payload: &ConditionPayload, readings: &Readings) -> Verdict {
        let result = match payload {
            ConditionPayload::Alert(alert) => eval_alert(alert, readings),
            ConditionPayload::Signal(expr) => check_inputs(expr, readings)
                .and_then(|_| eval_expr(expr, readings)),
            ConditionPayload::LlmEvaluated(_) => Err(SkipReason::RequiresJudgment),
        };
        match result {
            Ok(value) => Verdict::from_bool(value),
            Err(reason) => Verdict::Skipped(reason),
        }
    }
}

/// Edge for a verdict given the condition's state.
pub fn edge_for(state: ConditionState, verdict: Verdict) -> Edge {
    match (state, verdict) {
        (_, Verdict::Skipped(reason)) => Edge::Skipped(reason),
        (ConditionState::Active, Verdict::Satisfied) => Edge::Rising,
        (ConditionState::Active, Verdict::NotSatisfied) => Edge::Idle,
        (ConditionState::Fired, Verdict::Satisfied) => Edge::Held,
        (ConditionState::Fired, Verdict::NotSatisfied) => Edge::Rearm,
        (_, _) => Edge::Idle,
    }
}

fn reading<'a>(topic: &TopicKey, readings: &'a Readings) -> Result<&'a Reading, SkipReason> {
    let reading = readings
        .get(topic)
        .ok_or_else(|| SkipReason::MissingData(topic.clone()))?;
    if !reading.fresh {
        return Err(SkipReason::StaleData(topic.clone()));
    }
    Ok(reading)
}

/// Every input of a signal must be present and fresh before it is evaluated.
fn check_inputs(expr: &SignalExpr, readings: &Readings) -> Result<(), SkipReason> {
    for topic in expr.topics() {
        reading(&topic, readings)?;
    }
    Ok(())
}

fn eval_alert(alert: &AlertPredicate, readings: &Readings) -> Result<bool, SkipReason> {
    let reading = reading(&alert.topic, readings)?;
    let topic = &alert.topic;

    match &alert.comparison {
        Comparison::Above(threshold)
        | Comparison::AtOrAbove(threshold)
        | Comparison::Below(threshold)
        | Comparison::AtOrBelow(threshold) => {
            let sample = comparable(topic, &reading.value, threshold)?;
            let limit = threshold.value();
            Ok(match alert.comparison {
                Comparison::Above(_) => sample > limit,
                Comparison::AtOrAbove(_) => sample >= limit,
                Comparison::Below(_) => sample < limit,
                _ => sample <= limit,
            })
        }
        Comparison::Contains(needle) => {
            let needle = needle.to_lowercase();
            match &reading.value {
                SampleValue::Ranking(members) => {
                    Ok(members.iter().any(|m| m.to_lowercase() == needle))
                }
                SampleValue::Headlines(headlines) => Ok(headlines
                    .iter()
                    .any(|h| h.to_lowercase().contains(&needle))),
                SampleValue::Quantity(_) => Err(SkipReason::UnitMismatch(topic.clone())),
            }
        }
        Comparison::ChangeExceeds(percent) => {
            let current = reading
                .value
                .as_quantity()
                .ok_or_else(|| SkipReason::UnitMismatch(topic.clone()))?;
            let previous = reading
                .previous
                .as_ref()
                .and_then(|p| p.as_quantity())
                .ok_or_else(|| SkipReason::NoPrevious(topic.clone()))?;
            if !current.same_unit(&previous) {
                return Err(SkipReason::UnitMismatch(topic.clone()));
            }
            let change = match current {
                // Percent series change in percentage points.
                Quantity::Percent(cur) => cur - previous.value(),
                Quantity::Absolute(cur) => {
                    if previous.value() == 0.0 {
                        return Err(SkipReason::NoPrevious(topic.clone()));
                    }
                    (cur - previous.value()) / previous.value().abs() * 100.0
                }
            };
            Ok(change.abs() >= *percent)
        }
    }
}

/// Numeric sample value, provided it is in the threshold's unit.
fn comparable(topic: &TopicKey, value: &SampleValue, threshold: &Quantity) -> Result<f64, SkipReason> {
    match value.as_quantity() {
        Some(sample) if sample.same_unit(threshold) => Ok(sample.value()),
        _ => Err(SkipReason::UnitMismatch(topic.clone())),
    }
}

fn operand_value(operand: &Operand, readings: &Readings) -> Result<Quantity, SkipReason> {
    match operand {
        Operand::Constant(quantity) => Ok(*quantity),
        Operand::Topic(topic) => reading(topic, readings)?
            .value
            .as_quantity()
            .ok_or_else(|| SkipReason::UnitMismatch(topic.clone())),
    }
}

fn operand_topic(left: &Operand, right: &Operand) -> Option<TopicKey> {
    [left, right].into_iter().find_map(|operand| match operand {
        Operand::Topic(topic) => Some(topic.clone()),
        Operand::Constant(_) => None,
    })
}

fn eval_expr(expr: &SignalExpr, readings: &Readings) -> Result<bool, SkipReason> {
    match expr {
        SignalExpr::All(children) => {
            for child in children {
                if !eval_expr(child, readings)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        SignalExpr::Any(children) => {
            for child in children {
                if eval_expr(child, readings)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        SignalExpr::Not(inner) => Ok(!eval_expr(inner, readings)?),
        SignalExpr::Compare { left, op, right } => {
            let l = operand_value(left, readings)?;
            let r = operand_value(right, readings)?;
            if !l.same_unit(&r) {
                let topic = operand_topic(left, right);
                return Err(match topic {
                    Some(topic) => SkipReason::UnitMismatch(topic),
                    None => SkipReason::RequiresJudgment,
                });
            }
            Ok(op.apply(l.value(), r.value()))
        }
        SignalExpr::Holds(alert) => eval_alert(alert, readings),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::{
        CompareOp, ConditionOrigin, JudgmentSpec, TopicKind, UserId,
    };

    fn readings(entries: Vec<(TopicKey, SampleValue)>) -> Readings {
        entries
            .into_iter()
            .map(|(topic, value)| (topic, Reading::fresh(value, Utc::now())))
            .collect()
    }

    fn alert(topic: TopicKey, comparison: Comparison) -> ConditionPayload {
        ConditionPayload::Alert(AlertPredicate::new(topic, comparison))
    }

    #[test]
    fn test_funding_compared_in_percentage_units() {
        let payload = alert(
            TopicKey::funding("BTC"),
            Comparison::Below(Quantity::Percent(-0.1)),
        );

        let correct = readings(vec![(
            TopicKey::funding("BTC"),
            SampleValue::Quantity(Quantity::from_fraction(-0.0012)),
        )]);
        assert_eq!(TriggerEvaluator.verdict(&payload, &correct), Verdict::Satisfied);

        // A raw fraction tagged as absolute is never compared against a percent.
        let raw = readings(vec![(TopicKey::funding("BTC"), SampleValue::absolute(-0.0012))]);
        assert!(matches!(
            TriggerEvaluator.verdict(&payload, &raw),
            Verdict::Skipped(SkipReason::UnitMismatch(_))
        ));
    }

    #[test]
    fn test_comparison_operators() {
        let topic = TopicKey::price("BTC");
        let r = readings(vec![(topic.clone(), SampleValue::absolute(100.0))]);
        let check = |c: Comparison| TriggerEvaluator.verdict(&alert(topic.clone(), c), &r);

        assert_eq!(check(Comparison::Above(Quantity::Absolute(100.0))), Verdict::NotSatisfied);
        assert_eq!(check(Comparison::AtOrAbove(Quantity::Absolute(100.0))), Verdict::Satisfied);
        assert_eq!(check(Comparison::Below(Quantity::Absolute(100.0))), Verdict::NotSatisfied);
        assert_eq!(check(Comparison::AtOrBelow(Quantity::Absolute(100.0))), Verdict::Satisfied);
    }

    #[test]
    fn test_set_membership_and_keywords() {
        let ranking = TopicKey::new(TopicKind::Ranking, "top_gainers");
        let news = TopicKey::news();
        let r = readings(vec![
            (ranking.clone(), SampleValue::Ranking(vec!["SOL".into(), "PEPE".into()])),
            (news.clone(), SampleValue::Headlines(vec!["SEC approves spot ETF".into()])),
        ]);

        let member = alert(ranking, Comparison::Contains("pepe".into()));
        assert_eq!(TriggerEvaluator.verdict(&member, &r), Verdict::Satisfied);

        let keyword = alert(news, Comparison::Contains("etf".into()));
        assert_eq!(TriggerEvaluator.verdict(&keyword, &r), Verdict::Satisfied);
    }

    #[test]
    fn test_change_exceeds() {
        let topic = TopicKey::price("ETH");
        let mut r = Readings::new();
        r.insert(
            topic.clone(),
            Reading {
                value: SampleValue::absolute(110.0),
                previous: Some(SampleValue::absolute(100.0)),
                observed_at: Utc::now(),
                fresh: true,
            },
        );
        assert_eq!(
            TriggerEvaluator.verdict(&alert(topic.clone(), Comparison::ChangeExceeds(10.0)), &r),
            Verdict::Satisfied
        );
        assert_eq!(
            TriggerEvaluator.verdict(&alert(topic.clone(), Comparison::ChangeExceeds(10.5)), &r),
            Verdict::NotSatisfied
        );

        r.get_mut(&topic).unwrap().previous = None;
        assert!(matches!(
            TriggerEvaluator.verdict(&alert(topic, Comparison::ChangeExceeds(1.0)), &r),
            Verdict::Skipped(SkipReason::NoPrevious(_))
        ));
    }

    #[test]
    fn test_signal_skipped_when_input_stale() {
        let sol = TopicKey::new(TopicKind::Volume, "SOL");
        let funding = TopicKey::funding("SOL");
        let expr = SignalExpr::All(vec![
            SignalExpr::compare(
                Operand::Topic(sol.clone()),
                CompareOp::Gt,
                Operand::Constant(Quantity::Absolute(1_000.0)),
            ),
            SignalExpr::compare(
                Operand::Topic(funding.clone()),
                CompareOp::Lt,
                Operand::Constant(Quantity::Percent(0.0)),
            ),
        ]);
        let payload = ConditionPayload::Signal(expr);

        let mut r = readings(vec![
            (sol.clone(), SampleValue::absolute(5_000.0)),
            (funding.clone(), SampleValue::percent(-0.02)),
        ]);
        assert_eq!(TriggerEvaluator.verdict(&payload, &r), Verdict::Satisfied);

        r.get_mut(&funding).unwrap().fresh = false;
        assert_eq!(
            TriggerEvaluator.verdict(&payload, &r),
            Verdict::Skipped(SkipReason::StaleData(funding.clone()))
        );

        r.remove(&funding);
        assert_eq!(
            TriggerEvaluator.verdict(&payload, &r),
            Verdict::Skipped(SkipReason::MissingData(funding))
        );
    }

    #[test]
    fn test_edges_follow_state() {
        let now = Utc::now();
        let topic = TopicKey::price("BTC");
        let mut condition = Condition::new(
            UserId::new("u1"),
            alert(topic.clone(), Comparison::Above(Quantity::Absolute(50.0))),
            ConditionOrigin::UserRequest,
            "btc above 50",
            now,
        );
        let high = readings(vec![(topic.clone(), SampleValue::absolute(60.0))]);
        let low = readings(vec![(topic, SampleValue::absolute(40.0))]);

        let eval = TriggerEvaluator.evaluate(std::slice::from_ref(&condition), &high);
        assert!(eval[0].is_newly_satisfied());
        assert_eq!(TriggerEvaluator.evaluate(std::slice::from_ref(&condition), &low)[0].edge, Edge::Idle);

        condition.state = ConditionState::Fired;
        assert_eq!(TriggerEvaluator.evaluate(std::slice::from_ref(&condition), &high)[0].edge, Edge::Held);
        assert_eq!(TriggerEvaluator.evaluate(std::slice::from_ref(&condition), &low)[0].edge, Edge::Rearm);

        condition.state = ConditionState::Deleted;
        assert!(TriggerEvaluator.evaluate(&[condition], &high).is_empty());
    }

    #[test]
    fn test_llm_condition_requires_judgment() {
        let payload = ConditionPayload::LlmEvaluated(JudgmentSpec {
            prompt: "does the news look like capitulation?".into(),
            data_needed: vec![],
        });
        assert_eq!(
            TriggerEvaluator.verdict(&payload, &Readings::new()),
            Verdict::Skipped(SkipReason::RequiresJudgment)
        );
    }
}
