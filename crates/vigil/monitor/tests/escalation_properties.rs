//! End-to-end escalation behavior through the engine.

use std::sync::Arc;
use std::time::Duration;

use vigil_monitor::testing::{fakes, Fakes};
use vigil_monitor::{ManualClock, MonitorConfig, MonitorEngine, MonitorError};
use vigil_types::{
    AlertPredicate, CompareOp, Comparison, Condition, ConditionOrigin, ConditionPayload,
    ConditionState, EscalationOutcome, Operand, Quantity, SampleValue, SignalExpr, TopicKey,
    TopicKind, UserId,
};

fn engine_with(config: MonitorConfig) -> (Arc<MonitorEngine>, Fakes) {
    let fakes = fakes();
    let engine = MonitorEngine::with_clock(
        config,
        fakes.collaborators(),
        Arc::new(ManualClock::fixed()),
    );
    (Arc::new(engine), fakes)
}

fn engine() -> (Arc<MonitorEngine>, Fakes) {
    engine_with(MonitorConfig::default())
}

fn user() -> UserId {
    UserId::new("trader")
}

fn alert(engine: &MonitorEngine, topic: TopicKey, comparison: Comparison) -> Condition {
    engine
        .create_condition(
            &user(),
            ConditionPayload::Alert(AlertPredicate::new(topic, comparison)),
            ConditionOrigin::UserRequest,
            None,
        )
        .unwrap()
}

fn signal(engine: &MonitorEngine, expr: SignalExpr) -> Condition {
    engine
        .create_condition(
            &user(),
            ConditionPayload::Signal(expr),
            ConditionOrigin::UserRequest,
            None,
        )
        .unwrap()
}

async fn ingest(engine: &MonitorEngine, topic: &TopicKey, value: SampleValue) -> Vec<EscalationOutcome> {
    engine
        .ingest(&user(), topic, value)
        .unwrap()
        .settle()
        .await
}

#[tokio::test]
async fn true_false_true_notifies_exactly_twice() {
    let (engine, fakes) = engine();
    let btc = TopicKey::price("BTC");
    let condition = alert(&engine, btc.clone(), Comparison::AtOrAbove(Quantity::Absolute(100_000.0)));

    let values = [99_000.0, 100_500.0, 101_000.0, 98_000.0, 100_000.0, 100_200.0];
    for value in values {
        ingest(&engine, &btc, SampleValue::absolute(value)).await;
    }

    assert_eq!(fakes.notifier.count(), 2);
    let condition = engine.condition(&condition.id).unwrap();
    assert_eq!(condition.state, ConditionState::Fired);
    assert_eq!(condition.episode, 1);
    assert_eq!(condition.fire_count, 2);

    let episodes: Vec<u64> = fakes
        .notifier
        .sent()
        .iter()
        .map(|n| n.occurrence.episode)
        .collect();
    assert_eq!(episodes, vec![0, 1]);
}

#[tokio::test]
async fn funding_threshold_compares_in_percentage_units() {
    let (engine, fakes) = engine();
    let funding = TopicKey::funding("BTC");
    alert(&engine, funding.clone(), Comparison::Below(Quantity::Percent(-0.1)));

    // A raw exchange fraction is not a percentage sample.
    let err = engine
        .ingest(&user(), &funding, SampleValue::absolute(-0.0012))
        .unwrap_err();
    assert!(matches!(err, MonitorError::UnitMismatch { .. }));
    assert_eq!(fakes.notifier.count(), 0);

    // -0.0012 as a fraction is -0.12 %, which is below -0.1 %.
    let outcomes = ingest(
        &engine,
        &funding,
        SampleValue::Quantity(Quantity::from_fraction(-0.0012)),
    )
    .await;
    assert_eq!(outcomes, vec![EscalationOutcome::Notified]);

    // A threshold written as a fraction is rejected up front.
    let rejected = engine.create_condition(
        &user(),
        ConditionPayload::Alert(AlertPredicate::new(
            funding,
            Comparison::Below(Quantity::Absolute(-0.001)),
        )),
        ConditionOrigin::UserRequest,
        None,
    );
    assert!(matches!(rejected, Err(MonitorError::UnitMismatch { .. })));
}

#[tokio::test]
async fn budget_of_five_suppresses_the_rest() {
    let (engine, fakes) = engine();
    let funding = TopicKey::funding("ETH");
    let conditions: Vec<Condition> = (1..=7)
        .map(|i| {
            signal(
                &engine,
                SignalExpr::compare(
                    Operand::Topic(funding.clone()),
                    CompareOp::Lt,
                    Operand::Constant(Quantity::Percent(-0.01 * i as f64)),
                ),
            )
        })
        .collect();

    let outcomes = ingest(&engine, &funding, SampleValue::percent(-0.5)).await;
    assert_eq!(outcomes.len(), 7);

    let notified = outcomes
        .iter()
        .filter(|o| **o == EscalationOutcome::Notified)
        .count();
    let suppressed = outcomes
        .iter()
        .filter(|o| **o == EscalationOutcome::SuppressedByBudget)
        .count();
    assert_eq!(notified, 5);
    assert_eq!(suppressed, 2);
    assert_eq!(fakes.notifier.count(), 5);

    for condition in &conditions {
        assert_eq!(
            engine.condition(&condition.id).unwrap().state,
            ConditionState::Fired
        );
    }
    let status = engine.budget_status(&user());
    assert_eq!(status.count, 5);
    assert_eq!(status.remaining, 0);
}

#[tokio::test]
async fn alerts_are_not_budgeted() {
    let mut config = MonitorConfig::default();
    config.budget.daily_limit = 0;
    let (engine, fakes) = engine_with(config);
    let btc = TopicKey::price("BTC");
    alert(&engine, btc.clone(), Comparison::Above(Quantity::Absolute(1.0)));

    let outcomes = ingest(&engine, &btc, SampleValue::absolute(2.0)).await;
    assert_eq!(outcomes, vec![EscalationOutcome::Notified]);
    assert_eq!(fakes.notifier.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn overlapping_deltas_keep_one_attempt_in_flight() {
    let (engine, fakes) = engine();
    let funding = TopicKey::funding("BTC");
    let premium = TopicKey::new(TopicKind::Premium, "kimchi");
    let condition = signal(
        &engine,
        SignalExpr::All(vec![
            SignalExpr::compare(
                Operand::Topic(funding.clone()),
                CompareOp::Lt,
                Operand::Constant(Quantity::Percent(0.0)),
            ),
            SignalExpr::compare(
                Operand::Topic(premium.clone()),
                CompareOp::Gt,
                Operand::Constant(Quantity::Percent(3.0)),
            ),
        ]),
    );
    fakes.collector.stall_next(1, Duration::from_secs(10));

    ingest(&engine, &funding, SampleValue::percent(-0.05)).await;
    let first = engine
        .ingest(&user(), &premium, SampleValue::percent(4.2))
        .unwrap();
    assert_eq!(first.escalations.len(), 1);

    let second = engine
        .ingest(&user(), &funding, SampleValue::percent(-0.06))
        .unwrap();
    assert!(second.escalations.is_empty());
    assert_eq!(second.deduplicated, vec![condition.id]);
    assert_eq!(engine.coordinator().in_flight_count(), 1);

    assert_eq!(first.settle().await, vec![EscalationOutcome::Notified]);
    assert_eq!(fakes.notifier.count(), 1);
    assert_eq!(fakes.collector.calls(), 1);
    assert_eq!(engine.coordinator().in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_samples_notify_once() {
    let (engine, fakes) = engine();
    let sol = TopicKey::price("SOL");
    alert(&engine, sol.clone(), Comparison::Above(Quantity::Absolute(200.0)));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let engine = engine.clone();
            let sol = sol.clone();
            tokio::spawn(async move {
                engine
                    .ingest(&user(), &sol, SampleValue::absolute(201.0 + i as f64))
                    .unwrap()
                    .settle()
                    .await
            })
        })
        .collect();

    let mut notified = 0;
    for task in tasks {
        notified += task
            .await
            .unwrap()
            .iter()
            .filter(|o| **o == EscalationOutcome::Notified)
            .count();
    }
    assert_eq!(notified, 1);
    assert_eq!(fakes.notifier.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn collect_timeout_is_retried_on_next_cycle() {
    let (engine, fakes) = engine();
    let funding = TopicKey::funding("BTC");
    let condition = signal(
        &engine,
        SignalExpr::compare(
            Operand::Topic(funding.clone()),
            CompareOp::Lt,
            Operand::Constant(Quantity::Percent(0.0)),
        ),
    );
    fakes.collector.stall_next(1, Duration::from_secs(120));

    let outcomes = ingest(&engine, &funding, SampleValue::percent(-0.05)).await;
    assert!(matches!(
        outcomes.as_slice(),
        [EscalationOutcome::RetryableFailure { .. }]
    ));
    assert_eq!(
        engine.condition(&condition.id).unwrap().state,
        ConditionState::Active
    );
    assert_eq!(fakes.notifier.count(), 0);

    // Same value again: not a meaningful change, but the failed attempt retries.
    let retry = engine
        .ingest(&user(), &funding, SampleValue::percent(-0.05))
        .unwrap();
    assert!(!retry.meaningful);
    assert_eq!(retry.settle().await, vec![EscalationOutcome::Notified]);
    assert_eq!(fakes.collector.calls(), 2);
    assert_eq!(
        engine.condition(&condition.id).unwrap().state,
        ConditionState::Fired
    );
}

#[tokio::test]
async fn judge_failure_leaves_condition_active() {
    let (engine, fakes) = engine();
    let oi = TopicKey::new(TopicKind::OpenInterestChange, "BTC");
    let condition = signal(
        &engine,
        SignalExpr::compare(
            Operand::Topic(oi.clone()),
            CompareOp::Ge,
            Operand::Constant(Quantity::Percent(15.0)),
        ),
    );
    fakes.judge.fail_next(1);

    let outcomes = ingest(&engine, &oi, SampleValue::percent(16.0)).await;
    assert!(matches!(
        outcomes.as_slice(),
        [EscalationOutcome::RetryableFailure { .. }]
    ));
    assert_eq!(engine.budget_status(&user()).count, 0);
    assert!(engine.coordinator().is_pending_retry(&condition.id));

    let outcomes = ingest(&engine, &oi, SampleValue::percent(17.0)).await;
    assert_eq!(outcomes, vec![EscalationOutcome::Notified]);
}
