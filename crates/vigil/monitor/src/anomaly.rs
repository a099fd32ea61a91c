//! Anomaly detection for patrol sampling.
//!
//! Two detectors: fixed percentage bands on change-type topics, and a
//! deviation test against the stream's recent history.

use serde::{Deserialize, Serialize};
use vigil_types::{CompareOp, Operand, Quantity, SampleValue, SignalExpr, TopicKey, TopicKind, Unit};

use crate::config::AnomalyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Price change beyond the fixed band.
    PriceSwing,
    /// Funding rate beyond the fixed band.
    FundingExtreme,
    /// Open interest change beyond the fixed band.
    OpenInterestSwing,
    /// Value outside N standard deviations of recent history.
    Deviation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// A detected anomaly on one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub topic: TopicKey,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub direction: Direction,

    /// The anomalous value.
    pub value: f64,

    /// The level that was crossed, in the topic's unit.
    pub threshold: Quantity,

    /// Stable label; identical anomalies produce identical descriptions.
    pub description: String,
}

impl Anomaly {
    /// Signal watching whether the value stays beyond the anomalous level.
    pub fn condition(&self) -> SignalExpr {
        let op = match self.direction {
            Direction::Up => CompareOp::Ge,
            Direction::Down => CompareOp::Le,
        };
        SignalExpr::compare(
            Operand::Topic(self.topic.clone()),
            op,
            Operand::Constant(self.threshold),
        )
    }
}

/// Stateless detector configured with bands and sigma.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: &AnomalyConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Check `value` against the bands for its topic kind, then against
    /// `history` (values observed before `value`, oldest first).
    pub fn detect(&self, topic: &TopicKey, value: &SampleValue, history: &[f64]) -> Option<Anomaly> {
        let quantity = value.as_quantity()?;
        if !quantity.is_finite() || quantity.unit() != topic.unit() {
            return None;
        }
        self.band(topic, quantity.value())
            .or_else(|| self.deviation(topic, quantity, history))
    }

    fn band(&self, topic: &TopicKey, value: f64) -> Option<Anomaly> {
        let (kind, band) = match topic.kind {
            TopicKind::PriceChange => (AnomalyKind::PriceSwing, self.config.price_change_band),
            TopicKind::Funding => (AnomalyKind::FundingExtreme, self.config.funding_band),
            TopicKind::OpenInterestChange => {
                (AnomalyKind::OpenInterestSwing, self.config.open_interest_band)
            }
            _ => return None,
        };
        if band <= 0.0 || value.abs() < band {
            return None;
        }

        let direction = if value >= 0.0 { Direction::Up } else { Direction::Down };
        let level = match direction {
            Direction::Up => band,
            Direction::Down => -band,
        };
        let severity = if kind == AnomalyKind::PriceSwing && value.abs() >= self.config.price_change_high {
            Severity::High
        } else {
            Severity::Medium
        };

        Some(Anomaly {
            topic: topic.clone(),
            kind,
            severity,
            direction,
            value,
            threshold: Quantity::Percent(level),
            description: format!("Anomaly: {} beyond {}%", topic, level),
        })
    }

    fn deviation(&self, topic: &TopicKey, quantity: Quantity, history: &[f64]) -> Option<Anomaly> {
        let window = history.len().min(self.config.history_window.max(1));
        let recent = &history[history.len() - window..];
        if recent.len() < self.config.min_history.max(2) {
            return None;
        }

        let n = recent.len() as f64;
        let mean = recent.iter().sum::<f64>() / n;
        let variance = recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        if !std_dev.is_finite() || std_dev <= f64::EPSILON {
            return None;
        }

        let value = quantity.value();
        let spread = self.config.sigma * std_dev;
        if (value - mean).abs() <= spread {
            return None;
        }

        let (direction, level, word) = if value > mean {
            (Direction::Up, mean + spread, "above")
        } else {
            (Direction::Down, mean - spread, "below")
        };
        let threshold = match quantity.unit() {
            Unit::Percent => Quantity::Percent(level),
            _ => Quantity::Absolute(level),
        };

        Some(Anomaly {
            topic: topic.clone(),
            kind: AnomalyKind::Deviation,
            severity: if (value - mean).abs() > 2.0 * spread {
                Severity::High
            } else {
                Severity::Medium
            },
            direction,
            value,
            threshold,
            description: format!(
                "Anomaly: {} {} {}σ of recent history",
                topic, word, self.config.sigma
            ),
        })
    }
}
