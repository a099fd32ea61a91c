//! Sampled values and unit-carrying quantities.
//!
//! Percentages are always held in percentage units. Exchanges usually report
//! funding as a decimal fraction (`-0.0012`); that must go through
//! [`Quantity::from_fraction`] so it compares as `-0.12` against a
//! `-0.1 %` threshold.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::topic::Unit;

/// A number tagged with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum Quantity {
    /// Plain number.
    Absolute(f64),
    /// Percentage units (`1.5` = 1.5 %).
    Percent(f64),
}

impl Quantity {
    /// Build a percentage from a decimal fraction (`0.015` -> `1.5 %`).
    pub fn from_fraction(fraction: f64) -> Self {
        Quantity::Percent(fraction * 100.0)
    }

    pub fn unit(&self) -> Unit {
        match self {
            Quantity::Absolute(_) => Unit::Absolute,
            Quantity::Percent(_) => Unit::Percent,
        }
    }

    /// Raw magnitude in the quantity's own unit.
    pub fn value(&self) -> f64 {
        match self {
            Quantity::Absolute(v) | Quantity::Percent(v) => *v,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.value().is_finite()
    }

    /// Whether two quantities share a unit and can be compared.
    pub fn same_unit(&self, other: &Quantity) -> bool {
        self.unit() == other.unit()
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Absolute(v) => write!(f, "{}", v),
            Quantity::Percent(v) => write!(f, "{}%", v),
        }
    }
}

/// Last observed payload of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleValue {
    /// Numeric sample.
    Quantity(Quantity),
    /// Ordered ranking (e.g. top movers).
    Ranking(Vec<String>),
    /// Headline texts from a keyword feed.
    Headlines(Vec<String>),
}

impl SampleValue {
    pub fn absolute(value: f64) -> Self {
        SampleValue::Quantity(Quantity::Absolute(value))
    }

    pub fn percent(value: f64) -> Self {
        SampleValue::Quantity(Quantity::Percent(value))
    }

    pub fn unit(&self) -> Unit {
        match self {
            SampleValue::Quantity(q) => q.unit(),
            SampleValue::Ranking(_) => Unit::Set,
            SampleValue::Headlines(_) => Unit::Headlines,
        }
    }

    pub fn as_quantity(&self) -> Option<Quantity> {
        match self {
            SampleValue::Quantity(q) => Some(*q),
            _ => None,
        }
    }

    /// Numeric magnitude, for history tracking and anomaly detection.
    pub fn numeric(&self) -> Option<f64> {
        self.as_quantity().map(|q| q.value())
    }

    /// Members of a ranking or headline sample.
    pub fn members(&self) -> &[String] {
        match self {
            SampleValue::Ranking(items) | SampleValue::Headlines(items) => items,
            SampleValue::Quantity(_) => &[],
        }
    }
}
