//! Topics and stream keys.
//!
//! A topic is one named data facet (a symbol's price, a funding rate, a
//! ranking, a keyword feed). A stream is a topic watched for one user.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TypesError;
use crate::ids::UserId;

/// Kind of data facet a topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    /// Last traded price.
    Price,
    /// Price change over the exchange's rolling window, in percent.
    PriceChange,
    /// Perpetual funding rate, in percent.
    Funding,
    /// Open interest change, in percent.
    OpenInterestChange,
    /// Traded volume (or volume ratio against its average).
    Volume,
    /// Cross-venue premium (e.g. kimchi premium), in percent.
    Premium,
    /// Market indicator such as fear & greed.
    Indicator,
    /// Ordered ranking of symbols.
    Ranking,
    /// Keyword/news headline feed.
    News,
}

/// Native unit of a topic's samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    /// Plain number (price, volume, index value).
    Absolute,
    /// Percentage units: `-0.12` means -0.12 %.
    Percent,
    /// Ordered set of members.
    Set,
    /// Headline texts.
    Headlines,
}

impl TopicKind {
    /// All kinds, in declaration order.
    pub const ALL: [TopicKind; 9] = [
        TopicKind::Price,
        TopicKind::PriceChange,
        TopicKind::Funding,
        TopicKind::OpenInterestChange,
        TopicKind::Volume,
        TopicKind::Premium,
        TopicKind::Indicator,
        TopicKind::Ranking,
        TopicKind::News,
    ];

    /// Unit every sample of this kind is expressed in.
    pub fn unit(&self) -> Unit {
        match self {
            TopicKind::Price | TopicKind::Volume | TopicKind::Indicator => Unit::Absolute,
            TopicKind::PriceChange
            | TopicKind::Funding
            | TopicKind::OpenInterestChange
            | TopicKind::Premium => Unit::Percent,
            TopicKind::Ranking => Unit::Set,
            TopicKind::News => Unit::Headlines,
        }
    }

    /// Short name used in topic strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Price => "price",
            TopicKind::PriceChange => "change",
            TopicKind::Funding => "funding",
            TopicKind::OpenInterestChange => "oi",
            TopicKind::Volume => "volume",
            TopicKind::Premium => "premium",
            TopicKind::Indicator => "indicator",
            TopicKind::Ranking => "ranking",
            TopicKind::News => "news",
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopicKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TypesError::UnknownTopicKind(s.to_string()))
    }
}

/// Key of a topic: `kind/subject`, e.g. `funding/BTC` or `news/all`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicKey {
    pub kind: TopicKind,
    pub subject: String,
}

impl TopicKey {
    pub fn new(kind: TopicKind, subject: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
        }
    }

    pub fn price(symbol: impl Into<String>) -> Self {
        Self::new(TopicKind::Price, symbol)
    }

    pub fn funding(symbol: impl Into<String>) -> Self {
        Self::new(TopicKind::Funding, symbol)
    }

    pub fn news() -> Self {
        Self::new(TopicKind::News, "all")
    }

    pub fn unit(&self) -> Unit {
        self.kind.unit()
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subject)
    }
}

impl FromStr for TopicKey {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, subject) = s
            .split_once('/')
            .ok_or_else(|| TypesError::InvalidTopic(s.to_string()))?;
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(TypesError::InvalidTopic(s.to_string()));
        }
        Ok(Self::new(kind.trim().parse()?, subject))
    }
}

/// A (user, topic) pair under watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub user: UserId,
    pub topic: TopicKey,
}

impl StreamKey {
    pub fn new(user: UserId, topic: TopicKey) -> Self {
        Self { user, topic }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.user, self.topic)
    }
}
