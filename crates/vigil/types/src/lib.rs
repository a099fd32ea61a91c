//! Vigil Types - Core types for the market surveillance core
//!
//! Vigil watches external market data on behalf of many independent users
//! and decides when a user's condition is worth telling them about.
//!
//! ## Key Concepts
//!
//! - **Topic**: a named data facet (`price/BTC`, `funding/ETH`, `news/all`)
//! - **Stream**: a topic watched for one user, with a freshness tier
//! - **Condition**: a rule over streams, in one of three evaluation tiers
//! - **Occurrence**: one satisfaction episode of a condition
//! - **Notification**: what a user receives for an occurrence
//! - **Events**: unified observability stream

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod condition;
pub mod error;
pub mod events;
pub mod ids;
pub mod notification;
pub mod stream;
pub mod topic;
pub mod value;

// Re-export main types
pub use condition::{
    AlertPredicate, CompareOp, Comparison, Condition, ConditionOrigin, ConditionPayload,
    ConditionState, ConditionTier, DataCategory, JudgmentSpec, Occurrence, Operand, SignalExpr,
};
pub use error::TypesError;
pub use events::{EscalationOutcome, EscalationRecord, MonitorEvent};
pub use ids::{ConditionId, UserId};
pub use notification::{Notification, NotificationDetail};
pub use stream::{Sample, Stream, Temperature};
pub use topic::{StreamKey, TopicKey, TopicKind, Unit};
pub use value::{Quantity, SampleValue};
