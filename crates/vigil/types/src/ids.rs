//! Strongly-typed identifiers for Vigil entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TypesError;

/// Identifier of the user a stream or condition is watched for.
///
/// Users come from the surrounding bot/API layer, so the ID is opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user:{}", self.0)
    }
}

/// Unique identifier for a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConditionId(Uuid);

impl ConditionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cond:{}", self.0)
    }
}

impl FromStr for ConditionId {
    type Err = TypesError;

    /// Accepts both the bare UUID and the `cond:` display form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("cond:").unwrap_or(s);
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| TypesError::InvalidConditionId(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_id_roundtrips_display_form() {
        let id = ConditionId::generate();
        let parsed: ConditionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let bare: ConditionId = id.as_uuid().to_string().parse().unwrap();
        assert_eq!(bare, id);
    }

    #[test]
    fn test_condition_id_rejects_garbage() {
        assert!("cond:not-a-uuid".parse::<ConditionId>().is_err());
    }
}
