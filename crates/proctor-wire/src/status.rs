use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::WireError;

/// Identifier of an entity tracked on the shared status channel. The
/// backend emits numeric ids in some payloads and strings in others, so
/// both decode into the same textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        Self(raw.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => EntityId(text),
            Repr::Signed(value) => EntityId(value.to_string()),
            Repr::Unsigned(value) => EntityId(value.to_string()),
        })
    }
}

/// Lifecycle label for a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Upcoming,
    Ongoing,
    Finished,
}

impl EventStatus {
    pub fn from_code(code: i64) -> Result<Self, WireError> {
        match code {
            0 => Ok(EventStatus::Upcoming),
            1 => Ok(EventStatus::Ongoing),
            2 => Ok(EventStatus::Finished),
            other => Err(WireError::UnknownStatusCode(other)),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            EventStatus::Upcoming => 0,
            EventStatus::Ongoing => 1,
            EventStatus::Finished => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EventStatus::Upcoming => "upcoming",
            EventStatus::Ongoing => "ongoing",
            EventStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub entity_id: EntityId,
    pub status: EventStatus,
}

impl StatusUpdate {
    pub fn new(entity_id: EntityId, status: EventStatus) -> Self {
        Self { entity_id, status }
    }

    pub fn from_code(entity_id: EntityId, code: i64) -> Result<Self, WireError> {
        Ok(Self {
            entity_id,
            status: EventStatus::from_code(code)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_the_three_lifecycle_codes() {
        assert_eq!(EventStatus::from_code(0), Ok(EventStatus::Upcoming));
        assert_eq!(EventStatus::from_code(1), Ok(EventStatus::Ongoing));
        assert_eq!(EventStatus::from_code(2), Ok(EventStatus::Finished));
        assert_eq!(
            EventStatus::from_code(3),
            Err(WireError::UnknownStatusCode(3))
        );
        assert_eq!(EventStatus::Finished.code(), 2);
    }

    #[test]
    fn entity_ids_from_numbers_and_strings_compare_equal() {
        let numeric: EntityId = serde_json::from_str("42").unwrap();
        let text: EntityId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(numeric, text);
        assert_eq!(numeric, EntityId::from(42u64));
    }
}
