use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    domain::{ClientEvent, Condition, Phase, PhaseState},
    error::ProtocolError,
};

pub const STATE_CHANGE_TYPE: &str = "state_change";
pub const ERROR_TYPE: &str = "error";

/// Descriptive block some server revisions attach to a state change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub allowed_next: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The `phase` field: a full record in current revisions, a bare phase
/// type name in the oldest one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseRef {
    Record(Phase),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<StateInfo>,
    #[serde(
        default,
        alias = "nextTransition",
        deserialize_with = "timestamp::deserialize_optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_transition_at: Option<DateTime<Utc>>,
}

impl StateChange {
    /// Human-readable message: the top-level one, else the one in `info`.
    pub fn display_message(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or_else(|| self.info.as_ref().and_then(|info| info.message.as_deref()))
            .filter(|message| !message.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    StateChange(Box<StateChange>),
    Error(ServerError),
}

impl InboundMessage {
    /// Parses one text frame. A missing `type` means a state change, which
    /// is how the oldest server revision and the snapshot endpoint send it.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(ProtocolError::InvalidJson)?;
        let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;

        let kind = match object.get("type") {
            None | Some(Value::Null) => None,
            Some(Value::String(kind)) => Some(kind.as_str()),
            Some(other) => return Err(ProtocolError::UnknownType(other.to_string())),
        };

        match kind {
            None | Some(STATE_CHANGE_TYPE) => {
                if object.get("state").map_or(true, Value::is_null) {
                    return Err(ProtocolError::MissingField("state"));
                }
                let change = serde_json::from_value::<StateChange>(value).map_err(|source| {
                    ProtocolError::InvalidField {
                        kind: STATE_CHANGE_TYPE,
                        source,
                    }
                })?;
                Ok(InboundMessage::StateChange(Box::new(change)))
            }
            Some(ERROR_TYPE) => {
                if object.get("error").map_or(true, Value::is_null) {
                    return Err(ProtocolError::MissingField("error"));
                }
                let error = serde_json::from_value::<ServerError>(value).map_err(|source| {
                    ProtocolError::InvalidField {
                        kind: ERROR_TYPE,
                        source,
                    }
                })?;
                Ok(InboundMessage::Error(error))
            }
            Some(other) => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Client-to-server frame on the persistent channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub event: ClientEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterIncrement {
    pub increment: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEvaluation {
    pub current_value: i64,
    pub is_satisfied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_value: Option<i64>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Millis(i64),
        Text(String),
    }

    /// RFC 3339 text or epoch milliseconds. Empty strings and non-positive
    /// instants (Go's zero time) mean "no transition scheduled".
    pub fn deserialize_optional<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let parsed = match Option::<RawTimestamp>::deserialize(deserializer)? {
            None => return Ok(None),
            Some(RawTimestamp::Text(text)) if text.trim().is_empty() => return Ok(None),
            Some(RawTimestamp::Text(text)) => DateTime::parse_from_rfc3339(text.trim())
                .map(|instant| instant.with_timezone(&Utc))
                .map_err(D::Error::custom)?,
            Some(RawTimestamp::Millis(millis)) => Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| D::Error::custom(format!("timestamp {millis} out of range")))?,
        };
        Ok((parsed.timestamp() > 0).then_some(parsed))
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
