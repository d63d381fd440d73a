use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(PhaseId);
id_newtype!(ConditionId);
id_newtype!(PartId);

impl PhaseId {
    /// Parent id carried by phases that sit at the top of the tree.
    pub const ROOT: PhaseId = PhaseId(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

/// Server-reported progression state. The client mirrors whatever the
/// server sends, so unrecognised names are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum PhaseState {
    #[default]
    Ready,
    Active,
    Next,
    Finish,
    Other(String),
}

impl PhaseState {
    pub fn as_str(&self) -> &str {
        match self {
            PhaseState::Ready => "ready",
            PhaseState::Active => "active",
            PhaseState::Next => "next",
            PhaseState::Finish => "finish",
            PhaseState::Other(name) => name,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseState::Finish)
    }

    /// Events whose buttons are enabled while in this state.
    pub fn enabled_events(&self) -> &'static [ClientEvent] {
        match self {
            PhaseState::Ready => &[ClientEvent::Activate],
            PhaseState::Active => &[ClientEvent::Next],
            PhaseState::Next => &[ClientEvent::Finish],
            PhaseState::Finish | PhaseState::Other(_) => &[],
        }
    }

    /// Diagram edges leaving this state.
    pub fn highlighted_transitions(&self) -> &'static [ClientEvent] {
        match self {
            PhaseState::Ready => &[ClientEvent::Activate],
            PhaseState::Active => &[ClientEvent::Next],
            PhaseState::Next => &[ClientEvent::Activate, ClientEvent::Finish],
            PhaseState::Finish => &[ClientEvent::Reset],
            PhaseState::Other(_) => &[],
        }
    }
}

impl From<&str> for PhaseState {
    fn from(value: &str) -> Self {
        match value {
            "ready" => PhaseState::Ready,
            "active" => PhaseState::Active,
            "next" => PhaseState::Next,
            "finish" => PhaseState::Finish,
            other => PhaseState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PhaseState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PhaseState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(PhaseState::from(raw.as_str()))
    }
}

/// Legacy events sent over the persistent socket as `{"event": "<name>"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEvent {
    Activate,
    Next,
    Finish,
    Reset,
}

impl ClientEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientEvent::Activate => "activate",
            ClientEvent::Next => "next",
            ClientEvent::Finish => "finish",
            ClientEvent::Reset => "reset",
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions accepted by the auto-transition control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Stop,
    Reset,
    Activate,
    Next,
    Finish,
}

impl ControlAction {
    pub const ALL: [ControlAction; 6] = [
        ControlAction::Start,
        ControlAction::Stop,
        ControlAction::Reset,
        ControlAction::Activate,
        ControlAction::Next,
        ControlAction::Finish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::Reset => "reset",
            ControlAction::Activate => "activate",
            ControlAction::Next => "next",
            ControlAction::Finish => "finish",
        }
    }

    /// Auto-transition flag implied by a successful call, if the action
    /// says anything about it.
    pub fn auto_transition_running(self) -> Option<bool> {
        match self {
            ControlAction::Start => Some(true),
            ControlAction::Stop | ControlAction::Reset => Some(false),
            ControlAction::Activate | ControlAction::Next | ControlAction::Finish => None,
        }
    }
}

impl std::str::FromStr for ControlAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlAction::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown control action '{s}'"))
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer code or symbolic name, as different server revisions emit.
#[derive(Deserialize)]
#[serde(untagged)]
enum CodeOrName {
    Code(i64),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConditionKind {
    #[default]
    Unspecified,
    Time,
    Counter,
    Other(i64),
}

impl ConditionKind {
    pub fn code(self) -> i64 {
        match self {
            ConditionKind::Unspecified => 0,
            ConditionKind::Time => 1,
            ConditionKind::Counter => 2,
            ConditionKind::Other(code) => code,
        }
    }

    fn from_code(code: i64) -> Self {
        match code {
            0 => ConditionKind::Unspecified,
            1 => ConditionKind::Time,
            2 => ConditionKind::Counter,
            other => ConditionKind::Other(other),
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "unspecified" => Some(ConditionKind::Unspecified),
            "time" => Some(ConditionKind::Time),
            "counter" => Some(ConditionKind::Counter),
            _ => None,
        }
    }
}

impl Serialize for ConditionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for ConditionKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match CodeOrName::deserialize(deserializer)? {
            CodeOrName::Code(code) => Ok(ConditionKind::from_code(code)),
            CodeOrName::Name(name) => ConditionKind::from_name(&name).ok_or_else(|| {
                serde::de::Error::custom(format!("unknown condition kind '{name}'"))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ComparisonOperator {
    #[default]
    Unspecified,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    In,
    NotIn,
    Other(i64),
}

impl ComparisonOperator {
    const NAMED: [(ComparisonOperator, i64, &'static str); 10] = [
        (ComparisonOperator::Unspecified, 0, "unspecified"),
        (ComparisonOperator::Eq, 1, "eq"),
        (ComparisonOperator::Neq, 2, "neq"),
        (ComparisonOperator::Gt, 3, "gt"),
        (ComparisonOperator::Gte, 4, "gte"),
        (ComparisonOperator::Lt, 5, "lt"),
        (ComparisonOperator::Lte, 6, "lte"),
        (ComparisonOperator::Between, 7, "between"),
        (ComparisonOperator::In, 8, "in"),
        (ComparisonOperator::NotIn, 9, "not_in"),
    ];

    pub fn code(self) -> i64 {
        if let ComparisonOperator::Other(code) = self {
            return code;
        }
        Self::NAMED
            .iter()
            .find(|(op, _, _)| *op == self)
            .map(|(_, code, _)| *code)
            .unwrap_or_default()
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "==",
            ComparisonOperator::Neq => "!=",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Gte => ">=",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Lte => "<=",
            ComparisonOperator::Between => "between",
            ComparisonOperator::In => "in",
            ComparisonOperator::NotIn => "not in",
            ComparisonOperator::Unspecified | ComparisonOperator::Other(_) => "?",
        }
    }
}

impl Serialize for ComparisonOperator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for ComparisonOperator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match CodeOrName::deserialize(deserializer)? {
            CodeOrName::Code(code) => Ok(Self::NAMED
                .iter()
                .find(|(_, known, _)| *known == code)
                .map(|(op, _, _)| *op)
                .unwrap_or(ComparisonOperator::Other(code))),
            CodeOrName::Name(name) => {
                let lowered = name.to_ascii_lowercase();
                Self::NAMED
                    .iter()
                    .find(|(_, _, known)| *known == lowered)
                    .map(|(op, _, _)| *op)
                    .ok_or_else(|| {
                        serde::de::Error::custom(format!("unknown comparison operator '{name}'"))
                    })
            }
        }
    }
}

/// One stage of the server's progression tree. `parent_id == PhaseId::ROOT`
/// marks a root phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: PhaseId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub parent_id: PhaseId,
    #[serde(default)]
    pub has_children: bool,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_clear: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PhaseState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: ConditionId,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub kind: ConditionKind,
    #[serde(default)]
    pub is_clear: bool,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<PhaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_name: Option<String>,
    #[serde(default)]
    pub parts: Vec<ConditionPart>,
}

impl Condition {
    pub fn part(&self, part_id: PartId) -> Option<&ConditionPart> {
        self.parts.iter().find(|part| part.id == part_id)
    }
}

/// A single measurable criterion. Which reference value is meaningful
/// depends on the comparison type the server assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionPart {
    pub id: PartId,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub is_clear: bool,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub comparison_operator: ComparisonOperator,
    #[serde(default)]
    pub target_entity_type: String,
    #[serde(default)]
    pub target_entity_id: i64,
    #[serde(default)]
    pub reference_value_int: i64,
    #[serde(default)]
    pub reference_value_float: f64,
    #[serde(default)]
    pub reference_value_string: String,
    #[serde(default)]
    pub min_value: i64,
    #[serde(default)]
    pub max_value: i64,
    #[serde(default)]
    pub priority: i32,
    /// Server-side counter value; only counter conditions carry it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<i64>,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
