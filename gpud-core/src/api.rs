//! Health and event data model
//!
//! Shared vocabulary between components, the suggested actions store and
//! the escalation engine: health levels, event severities and repair actions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health level of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum HealthStateType {
    /// Component is functioning normally
    #[default]
    Healthy,
    /// Component is failing and likely impacts workloads
    Unhealthy,
    /// Component has an issue that does not affect workloads yet
    Degraded,
    /// Component has not finished its first evaluation
    Initializing,
}

impl fmt::Display for HealthStateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStateType::Healthy => write!(f, "Healthy"),
            HealthStateType::Unhealthy => write!(f, "Unhealthy"),
            HealthStateType::Degraded => write!(f, "Degraded"),
            HealthStateType::Initializing => write!(f, "Initializing"),
        }
    }
}

/// Whether a health state comes from a built-in component or a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentType {
    #[default]
    Component,
    CustomPlugin,
}

/// How the check producing a health state is triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunModeType {
    /// Runs periodically on the component's interval
    #[default]
    Auto,
    /// Runs only when triggered on demand
    Manual,
}

/// Remediation recommended to the fleet operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairActionType {
    /// Issue is known and harmless
    IgnoreNoActionRequired,
    /// Rebooting the machine is expected to recover
    RebootSystem,
    /// Recurring failure, escalate to a hardware ticket
    HardwareInspection,
    /// Likely caused by the user workload rather than the machine
    #[serde(rename = "CHECK_USER_APP_AND_GPU")]
    CheckUserAppAndGpu,
}

impl RepairActionType {
    /// All repair actions, in declaration order
    pub const ALL: [RepairActionType; 4] = [
        RepairActionType::IgnoreNoActionRequired,
        RepairActionType::RebootSystem,
        RepairActionType::HardwareInspection,
        RepairActionType::CheckUserAppAndGpu,
    ];

    /// Stable wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairActionType::IgnoreNoActionRequired => "IGNORE_NO_ACTION_REQUIRED",
            RepairActionType::RebootSystem => "REBOOT_SYSTEM",
            RepairActionType::HardwareInspection => "HARDWARE_INSPECTION",
            RepairActionType::CheckUserAppAndGpu => "CHECK_USER_APP_AND_GPU",
        }
    }
}

impl fmt::Display for RepairActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recommended remediation attached to a health state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SuggestedActions {
    /// Why these actions are recommended
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Ordered list of recommended actions
    pub repair_actions: Vec<RepairActionType>,
}

impl SuggestedActions {
    /// Suggest a single repair action
    pub fn single(action: RepairActionType, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            repair_actions: vec![action],
        }
    }

    /// Whether the list of repair actions is empty
    pub fn is_empty(&self) -> bool {
        self.repair_actions.is_empty()
    }
}

/// Point-in-time health of a component with supporting evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HealthState {
    /// When the state was evaluated
    pub time: DateTime<Utc>,
    /// Component that produced the state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component: String,
    #[serde(default)]
    pub component_type: ComponentType,
    /// Name of the state, may differ from the component name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub run_mode: RunModeType,
    pub health: HealthStateType,
    /// What was detected, if anything
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Underlying error text
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_actions: Option<SuggestedActions>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_info: BTreeMap<String, String>,
}

impl HealthState {
    /// Reason reported before a component has produced its first result
    pub const NO_DATA_YET: &'static str = "no data yet";

    /// Placeholder state for a component that has not checked yet
    pub fn no_data_yet(component: &str) -> Self {
        Self {
            time: Utc::now(),
            component: component.to_string(),
            name: component.to_string(),
            health: HealthStateType::Healthy,
            reason: Self::NO_DATA_YET.to_string(),
            ..Default::default()
        }
    }
}

/// Severity of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EventType {
    #[default]
    Unknown,
    /// General event that requires no action
    Info,
    /// May impact workloads
    Warning,
    /// Definitely impacting workloads, requires immediate action
    Critical,
    /// Impacts wide systems, requires immediate action
    Fatal,
}

impl EventType {
    /// Whether the event indicates a failure rather than information
    pub fn is_failure(&self) -> bool {
        matches!(self, EventType::Critical | EventType::Fatal)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Unknown => write!(f, "Unknown"),
            EventType::Info => write!(f, "Info"),
            EventType::Warning => write!(f, "Warning"),
            EventType::Critical => write!(f, "Critical"),
            EventType::Fatal => write!(f, "Fatal"),
        }
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    /// Unrecognized input maps to `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Info" => EventType::Info,
            "Warning" => EventType::Warning,
            "Critical" => EventType::Critical,
            "Fatal" => EventType::Fatal,
            _ => EventType::Unknown,
        })
    }
}

/// Something that happened in a component at a specific time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component: String,
    pub time: DateTime<Utc>,
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Event {
    /// Create a new event
    pub fn new(
        component: impl Into<String>,
        time: DateTime<Utc>,
        name: impl Into<String>,
        event_type: EventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            time,
            name: name.into(),
            event_type,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repair_action_wire_names() {
        for action in RepairActionType::ALL {
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
        }
    }

    #[test]
    fn test_event_type_from_str() {
        assert_eq!("Fatal".parse::<EventType>().unwrap(), EventType::Fatal);
        assert_eq!("bogus".parse::<EventType>().unwrap(), EventType::Unknown);
        assert!(EventType::Critical.is_failure());
        assert!(!EventType::Warning.is_failure());
    }

    #[test]
    fn test_no_data_yet_state() {
        let state = HealthState::no_data_yet("os");
        assert_eq!(state.health, HealthStateType::Healthy);
        assert_eq!(state.reason, "no data yet");
        assert_eq!(state.component, "os");
    }

    #[test]
    fn test_health_state_serialization_skips_empty() {
        let state = HealthState {
            component: "disk".to_string(),
            health: HealthStateType::Degraded,
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["health"], "Degraded");
        assert!(json.get("reason").is_none());
        assert!(json.get("suggested_actions").is_none());
    }
}
