use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::protocol::ThingDescriptor;

/// Thing (device) identifier
pub type DeviceId = String;

/// Thing class identifier
pub type ThingClassId = String;

/// State type identifier
pub type StateTypeId = String;

/// Action type identifier
pub type ActionTypeId = String;

/// Value type of a state or param, as declared by the hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValueType {
    Bool,
    Int,
    Uint,
    Double,
    String,
    Color,
    Time,
    /// Anything else the hub declares (Variant, Object, lists, ...)
    Other(String),
}

impl From<String> for ValueType {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "bool" => ValueType::Bool,
            "int" => ValueType::Int,
            "uint" => ValueType::Uint,
            "double" => ValueType::Double,
            "string" | "qstring" => ValueType::String,
            "color" => ValueType::Color,
            "time" => ValueType::Time,
            _ => ValueType::Other(raw),
        }
    }
}

impl From<ValueType> for String {
    fn from(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Bool => "Bool".into(),
            ValueType::Int => "Int".into(),
            ValueType::Uint => "Uint".into(),
            ValueType::Double => "Double".into(),
            ValueType::String => "String".into(),
            ValueType::Color => "Color".into(),
            ValueType::Time => "Time".into(),
            ValueType::Other(raw) => raw,
        }
    }
}

impl ValueType {
    /// Check whether a JSON value fits this declared type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::Bool => value.is_boolean(),
            ValueType::Int => value.is_i64() || is_integral_float(value),
            ValueType::Uint => {
                value.is_u64() || (is_integral_float(value) && value.as_f64().is_some_and(|f| f >= 0.0))
            }
            ValueType::Double => value.is_number(),
            ValueType::String | ValueType::Color | ValueType::Time => value.is_string(),
            ValueType::Other(_) => true,
        }
    }
}

fn is_integral_float(value: &Value) -> bool {
    value.as_f64().is_some_and(|f| f.fract() == 0.0)
}

/// Descriptor of one observable attribute of a thing class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateType {
    pub id: StateTypeId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "type", default = "default_value_type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// Parameter of an action type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamType {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "type", default = "default_value_type")]
    pub value_type: ValueType,
}

fn default_value_type() -> ValueType {
    ValueType::Other("Variant".into())
}

/// Descriptor of something a thing can be told to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionType {
    pub id: ActionTypeId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub param_types: Vec<ParamType>,
}

impl ActionType {
    /// Name or display name equals `name`, ignoring case
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.display_name.eq_ignore_ascii_case(name)
    }
}

/// Vendor entry from `GetVendors`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vendor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

/// Capability template of a device kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThingClass {
    pub id: ThingClassId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub state_types: Vec<StateType>,
    #[serde(default)]
    pub action_types: Vec<ActionType>,
}

impl ThingClass {
    /// Look up a declared state type
    pub fn state_type(&self, id: &str) -> Option<&StateType> {
        self.state_types.iter().find(|st| st.id == id)
    }

    /// Look up a state type by its (case-insensitive) name
    pub fn state_type_named(&self, name: &str) -> Option<&StateType> {
        self.state_types
            .iter()
            .find(|st| st.name.eq_ignore_ascii_case(name))
    }

    /// Look up an action type by name or display name, case-insensitive
    pub fn action_type_named(&self, name: &str) -> Option<&ActionType> {
        self.action_types.iter().find(|at| at.matches_name(name))
    }

    /// The state type that carries the device firmware version, if the class has one
    pub fn firmware_state_type(&self) -> Option<&StateType> {
        const NAMES: [&str; 3] = ["firmwareVersion", "currentVersion", "version"];
        NAMES
            .iter()
            .find_map(|name| self.state_type_named(name))
            .or_else(|| {
                self.state_types.iter().find(|st| {
                    let display = st.display_name.to_ascii_lowercase();
                    display.ends_with("version") && !display.contains("available")
                })
            })
    }
}

/// A hub-known device: an instance of a [`ThingClass`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub thing_class_id: ThingClassId,
    pub firmware_version: Option<String>,
    /// Current value per declared state type
    pub states: BTreeMap<StateTypeId, Value>,
}

impl Device {
    /// Build a device from a hub descriptor, keeping only states its class declares
    ///
    /// Returns the device and the ids of any undeclared states that were dropped.
    pub(crate) fn from_descriptor(
        descriptor: ThingDescriptor,
        class: Option<&ThingClass>,
    ) -> (Self, Vec<StateTypeId>) {
        let mut states = BTreeMap::new();
        let mut dropped = Vec::new();

        for state in descriptor.states {
            if class.is_some_and(|c| c.state_type(&state.state_type_id).is_some()) {
                states.insert(state.state_type_id, state.value);
            } else {
                dropped.push(state.state_type_id);
            }
        }

        let mut device = Self {
            id: descriptor.id,
            name: descriptor.name,
            thing_class_id: descriptor.thing_class_id,
            firmware_version: None,
            states,
        };
        if let Some(class) = class {
            device.refresh_derived(class);
        }
        (device, dropped)
    }

    /// Recompute fields derived from state values
    pub(crate) fn refresh_derived(&mut self, class: &ThingClass) {
        self.firmware_version = class
            .firmware_state_type()
            .and_then(|st| self.states.get(&st.id))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            });
    }

    /// Current value of a state type
    pub fn state(&self, state_type_id: &str) -> Option<&Value> {
        self.states.get(state_type_id)
    }

    /// Current value of the state type with the given name in `class`
    pub fn state_named(&self, class: &ThingClass, name: &str) -> Option<&Value> {
        class
            .state_type_named(name)
            .and_then(|st| self.states.get(&st.id))
    }

    /// Interpret the device's `state` state as a cover position, if it has one
    pub fn cover_state(&self, class: &ThingClass) -> Option<CoverState> {
        self.state_named(class, "state")
            .and_then(|v| v.as_str())
            .map(|s| s.parse().unwrap_or(CoverState::Unknown))
    }
}

/// Position reported by garage door / cover things
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverState {
    Unknown,
    Open,
    Closed,
    Opening,
    Closing,
    Intermediate,
}

impl FromStr for CoverState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(CoverState::Open),
            "closed" => Ok(CoverState::Closed),
            "opening" => Ok(CoverState::Opening),
            "closing" => Ok(CoverState::Closing),
            "intermediate" => Ok(CoverState::Intermediate),
            "unknown" => Ok(CoverState::Unknown),
            other => Err(format!("unknown cover state {other:?}")),
        }
    }
}

/// Durable result of pairing: a token valid for one hub instance
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub hub_id: uuid::Uuid,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("hub_id", &self.hub_id)
            .finish()
    }
}
