use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{DeviceId, StateTypeId, ThingClassId};

/// Method names of the command channel vocabulary
pub mod methods {
    pub const HELLO: &str = "JSONRPC.Hello";
    pub const REQUEST_PUSH_BUTTON_AUTH: &str = "JSONRPC.RequestPushButtonAuth";
    pub const SET_NOTIFICATION_STATUS: &str = "JSONRPC.SetNotificationStatus";
    pub const GET_THINGS: &str = "Integrations.GetThings";
    pub const GET_THING_CLASSES: &str = "Integrations.GetThingClasses";
    pub const GET_STATE_TYPES: &str = "Integrations.GetStateTypes";
    pub const GET_ACTION_TYPES: &str = "Integrations.GetActionTypes";
    pub const GET_STATE_VALUE: &str = "Integrations.GetStateValue";
    pub const EXECUTE_ACTION: &str = "Integrations.ExecuteAction";
    pub const GET_VENDORS: &str = "Integrations.GetVendors";
}

/// Command channel request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Request {
    /// Create a new request with the given id and method
    pub fn new(id: u64, method: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            params: None,
            token: None,
        }
    }

    /// Set the request params; empty objects are left off the wire
    pub fn with_params(mut self, params: Value) -> Self {
        let empty = params.is_null() || params.as_object().is_some_and(|o| o.is_empty());
        self.params = if empty { None } else { Some(params) };
        self
    }

    /// Attach an authentication token
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

/// Command channel response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == "unauthorized"
    }

    /// The hub's rejection reason, falling back to the raw status
    pub fn error_code(&self) -> String {
        self.error.clone().unwrap_or_else(|| self.status.clone())
    }
}

/// Unsolicited push message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    pub fn topic(&self) -> Topic {
        Topic::classify(&self.notification)
    }

    /// Decode the params into a typed payload
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            ProtocolError::new(format!("bad {} payload: {}", self.notification, e))
        })
    }
}

/// Anything the hub can send us
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Notification(Notification),
    Response(Response),
}

/// Notification topics the client understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    DeviceAdded,
    DeviceChanged,
    DeviceRemoved,
    StateChanged,
    ConnectionStatusChanged,
    PushButtonAuthFinished,
    Unknown,
}

impl Topic {
    pub fn classify(name: &str) -> Self {
        match name {
            "Integrations.ThingAdded" | "DeviceAdded" => Topic::DeviceAdded,
            "Integrations.ThingChanged" | "DeviceChanged" => Topic::DeviceChanged,
            "Integrations.ThingRemoved" | "DeviceRemoved" => Topic::DeviceRemoved,
            "Integrations.StateChanged" | "StateChanged" => Topic::StateChanged,
            "JSONRPC.ConnectionStatusChanged" | "ConnectionStatusChanged" => {
                Topic::ConnectionStatusChanged
            }
            "JSONRPC.PushButtonAuthFinished" => Topic::PushButtonAuthFinished,
            _ => Topic::Unknown,
        }
    }
}

// ========== Typed payloads ==========

/// Reply to `JSONRPC.Hello`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    #[serde(default)]
    pub initial_setup_required: bool,
    #[serde(default)]
    pub authentication_required: bool,
    #[serde(default)]
    pub push_button_auth_available: bool,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename = "protocol version")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

impl HelloReply {
    /// The hub instance id, as announced in the hello
    pub fn hub_id(&self) -> Result<uuid::Uuid, ProtocolError> {
        let raw = self
            .uuid
            .as_deref()
            .ok_or_else(|| ProtocolError::new("hello reply carries no hub uuid"))?;
        uuid::Uuid::parse_str(raw)
            .map_err(|e| ProtocolError::new(format!("invalid hub uuid {raw:?}: {e}")))
    }
}

/// Reply to `JSONRPC.RequestPushButtonAuth`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushButtonAuthReply {
    pub success: bool,
    #[serde(default)]
    pub transaction_id: i64,
}

/// Params of `JSONRPC.PushButtonAuthFinished`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushButtonAuthFinished {
    pub success: bool,
    #[serde(default)]
    pub transaction_id: i64,
    #[serde(default)]
    pub token: Option<String>,
}

/// One `{stateTypeId, value}` entry of a thing descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateValue {
    pub state_type_id: StateTypeId,
    #[serde(default)]
    pub value: Value,
}

/// A thing as the hub describes it in `GetThings` and `ThingAdded`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThingDescriptor {
    pub id: DeviceId,
    #[serde(default)]
    pub name: String,
    pub thing_class_id: ThingClassId,
    #[serde(default)]
    pub states: Vec<StateValue>,
}

/// Params of a thing added/changed notification
#[derive(Debug, Clone, Deserialize)]
pub struct ThingParams {
    pub thing: ThingDescriptor,
}

/// Params of a thing removed notification
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThingRemovedParams {
    #[serde(alias = "id")]
    pub thing_id: DeviceId,
}

/// Params of a state changed notification
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangedParams {
    #[serde(alias = "id")]
    pub thing_id: DeviceId,
    pub state_type_id: StateTypeId,
    pub value: Value,
}

/// Params of a connection status notification
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionStatusParams {
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_empty_params_and_missing_token() {
        let req = Request::new(4, methods::GET_THINGS).with_params(json!({}));
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"id": 4, "method": "Integrations.GetThings"})
        );

        let req = Request::new(5, methods::GET_STATE_TYPES)
            .with_params(json!({"thingClassId": "cls1"}))
            .with_token(Some("tok".into()));
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "id": 5,
                "method": "Integrations.GetStateTypes",
                "params": {"thingClassId": "cls1"},
                "token": "tok"
            })
        );
    }

    #[test]
    fn inbound_distinguishes_notifications_from_responses() {
        let resp: Inbound =
            serde_json::from_str(r#"{"id":1,"status":"success","params":{"things":[]}}"#).unwrap();
        assert!(matches!(resp, Inbound::Response(ref r) if r.id == 1 && r.is_success()));

        let note: Inbound = serde_json::from_str(
            r#"{"id":17,"notification":"Integrations.StateChanged","params":{}}"#,
        )
        .unwrap();
        assert!(matches!(note, Inbound::Notification(ref n) if n.topic() == Topic::StateChanged));

        assert!(serde_json::from_str::<Inbound>(r#"{"hello":"world"}"#).is_err());
    }

    #[test]
    fn unknown_topics_classify_as_unknown() {
        assert_eq!(Topic::classify("Rules.RuleAdded"), Topic::Unknown);
        assert_eq!(Topic::classify("DeviceRemoved"), Topic::DeviceRemoved);
        assert_eq!(
            Topic::classify("Integrations.ThingRemoved"),
            Topic::DeviceRemoved
        );
    }

    #[test]
    fn removed_params_accept_both_id_spellings() {
        let a: ThingRemovedParams = serde_json::from_value(json!({"thingId": "dev1"})).unwrap();
        let b: ThingRemovedParams = serde_json::from_value(json!({"id": "dev1"})).unwrap();
        assert_eq!(a.thing_id, b.thing_id);
    }

    #[test]
    fn hello_reply_parses_braced_hub_uuid() {
        let hello: HelloReply = serde_json::from_value(json!({
            "authenticationRequired": true,
            "pushButtonAuthAvailable": true,
            "initialSetupRequired": false,
            "protocol version": "5.4",
            "uuid": "{3f2c6e9a-1b7d-4c1e-9a4f-0d2b8e6c5a10}"
        }))
        .unwrap();
        assert!(hello.authentication_required);
        assert_eq!(hello.protocol_version.as_deref(), Some("5.4"));
        assert_eq!(
            hello.hub_id().unwrap().to_string(),
            "3f2c6e9a-1b7d-4c1e-9a4f-0d2b8e6c5a10"
        );
    }
}
