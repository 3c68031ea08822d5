//! Typed wrappers for the hub's method vocabulary.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::correlator::Correlator;
use crate::error::{HubError, ProtocolError, RequestError, Result};
use crate::protocol::{methods, HelloReply, PushButtonAuthReply, ThingDescriptor};
use crate::types::{ActionType, ActionTypeId, StateType, ThingClass, ThingClassId, Vendor};

/// `thingError` value the hub reports for a successful action
const THING_ERROR_NONE: &str = "ThingErrorNoError";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThingsReply {
    #[serde(default)]
    things: Vec<ThingDescriptor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThingClassesReply {
    #[serde(default)]
    thing_classes: Vec<ThingClass>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateTypesReply {
    #[serde(default)]
    state_types: Vec<StateType>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionTypesReply {
    #[serde(default)]
    action_types: Vec<ActionType>,
}

#[derive(Deserialize)]
struct VendorsReply {
    #[serde(default)]
    vendors: Vec<Vendor>,
}

#[derive(Deserialize)]
struct StateValueReply {
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionReply {
    #[serde(default)]
    thing_error: Option<String>,
}

/// Stateless command facade over a [`Correlator`]
#[derive(Clone)]
pub struct HubCommands {
    correlator: Correlator,
}

impl HubCommands {
    pub fn new(correlator: Correlator) -> Self {
        Self { correlator }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> std::result::Result<T, RequestError> {
        let reply = self.correlator.call(method, params).await?;
        decode(method, reply)
    }

    /// Capability query
    pub async fn hello(&self) -> std::result::Result<HelloReply, RequestError> {
        self.call(methods::HELLO, Value::Null).await
    }

    /// Capability query presenting `token`, used to check a stored credential
    pub async fn hello_with_token(&self, token: &str) -> std::result::Result<HelloReply, RequestError> {
        let reply = self
            .correlator
            .call_with_token(methods::HELLO, Value::Null, token)
            .await?;
        decode(methods::HELLO, reply)
    }

    /// Ask the hub to start a push-button pairing transaction
    pub async fn request_push_button_auth(
        &self,
        device_name: &str,
        timeout: Duration,
    ) -> std::result::Result<PushButtonAuthReply, RequestError> {
        let reply = self
            .correlator
            .call_with_timeout(
                methods::REQUEST_PUSH_BUTTON_AUTH,
                json!({ "deviceName": device_name }),
                timeout,
            )
            .await?;
        decode(methods::REQUEST_PUSH_BUTTON_AUTH, reply)
    }

    /// Enable or disable notification delivery on the calling connection
    pub async fn set_notification_status(&self, enabled: bool) -> std::result::Result<(), RequestError> {
        self.correlator
            .call(methods::SET_NOTIFICATION_STATUS, json!({ "enabled": enabled }))
            .await
            .map(|_| ())
    }

    pub async fn get_things(&self) -> std::result::Result<Vec<ThingDescriptor>, RequestError> {
        let reply: ThingsReply = self.call(methods::GET_THINGS, Value::Null).await?;
        Ok(reply.things)
    }

    /// Thing classes by id; an empty list asks for every class
    pub async fn get_thing_classes(
        &self,
        ids: &[ThingClassId],
    ) -> std::result::Result<Vec<ThingClass>, RequestError> {
        let params = if ids.is_empty() {
            Value::Null
        } else {
            json!({ "thingClassIds": ids })
        };
        let reply: ThingClassesReply = self.call(methods::GET_THING_CLASSES, params).await?;
        Ok(reply.thing_classes)
    }

    pub async fn get_state_types(&self, thing_class_id: &str) -> std::result::Result<Vec<StateType>, RequestError> {
        let reply: StateTypesReply = self
            .call(methods::GET_STATE_TYPES, json!({ "thingClassId": thing_class_id }))
            .await?;
        Ok(reply.state_types)
    }

    pub async fn get_action_types(&self, thing_class_id: &str) -> std::result::Result<Vec<ActionType>, RequestError> {
        let reply: ActionTypesReply = self
            .call(methods::GET_ACTION_TYPES, json!({ "thingClassId": thing_class_id }))
            .await?;
        Ok(reply.action_types)
    }

    pub async fn get_state_value(
        &self,
        thing_id: &str,
        state_type_id: &str,
    ) -> std::result::Result<Value, RequestError> {
        let reply: StateValueReply = self
            .call(
                methods::GET_STATE_VALUE,
                json!({ "thingId": thing_id, "stateTypeId": state_type_id }),
            )
            .await?;
        Ok(reply.value)
    }

    /// Run an action on a thing
    ///
    /// The device's state is not touched; the outcome arrives later as a
    /// state change notification.
    pub async fn execute_action(
        &self,
        thing_id: &str,
        action_type_id: &str,
        params: &[(String, Value)],
    ) -> std::result::Result<(), RequestError> {
        let mut request = json!({ "thingId": thing_id, "actionTypeId": action_type_id });
        if !params.is_empty() {
            request["params"] = params
                .iter()
                .map(|(param_type_id, value)| json!({ "paramTypeId": param_type_id, "value": value }))
                .collect();
        }

        let reply: ActionReply = self.call(methods::EXECUTE_ACTION, request).await?;
        match reply.thing_error {
            Some(code) if code != THING_ERROR_NONE => Err(RequestError::HubRejected {
                method: methods::EXECUTE_ACTION.to_string(),
                code,
            }),
            _ => Ok(()),
        }
    }

    pub async fn get_vendors(&self) -> std::result::Result<Vec<Vendor>, RequestError> {
        let reply: VendorsReply = self.call(methods::GET_VENDORS, Value::Null).await?;
        Ok(reply.vendors)
    }

    /// Execute the class's `open` action on a cover thing
    pub async fn open_cover(&self, class: &ThingClass, thing_id: &str) -> Result<()> {
        self.run_named_action(class, thing_id, "open").await
    }

    /// Execute the class's `close` action on a cover thing
    pub async fn close_cover(&self, class: &ThingClass, thing_id: &str) -> Result<()> {
        self.run_named_action(class, thing_id, "close").await
    }

    async fn run_named_action(&self, class: &ThingClass, thing_id: &str, name: &str) -> Result<()> {
        let action: ActionTypeId = match class.action_type_named(name) {
            Some(action) => action.id.clone(),
            None => {
                // Classes fetched in bulk may omit action types
                self.get_action_types(&class.id)
                    .await?
                    .into_iter()
                    .find(|at| at.matches_name(name))
                    .map(|at| at.id)
                    .ok_or_else(|| {
                        HubError::NotFound(format!("action {name:?} on thing class {}", class.id))
                    })?
            }
        };

        tracing::debug!("Executing {} action {} on {}", name, action, thing_id);
        self.execute_action(thing_id, &action, &[]).await?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(method: &str, reply: Value) -> std::result::Result<T, RequestError> {
    serde_json::from_value(reply)
        .map_err(|e| ProtocolError::new(format!("unexpected {method} reply: {e}")).into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::correlator::{ConnectionCommand, DEFAULT_REQUEST_TIMEOUT};
    use tokio::sync::mpsc;

    /// Answer every call on the channel with the reply produced by `respond`
    pub(crate) fn fake_connection(
        respond: impl Fn(&crate::protocol::Request) -> std::result::Result<Value, RequestError> + Send + 'static,
    ) -> (HubCommands, tokio::task::JoinHandle<Vec<crate::protocol::Request>>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(command) = rx.recv().await {
                if let ConnectionCommand::Call { request, reply, .. } = command {
                    let _ = reply.send(respond(&request));
                    seen.push(request);
                }
            }
            seen
        });
        (HubCommands::new(Correlator::new(tx, DEFAULT_REQUEST_TIMEOUT)), handle)
    }

    fn garage_class() -> ThingClass {
        serde_json::from_value(json!({
            "id": "cls1",
            "name": "maveoStick",
            "actionTypes": [
                {"id": "act-open", "name": "open", "displayName": "Open"},
                {"id": "act-close", "name": "close", "displayName": "Close"}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn get_things_unwraps_the_thing_list() {
        let (commands, _) = fake_connection(|_| {
            Ok(json!({"things": [{"id": "dev1", "thingClassId": "cls1", "name": "Garage"}]}))
        });
        let things = commands.get_things().await.unwrap();
        assert_eq!(things.len(), 1);
        assert_eq!(things[0].name, "Garage");
    }

    #[tokio::test]
    async fn execute_action_sends_param_list_and_checks_thing_error() {
        let (commands, handle) = fake_connection(|req| {
            if req.params.as_ref().and_then(|p| p.get("params")).is_some() {
                Ok(json!({"thingError": "ThingErrorNoError"}))
            } else {
                Ok(json!({"thingError": "ThingErrorHardwareNotAvailable"}))
            }
        });

        commands
            .execute_action("dev1", "act-light", &[("p-power".into(), json!(true))])
            .await
            .unwrap();
        let err = commands.execute_action("dev1", "act-open", &[]).await.unwrap_err();
        assert_eq!(
            err,
            RequestError::HubRejected {
                method: methods::EXECUTE_ACTION.into(),
                code: "ThingErrorHardwareNotAvailable".into()
            }
        );

        drop(commands);
        let seen = handle.await.unwrap();
        assert_eq!(
            seen[0].params,
            Some(json!({
                "thingId": "dev1",
                "actionTypeId": "act-light",
                "params": [{"paramTypeId": "p-power", "value": true}]
            }))
        );
    }

    #[tokio::test]
    async fn open_cover_resolves_the_action_by_name() {
        let (commands, handle) = fake_connection(|_| Ok(json!({})));
        commands.open_cover(&garage_class(), "dev1").await.unwrap();
        commands.close_cover(&garage_class(), "dev1").await.unwrap();

        drop(commands);
        let seen = handle.await.unwrap();
        let actions: Vec<_> = seen
            .iter()
            .map(|r| r.params.as_ref().unwrap()["actionTypeId"].clone())
            .collect();
        assert_eq!(actions, vec![json!("act-open"), json!("act-close")]);
    }

    #[tokio::test]
    async fn missing_cover_action_is_not_found() {
        let (commands, _) = fake_connection(|_| Ok(json!({"actionTypes": []})));
        let mut class = garage_class();
        class.action_types.clear();

        let err = commands.open_cover(&class, "dev1").await.unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
    }

    #[tokio::test]
    async fn malformed_reply_is_a_protocol_error() {
        let (commands, _) = fake_connection(|_| Ok(json!({"things": "nope"})));
        assert!(matches!(
            commands.get_things().await,
            Err(RequestError::Protocol(_))
        ));
    }
}
