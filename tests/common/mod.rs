//! In-process fake hub shared by the integration tests.
//!
//! ```text
//! client ──TCP {json}\n──▶ command listener ──▶ Script::answer ──▶ reply (optionally delayed)
//! client ──WebSocket─────▶ ws listener      ──▶ handshake, then pushed notifications
//! ```
//!
//! Tests drive the hub through [`FakeHub`]: push notifications on either
//! channel, drop command connections, and inspect every request it received.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use nymea_hub::{HubAddress, HubConfig, ReconnectPolicy, TlsMode};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

pub const HUB_UUID: &str = "3f2c6e9a-1b7d-4c1e-9a4f-0d2b8e6c5a10";
pub const TOKEN: &str = "tok-garage";
pub const TRANSACTION_ID: i64 = 42;

/// Pushed line that makes a connection hang up
const CLOSE: &str = "__close__";

/// How the fake hub answers
#[derive(Clone)]
pub struct Script {
    pub auth_required: bool,
    pub things: Value,
    pub classes: Value,
    /// Methods that never get an answer
    pub hold: Vec<&'static str>,
    /// Token sent in `PushButtonAuthFinished` shortly after a pairing request
    pub confirm_with: Option<&'static str>,
    pub delay: fn(&Value) -> Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            auth_required: false,
            things: json!([{"id": "dev1", "thingClassId": "cls1", "name": "Garage"}]),
            classes: json!([garage_class()]),
            hold: Vec::new(),
            confirm_with: None,
            delay: |_| Duration::ZERO,
        }
    }
}

pub fn garage_class() -> Value {
    json!({
        "id": "cls1",
        "name": "maveoStick",
        "displayName": "maveo stick",
        "vendorId": "vendor-maveo",
        "stateTypes": [
            {"id": "st-state", "name": "state", "displayName": "State", "type": "QString"},
            {"id": "st-light", "name": "light", "displayName": "Light", "type": "Bool"},
            {"id": "st-ver", "name": "stickVersion", "displayName": "maveo-stick version", "type": "QString"}
        ],
        "actionTypes": [
            {"id": "act-open", "name": "open", "displayName": "Open"},
            {"id": "act-close", "name": "close", "displayName": "Close"}
        ]
    })
}

impl Script {
    fn hello(&self) -> Value {
        json!({
            "server": "nymea",
            "name": "maveo box",
            "version": "1.9.0",
            "protocol version": "8.0",
            "uuid": format!("{{{HUB_UUID}}}"),
            "initialSetupRequired": false,
            "authenticationRequired": self.auth_required,
            "pushButtonAuthAvailable": true
        })
    }

    fn class_field(&self, params: &Value, field: &str) -> Value {
        let wanted = params["thingClassId"].as_str().unwrap_or_default();
        self.classes
            .as_array()
            .and_then(|classes| classes.iter().find(|c| c["id"] == wanted))
            .map(|c| c[field].clone())
            .unwrap_or_else(|| json!([]))
    }

    /// The reply for a request, or `None` to stay silent
    fn answer(&self, request: &Value, things: &Value) -> Option<(Duration, Value)> {
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default();
        if self.hold.iter().any(|held| *held == method) {
            return None;
        }

        let token = request.get("token").and_then(Value::as_str);
        let authorized = !self.auth_required || token == Some(TOKEN);
        let params = &request["params"];

        let result = match method {
            "JSONRPC.Hello" if token.is_some_and(|t| t != TOKEN) => Err(("unauthorized", None)),
            "JSONRPC.Hello" => Ok(self.hello()),
            "JSONRPC.RequestPushButtonAuth" => Ok(json!({"success": true, "transactionId": TRANSACTION_ID})),
            _ if !authorized => Err(("unauthorized", None)),
            "JSONRPC.SetNotificationStatus" => Ok(json!({"enabled": true})),
            "Integrations.GetThings" => Ok(json!({"things": things})),
            "Integrations.GetThingClasses" => Ok(json!({"thingClasses": self.classes})),
            "Integrations.GetStateTypes" => Ok(json!({"stateTypes": self.class_field(params, "stateTypes")})),
            "Integrations.GetActionTypes" => Ok(json!({"actionTypes": self.class_field(params, "actionTypes")})),
            "Integrations.GetStateValue" => Ok(json!({"value": params["stateTypeId"]})),
            "Integrations.ExecuteAction" => Ok(json!({"thingError": "ThingErrorNoError"})),
            "Integrations.GetVendors" => Ok(json!({"vendors": [{"id": "vendor-maveo", "name": "maveo"}]})),
            _ => Err(("error", Some("JSONRPCErrorMethodNotFound"))),
        };

        let reply = match result {
            Ok(params) => json!({"id": id, "status": "success", "params": params}),
            Err((status, error)) => json!({"id": id, "status": status, "error": error}),
        };
        Some(((self.delay)(request), reply))
    }
}

/// State shared by every connection to the fake hub
#[derive(Clone)]
struct Shared {
    script: Arc<Script>,
    things: Arc<Mutex<Value>>,
    requests: Arc<Mutex<Vec<Value>>>,
    ws_requests: Arc<Mutex<Vec<Value>>>,
}

impl Shared {
    fn answer(&self, request: &Value) -> Option<(Duration, Value)> {
        let things = self.things.lock().unwrap().clone();
        self.script.answer(request, &things)
    }
}

pub struct FakeHub {
    pub address: HubAddress,
    shared: Shared,
    command_push: broadcast::Sender<String>,
    ws_push: broadcast::Sender<String>,
}

impl FakeHub {
    pub async fn start(script: Script) -> Self {
        let commands = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sockets = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = HubAddress::new("127.0.0.1").with_ports(
            commands.local_addr().unwrap().port(),
            sockets.local_addr().unwrap().port(),
        );

        let shared = Shared {
            things: Arc::new(Mutex::new(script.things.clone())),
            script: Arc::new(script),
            requests: Arc::new(Mutex::new(Vec::new())),
            ws_requests: Arc::new(Mutex::new(Vec::new())),
        };
        let (command_push, _) = broadcast::channel(64);
        let (ws_push, _) = broadcast::channel(64);

        {
            let shared = shared.clone();
            let push = command_push.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = commands.accept().await {
                    tokio::spawn(serve_commands(stream, shared.clone(), push.clone()));
                }
            });
        }
        {
            let shared = shared.clone();
            let push = ws_push.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = sockets.accept().await {
                    tokio::spawn(serve_websocket(stream, shared.clone(), push.clone()));
                }
            });
        }

        Self {
            address,
            shared,
            command_push,
            ws_push,
        }
    }

    /// Client config for this hub: plain TCP, no reconnect, short deadlines
    pub fn config(&self) -> HubConfig {
        HubConfig::new(self.address.clone())
            .with_tls(TlsMode::Plain)
            .with_request_timeout(Duration::from_secs(2))
            .with_pairing_window(Duration::from_secs(2))
            .with_reconnect(ReconnectPolicy::disabled())
    }

    /// Like [`config`](Self::config), but both channels come back quickly after a drop
    pub fn reconnecting_config(&self) -> HubConfig {
        self.config().with_reconnect(ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            ..ReconnectPolicy::default()
        })
    }

    /// Everything received on command connections
    pub fn requests(&self) -> Vec<Value> {
        self.shared.requests.lock().unwrap().clone()
    }

    /// Everything received on notification WebSockets
    pub fn ws_requests(&self) -> Vec<Value> {
        self.shared.ws_requests.lock().unwrap().clone()
    }

    /// Replace the things `GetThings` reports from now on
    pub fn set_things(&self, things: Value) {
        *self.shared.things.lock().unwrap() = things;
    }

    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|r| r["method"] == method)
            .collect()
    }

    pub fn ws_requests_for(&self, method: &str) -> Vec<Value> {
        self.ws_requests()
            .into_iter()
            .filter(|r| r["method"] == method)
            .collect()
    }

    /// Push a notification on every command connection
    pub fn push_command(&self, notification: Value) {
        let _ = self.command_push.send(notification.to_string());
    }

    /// Push a notification on every notification WebSocket
    pub fn push_notification(&self, notification: Value) {
        let _ = self.ws_push.send(notification.to_string());
    }

    /// Hang up on every command connection
    pub fn drop_command_connections(&self) {
        let _ = self.command_push.send(CLOSE.to_string());
    }

    /// Hang up on every notification WebSocket
    pub fn drop_websockets(&self) {
        let _ = self.ws_push.send(CLOSE.to_string());
    }
}

async fn serve_commands(stream: TcpStream, shared: Shared, push: broadcast::Sender<String>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut pushed = push.subscribe();
    let (replies_tx, mut replies) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(request) = serde_json::from_str::<Value>(&line) else { continue };
                shared.requests.lock().unwrap().push(request.clone());

                if let Some((delay, reply)) = shared.answer(&request) {
                    let tx = replies_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(reply.to_string());
                    });
                }

                if request["method"] == "JSONRPC.RequestPushButtonAuth" {
                    if let Some(token) = shared.script.confirm_with {
                        let push = push.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            let finished = json!({
                                "notification": "JSONRPC.PushButtonAuthFinished",
                                "params": {"success": true, "transactionId": TRANSACTION_ID, "token": token}
                            });
                            let _ = push.send(finished.to_string());
                        });
                    }
                }
            }
            Some(reply) = replies.recv() => {
                if write.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            pushed = pushed.recv() => match pushed {
                Ok(line) if line == CLOSE => break,
                Ok(line) => {
                    if write.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn serve_websocket(stream: TcpStream, shared: Shared, push: broadcast::Sender<String>) {
    let mut pushed = push.subscribe();
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };

    loop {
        tokio::select! {
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(&text) else { continue };
                    shared.ws_requests.lock().unwrap().push(request.clone());
                    if let Some((_, reply)) = shared.answer(&request) {
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            pushed = pushed.recv() => match pushed {
                Ok(line) if line == CLOSE => {
                    let _ = ws.close(None).await;
                    break;
                }
                Ok(line) => {
                    if ws.send(Message::Text(line)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Poll `check` until it holds, failing the test after two seconds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

pub fn state_changed(thing: &str, state_type: &str, value: Value) -> Value {
    json!({
        "notification": "Integrations.StateChanged",
        "params": {"thingId": thing, "stateTypeId": state_type, "value": value}
    })
}
