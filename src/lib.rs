//! Rust client for nymea-based smart-home hubs (such as the maveo box)
//!
//! This library provides an async API for talking to a hub over its two
//! channels. It supports:
//!
//! - JSON-RPC commands over TCP (port 2223), plain or TLS
//! - Push-button pairing and stored-credential authentication
//! - Push notifications over WebSocket (port 4444)
//! - A live, observable mirror of the hub's things (devices)
//! - Automatic reconnection with exponential backoff
//!
//! # Quick Start
//!
//! ```no_run
//! use nymea_hub::{HubAddress, HubClient, HubConfig, SubscriptionKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HubClient::connect(HubConfig::new(HubAddress::new("192.168.1.50"))).await?;
//!
//!     // One-time pairing: someone presses the button on the hub
//!     let credential = client
//!         .pair(|prompt| println!("Press the hub's button within {:?}", prompt.window))
//!         .await?;
//!     println!("Store this credential: {:?}", credential);
//!
//!     // Load devices, then keep them in sync
//!     client.refresh().await?;
//!     client.start_notifications().await?;
//!
//!     client.subscribe(SubscriptionKey::All, |change| {
//!         println!("{:?}: {}", change.kind, change.device.name);
//!     });
//!
//!     for device in client.registry().devices() {
//!         println!("{} ({})", device.name, device.id);
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Client**: wiring, pairing/authentication entry points
//! - **Registry**: the device mirror and change subscriptions
//! - **Router**: applies notifications to the registry in order
//! - **Commands**: typed wrappers for the hub's methods
//! - **Connection / Correlator**: one command socket, many concurrent requests
//! - **Transport / Framing**: sockets, TLS and newline-delimited JSON
//! - **Protocol**: JSON message structures
//! - **Types**: domain types and data structures

mod client;
mod commands;
mod config;
mod connection;
mod correlator;
mod error;
mod framing;
mod notifications;
mod pairing;
mod protocol;
mod registry;
mod router;
mod subscription;
mod transport;
mod types;

// Public exports
pub use client::HubClient;
pub use commands::HubCommands;
pub use config::{HubConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_NOTIFICATION_QUEUE, DEFAULT_PAIRING_WINDOW};
pub use connection::CommandConnection;
pub use correlator::{Correlator, DEFAULT_REQUEST_TIMEOUT};
pub use error::{HubError, PairingError, ProtocolError, RequestError, Result, TransportError};
pub use framing::{JsonLineCodec, MAX_FRAME_LEN};
pub use pairing::{Pairing, PairingPrompt, PairingState};
pub use protocol::{
    methods, HelloReply, Inbound, Notification, PushButtonAuthFinished, PushButtonAuthReply, Request, Response,
    StateValue, ThingDescriptor, Topic,
};
pub use registry::DeviceRegistry;
pub use subscription::{ChangeKind, DeviceChange, EventReceiver, HubEvent, Subscription, SubscriptionKey};
pub use transport::{
    probe, ConnectionStatus, HubAddress, ReconnectPolicy, TlsMode, DEFAULT_COMMAND_PORT, DEFAULT_NOTIFICATION_PORT,
};
pub use types::{
    ActionType, ActionTypeId, CoverState, Credential, Device, DeviceId, ParamType, StateType, StateTypeId,
    ThingClass, ThingClassId, ValueType, Vendor,
};
