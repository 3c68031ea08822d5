use std::time::Duration;

use crate::correlator::DEFAULT_REQUEST_TIMEOUT;
use crate::transport::{HubAddress, ReconnectPolicy, TlsMode};

/// Default window for the operator to press the hub's button
pub const DEFAULT_PAIRING_WINDOW: Duration = Duration::from_secs(30);

/// Default TCP/WebSocket connect deadline
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the notification queue
pub const DEFAULT_NOTIFICATION_QUEUE: usize = 256;

/// Everything a [`HubClient`](crate::HubClient) needs to reach and talk to a hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub address: HubAddress,
    pub tls: TlsMode,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// How long pairing waits for the physical button press
    pub pairing_window: Duration,
    /// Name the hub shows for this client in its list of paired devices
    pub device_name: String,
    /// Notifications buffered ahead of the router before the oldest are dropped
    pub notification_queue: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            address: HubAddress::new("localhost"),
            tls: TlsMode::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pairing_window: DEFAULT_PAIRING_WINDOW,
            device_name: "nymea-hub".to_string(),
            notification_queue: DEFAULT_NOTIFICATION_QUEUE,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl HubConfig {
    /// Default configuration for the hub at `address`
    pub fn new(address: HubAddress) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_address(mut self, address: HubAddress) -> Self {
        self.address = address;
        self
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_pairing_window(mut self, window: Duration) -> Self {
        self.pairing_window = window;
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Capacity of the notification queue; clamped to at least 1
    pub fn with_notification_queue(mut self, capacity: usize) -> Self {
        self.notification_queue = capacity.max(1);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}
