//! Raw connections to the hub.
//!
//! The hub exposes two endpoints: a newline-delimited JSON-RPC port for
//! commands and a WebSocket for push notifications. Both may be wrapped in
//! TLS with a self-signed certificate.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::codec::Framed;

use crate::error::TransportError;
use crate::framing::JsonLineCodec;
use crate::protocol::{methods, Inbound, Request};

pub const DEFAULT_COMMAND_PORT: u16 = 2223;
pub const DEFAULT_NOTIFICATION_PORT: u16 = 4444;

/// Request id used by the plain-text probe in [`TlsMode::Auto`]
const PROBE_REQUEST_ID: u64 = 0;

/// Where a hub lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HubAddress {
    pub host: String,
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    #[serde(default = "default_notification_port")]
    pub notification_port: u16,
}

fn default_command_port() -> u16 {
    DEFAULT_COMMAND_PORT
}

fn default_notification_port() -> u16 {
    DEFAULT_NOTIFICATION_PORT
}

impl HubAddress {
    /// Address with the default hub ports
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            command_port: DEFAULT_COMMAND_PORT,
            notification_port: DEFAULT_NOTIFICATION_PORT,
        }
    }

    pub fn with_ports(mut self, command_port: u16, notification_port: u16) -> Self {
        self.command_port = command_port;
        self.notification_port = notification_port;
        self
    }

    fn host_for_authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `host:port` of the command channel
    pub fn command_target(&self) -> String {
        format!("{}:{}", self.host_for_authority(), self.command_port)
    }

    /// WebSocket URL of the notification channel
    pub fn notification_url(&self, secure: bool) -> String {
        let scheme = if secure { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host_for_authority(), self.notification_port)
    }
}

/// Whether to wrap connections in TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    Plain,
    Tls,
    /// Try plain first, fall back to TLS
    #[default]
    Auto,
}

/// Lifecycle of the connection to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Ready,
    /// Reconnection gave up
    Failed,
}

impl ConnectionStatus {
    /// A socket is up (whatever the authentication state)
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::Authenticating | ConnectionStatus::Ready
        )
    }
}

/// Exponential backoff configuration for reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect at all after an unexpected close
    pub enabled: bool,

    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Attempts before giving up. `None` means retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (0-based): 1s, 2s, 4s, ... capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows(&self, attempts: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Any byte stream the command channel can run over
pub trait HubIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> HubIo for T {}

/// A framed command channel connection
pub type CommandStream = Framed<Box<dyn HubIo>, JsonLineCodec>;

/// The notification channel socket
pub type NotificationSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Check whether anything accepts TCP connections on the hub's command port
pub async fn probe(address: &HubAddress, deadline: Duration) -> bool {
    match tcp_connect(address, deadline).await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("Probe of {} failed: {}", address.command_target(), e);
            false
        }
    }
}

/// Open the command channel
pub async fn connect_command(
    address: &HubAddress,
    tls: TlsMode,
    deadline: Duration,
) -> Result<CommandStream, TransportError> {
    match tls {
        TlsMode::Plain => Ok(frame(tcp_connect(address, deadline).await?)),
        TlsMode::Tls => open_tls(address, deadline).await,
        TlsMode::Auto => match probe_plain(address, deadline).await {
            Ok(stream) => Ok(stream),
            Err(e @ TransportError::Unreachable { .. }) => Err(e),
            Err(e) => {
                tracing::info!("Plain command channel failed ({}), trying TLS", e);
                open_tls(address, deadline).await
            }
        },
    }
}

/// Open the notification WebSocket
pub async fn connect_notifications(
    address: &HubAddress,
    tls: TlsMode,
    deadline: Duration,
) -> Result<NotificationSocket, TransportError> {
    match tls {
        TlsMode::Plain => ws_connect(address.notification_url(false), None, deadline).await,
        TlsMode::Tls => ws_connect_tls(address, deadline).await,
        TlsMode::Auto => match ws_connect(address.notification_url(false), None, deadline).await {
            Ok(socket) => Ok(socket),
            Err(e) => {
                tracing::info!("Non-TLS WebSocket failed ({}), trying TLS", e);
                ws_connect_tls(address, deadline).await
            }
        },
    }
}

fn frame<T: HubIo + 'static>(io: T) -> CommandStream {
    Framed::new(Box::new(io) as Box<dyn HubIo>, JsonLineCodec::new())
}

async fn tcp_connect(address: &HubAddress, deadline: Duration) -> Result<TcpStream, TransportError> {
    let target = address.command_target();
    match timeout(deadline, TcpStream::connect(&target)).await {
        Err(_) => Err(TransportError::TimedOut(target)),
        Ok(Err(source)) => Err(TransportError::Unreachable {
            address: target,
            source,
        }),
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}

/// The hub ships a self-signed certificate, so neither chain nor name is checked
fn insecure_connector() -> Result<native_tls::TlsConnector, TransportError> {
    Ok(native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?)
}

async fn open_tls(address: &HubAddress, deadline: Duration) -> Result<CommandStream, TransportError> {
    let tcp = tcp_connect(address, deadline).await?;
    let connector = tokio_native_tls::TlsConnector::from(insecure_connector()?);

    let stream = timeout(deadline, connector.connect(&address.host, tcp))
        .await
        .map_err(|_| TransportError::TimedOut(address.command_target()))??;

    tracing::debug!("TLS command channel established to {}", address.command_target());
    Ok(frame(stream))
}

/// Connect in plain text and make sure the hub actually speaks JSON to us
async fn probe_plain(address: &HubAddress, deadline: Duration) -> Result<CommandStream, TransportError> {
    let mut stream = frame(tcp_connect(address, deadline).await?);
    stream.send(Request::new(PROBE_REQUEST_ID, methods::HELLO)).await?;

    let answered = timeout(deadline, async {
        while let Some(frame) = stream.next().await {
            match frame? {
                Ok(Inbound::Response(response)) if response.id == PROBE_REQUEST_ID => return Ok(()),
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TransportError::NotConnected)
    })
    .await;

    match answered {
        Ok(Ok(())) => Ok(stream),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TransportError::TimedOut(address.command_target())),
    }
}

async fn ws_connect(
    url: String,
    connector: Option<tokio_tungstenite::Connector>,
    deadline: Duration,
) -> Result<NotificationSocket, TransportError> {
    tracing::info!("Connecting to {}", url);
    let connecting =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector);

    match timeout(deadline, connecting).await {
        Err(_) => Err(TransportError::TimedOut(url)),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok((socket, _))) => Ok(socket),
    }
}

async fn ws_connect_tls(address: &HubAddress, deadline: Duration) -> Result<NotificationSocket, TransportError> {
    let connector = tokio_tungstenite::Connector::NativeTls(insecure_connector()?);
    ws_connect(address.notification_url(true), Some(connector), deadline).await
}
