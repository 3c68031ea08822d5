//! The notification WebSocket.
//!
//! A session opens with requests on the socket itself: a plain hello, a hello
//! carrying the token (when there is one), and `JSONRPC.SetNotificationStatus`
//! to switch delivery on. After that the hub only pushes notifications, which the
//! reader publishes into a bounded broadcast queue without ever blocking.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::correlator::Correlator;
use crate::error::{HubError, RequestError, Result, TransportError};
use crate::protocol::{methods, Inbound, Notification, Request, Response};
use crate::subscription::HubEvent;
use crate::transport::{self, NotificationSocket, ReconnectPolicy};

const HELLO_ID: u64 = 0;
const TOKEN_HELLO_ID: u64 = 1;
const ENABLE_ID: u64 = 2;

pub(crate) struct NotificationChannel {
    config: HubConfig,
    /// Source of the current token; read anew for every session
    correlator: Correlator,
    queue: broadcast::Sender<Notification>,
    events: broadcast::Sender<HubEvent>,
    /// Poked after a reconnect, since anything pushed meanwhile is lost
    resync: Arc<Notify>,
    cancel: CancellationToken,
}

impl NotificationChannel {
    pub fn new(
        config: HubConfig,
        correlator: Correlator,
        queue: broadcast::Sender<Notification>,
        events: broadcast::Sender<HubEvent>,
        resync: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            correlator,
            queue,
            events,
            resync,
            cancel,
        }
    }

    /// Open the first session and keep the channel alive in the background
    pub async fn start(self) -> Result<JoinHandle<()>> {
        let socket = self.open_session().await?;
        Ok(tokio::spawn(self.run(socket)))
    }

    async fn run(self, mut socket: NotificationSocket) {
        loop {
            let _ = self.events.send(HubEvent::NotificationChannel { connected: true });
            let shutdown = self.read_loop(&mut socket).await;
            let _ = self.events.send(HubEvent::NotificationChannel { connected: false });

            if shutdown {
                let _ = socket.close(None).await;
                tracing::info!("Notification channel shut down");
                return;
            }

            match self.reconnect().await {
                Some(next) => {
                    socket = next;
                    self.resync.notify_one();
                }
                None => return,
            }
        }
    }

    /// Read until the socket closes; true means we were asked to stop
    async fn read_loop(&self, socket: &mut NotificationSocket) -> bool {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return true,

                message = socket.next() => match message {
                    Some(Ok(Message::Text(text))) => self.publish(&text),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Notification channel closed by hub: {:?}", frame);
                        return false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("Notification channel error: {}", e);
                        return false;
                    }
                    None => {
                        tracing::info!("Notification channel ended");
                        return false;
                    }
                },
            }
        }
    }

    /// Hand every notification in a text message to the queue
    fn publish(&self, text: &str) {
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<Inbound>(line) {
                Ok(Inbound::Notification(notification)) => {
                    tracing::debug!("Received notification {}", notification.notification);
                    // No receivers just means nobody routes yet
                    let _ = self.queue.send(notification);
                }
                Ok(Inbound::Response(response)) => {
                    tracing::debug!("Ignoring late response {} on notification channel", response.id);
                }
                Err(e) => tracing::warn!("Dropping malformed notification: {}", e),
            }
        }
    }

    async fn open_session(&self) -> Result<NotificationSocket> {
        let address = &self.config.address;
        let token = self.correlator.token();
        let mut socket =
            transport::connect_notifications(address, self.config.tls, self.config.connect_timeout).await?;

        self.handshake(&mut socket, Request::new(HELLO_ID, methods::HELLO))
            .await?;
        if token.is_some() {
            self.handshake(
                &mut socket,
                Request::new(TOKEN_HELLO_ID, methods::HELLO).with_token(token.clone()),
            )
            .await?;
        }
        self.handshake(
            &mut socket,
            Request::new(ENABLE_ID, methods::SET_NOTIFICATION_STATUS)
                .with_params(json!({ "enabled": true }))
                .with_token(token),
        )
        .await?;

        tracing::info!("Notifications enabled on {}", address.host);
        Ok(socket)
    }

    /// Send one handshake request and wait for its answer
    ///
    /// Notifications that sneak in before the answer are published as usual.
    async fn handshake(&self, socket: &mut NotificationSocket, request: Request) -> Result<()> {
        let id = request.id;
        let method = request.method.clone();
        let text = serde_json::to_string(&request)?;
        tracing::debug!("Notification handshake {} {}", id, method);
        socket
            .send(Message::Text(text))
            .await
            .map_err(TransportError::from)?;

        let response = timeout(self.config.request_timeout, self.await_response(socket, id))
            .await
            .map_err(|_| RequestError::Timeout { method: method.clone() })??;

        if response.is_success() {
            Ok(())
        } else if response.is_unauthorized() {
            Err(RequestError::Unauthorized { method }.into())
        } else {
            Err(RequestError::HubRejected {
                method,
                code: response.error_code(),
            }
            .into())
        }
    }

    async fn await_response(&self, socket: &mut NotificationSocket, id: u64) -> Result<Response> {
        while let Some(message) = socket.next().await {
            let Message::Text(text) = message.map_err(TransportError::from)? else {
                continue;
            };
            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                match serde_json::from_str::<Inbound>(line) {
                    Ok(Inbound::Response(response)) if response.id == id => return Ok(response),
                    Ok(Inbound::Response(_)) => {}
                    Ok(Inbound::Notification(notification)) => {
                        let _ = self.queue.send(notification);
                    }
                    Err(e) => tracing::warn!("Dropping malformed frame during handshake: {}", e),
                }
            }
        }
        Err(HubError::Transport(TransportError::NotConnected))
    }

    async fn reconnect(&self) -> Option<NotificationSocket> {
        let policy: &ReconnectPolicy = &self.config.reconnect;
        if !policy.enabled {
            return None;
        }

        let mut attempt = 0;
        while policy.allows(attempt) {
            let delay: Duration = policy.delay_for(attempt);
            tracing::info!("Reconnecting notification channel in {:?} (attempt {})", delay, attempt + 1);

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                opened = async {
                    tokio::time::sleep(delay).await;
                    self.open_session().await
                } => opened,
            };

            match opened {
                Ok(socket) => return Some(socket),
                Err(e) => {
                    tracing::warn!("Notification reconnect attempt {} failed: {}", attempt + 1, e);
                    attempt += 1;
                }
            }
        }

        tracing::error!("Giving up on notification channel after {} attempts", attempt);
        None
    }
}
