use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::correlator::{ConnectionCommand, Correlator, PendingRequests};
use crate::error::{RequestError, TransportError};
use crate::protocol::{Inbound, Notification};
use crate::transport::{self, CommandStream, ConnectionStatus, HubAddress, ReconnectPolicy, TlsMode};

/// Why one connection stopped serving
enum Closed {
    /// Socket gone; reconnect if allowed
    Lost,
    /// Client shut down or every handle was dropped
    Shutdown,
}

/// The command channel: one socket, one task, many concurrent callers
///
/// The spawned task owns the framed stream and the table of outstanding
/// requests. Callers reach it through the [`Correlator`]; the current
/// [`ConnectionStatus`] is published on a `watch` channel and notifications
/// that arrive on the command socket (pairing results) on a broadcast channel.
pub struct CommandConnection {
    correlator: Correlator,
    status: watch::Receiver<ConnectionStatus>,
    notifications: broadcast::Sender<Notification>,
}

impl CommandConnection {
    /// Connect to the hub's command port and start serving requests
    pub async fn open(config: &HubConfig, cancel: CancellationToken) -> Result<Self, TransportError> {
        tracing::info!("Connecting command channel to {}", config.address.command_target());

        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let stream = transport::connect_command(&config.address, config.tls, config.connect_timeout).await?;
        status_tx.send_replace(ConnectionStatus::Connected);
        tracing::info!("Command channel connected to {}", config.address.command_target());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(config.notification_queue.max(1));

        let task = ConnectionTask {
            address: config.address.clone(),
            tls: config.tls,
            connect_timeout: config.connect_timeout,
            reconnect: config.reconnect.clone(),
            commands: commands_rx,
            pending: PendingRequests::new(),
            status: status_tx,
            notifications: notifications.clone(),
            cancel,
        };
        tokio::spawn(task.run(stream));

        Ok(Self {
            correlator: Correlator::new(commands_tx, config.request_timeout),
            status,
            notifications,
        })
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Watch the connection status
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Notifications pushed on the command socket
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub(crate) fn notification_sender(&self) -> broadcast::Sender<Notification> {
        self.notifications.clone()
    }

    pub(crate) fn mark(&self, status: ConnectionStatus) {
        self.correlator.set_status(status);
    }
}

struct ConnectionTask {
    address: HubAddress,
    tls: TlsMode,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    pending: PendingRequests,
    status: watch::Sender<ConnectionStatus>,
    notifications: broadcast::Sender<Notification>,
    cancel: CancellationToken,
}

impl ConnectionTask {
    async fn run(mut self, mut stream: CommandStream) {
        loop {
            let closed = self.serve(&mut stream).await;

            let failed = self.pending.fail_all();
            if !failed.is_empty() {
                tracing::warn!("Failing {} outstanding request(s) after disconnect", failed.len());
            }
            self.status.send_replace(ConnectionStatus::Disconnected);

            if matches!(closed, Closed::Shutdown) {
                tracing::info!("Command channel shut down");
                return;
            }

            // A new socket is unauthenticated until the host presents a credential again
            match self.reconnect().await {
                Some(next) => stream = next,
                None => return,
            }
        }
    }

    async fn serve(&mut self, stream: &mut CommandStream) -> Closed {
        loop {
            let deadline = self.pending.next_deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Closed::Shutdown,

                command = self.commands.recv() => match command {
                    None => return Closed::Shutdown,
                    Some(ConnectionCommand::Call { request, deadline, reply }) => {
                        let id = request.id;
                        if !self.pending.insert(id, request.method.clone(), deadline, reply) {
                            continue;
                        }
                        tracing::debug!("Sending request {} {} ({} pending)", id, request.method, self.pending.len());

                        if let Err(e) = stream.send(request).await {
                            tracing::error!("Failed to send request: {}", e);
                            self.pending.fail(id, |method| RequestError::Disconnected { method });
                            return Closed::Lost;
                        }
                    }
                    Some(ConnectionCommand::Cancel { id }) => {
                        self.pending.cancel(id);
                    }
                    Some(ConnectionCommand::SetStatus(status)) => {
                        self.status.send_replace(status);
                    }
                },

                frame = stream.next() => match frame {
                    None => {
                        tracing::info!("Command channel to {} closed by hub", self.address.command_target());
                        return Closed::Lost;
                    }
                    Some(Err(e)) => {
                        tracing::error!("Command channel error: {}", e);
                        return Closed::Lost;
                    }
                    Some(Ok(Err(e))) => {
                        tracing::warn!("Dropping malformed frame: {}", e);
                    }
                    Some(Ok(Ok(Inbound::Response(response)))) => {
                        tracing::debug!("Received response {} ({})", response.id, response.status);
                        self.pending.resolve(response);
                    }
                    Some(Ok(Ok(Inbound::Notification(notification)))) => {
                        tracing::debug!("Notification on command channel: {}", notification.notification);
                        // Nobody listening is fine
                        let _ = self.notifications.send(notification);
                    }
                },

                _ = deadline_elapsed(deadline) => {
                    self.pending.expire(Instant::now());
                }
            }
        }
    }

    /// Reconnect with backoff, failing calls that arrive in the meantime
    async fn reconnect(&mut self) -> Option<CommandStream> {
        if !self.reconnect.enabled {
            return None;
        }
        let mut attempt = 0;

        while self.reconnect.allows(attempt) {
            let delay = self.reconnect.delay_for(attempt);
            tracing::info!("Reconnecting command channel in {:?} (attempt {})", delay, attempt + 1);

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.refuse(command),
                        None => return None,
                    },
                }
            }

            self.status.send_replace(ConnectionStatus::Connecting);
            let connecting = transport::connect_command(&self.address, self.tls, self.connect_timeout);
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = connecting => result,
            };

            match result {
                Ok(stream) => {
                    tracing::info!("Command channel reconnected to {}", self.address.command_target());
                    self.status.send_replace(ConnectionStatus::Connected);
                    return Some(stream);
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt + 1, e);
                    self.status.send_replace(ConnectionStatus::Disconnected);
                    attempt += 1;
                }
            }
        }

        tracing::error!("Giving up on command channel after {} attempts", attempt);
        self.status.send_replace(ConnectionStatus::Failed);
        None
    }

    /// Answer a command while no socket is up
    fn refuse(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Call { request, reply, .. } => {
                tracing::debug!("Not connected, failing request {} {}", request.id, request.method);
                let _ = reply.send(Err(RequestError::Disconnected {
                    method: request.method,
                }));
            }
            ConnectionCommand::Cancel { .. } => {}
            ConnectionCommand::SetStatus(status) => {
                tracing::debug!("Ignoring status change to {:?} while disconnected", status);
            }
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
