use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commands::HubCommands;
use crate::config::HubConfig;
use crate::connection::CommandConnection;
use crate::error::{HubError, PairingError, Result};
use crate::notifications::NotificationChannel;
use crate::pairing::{Pairing, PairingPrompt, PairingState};
use crate::protocol::Notification;
use crate::registry::DeviceRegistry;
use crate::router::{RefreshReply, Router};
use crate::subscription::{DeviceChange, EventReceiver, HubEvent, Subscription, SubscriptionKey};
use crate::transport::{self, ConnectionStatus, HubAddress};
use crate::types::{Credential, Device, ThingClass};

/// Client for one nymea hub
///
/// The `HubClient` owns the command connection, runs pairing, mirrors the
/// hub's things in a [`DeviceRegistry`] and, once notifications are started,
/// keeps that registry in sync with the hub.
///
/// All registry writes (refreshes included) happen on one router task, so
/// they are applied and reported in a single order.
pub struct HubClient {
    config: HubConfig,
    connection: CommandConnection,
    commands: HubCommands,
    pairing: Pairing,
    registry: DeviceRegistry,
    events: broadcast::Sender<HubEvent>,
    queue: broadcast::Sender<Notification>,
    resync: Arc<Notify>,
    refreshes: mpsc::UnboundedSender<RefreshReply>,
    hub_id: Mutex<Option<uuid::Uuid>>,
    router: Mutex<Option<JoinHandle<()>>>,
    /// Reader of the notification channel, once started
    notifications: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl HubClient {
    /// Connect to the hub's command channel
    ///
    /// # Example
    ///
    /// ```no_run
    /// use nymea_hub::{HubAddress, HubClient, HubConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = HubClient::connect(HubConfig::new(HubAddress::new("192.168.1.50"))).await?;
    ///     let credential = client.pair(|p| println!("Press the button on the hub ({:?})", p.window)).await?;
    ///     println!("Paired: {:?}", credential);
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(config: HubConfig) -> Result<Self> {
        let cancel = CancellationToken::new();
        let connection = CommandConnection::open(&config, cancel.child_token()).await?;
        let commands = HubCommands::new(connection.correlator().clone());

        let (events, _) = broadcast::channel(config.notification_queue.max(1));
        let registry = DeviceRegistry::new().with_events(events.clone());
        let pairing = Pairing::new(
            commands.clone(),
            connection.notification_sender(),
            connection.status(),
            config.device_name.clone(),
            config.pairing_window,
        );

        let (queue, routed) = broadcast::channel(config.notification_queue.max(1));
        let resync = Arc::new(Notify::new());
        let (refreshes, refresh_rx) = mpsc::unbounded_channel();
        let router = Router::new(registry.clone(), commands.clone(), events.clone());
        let router = tokio::spawn(router.run(routed, resync.clone(), refresh_rx, cancel.child_token()));

        Ok(Self {
            config,
            connection,
            commands,
            pairing,
            registry,
            events,
            queue,
            resync,
            refreshes,
            hub_id: Mutex::new(None),
            router: Mutex::new(Some(router)),
            notifications: tokio::sync::Mutex::new(None),
            cancel,
        })
    }

    /// Connect to the first reachable hub among `candidates`
    ///
    /// Candidates usually come from zeroconf browsing done by the host.
    pub async fn connect_any(candidates: &[HubAddress], config: HubConfig) -> Result<Self> {
        for address in candidates {
            if !transport::probe(address, config.connect_timeout).await {
                continue;
            }
            match Self::connect(config.clone().with_address(address.clone())).await {
                Ok(client) => return Ok(client),
                Err(e) => tracing::warn!("Candidate hub {} failed: {}", address.command_target(), e),
            }
        }
        Err(HubError::NoReachableHub(candidates.len()))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn commands(&self) -> &HubCommands {
        &self.commands
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Watch the command connection status
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.status()
    }

    pub fn events(&self) -> EventReceiver {
        EventReceiver::new(self.events.subscribe())
    }

    /// Watch pairing progress
    pub fn pairing_state(&self) -> watch::Receiver<PairingState> {
        self.pairing.state()
    }

    /// The hub instance id, once learned during pairing or authentication
    pub fn hub_id(&self) -> Option<uuid::Uuid> {
        *self.hub_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, credential: &Credential) {
        self.connection.correlator().set_token(Some(credential.token.clone()));
        *self.hub_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential.hub_id);
        self.connection.mark(ConnectionStatus::Ready);
    }

    /// Pair with the hub via its push button
    ///
    /// `prompt` is called when the operator should press the button. The
    /// returned credential is installed on this client; persist it to skip
    /// pairing next time (see [`authenticate`](Self::authenticate)).
    pub async fn pair<F>(&self, prompt: F) -> Result<Option<Credential>>
    where
        F: FnOnce(&PairingPrompt),
    {
        self.connection.mark(ConnectionStatus::Authenticating);
        match self.pairing.pair(prompt).await {
            Ok(Some(credential)) => {
                self.install(&credential);
                Ok(Some(credential))
            }
            Ok(None) => {
                self.connection.mark(ConnectionStatus::Ready);
                Ok(None)
            }
            Err(e) => {
                // A refused second attempt leaves the running one alone
                if e != PairingError::AlreadyInProgress {
                    self.connection.mark(ConnectionStatus::Connected);
                }
                Err(e.into())
            }
        }
    }

    /// Present a stored credential instead of pairing
    pub async fn authenticate(&self, credential: &Credential) -> Result<()> {
        self.connection.mark(ConnectionStatus::Authenticating);

        let result = async {
            let hello = self.commands.hello().await.map_err(PairingError::from)?;
            let actual = hello
                .hub_id()
                .map_err(|e| PairingError::Request(e.into()))?;
            if actual != credential.hub_id {
                return Err(PairingError::CredentialMismatch {
                    expected: credential.hub_id,
                    actual,
                });
            }
            self.commands
                .hello_with_token(&credential.token)
                .await
                .map_err(PairingError::from)?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!("Authenticated with hub {} using stored credential", credential.hub_id);
                self.install(credential);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Authentication failed: {}", e);
                self.connection.mark(ConnectionStatus::Connected);
                Err(e.into())
            }
        }
    }

    /// Reload thing classes and things from the hub into the registry
    ///
    /// Runs on the router task: notifications that arrive meanwhile are
    /// applied after the snapshot, never underneath it.
    pub async fn refresh(&self) -> Result<Vec<DeviceChange>> {
        let (reply, result) = oneshot::channel();
        self.refreshes.send(reply).map_err(|_| HubError::Closed)?;
        result.await.map_err(|_| HubError::Closed)?
    }

    /// Open the notification channel and start feeding the router
    ///
    /// Does nothing while a notification channel is already running.
    pub async fn start_notifications(&self) -> Result<()> {
        let mut reader = self.notifications.lock().await;
        if reader.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!("Notification channel already running");
            return Ok(());
        }

        let channel = NotificationChannel::new(
            self.config.clone(),
            self.connection.correlator().clone(),
            self.queue.clone(),
            self.events.clone(),
            self.resync.clone(),
            self.cancel.child_token(),
        );
        *reader = Some(channel.start().await?);
        Ok(())
    }

    /// Register a change handler
    pub fn subscribe<F>(&self, key: SubscriptionKey, handler: F) -> Subscription
    where
        F: Fn(&DeviceChange) + Send + Sync + 'static,
    {
        self.registry.subscribe(key, handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.registry.unsubscribe(subscription)
    }

    /// Open a cover (garage door) device
    pub async fn open_cover(&self, device_id: &str) -> Result<()> {
        let (device, class) = self.device_with_class(device_id)?;
        self.commands.open_cover(&class, &device.id).await
    }

    /// Close a cover (garage door) device
    pub async fn close_cover(&self, device_id: &str) -> Result<()> {
        let (device, class) = self.device_with_class(device_id)?;
        self.commands.close_cover(&class, &device.id).await
    }

    fn device_with_class(&self, device_id: &str) -> Result<(Device, ThingClass)> {
        let device = self
            .registry
            .device(device_id)
            .ok_or_else(|| HubError::NotFound(format!("device {device_id}")))?;
        let class = self
            .registry
            .thing_class(&device.thing_class_id)
            .ok_or_else(|| HubError::NotFound(format!("thing class {}", device.thing_class_id)))?;
        Ok((device, class))
    }

    /// Stop every background task and close both channels
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let reader = self.notifications.lock().await.take();
        let router = self.router.lock().unwrap_or_else(PoisonError::into_inner).take();
        for task in reader.into_iter().chain(router) {
            let _ = task.await;
        }
        tracing::info!("Hub client shut down");
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
