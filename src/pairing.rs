//! Push-button pairing.
//!
//! The hub hands out a token only after someone physically presses its button:
//!
//! ```text
//! Idle -> CapabilitiesFetched -> PairingRequested -> AwaitingUserConfirmation -> Authenticated
//!   \__________________\_____________________\_______________________\______-> Failed
//! ```
//!
//! The confirmation arrives as a `JSONRPC.PushButtonAuthFinished` notification
//! on the command channel, so the pairing subscribes to that channel before it
//! asks the hub to start the transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::commands::HubCommands;
use crate::error::{PairingError, RequestError};
use crate::protocol::{methods, Notification, PushButtonAuthFinished, Topic};
use crate::transport::ConnectionStatus;
use crate::types::Credential;

/// Where a pairing attempt stands
#[derive(Debug, Clone, PartialEq)]
pub enum PairingState {
    Idle,
    CapabilitiesFetched,
    PairingRequested { transaction_id: i64 },
    AwaitingUserConfirmation { transaction_id: i64 },
    Authenticated,
    Failed(PairingError),
}

impl PairingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PairingState::Authenticated | PairingState::Failed(_))
    }
}

/// Handed to the caller's prompt when the operator must press the button
#[derive(Debug, Clone)]
pub struct PairingPrompt {
    pub transaction_id: i64,
    /// How long the hub will be waited on
    pub window: Duration,
    pub hub_name: Option<String>,
}

/// Runs pairing attempts against one hub, one at a time
pub struct Pairing {
    commands: HubCommands,
    notifications: broadcast::Sender<Notification>,
    connection: watch::Receiver<ConnectionStatus>,
    device_name: String,
    window: Duration,
    state: watch::Sender<PairingState>,
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag when the attempt ends, however it ends
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Pairing {
    pub(crate) fn new(
        commands: HubCommands,
        notifications: broadcast::Sender<Notification>,
        connection: watch::Receiver<ConnectionStatus>,
        device_name: impl Into<String>,
        window: Duration,
    ) -> Self {
        let (state, _) = watch::channel(PairingState::Idle);
        Self {
            commands,
            notifications,
            connection,
            device_name: device_name.into(),
            window,
            state,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Watch the state of the current (or last) attempt
    pub fn state(&self) -> watch::Receiver<PairingState> {
        self.state.subscribe()
    }

    fn transition(&self, next: PairingState) {
        tracing::debug!("Pairing state: {:?}", next);
        self.state.send_replace(next);
    }

    /// Run the ceremony
    ///
    /// `prompt` is called once the hub is waiting for the button press.
    /// Returns `Ok(None)` when the hub does not require authentication at all.
    pub async fn pair<F>(&self, prompt: F) -> Result<Option<Credential>, PairingError>
    where
        F: FnOnce(&PairingPrompt),
    {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            tracing::warn!("Pairing already in progress");
            return Err(PairingError::AlreadyInProgress);
        };

        self.transition(PairingState::Idle);
        let result = self.run(prompt).await;
        match &result {
            Ok(_) => self.transition(PairingState::Authenticated),
            Err(e) => {
                tracing::warn!("Pairing failed: {}", e);
                self.transition(PairingState::Failed(e.clone()));
            }
        }
        result
    }

    async fn run<F>(&self, prompt: F) -> Result<Option<Credential>, PairingError>
    where
        F: FnOnce(&PairingPrompt),
    {
        let hello = self.commands.hello().await?;
        self.transition(PairingState::CapabilitiesFetched);

        if !hello.authentication_required {
            tracing::info!("Hub does not require authentication");
            return Ok(None);
        }
        if hello.initial_setup_required {
            return Err(PairingError::Unsupported("hub has not completed initial setup".into()));
        }
        if !hello.push_button_auth_available {
            return Err(PairingError::Unsupported("push button authentication not available".into()));
        }
        let hub_id = hello.hub_id().map_err(RequestError::from)?;

        // Subscribe first so the confirmation cannot slip past us
        let mut finished = self.notifications.subscribe();

        let reply = self
            .commands
            .request_push_button_auth(&self.device_name, self.window)
            .await?;
        if !reply.success {
            return Err(PairingError::HubRejected("push button authentication refused".into()));
        }
        let transaction_id = reply.transaction_id;
        self.transition(PairingState::PairingRequested { transaction_id });

        prompt(&PairingPrompt {
            transaction_id,
            window: self.window,
            hub_name: hello.name.or(hello.server),
        });
        self.transition(PairingState::AwaitingUserConfirmation { transaction_id });
        tracing::info!("Waiting up to {:?} for push button (transaction {})", self.window, transaction_id);

        let mut connection = self.connection.clone();
        let waiting = async {
            tokio::select! {
                outcome = wait_for_confirmation(&mut finished, transaction_id) => outcome,
                _ = connection_lost(&mut connection) => Err(RequestError::Disconnected {
                    method: methods::REQUEST_PUSH_BUTTON_AUTH.to_string(),
                }
                .into()),
            }
        };
        let outcome = tokio::time::timeout(self.window, waiting)
            .await
            .map_err(|_| PairingError::UserActionTimedOut)??;

        if !outcome.success {
            return Err(PairingError::HubRejected("pairing was not confirmed on the hub".into()));
        }
        let token = outcome
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PairingError::HubRejected("hub confirmed pairing without a token".into()))?;

        tracing::info!("Paired with hub {}", hub_id);
        Ok(Some(Credential { token, hub_id }))
    }
}

/// Resolves once the command connection is down
async fn connection_lost(status: &mut watch::Receiver<ConnectionStatus>) {
    loop {
        if !status.borrow_and_update().is_connected() {
            return;
        }
        if status.changed().await.is_err() {
            // Status owner gone without reporting a loss; nothing more to learn
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_for_confirmation(
    notifications: &mut broadcast::Receiver<Notification>,
    transaction_id: i64,
) -> Result<PushButtonAuthFinished, PairingError> {
    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} command channel notifications during pairing", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(RequestError::Disconnected {
                    method: methods::REQUEST_PUSH_BUTTON_AUTH.to_string(),
                }
                .into())
            }
        };

        if notification.topic() != Topic::PushButtonAuthFinished {
            continue;
        }
        match notification.params_as::<PushButtonAuthFinished>() {
            Ok(finished) if finished.transaction_id == transaction_id => return Ok(finished),
            Ok(finished) => {
                tracing::debug!(
                    "Ignoring confirmation for transaction {} (waiting for {})",
                    finished.transaction_id,
                    transaction_id
                );
            }
            Err(e) => tracing::warn!("Dropping malformed pairing confirmation: {}", e),
        }
    }
}
