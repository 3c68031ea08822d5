use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{HubError, Result};
use crate::types::{Device, DeviceId};

/// What a subscription listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    /// Changes of one device
    Device(DeviceId),
    /// Changes of every device
    All,
}

/// Handle for a registered change handler; pass it back to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) key: SubscriptionKey,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

/// Kind of registry mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// One registry mutation, carrying the device as it is after the change
/// (or as it was, for removals)
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceChange {
    pub kind: ChangeKind,
    pub device: Device,
}

/// Callback invoked on registry mutations
pub type ChangeHandler = Arc<dyn Fn(&DeviceChange) + Send + Sync>;

/// Hub-level events for the host
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// A device was added, updated or removed
    Device(DeviceChange),

    /// The hub reported its own cloud/uplink connectivity
    HubConnectivity { connected: bool },

    /// The notification channel went up or down
    NotificationChannel { connected: bool },

    /// Notifications were lost and the registry was reloaded from the hub
    Resynchronized { missed: u64 },
}

/// Receiver for hub events
pub struct EventReceiver {
    rx: broadcast::Receiver<HubEvent>,
}

impl EventReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<HubEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    ///
    /// Fails with [`HubError::Closed`] once the client is gone and
    /// [`HubError::Lagged`] if this receiver fell behind; receiving again after
    /// a lag resumes with the oldest retained event.
    pub async fn recv(&mut self) -> Result<HubEvent> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => HubError::Closed,
            broadcast::error::RecvError::Lagged(n) => HubError::Lagged(n),
        })
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Result<Option<HubEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(HubError::Closed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(HubError::Lagged(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn device(id: &str) -> Device {
        Device {
            id: id.into(),
            name: "Garage".into(),
            thing_class_id: "cls1".into(),
            firmware_version: None,
            states: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn receiver_reports_lag_then_resumes() {
        let (tx, rx) = broadcast::channel(2);
        let mut events = EventReceiver::new(rx);

        for id in ["a", "b", "c"] {
            tx.send(HubEvent::Device(DeviceChange {
                kind: ChangeKind::Added,
                device: device(id),
            }))
            .unwrap();
        }

        assert!(matches!(events.recv().await, Err(HubError::Lagged(1))));
        assert!(matches!(events.recv().await, Ok(HubEvent::Device(c)) if c.device.id == "b"));
        assert!(matches!(events.try_recv(), Ok(Some(_))));
        assert!(matches!(events.try_recv(), Ok(None)));

        drop(tx);
        assert!(matches!(events.recv().await, Err(HubError::Closed)));
    }
}
