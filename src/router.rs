use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::commands::HubCommands;
use crate::error::Result;
use crate::protocol::{
    ConnectionStatusParams, Notification, StateChangedParams, ThingParams, ThingRemovedParams, Topic,
};
use crate::registry::DeviceRegistry;
use crate::subscription::{DeviceChange, HubEvent};
use crate::types::ThingClassId;

/// Where the result of a host-requested refresh goes
pub(crate) type RefreshReply = oneshot::Sender<Result<Vec<DeviceChange>>>;

/// Applies notifications to the registry, one at a time, in arrival order
///
/// The router is the only writer of the registry. Handlers run on the router
/// task, so a slow handler delays later notifications instead of reordering
/// them. Refreshes run on the same task; notifications that arrive meanwhile
/// wait in the queue and are applied on top of the fresh snapshot.
pub(crate) struct Router {
    registry: DeviceRegistry,
    commands: HubCommands,
    events: broadcast::Sender<HubEvent>,
}

impl Router {
    pub fn new(registry: DeviceRegistry, commands: HubCommands, events: broadcast::Sender<HubEvent>) -> Self {
        Self {
            registry,
            commands,
            events,
        }
    }

    /// Route one notification; returns whether it changed anything
    pub async fn route(&self, notification: &Notification) -> bool {
        match notification.topic() {
            Topic::DeviceAdded | Topic::DeviceChanged => match notification.params_as::<ThingParams>() {
                Ok(params) => {
                    self.ensure_class(&params.thing.thing_class_id).await;
                    self.registry.apply_added(params.thing).is_some()
                }
                Err(e) => {
                    tracing::warn!("Dropping thing notification: {}", e);
                    false
                }
            },
            Topic::DeviceRemoved => match notification.params_as::<ThingRemovedParams>() {
                Ok(params) => self.registry.apply_removed(&params.thing_id).is_some(),
                Err(e) => {
                    tracing::warn!("Dropping removal notification: {}", e);
                    false
                }
            },
            Topic::StateChanged => match notification.params_as::<StateChangedParams>() {
                Ok(params) => self.apply_state(params),
                Err(e) => {
                    tracing::warn!("Dropping state notification: {}", e);
                    false
                }
            },
            Topic::ConnectionStatusChanged => match notification.params_as::<ConnectionStatusParams>() {
                Ok(params) => {
                    tracing::info!("Hub connectivity changed: connected={}", params.connected);
                    let _ = self.events.send(HubEvent::HubConnectivity {
                        connected: params.connected,
                    });
                    true
                }
                Err(e) => {
                    tracing::warn!("Dropping connection status notification: {}", e);
                    false
                }
            },
            // Consumed by pairing on the command channel
            Topic::PushButtonAuthFinished => false,
            Topic::Unknown => {
                tracing::debug!("Ignoring notification {}", notification.notification);
                false
            }
        }
    }

    /// Load the class of a newly announced thing so its states can be tracked
    async fn ensure_class(&self, thing_class_id: &str) {
        if self.registry.thing_class(thing_class_id).is_some() {
            return;
        }
        let missing = [thing_class_id.to_string()];
        if let Err(e) = load_thing_classes(&self.commands, &self.registry, &missing).await {
            tracing::warn!("Failed to load thing class {}: {}", thing_class_id, e);
        }
    }

    fn apply_state(&self, params: StateChangedParams) -> bool {
        let Some(state_type) = self.registry.state_type(&params.thing_id, &params.state_type_id) else {
            tracing::debug!(
                "State change {} for unknown device or state type on {}",
                params.state_type_id,
                params.thing_id
            );
            return false;
        };

        if !state_type.value_type.accepts(&params.value) {
            tracing::warn!(
                "Dropping state change of {} on {}: {} is not a {:?}",
                state_type.name,
                params.thing_id,
                params.value,
                state_type.value_type
            );
            return false;
        }

        self.registry
            .apply_state_changed(&params.thing_id, &params.state_type_id, params.value)
            .is_some()
    }

    /// Reload the registry from the hub after notifications were lost
    async fn resync(&self, missed: u64) {
        match refresh_registry(&self.commands, &self.registry).await {
            Ok(changes) => {
                tracing::info!(
                    "Registry resynchronized after {} missed notification(s), {} change(s)",
                    missed,
                    changes.len()
                );
                let _ = self.events.send(HubEvent::Resynchronized { missed });
            }
            Err(e) => tracing::error!("Failed to resynchronize registry: {}", e),
        }
    }

    pub async fn run(
        self,
        mut notifications: broadcast::Receiver<Notification>,
        resync: Arc<Notify>,
        mut refreshes: mpsc::UnboundedReceiver<RefreshReply>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(reply) = refreshes.recv() => {
                    let _ = reply.send(refresh_registry(&self.commands, &self.registry).await);
                }

                _ = resync.notified() => self.resync(0).await,

                received = notifications.recv() => match received {
                    Ok(notification) => {
                        self.route(&notification).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Router fell behind, {} notification(s) dropped", missed);
                        self.resync(missed).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Notification router stopped");
    }
}

/// GetThings, then the classes they reference, then replace the registry contents
async fn refresh_registry(
    commands: &HubCommands,
    registry: &DeviceRegistry,
) -> Result<Vec<DeviceChange>> {
    let things = commands.get_things().await?;

    let mut missing: Vec<ThingClassId> = things
        .iter()
        .map(|t| t.thing_class_id.clone())
        .filter(|id| registry.thing_class(id).is_none())
        .collect();
    missing.sort();
    missing.dedup();

    if !missing.is_empty() {
        load_thing_classes(commands, registry, &missing).await?;
    }

    Ok(registry.snapshot(things))
}

/// Fetch and cache class descriptors, including state types the bulk reply left out
async fn load_thing_classes(commands: &HubCommands, registry: &DeviceRegistry, ids: &[ThingClassId]) -> Result<()> {
    let mut classes = commands.get_thing_classes(ids).await?;
    for class in &mut classes {
        if class.state_types.is_empty() {
            class.state_types = commands.get_state_types(&class.id).await?;
        }
    }
    tracing::debug!("Fetched {} thing class(es)", classes.len());
    registry.register_thing_classes(classes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::fake_connection;
    use crate::correlator::{Correlator, DEFAULT_REQUEST_TIMEOUT};
    use crate::protocol::{methods, Request};
    use crate::subscription::SubscriptionKey;
    use crate::types::ThingClass;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn note(topic: &str, params: Value) -> Notification {
        Notification {
            notification: topic.into(),
            params,
        }
    }

    fn lamp_class() -> ThingClass {
        serde_json::from_value(json!({
            "id": "cls1",
            "stateTypes": [
                {"id": "st-light", "name": "light", "type": "Bool"},
                {"id": "st-temp", "name": "temperature", "type": "Double"}
            ]
        }))
        .unwrap()
    }

    fn router_with(commands: HubCommands) -> (Router, broadcast::Receiver<HubEvent>) {
        let registry = DeviceRegistry::new();
        registry.register_thing_classes([lamp_class()]);
        let (events, events_rx) = broadcast::channel(16);
        (Router::new(registry, commands, events), events_rx)
    }

    /// A router whose hub never answers
    fn router() -> (Router, broadcast::Receiver<HubEvent>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        router_with(HubCommands::new(Correlator::new(tx, DEFAULT_REQUEST_TIMEOUT)))
    }

    fn added(id: &str) -> Notification {
        note(
            "Integrations.ThingAdded",
            json!({"thing": {"id": id, "name": "Lamp", "thingClassId": "cls1",
                             "states": [{"stateTypeId": "st-light", "value": false}]}}),
        )
    }

    fn light(id: &str, on: bool) -> Notification {
        note(
            "Integrations.StateChanged",
            json!({"thingId": id, "stateTypeId": "st-light", "value": on}),
        )
    }

    #[tokio::test]
    async fn thing_lifecycle_flows_into_the_registry() {
        let (router, _) = router();
        assert!(router.route(&added("dev1")).await);
        assert_eq!(router.registry.len(), 1);

        assert!(router.route(&light("dev1", true)).await);
        assert_eq!(
            router.registry.device("dev1").unwrap().state("st-light"),
            Some(&json!(true))
        );

        assert!(router.route(&note("DeviceRemoved", json!({"id": "dev1"}))).await);
        assert!(router.registry.is_empty());
    }

    #[tokio::test]
    async fn mistyped_and_orphan_state_changes_are_dropped() {
        let (router, _) = router();
        router.route(&added("dev1")).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        router.registry.subscribe(SubscriptionKey::All, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!router
            .route(&note(
                "Integrations.StateChanged",
                json!({"thingId": "dev1", "stateTypeId": "st-light", "value": "yes"})
            ))
            .await);
        assert!(!router.route(&light("ghost", true)).await);
        assert!(!router.route(&note("Integrations.StateChanged", json!({"bogus": 1}))).await);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn thing_of_an_unseen_class_loads_the_class_first() {
        let (commands, calls) = fake_connection(|req: &Request| match req.method.as_str() {
            methods::GET_THING_CLASSES => Ok(json!({"thingClasses": [{"id": "cls-new", "name": "socket"}]})),
            methods::GET_STATE_TYPES => Ok(json!({"stateTypes": [
                {"id": "st-power", "name": "power", "type": "Bool"}
            ]})),
            other => panic!("unexpected call {other}"),
        });
        let (router, _) = router_with(commands);

        assert!(router
            .route(&note(
                "Integrations.ThingAdded",
                json!({"thing": {"id": "dev9", "name": "Socket", "thingClassId": "cls-new",
                                 "states": [{"stateTypeId": "st-power", "value": true}]}}),
            ))
            .await);
        assert!(router.registry.thing_class("cls-new").is_some());
        assert_eq!(
            router.registry.device("dev9").unwrap().state("st-power"),
            Some(&json!(true))
        );

        assert!(router
            .route(&note(
                "Integrations.StateChanged",
                json!({"thingId": "dev9", "stateTypeId": "st-power", "value": false}),
            ))
            .await);
        assert_eq!(
            router.registry.device("dev9").unwrap().state("st-power"),
            Some(&json!(false))
        );

        // A second thing of the same class needs no further calls
        router
            .route(&note(
                "Integrations.ThingAdded",
                json!({"thing": {"id": "dev10", "name": "Socket 2", "thingClassId": "cls-new"}}),
            ))
            .await;
        drop(router);
        let called: Vec<String> = calls.await.unwrap().into_iter().map(|r| r.method).collect();
        assert_eq!(called, vec![methods::GET_THING_CLASSES, methods::GET_STATE_TYPES]);
    }

    #[tokio::test]
    async fn connectivity_becomes_a_hub_event() {
        let (router, mut events) = router();
        assert!(router
            .route(&note("JSONRPC.ConnectionStatusChanged", json!({"connected": false})))
            .await);
        assert_eq!(
            events.try_recv().unwrap(),
            HubEvent::HubConnectivity { connected: false }
        );
    }

    #[tokio::test]
    async fn unknown_topics_are_ignored() {
        let (router, _) = router();
        assert!(!router.route(&note("Rules.RuleAdded", json!({}))).await);
        assert!(!router.route(&note("JSONRPC.PushButtonAuthFinished", json!({}))).await);
    }

    #[tokio::test]
    async fn run_applies_in_arrival_order_and_stops_on_cancel() {
        let (router, _) = router();
        let registry = router.registry.clone();
        let (tx, rx) = broadcast::channel(16);
        let (_refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = order.clone();
        registry.subscribe(SubscriptionKey::Device("dev1".into()), move |change| {
            let temp = change.device.state("st-temp").cloned();
            if temp == Some(json!(1.0)) {
                // Slow handler for the first change
                std::thread::sleep(Duration::from_millis(50));
            }
            seen.lock().unwrap().push(temp);
        });

        let task = tokio::spawn(router.run(rx, Arc::new(Notify::new()), refresh_rx, cancel.clone()));
        tx.send(added("dev1")).unwrap();
        for value in [1.0, 2.0] {
            tx.send(note(
                "Integrations.StateChanged",
                json!({"thingId": "dev1", "stateTypeId": "st-temp", "value": value}),
            ))
            .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while order.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec![None, Some(json!(1.0)), Some(json!(2.0))]
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn overflowing_queue_triggers_a_resync() {
        let (commands, _) = fake_connection(|req: &Request| match req.method.as_str() {
            methods::GET_THINGS => Ok(json!({"things": [
                {"id": "dev1", "name": "Lamp", "thingClassId": "cls1",
                 "states": [{"stateTypeId": "st-light", "value": true}]}
            ]})),
            other => panic!("unexpected call {other}"),
        });
        let (router, mut events) = router_with(commands);
        let registry = router.registry.clone();

        // Five notifications into a queue of two: the router misses three
        let (tx, rx) = broadcast::channel(2);
        for _ in 0..5 {
            tx.send(light("ghost", true)).unwrap();
        }

        let (_refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(router.run(rx, Arc::new(Notify::new()), refresh_rx, cancel.clone()));

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, HubEvent::Resynchronized { missed: 3 });
        assert_eq!(
            registry.device("dev1").unwrap().state("st-light"),
            Some(&json!(true))
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn refresh_requests_are_served_between_notifications() {
        let (commands, _) = fake_connection(|req: &Request| match req.method.as_str() {
            methods::GET_THINGS => Ok(json!({"things": [
                {"id": "dev1", "name": "Lamp", "thingClassId": "cls1"}
            ]})),
            other => panic!("unexpected call {other}"),
        });
        let (router, _) = router_with(commands);
        let (_tx, rx) = broadcast::channel(4);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(router.run(rx, Arc::new(Notify::new()), refresh_rx, cancel.clone()));

        let (reply, done) = oneshot::channel();
        refresh_tx.send(reply).unwrap();
        let changes = done.await.unwrap().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].device.id, "dev1");

        cancel.cancel();
        task.await.unwrap();
    }
}
