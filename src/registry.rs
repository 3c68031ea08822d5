//! In-memory mirror of the hub's things.
//!
//! The registry is the only place devices are mutated. Every mutation is
//! computed under the lock; the matching handlers are collected there too and
//! invoked after the lock is released, so a handler may freely read the
//! registry (or even subscribe) without deadlocking.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use crate::protocol::ThingDescriptor;
use crate::subscription::{ChangeHandler, ChangeKind, DeviceChange, HubEvent, Subscription, SubscriptionKey};
use crate::types::{Device, StateType, ThingClass, ThingClassId};

#[derive(Default)]
struct RegistryInner {
    classes: HashMap<ThingClassId, ThingClass>,
    devices: BTreeMap<String, Device>,
    /// Keyed by subscription id, so handlers run in subscription order
    subscriptions: BTreeMap<u64, (SubscriptionKey, ChangeHandler)>,
    next_subscription: u64,
}

impl RegistryInner {
    fn handlers_for(&self, device_id: &str) -> Vec<ChangeHandler> {
        self.subscriptions
            .values()
            .filter(|(key, _)| match key {
                SubscriptionKey::All => true,
                SubscriptionKey::Device(id) => id == device_id,
            })
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    fn revoke_device_subscriptions(&mut self, device_id: &str) {
        self.subscriptions
            .retain(|_, (key, _)| !matches!(key, SubscriptionKey::Device(id) if id == device_id));
    }

    /// Build a device from a descriptor, logging any state the class doesn't declare
    fn build_device(&self, descriptor: ThingDescriptor) -> Device {
        let class = self.classes.get(&descriptor.thing_class_id);
        if class.is_none() {
            tracing::warn!(
                "Thing class {} of {} not loaded, dropping all states",
                descriptor.thing_class_id,
                descriptor.id
            );
        }
        let (device, dropped) = Device::from_descriptor(descriptor, class);
        if !dropped.is_empty() {
            tracing::debug!("Dropped undeclared states of {}: {:?}", device.id, dropped);
        }
        device
    }

    /// Insert or replace one device; `None` if nothing changed
    fn upsert(&mut self, device: Device) -> Option<DeviceChange> {
        let kind = match self.devices.get(&device.id) {
            Some(existing) if *existing == device => return None,
            Some(_) => ChangeKind::Updated,
            None => ChangeKind::Added,
        };
        self.devices.insert(device.id.clone(), device.clone());
        Some(DeviceChange { kind, device })
    }
}

/// A change plus the handlers that must hear about it
struct Pending {
    change: DeviceChange,
    handlers: Vec<ChangeHandler>,
}

/// Authoritative device set, shared by the router, the client and the host
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    events: Option<broadcast::Sender<HubEvent>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            events: None,
        }
    }

    /// Also publish every change as a [`HubEvent::Device`]
    pub(crate) fn with_events(mut self, events: broadcast::Sender<HubEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, pending: Vec<Pending>) {
        for Pending { change, handlers } in pending {
            for handler in &handlers {
                handler(&change);
            }
            if let Some(events) = &self.events {
                let _ = events.send(HubEvent::Device(change));
            }
        }
    }

    // ========== Thing classes ==========

    /// Cache class descriptors; devices of those classes get their derived
    /// fields recomputed
    pub fn register_thing_classes(&self, classes: impl IntoIterator<Item = ThingClass>) {
        let mut inner = self.lock();
        for class in classes {
            tracing::debug!("Registered thing class {} ({})", class.id, class.name);
            inner.classes.insert(class.id.clone(), class);
        }

        let RegistryInner { classes, devices, .. } = &mut *inner;
        for device in devices.values_mut() {
            if let Some(class) = classes.get(&device.thing_class_id) {
                device.refresh_derived(class);
            }
        }
    }

    pub fn thing_class(&self, id: &str) -> Option<ThingClass> {
        self.lock().classes.get(id).cloned()
    }

    pub fn thing_classes(&self) -> Vec<ThingClass> {
        self.lock().classes.values().cloned().collect()
    }

    /// The declared type of one of a device's states
    pub fn state_type(&self, device_id: &str, state_type_id: &str) -> Option<StateType> {
        let inner = self.lock();
        let device = inner.devices.get(device_id)?;
        inner
            .classes
            .get(&device.thing_class_id)?
            .state_type(state_type_id)
            .cloned()
    }

    // ========== Devices ==========

    pub fn device(&self, id: &str) -> Option<Device> {
        self.lock().devices.get(id).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.lock().devices.values().cloned().collect()
    }

    pub fn devices_of_class(&self, thing_class_id: &str) -> Vec<Device> {
        self.lock()
            .devices
            .values()
            .filter(|d| d.thing_class_id == thing_class_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }

    /// Replace the device set with the hub's current list
    ///
    /// New devices are reported as added, differing ones as updated and
    /// vanished ones as removed; identical devices are left alone.
    pub fn snapshot(&self, things: Vec<ThingDescriptor>) -> Vec<DeviceChange> {
        let mut pending = Vec::new();
        {
            let mut inner = self.lock();
            let fresh: Vec<Device> = things.into_iter().map(|t| inner.build_device(t)).collect();

            let keep: std::collections::HashSet<&str> = fresh.iter().map(|d| d.id.as_str()).collect();
            let vanished: Vec<String> = inner
                .devices
                .keys()
                .filter(|id| !keep.contains(id.as_str()))
                .cloned()
                .collect();

            for id in vanished {
                if let Some(device) = inner.devices.remove(&id) {
                    let handlers = inner.handlers_for(&id);
                    inner.revoke_device_subscriptions(&id);
                    pending.push(Pending {
                        change: DeviceChange {
                            kind: ChangeKind::Removed,
                            device,
                        },
                        handlers,
                    });
                }
            }

            for device in fresh {
                let id = device.id.clone();
                if let Some(change) = inner.upsert(device) {
                    pending.push(Pending {
                        handlers: inner.handlers_for(&id),
                        change,
                    });
                }
            }

            tracing::info!(
                "Registry snapshot applied: {} device(s), {} change(s)",
                inner.devices.len(),
                pending.len()
            );
        }

        let changes = pending.iter().map(|p| p.change.clone()).collect();
        self.dispatch(pending);
        changes
    }

    /// Add a device, or update it if already known
    pub fn apply_added(&self, descriptor: ThingDescriptor) -> Option<DeviceChange> {
        let pending = {
            let mut inner = self.lock();
            let device = inner.build_device(descriptor);
            let id = device.id.clone();
            let change = inner.upsert(device)?;
            Pending {
                handlers: inner.handlers_for(&id),
                change,
            }
        };

        let change = pending.change.clone();
        self.dispatch(vec![pending]);
        Some(change)
    }

    /// Remove a device and revoke its device-keyed subscriptions
    ///
    /// Those subscriptions still hear about the removal itself.
    pub fn apply_removed(&self, device_id: &str) -> Option<DeviceChange> {
        let pending = {
            let mut inner = self.lock();
            let Some(device) = inner.devices.remove(device_id) else {
                tracing::debug!("Removal of unknown device {} ignored", device_id);
                return None;
            };
            let handlers = inner.handlers_for(device_id);
            inner.revoke_device_subscriptions(device_id);
            Pending {
                change: DeviceChange {
                    kind: ChangeKind::Removed,
                    device,
                },
                handlers,
            }
        };

        let change = pending.change.clone();
        self.dispatch(vec![pending]);
        Some(change)
    }

    /// Set one state value of a known device
    ///
    /// Unknown devices, undeclared state types and values equal to the current
    /// one change nothing and notify nobody.
    pub fn apply_state_changed(&self, device_id: &str, state_type_id: &str, value: Value) -> Option<DeviceChange> {
        let pending = {
            let mut inner = self.lock();
            let RegistryInner { classes, devices, .. } = &mut *inner;

            let Some(device) = devices.get_mut(device_id) else {
                tracing::debug!("State change {} for unknown device {}", state_type_id, device_id);
                return None;
            };
            let Some(class) = classes.get(&device.thing_class_id) else {
                tracing::warn!("State change for {} without thing class {}", device_id, device.thing_class_id);
                return None;
            };
            if class.state_type(state_type_id).is_none() {
                tracing::warn!("State type {} not declared by the class of {}", state_type_id, device_id);
                return None;
            }
            if device.states.get(state_type_id) == Some(&value) {
                return None;
            }

            device.states.insert(state_type_id.to_string(), value);
            device.refresh_derived(class);
            let device = device.clone();

            Pending {
                handlers: inner.handlers_for(device_id),
                change: DeviceChange {
                    kind: ChangeKind::Updated,
                    device,
                },
            }
        };

        let change = pending.change.clone();
        self.dispatch(vec![pending]);
        Some(change)
    }

    // ========== Subscriptions ==========

    /// Register a change handler for one device or for all of them
    pub fn subscribe<F>(&self, key: SubscriptionKey, handler: F) -> Subscription
    where
        F: Fn(&DeviceChange) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner.subscriptions.insert(id, (key.clone(), Arc::new(handler)));
        Subscription { id, key }
    }

    /// Remove a handler; false if it was already gone (or revoked)
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.lock().subscriptions.remove(&subscription.id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }
}
