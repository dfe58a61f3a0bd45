use crate::errors::{Error, Result};
use crate::model::{ChangeKind, Device, DevicePatch, NewDevice};
use crate::notifier::ChangeNotifier;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
struct Devices {
    by_id: HashMap<String, Device>,
    // Creation order for `list`
    order: Vec<String>,
}

/// Authoritative in-process snapshot of every registered device.
///
/// Every operation runs under one lock and publishes its change event before
/// releasing it, so observers receive events for a device in the order the
/// mutations were applied. Nothing performed under the lock awaits.
pub struct DeviceRegistry {
    devices: RwLock<Devices>,
    notifier: Arc<ChangeNotifier>,
}

impl DeviceRegistry {
    pub fn new(notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            devices: RwLock::new(Devices::default()),
            notifier,
        }
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    /// Loads previously persisted devices without emitting events
    pub fn hydrate(&self, devices: Vec<Device>) {
        let mut guard = self.devices.write();
        for device in devices {
            if guard.by_id.contains_key(&device.id) {
                continue;
            }
            guard.order.push(device.id.clone());
            guard.by_id.insert(device.id.clone(), device);
        }
        info!("Registry hydrated with {} devices", guard.order.len());
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices.read().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.read().by_id.contains_key(id)
    }

    pub fn list(&self) -> Vec<Device> {
        let guard = self.devices.read();
        guard
            .order
            .iter()
            .filter_map(|id| guard.by_id.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn create(&self, registration: NewDevice) -> Result<Device> {
        let mut guard = self.devices.write();
        if guard.by_id.contains_key(&registration.id) {
            return Err(Error::DuplicateId(registration.id));
        }

        let device = Device::new(registration, Utc::now());
        guard.order.push(device.id.clone());
        guard.by_id.insert(device.id.clone(), device.clone());
        self.notifier.publish(ChangeKind::Added, device.clone());
        drop(guard);

        info!(device_id = %device.id, "Device registered");
        Ok(device)
    }

    /// Merges `patch` into the device and refreshes `last_update`
    pub fn update(&self, id: &str, patch: &DevicePatch) -> Result<Device> {
        self.update_at(id, patch, Utc::now())
    }

    pub fn update_at(&self, id: &str, patch: &DevicePatch, now: DateTime<Utc>) -> Result<Device> {
        self.update_when(id, patch, now, |_| true)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Applies `patch` only if `predicate` accepts the current record.
    ///
    /// The predicate runs under the registry lock, so the check and the
    /// write cannot be interleaved with another mutation. Returns `Ok(None)`
    /// when the predicate rejects.
    pub fn update_when<F>(
        &self,
        id: &str,
        patch: &DevicePatch,
        now: DateTime<Utc>,
        predicate: F,
    ) -> Result<Option<Device>>
    where
        F: FnOnce(&Device) -> bool,
    {
        let mut guard = self.devices.write();
        let device = guard
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !predicate(device) {
            return Ok(None);
        }

        patch.apply(device, now);
        let snapshot = device.clone();
        self.notifier.publish(ChangeKind::Updated, snapshot.clone());
        drop(guard);

        debug!(device_id = %id, status = %snapshot.status, "Device updated");
        Ok(Some(snapshot))
    }

    pub fn delete(&self, id: &str) -> Result<Device> {
        let mut guard = self.devices.write();
        let device = guard
            .by_id
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        guard.order.retain(|existing| existing != id);
        self.notifier.publish(ChangeKind::Deleted, device.clone());
        drop(guard);

        info!(device_id = %id, "Device deregistered");
        Ok(device)
    }
}
