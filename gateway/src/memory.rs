use crate::errors::Result;
use crate::model::{Device, HistoryQuery, SensorSample};
use crate::storage::Storage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_SAMPLES_PER_DEVICE: usize = 720;

#[derive(Default)]
struct MemoryState {
    devices: Vec<Device>,
    history: HashMap<String, VecDeque<SensorSample>>,
}

/// Non-durable storage used when the database is unreachable.
///
/// Keeps only the most recent `samples_per_device` samples for each device.
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    samples_per_device: usize,
}

impl MemoryStorage {
    pub fn new(samples_per_device: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            samples_per_device: samples_per_device.max(1),
        }
    }

    pub fn sample_count(&self, device_id: &str) -> usize {
        self.state
            .lock()
            .history
            .get(device_id)
            .map_or(0, VecDeque::len)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLES_PER_DEVICE)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert_device(&self, device: &Device) -> Result<()> {
        let mut state = self.state.lock();
        if !state.devices.iter().any(|d| d.id == device.id) {
            state.devices.push(device.clone());
        }
        Ok(())
    }

    async fn select_all_devices(&self) -> Result<Vec<Device>> {
        Ok(self.state.lock().devices.clone())
    }

    async fn select_device_by_id(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.state.lock().devices.iter().find(|d| d.id == id).cloned())
    }

    async fn update_device_fields(&self, device: &Device) -> Result<()> {
        let mut state = self.state.lock();
        match state.devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => *existing = device.clone(),
            None => state.devices.push(device.clone()),
        }
        Ok(())
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        self.state.lock().devices.retain(|d| d.id != id);
        Ok(())
    }

    async fn insert_sensor_samples(&self, samples: &[SensorSample]) -> Result<()> {
        let mut state = self.state.lock();
        for sample in samples {
            let ring = state.history.entry(sample.device_id.clone()).or_default();
            ring.push_back(sample.clone());
            while ring.len() > self.samples_per_device {
                ring.pop_front();
            }
        }
        Ok(())
    }

    async fn query_sensor_history(
        &self,
        device_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<SensorSample>> {
        let state = self.state.lock();
        let Some(ring) = state.history.get(device_id) else {
            return Ok(Vec::new());
        };

        let mut window: Vec<SensorSample> = ring
            .iter()
            .filter(|s| query.contains(s.timestamp))
            .cloned()
            .collect();
        window.sort_by_key(|s| s.timestamp);

        let skip = window.len().saturating_sub(query.limit);
        Ok(window.split_off(skip))
    }
}
