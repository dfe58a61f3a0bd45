use crate::errors::{Error, Result};
use crate::metrics::STORAGE_FAILURES_TOTAL;
use crate::model::{ChangeKind, Device, HistoryQuery, SensorSample};
use crate::notifier::ChangeSink;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Durable storage for devices and sensor history.
///
/// Implemented by the Postgres backend and by the in-memory fallback used
/// when no database is reachable.
#[async_trait]
pub trait Storage: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn insert_device(&self, device: &Device) -> Result<()>;

    /// All devices in creation order
    async fn select_all_devices(&self) -> Result<Vec<Device>>;

    async fn select_device_by_id(&self, id: &str) -> Result<Option<Device>>;

    async fn update_device_fields(&self, device: &Device) -> Result<()>;

    async fn delete_device(&self, id: &str) -> Result<()>;

    async fn insert_sensor_samples(&self, samples: &[SensorSample]) -> Result<()>;

    async fn insert_sensor_sample(&self, sample: &SensorSample) -> Result<()> {
        self.insert_sensor_samples(std::slice::from_ref(sample)).await
    }

    /// Samples inside the query window, oldest first, at most `query.limit`
    /// of the most recent ones
    async fn query_sensor_history(
        &self,
        device_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<SensorSample>>;
}

/// Bounds a storage call so a hung backend cannot stall its caller
pub async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| Error::StorageUnavailable(format!("timed out after {:?}", timeout)))?
}

/// Mirrors registry change events into storage, one device at a time.
///
/// While a write is slow, newer changes to the same device replace the
/// pending one, so an outage costs one write per device afterwards. Failures
/// are logged and counted; the registry stays authoritative.
pub async fn run_store_sync(
    mut rx: ChangeSink,
    storage: Arc<dyn Storage>,
    timeout: Duration,
) {
    info!("Starting store sync on {} backend", storage.backend());

    while let Some(event) = rx.recv().await {
        let device_id = event.device.id.clone();
        let result = match event.kind {
            ChangeKind::Added => with_timeout(timeout, storage.insert_device(&event.device)).await,
            ChangeKind::Updated => {
                with_timeout(timeout, storage.update_device_fields(&event.device)).await
            }
            ChangeKind::Deleted => with_timeout(timeout, storage.delete_device(&device_id)).await,
        };

        match result {
            Ok(()) => debug!(device_id = %device_id, kind = event.kind.as_str(), "Device synced to storage"),
            Err(e) => {
                STORAGE_FAILURES_TOTAL.inc();
                error!(
                    device_id = %device_id,
                    kind = event.kind.as_str(),
                    "Failed to sync device to storage: {}",
                    e
                );
            }
        }
    }

    info!("Store sync stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::model::{DevicePatch, NewDevice};
    use crate::notifier::ChangeNotifier;
    use crate::registry::DeviceRegistry;

    #[tokio::test]
    async fn test_store_sync_mirrors_registry() {
        let notifier = Arc::new(ChangeNotifier::new(16));
        let storage = Arc::new(MemoryStorage::new(720));
        let rx = notifier.attach_sink();
        let registry = DeviceRegistry::new(Arc::clone(&notifier));

        for id in ["d1", "d2"] {
            registry
                .create(NewDevice {
                    id: id.to_string(),
                    name: id.to_uppercase(),
                    zone: String::new(),
                    zone_label: String::new(),
                    ip: None,
                })
                .unwrap();
        }
        registry.update("d1", &DevicePatch::pump(true)).unwrap();
        registry.delete("d2").unwrap();
        drop(registry);
        drop(notifier);

        run_store_sync(rx, storage.clone(), Duration::from_secs(1)).await;

        let stored = storage.select_all_devices().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].pump_active);
        assert!(storage.select_device_by_id("d2").await.unwrap().is_none());
    }

    /// Storage whose device writes take one second each
    struct SlowStorage {
        inner: MemoryStorage,
        writes: parking_lot::Mutex<Vec<(String, Option<i32>)>>,
    }

    #[async_trait]
    impl Storage for SlowStorage {
        fn backend(&self) -> &'static str {
            "slow"
        }

        async fn insert_device(&self, device: &Device) -> Result<()> {
            self.update_device_fields(device).await
        }

        async fn select_all_devices(&self) -> Result<Vec<Device>> {
            self.inner.select_all_devices().await
        }

        async fn select_device_by_id(&self, id: &str) -> Result<Option<Device>> {
            self.inner.select_device_by_id(id).await
        }

        async fn update_device_fields(&self, device: &Device) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.writes
                .lock()
                .push((device.id.clone(), device.soil_moisture));
            self.inner.update_device_fields(device).await
        }

        async fn delete_device(&self, id: &str) -> Result<()> {
            self.inner.delete_device(id).await
        }

        async fn insert_sensor_samples(&self, samples: &[SensorSample]) -> Result<()> {
            self.inner.insert_sensor_samples(samples).await
        }

        async fn query_sensor_history(
            &self,
            device_id: &str,
            query: &HistoryQuery,
        ) -> Result<Vec<SensorSample>> {
            self.inner.query_sensor_history(device_id, query).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_storage_backlog_stays_bounded() {
        let notifier = Arc::new(ChangeNotifier::new(16));
        let registry = DeviceRegistry::new(Arc::clone(&notifier));
        let storage = Arc::new(SlowStorage {
            inner: MemoryStorage::new(720),
            writes: parking_lot::Mutex::new(Vec::new()),
        });
        let sink = notifier.attach_sink();

        for id in ["d1", "d2"] {
            registry
                .create(NewDevice {
                    id: id.to_string(),
                    name: String::new(),
                    zone: String::new(),
                    zone_label: String::new(),
                    ip: None,
                })
                .unwrap();
        }

        let handle = tokio::spawn(run_store_sync(
            sink,
            storage.clone(),
            Duration::from_secs(5),
        ));

        // 500 updates per device arrive while every write takes a second
        for soil in 0..500 {
            for id in ["d1", "d2"] {
                let patch = DevicePatch {
                    soil_moisture: Some(soil),
                    ..Default::default()
                };
                registry.update(id, &patch).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(registry);
        drop(notifier);
        handle.await.unwrap();

        let writes = storage.writes.lock().clone();
        assert!(writes.len() < 20, "{} writes for 1000 updates", writes.len());
        for id in ["d1", "d2"] {
            let last = writes.iter().rev().find(|(w, _)| w == id).unwrap();
            assert_eq!(last.1, Some(499));
        }
        let stored = storage.inner.select_device_by_id("d1").await.unwrap().unwrap();
        assert_eq!(stored.soil_moisture, Some(499));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_reports_storage_unavailable() {
        let result: Result<()> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::StorageUnavailable(_))));
    }
}
