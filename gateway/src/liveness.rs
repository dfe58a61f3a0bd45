use crate::errors::Error;
use crate::metrics::OFFLINE_TRANSITIONS_TOTAL;
use crate::model::{DevicePatch, DeviceStatus};
use crate::registry::DeviceRegistry;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Time of the most recently accepted telemetry message per device.
///
/// Kept in memory only; after a restart every device is unseen until it
/// reports again.
#[derive(Default)]
pub struct LastSeen {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LastSeen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, device_id: &str, at: DateTime<Utc>) {
        self.seen.lock().insert(device_id.to_string(), at);
    }

    pub fn get(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.seen.lock().get(device_id).copied()
    }

    pub fn forget(&self, device_id: &str) {
        self.seen.lock().remove(device_id);
    }

    /// True when the device was last seen at or before `cutoff`
    pub fn is_stale(&self, device_id: &str, cutoff: DateTime<Utc>) -> bool {
        self.get(device_id).is_some_and(|at| at <= cutoff)
    }
}

/// Periodic sweep demoting silent devices to offline
pub struct LivenessMonitor {
    registry: Arc<DeviceRegistry>,
    last_seen: Arc<LastSeen>,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<DeviceRegistry>, last_seen: Arc<LastSeen>, timeout: Duration) -> Self {
        Self {
            registry,
            last_seen,
            timeout,
        }
    }

    /// Runs one sweep as of `now` and returns how many devices went offline.
    ///
    /// Devices that never reported have no last-seen entry and are left
    /// alone. Staleness and current status are re-checked under the registry
    /// lock, so telemetry racing with the sweep always wins.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.timeout;
        let mut demoted = 0;

        for device in self.registry.list() {
            if device.status == DeviceStatus::Offline
                || !self.last_seen.is_stale(&device.id, cutoff)
            {
                continue;
            }

            let last_seen = &self.last_seen;
            let result = self.registry.update_when(
                &device.id,
                &DevicePatch::offline(),
                now,
                |current| {
                    current.status != DeviceStatus::Offline
                        && last_seen.is_stale(&current.id, cutoff)
                },
            );

            match result {
                Ok(Some(_)) => {
                    demoted += 1;
                    OFFLINE_TRANSITIONS_TOTAL.inc();
                    info!(
                        device_id = %device.id,
                        last_seen = ?self.last_seen.get(&device.id),
                        "Device went offline"
                    );
                }
                Ok(None) => {}
                Err(Error::NotFound(_)) => {
                    debug!(device_id = %device.id, "Device deleted during liveness sweep");
                }
                Err(e) => {
                    error!(device_id = %device.id, "Liveness update failed: {}", e);
                }
            }
        }

        demoted
    }
}

/// Runs the sweep every `period` until `shutdown` flips.
///
/// Sweeps run one at a time in this task; ticks missed while a sweep is
/// still running are skipped rather than queued.
pub async fn run_liveness(
    monitor: LivenessMonitor,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "Starting liveness monitor with period={:?}, timeout={}s",
        period,
        monitor.timeout.num_seconds()
    );

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let demoted = monitor.sweep(Utc::now());
                if demoted > 0 {
                    debug!("Liveness sweep demoted {} devices", demoted);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Liveness monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeKind, NewDevice};
    use crate::notifier::ChangeNotifier;

    fn setup() -> (Arc<DeviceRegistry>, Arc<LastSeen>, LivenessMonitor) {
        let registry = Arc::new(DeviceRegistry::new(Arc::new(ChangeNotifier::new(64))));
        let last_seen = Arc::new(LastSeen::new());
        let monitor =
            LivenessMonitor::new(Arc::clone(&registry), Arc::clone(&last_seen), Duration::seconds(20));
        (registry, last_seen, monitor)
    }

    fn register(registry: &DeviceRegistry, id: &str) {
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

    #[test]
    fn test_silent_device_goes_offline_once() {
        let (registry, last_seen, monitor) = setup();
        register(&registry, "d1");
        let t0 = Utc::now();
        last_seen.record("d1", t0);
        registry.update("d1", &DevicePatch::pump(true)).unwrap();

        let mut rx = registry.notifier().subscribe();

        assert_eq!(monitor.sweep(t0 + Duration::seconds(10)), 0);
        assert_eq!(monitor.sweep(t0 + Duration::seconds(21)), 1);
        assert_eq!(monitor.sweep(t0 + Duration::seconds(51)), 0);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, ChangeKind::Updated);
        assert_eq!(event.device.status, DeviceStatus::Offline);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_never_seen_device_is_left_alone() {
        let (registry, _last_seen, monitor) = setup();
        register(&registry, "quiet");
        registry.update("quiet", &DevicePatch::pump(false)).unwrap();

        assert_eq!(monitor.sweep(Utc::now() + Duration::hours(1)), 0);
        assert_eq!(registry.get("quiet").unwrap().status, DeviceStatus::Online);
    }

    #[test]
    fn test_fresh_telemetry_keeps_device_online() {
        let (registry, last_seen, monitor) = setup();
        register(&registry, "d1");
        let now = Utc::now();
        last_seen.record("d1", now - Duration::seconds(5));
        registry.update("d1", &DevicePatch::pump(false)).unwrap();

        assert_eq!(monitor.sweep(now), 0);
        assert_eq!(registry.get("d1").unwrap().status, DeviceStatus::Online);
    }

    #[test]
    fn test_deleted_device_is_not_resurrected() {
        let (registry, last_seen, monitor) = setup();
        register(&registry, "d1");
        last_seen.record("d1", Utc::now() - Duration::minutes(5));
        registry.update("d1", &DevicePatch::pump(false)).unwrap();
        registry.delete("d1").unwrap();

        assert_eq!(monitor.sweep(Utc::now()), 0);
        assert!(registry.get("d1").is_none());
    }

    #[test]
    fn test_silent_for_exactly_the_timeout_is_offline() {
        let (registry, last_seen, monitor) = setup();
        register(&registry, "d1");
        let t0 = Utc::now();
        last_seen.record("d1", t0);
        registry.update("d1", &DevicePatch::pump(false)).unwrap();

        assert_eq!(monitor.sweep(t0 + Duration::seconds(20) - Duration::milliseconds(1)), 0);
        assert_eq!(monitor.sweep(t0 + Duration::seconds(20)), 1);
        assert_eq!(registry.get("d1").unwrap().status, DeviceStatus::Offline);
    }

    #[test]
    fn test_sweep_races_with_deletes() {
        let (registry, last_seen, monitor) = setup();
        let stale = Utc::now() - Duration::minutes(5);
        let ids: Vec<String> = (0..500).map(|i| format!("d{}", i)).collect();
        for id in &ids {
            register(&registry, id);
            last_seen.record(id, stale);
            registry.update(id, &DevicePatch::pump(false)).unwrap();
        }

        let deleted: Vec<String> = ids.iter().filter(|id| id.len() % 2 == 0).cloned().collect();
        let demoted = std::thread::scope(|scope| {
            let deleter = Arc::clone(&registry);
            let to_delete = &deleted;
            scope.spawn(move || {
                for id in to_delete.iter().rev() {
                    deleter.delete(id).unwrap();
                }
            });
            monitor.sweep(Utc::now())
        });

        assert!(demoted <= ids.len());
        for id in &deleted {
            assert!(registry.get(id).is_none(), "{} came back", id);
        }
        assert_eq!(registry.len(), ids.len() - deleted.len());
        for device in registry.list() {
            assert_eq!(device.status, DeviceStatus::Offline);
        }
    }

    #[test]
    fn test_last_seen_staleness() {
        let last_seen = LastSeen::new();
        let now = Utc::now();
        assert!(!last_seen.is_stale("d1", now));

        last_seen.record("d1", now - Duration::seconds(30));
        assert!(last_seen.is_stale("d1", now - Duration::seconds(20)));

        last_seen.record("d1", now);
        assert!(!last_seen.is_stale("d1", now - Duration::seconds(20)));

        last_seen.forget("d1");
        assert!(last_seen.get("d1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_liveness_stops_on_shutdown() {
        let (_registry, _last_seen, monitor) = setup();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_liveness(
            monitor,
            std::time::Duration::from_secs(30),
            rx,
        ));
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        tx.send(true).unwrap();

        handle.await.unwrap();
    }
}
