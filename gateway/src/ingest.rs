use crate::errors::{Error, Result};
use crate::history::HistoryRecorder;
use crate::liveness::LastSeen;
use crate::metrics::{APPLIED_MESSAGES_TOTAL, MALFORMED_MESSAGES_TOTAL, UNKNOWN_DEVICE_TOTAL};
use crate::model::{Device, DevicePatch, SensorSample};
use crate::registry::DeviceRegistry;
use crate::validate::parse_reading;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Applies inbound telemetry to the registry and history.
///
/// Every message is treated as the latest observation of its device: there
/// is no sequencing or deduplication, the last message applied wins.
pub struct TelemetryIngest {
    registry: Arc<DeviceRegistry>,
    last_seen: Arc<LastSeen>,
    history: HistoryRecorder,
}

impl TelemetryIngest {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        last_seen: Arc<LastSeen>,
        history: HistoryRecorder,
    ) -> Self {
        Self {
            registry,
            last_seen,
            history,
        }
    }

    pub fn handle(&self, device_id: &str, payload: &[u8]) -> Result<Device> {
        self.handle_at(device_id, payload, Utc::now())
    }

    /// Processes one message received at `now`.
    ///
    /// Malformed payloads and unknown devices come back as errors without
    /// touching the registry; a failed history write does not.
    pub fn handle_at(&self, device_id: &str, payload: &[u8], now: DateTime<Utc>) -> Result<Device> {
        let reading = parse_reading(payload).map_err(|e| {
            MALFORMED_MESSAGES_TOTAL.inc();
            e
        })?;

        self.last_seen.record(device_id, now);

        let device = match self
            .registry
            .update_at(device_id, &DevicePatch::from_reading(&reading), now)
        {
            Ok(device) => device,
            Err(Error::NotFound(_)) => {
                self.last_seen.forget(device_id);
                UNKNOWN_DEVICE_TOTAL.inc();
                return Err(Error::UnknownDevice(device_id.to_string()));
            }
            Err(e) => return Err(e),
        };
        APPLIED_MESSAGES_TOTAL.inc();

        if let Err(e) = self
            .history
            .record(SensorSample::from_reading(device_id, &reading, now))
        {
            warn!(device_id = %device_id, "Sensor sample not recorded: {}", e);
        }

        debug!(
            device_id = %device_id,
            status = %device.status,
            soil = reading.soil_percent,
            "Telemetry applied"
        );
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeKind, DeviceStatus, NewDevice};
    use crate::notifier::ChangeNotifier;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        last_seen: Arc<LastSeen>,
        ingest: TelemetryIngest,
        samples: mpsc::Receiver<SensorSample>,
    }

    fn fixture(history_capacity: usize) -> Fixture {
        let registry = Arc::new(DeviceRegistry::new(Arc::new(ChangeNotifier::new(64))));
        let last_seen = Arc::new(LastSeen::new());
        let (history, samples) = HistoryRecorder::channel(history_capacity);
        let ingest = TelemetryIngest::new(Arc::clone(&registry), Arc::clone(&last_seen), history);
        registry
            .create(NewDevice {
                id: "d1".to_string(),
                name: "Bed 1".to_string(),
                zone: "z1".to_string(),
                zone_label: "East".to_string(),
                ip: None,
            })
            .unwrap();
        Fixture {
            registry,
            last_seen,
            ingest,
            samples,
        }
    }

    #[test]
    fn test_reading_updates_device_and_history() {
        let mut f = fixture(8);
        let mut events = f.registry.notifier().subscribe();
        let now = Utc::now();

        let device = f
            .ingest
            .handle_at("d1", br#"{"temperature":30,"humidity":60,"soilPercent":50}"#, now)
            .unwrap();

        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.soil_moisture, Some(50));
        assert_eq!(device.temperature, Some(30.0));
        assert_eq!(device.last_update, now);
        assert_eq!(f.last_seen.get("d1"), Some(now));

        let sample = f.samples.try_recv().unwrap();
        assert_eq!(sample.soil_moisture, 50);
        assert_eq!(sample.timestamp, now);

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, ChangeKind::Updated);
        assert_eq!(event.device, device);
    }

    #[test]
    fn test_pump_flag_sets_watering() {
        let f = fixture(8);
        let device = f
            .ingest
            .handle(
                "d1",
                br#"{"temperature":25,"humidity":40,"soilPercent":20,"pumpActive":true}"#,
            )
            .unwrap();

        assert!(device.pump_active);
        assert_eq!(device.status, DeviceStatus::Watering);
    }

    #[test]
    fn test_malformed_message_changes_nothing() {
        let mut f = fixture(8);
        let before = f.registry.get("d1").unwrap();

        let result = f.ingest.handle(
            "d1",
            br#"{"temperature":"warm","humidity":60,"soilPercent":50}"#,
        );

        assert!(matches!(result, Err(Error::MalformedMessage(_))));
        assert_eq!(f.registry.get("d1").unwrap(), before);
        assert!(f.last_seen.get("d1").is_none());
        assert!(f.samples.try_recv().is_err());
    }

    #[test]
    fn test_unknown_device_is_discarded() {
        let mut f = fixture(8);
        let result = f.ingest.handle(
            "stranger",
            br#"{"temperature":20,"humidity":50,"soilPercent":10}"#,
        );

        assert!(matches!(result, Err(Error::UnknownDevice(id)) if id == "stranger"));
        assert!(f.registry.get("stranger").is_none());
        assert!(f.last_seen.get("stranger").is_none());
        assert!(f.samples.try_recv().is_err());
    }

    #[test]
    fn test_history_backpressure_does_not_block_state() {
        let f = fixture(1);
        let payload = br#"{"temperature":20,"humidity":50,"soilPercent":10}"#;
        f.ingest.handle("d1", payload).unwrap();

        let device = f
            .ingest
            .handle("d1", br#"{"temperature":21,"humidity":51,"soilPercent":11}"#)
            .unwrap();

        assert_eq!(device.soil_moisture, Some(11));
        assert_eq!(f.registry.get("d1").unwrap().temperature, Some(21.0));
    }
}
