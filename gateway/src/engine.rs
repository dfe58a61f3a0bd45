use crate::commands::{CommandDispatcher, CommandTransport};
use crate::errors::Result;
use crate::history::HistoryRecorder;
use crate::ingest::TelemetryIngest;
use crate::liveness::{LastSeen, LivenessMonitor};
use crate::notifier::ChangeNotifier;
use crate::model::DeviceStatus;
use crate::registry::DeviceRegistry;
use crate::storage::{with_timeout, Storage};
use std::sync::Arc;
use std::time::Duration;

/// The reconciliation engine: one registry with the components that mutate
/// it, sharing a single change notifier.
///
/// Holds no global state, so independent instances can coexist.
#[derive(Clone)]
pub struct Engine {
    pub notifier: Arc<ChangeNotifier>,
    pub registry: Arc<DeviceRegistry>,
    pub last_seen: Arc<LastSeen>,
    pub ingest: Arc<TelemetryIngest>,
    pub dispatcher: Arc<CommandDispatcher>,
}

impl Engine {
    pub fn new(
        event_capacity: usize,
        history: HistoryRecorder,
        transport: Arc<dyn CommandTransport>,
    ) -> Self {
        let notifier = Arc::new(ChangeNotifier::new(event_capacity));
        let registry = Arc::new(DeviceRegistry::new(Arc::clone(&notifier)));
        let last_seen = Arc::new(LastSeen::new());
        let ingest = Arc::new(TelemetryIngest::new(
            Arc::clone(&registry),
            Arc::clone(&last_seen),
            history,
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&registry), transport));

        Self {
            notifier,
            registry,
            last_seen,
            ingest,
            dispatcher,
        }
    }

    /// Loads persisted devices into the registry.
    ///
    /// Everything starts offline until its next telemetry message arrives.
    pub async fn hydrate(&self, storage: &dyn Storage, timeout: Duration) -> Result<usize> {
        let mut devices = with_timeout(timeout, storage.select_all_devices()).await?;
        for device in &mut devices {
            device.status = DeviceStatus::Offline;
        }
        let count = devices.len();
        self.registry.hydrate(devices);
        Ok(count)
    }

    pub fn liveness(&self, timeout: Duration) -> LivenessMonitor {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(20));
        LivenessMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.last_seen),
            timeout,
        )
    }
}
