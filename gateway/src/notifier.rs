use crate::model::{ChangeEvent, ChangeKind, Device};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

/// Fan-out point for registry mutations.
///
/// Real-time subscribers get events through a broadcast channel: delivery is
/// best-effort and a subscriber that falls behind sees `Lagged` and must
/// resynchronise from a registry snapshot. Sinks never lose a device's final
/// state and are meant for observers such as the storage sync task.
///
/// `publish` never blocks. The registry calls it while holding its lock, so
/// per-device event order matches mutation order.
pub struct ChangeNotifier {
    realtime: broadcast::Sender<ChangeEvent>,
    sinks: Mutex<Vec<Arc<SinkShared>>>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (realtime, _) = broadcast::channel(capacity.max(1));
        Self {
            realtime,
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.realtime.subscribe()
    }

    pub fn attach_sink(&self) -> ChangeSink {
        let shared = Arc::new(SinkShared::default());
        self.sinks.lock().push(Arc::clone(&shared));
        ChangeSink { shared }
    }

    pub fn subscriber_count(&self) -> usize {
        self.realtime.receiver_count()
    }

    pub fn publish(&self, kind: ChangeKind, device: Device) {
        let event = ChangeEvent { kind, device };
        debug!(
            device_id = %event.device.id,
            kind = event.kind.as_str(),
            status = %event.device.status,
            "publishing change event"
        );

        {
            let mut sinks = self.sinks.lock();
            sinks.retain(|sink| {
                // Only the notifier still holds it: the receiving side is gone
                if Arc::strong_count(sink) == 1 {
                    warn!("Change sink closed, detaching it");
                    return false;
                }
                sink.push(event.clone());
                true
            });
        }

        // No connected subscribers is not an error: they resync on connect
        let _ = self.realtime.send(event);
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        for sink in self.sinks.lock().drain(..) {
            sink.close();
        }
    }
}

#[derive(Default)]
struct Pending {
    order: VecDeque<String>,
    latest: HashMap<String, ChangeEvent>,
    closed: bool,
}

#[derive(Default)]
struct SinkShared {
    pending: Mutex<Pending>,
    notify: Notify,
}

impl SinkShared {
    /// Queues `event`, folding it into any event still pending for the same
    /// device so the backlog never exceeds one entry per device.
    fn push(&self, event: ChangeEvent) {
        {
            let mut pending = self.pending.lock();
            let id = event.device.id.clone();
            match pending.latest.get_mut(&id) {
                Some(queued) => {
                    queued.kind = merge_kinds(queued.kind, event.kind);
                    queued.device = event.device;
                }
                None => {
                    pending.order.push_back(id.clone());
                    pending.latest.insert(id, event);
                }
            }
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.pending.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Kind to apply downstream when a pending `queued` event is superseded
fn merge_kinds(queued: ChangeKind, next: ChangeKind) -> ChangeKind {
    match (queued, next) {
        // Still a new device as far as storage knows
        (ChangeKind::Added, ChangeKind::Updated) => ChangeKind::Added,
        // The stored row may still exist, so overwrite it
        (ChangeKind::Deleted, ChangeKind::Added) => ChangeKind::Updated,
        (_, next) => next,
    }
}

/// Receiving side of a sink.
///
/// Holds at most one pending event per device, carrying the latest snapshot;
/// a slow consumer skips intermediate states instead of queueing them.
pub struct ChangeSink {
    shared: Arc<SinkShared>,
}

impl ChangeSink {
    /// Next pending event, or `None` once the notifier is gone and the
    /// backlog is drained
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            {
                let mut pending = self.shared.pending.lock();
                if let Some(event) = pop(&mut pending) {
                    return Some(event);
                }
                if pending.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        pop(&mut self.shared.pending.lock())
    }

    /// Number of devices with a pending event
    pub fn len(&self) -> usize {
        self.shared.pending.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn pop(pending: &mut Pending) -> Option<ChangeEvent> {
    let id = pending.order.pop_front()?;
    pending.latest.remove(&id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceStatus, NewDevice};
    use chrono::Utc;

    fn device(id: &str, status: DeviceStatus) -> Device {
        let mut d = Device::new(
            NewDevice {
                id: id.to_string(),
                name: String::new(),
                zone: String::new(),
                zone_label: String::new(),
                ip: None,
            },
            Utc::now(),
        );
        d.status = status;
        d
    }

    #[test]
    fn test_subscribers_and_sinks_see_events_in_order() {
        let notifier = ChangeNotifier::new(16);
        let mut rx = notifier.subscribe();
        let mut sink = notifier.attach_sink();

        notifier.publish(ChangeKind::Added, device("d1", DeviceStatus::Offline));
        notifier.publish(ChangeKind::Updated, device("d1", DeviceStatus::Online));
        notifier.publish(ChangeKind::Updated, device("d1", DeviceStatus::Watering));

        let statuses: Vec<_> = (0..3).map(|_| rx.try_recv().unwrap().device.status).collect();
        assert_eq!(
            statuses,
            vec![DeviceStatus::Offline, DeviceStatus::Online, DeviceStatus::Watering]
        );

        // The sink keeps one entry per device: the latest snapshot, still
        // reported as an addition
        let folded = sink.try_recv().unwrap();
        assert_eq!(folded.kind, ChangeKind::Added);
        assert_eq!(folded.device.status, DeviceStatus::Watering);
        assert!(sink.try_recv().is_none());
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let notifier = ChangeNotifier::new(16);
        notifier.publish(ChangeKind::Added, device("d1", DeviceStatus::Offline));

        let mut rx = notifier.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_sink_is_detached() {
        let notifier = ChangeNotifier::new(4);
        let sink = notifier.attach_sink();
        drop(sink);

        notifier.publish(ChangeKind::Added, device("d1", DeviceStatus::Offline));
        assert!(notifier.sinks.lock().is_empty());
    }

    #[test]
    fn test_sink_backlog_is_one_entry_per_device() {
        let notifier = ChangeNotifier::new(4);
        let mut sink = notifier.attach_sink();

        for i in 0..1000 {
            let id = format!("d{}", i % 10);
            notifier.publish(ChangeKind::Updated, device(&id, DeviceStatus::Online));
        }

        assert_eq!(sink.len(), 10);
        let first = sink.try_recv().unwrap();
        assert_eq!(first.device.id, "d0");
        assert_eq!(first.kind, ChangeKind::Updated);
    }

    #[test]
    fn test_merge_kinds() {
        use ChangeKind::*;
        assert_eq!(merge_kinds(Added, Updated), Added);
        assert_eq!(merge_kinds(Added, Deleted), Deleted);
        assert_eq!(merge_kinds(Updated, Deleted), Deleted);
        assert_eq!(merge_kinds(Deleted, Added), Updated);
        assert_eq!(merge_kinds(Updated, Updated), Updated);
    }

    #[tokio::test]
    async fn test_sink_drains_then_closes_with_notifier() {
        let notifier = ChangeNotifier::new(4);
        let mut sink = notifier.attach_sink();
        notifier.publish(ChangeKind::Added, device("d1", DeviceStatus::Offline));
        notifier.publish(ChangeKind::Added, device("d2", DeviceStatus::Offline));
        drop(notifier);

        assert_eq!(sink.recv().await.unwrap().device.id, "d1");
        assert_eq!(sink.recv().await.unwrap().device.id, "d2");
        assert!(sink.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_sink_wakes_on_publish() {
        let notifier = Arc::new(ChangeNotifier::new(4));
        let mut sink = notifier.attach_sink();

        let publisher = Arc::clone(&notifier);
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish(ChangeKind::Added, device("d1", DeviceStatus::Offline));
        });

        let event = sink.recv().await.unwrap();
        assert_eq!(event.device.id, "d1");
        handle.await.unwrap();
    }
}
