use crate::errors::{Error, Result};
use crate::metrics::{HISTORY_DROPPED_TOTAL, HISTORY_FLUSH_SECONDS, STORAGE_FAILURES_TOTAL};
use crate::model::SensorSample;
use crate::storage::{with_timeout, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

/// Non-blocking handle for appending sensor samples to history
#[derive(Clone)]
pub struct HistoryRecorder {
    tx: mpsc::Sender<SensorSample>,
}

impl HistoryRecorder {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SensorSample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues a sample for the background writer; never waits
    pub fn record(&self, sample: SensorSample) -> Result<()> {
        self.tx.try_send(sample).map_err(|e| {
            HISTORY_DROPPED_TOTAL.inc();
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::StorageUnavailable("history queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => Error::ChannelSend,
            }
        })
    }
}

pub async fn run_recorder(
    mut rx: mpsc::Receiver<SensorSample>,
    storage: Arc<dyn Storage>,
    max_batch: usize,
    max_wait_ms: u64,
    timeout: Duration,
) {
    info!(
        "Starting history recorder on {} backend with max_batch={}, max_wait_ms={}",
        storage.backend(),
        max_batch,
        max_wait_ms
    );

    let max_batch = max_batch.max(1);
    let mut buffer: Vec<SensorSample> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms.max(1)));

    loop {
        tokio::select! {
            sample = rx.recv() => {
                match sample {
                    Some(s) => {
                        buffer.push(s);

                        if buffer.len() >= max_batch {
                            flush_batch(storage.as_ref(), &mut buffer, timeout).await;
                        }
                    }
                    None => {
                        info!("History channel closed, flushing remaining samples");
                        flush_batch(storage.as_ref(), &mut buffer, timeout).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(storage.as_ref(), &mut buffer, timeout).await;
                }
            }
        }
    }

    info!("History recorder stopped");
}

async fn flush_batch(storage: &dyn Storage, buffer: &mut Vec<SensorSample>, timeout: Duration) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Flushing {} sensor samples", batch_len);
    let start = Instant::now();

    // 3 attempts with exponential backoff
    const MAX_RETRIES: u32 = 3;
    let mut attempt = 0;

    loop {
        attempt += 1;

        match with_timeout(timeout, storage.insert_sensor_samples(buffer.as_slice())).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_secs_f64();
                HISTORY_FLUSH_SECONDS.observe(elapsed);
                if attempt > 1 {
                    info!("History batch stored after {} attempts in {:.3}s", attempt, elapsed);
                } else {
                    debug!("History batch stored in {:.3}s", elapsed);
                }
                buffer.clear();
                return;
            }
            Err(e) => {
                STORAGE_FAILURES_TOTAL.inc();
                if attempt >= MAX_RETRIES {
                    error!("Failed to store history batch after {} attempts: {}", MAX_RETRIES, e);
                    error!("{} sensor samples dropped", batch_len);
                    HISTORY_DROPPED_TOTAL.inc_by(batch_len as f64);
                    buffer.clear();
                    return;
                }

                // 100ms, 200ms, 400ms
                let backoff_ms = 100 * 2_u64.pow(attempt - 1);
                error!(
                    "Failed to store history batch (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::model::{Device, HistoryQuery};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sample(device_id: &str, soil: i32) -> SensorSample {
        SensorSample {
            device_id: device_id.to_string(),
            timestamp: Utc::now() + chrono::Duration::milliseconds(soil as i64),
            temperature: 20.0,
            humidity: 55.0,
            soil_moisture: soil,
        }
    }

    /// Storage whose history writes always fail
    struct BrokenStorage {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Storage for BrokenStorage {
        fn backend(&self) -> &'static str {
            "broken"
        }
        async fn insert_device(&self, _: &Device) -> Result<()> {
            Ok(())
        }
        async fn select_all_devices(&self) -> Result<Vec<Device>> {
            Ok(Vec::new())
        }
        async fn select_device_by_id(&self, _: &str) -> Result<Option<Device>> {
            Ok(None)
        }
        async fn update_device_fields(&self, _: &Device) -> Result<()> {
            Ok(())
        }
        async fn delete_device(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn insert_sensor_samples(&self, _: &[SensorSample]) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::StorageUnavailable("down".to_string()))
        }
        async fn query_sensor_history(
            &self,
            _: &str,
            _: &HistoryQuery,
        ) -> Result<Vec<SensorSample>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_record_never_blocks_when_full() {
        let (recorder, _rx) = HistoryRecorder::channel(1);
        assert!(recorder.record(sample("d1", 1)).is_ok());
        assert!(matches!(
            recorder.record(sample("d1", 2)),
            Err(Error::StorageUnavailable(_))
        ));
    }

    #[test]
    fn test_record_after_recorder_stopped() {
        let (recorder, rx) = HistoryRecorder::channel(4);
        drop(rx);
        assert!(matches!(recorder.record(sample("d1", 1)), Err(Error::ChannelSend)));
    }

    #[tokio::test]
    async fn test_recorder_flushes_on_close() {
        let storage = Arc::new(MemoryStorage::default());
        let (recorder, rx) = HistoryRecorder::channel(16);
        for soil in 0..5 {
            recorder.record(sample("d1", soil)).unwrap();
        }
        drop(recorder);

        run_recorder(rx, storage.clone(), 2, 1000, Duration::from_secs(1)).await;

        assert_eq!(storage.sample_count("d1"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_dropped_after_retries() {
        let storage = Arc::new(BrokenStorage {
            attempts: AtomicU32::new(0),
        });
        let mut buffer = vec![sample("d1", 1), sample("d1", 2)];

        flush_batch(storage.as_ref(), &mut buffer, Duration::from_secs(1)).await;

        assert!(buffer.is_empty());
        assert_eq!(storage.attempts.load(Ordering::SeqCst), 3);
    }
}
