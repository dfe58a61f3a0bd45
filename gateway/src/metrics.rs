use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::{error, warn};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_messages_total",
        "Total telemetry messages received from MQTT"
    ))
    .unwrap();
    pub static ref APPLIED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_applied_messages_total",
        "Total telemetry messages applied to the device registry"
    ))
    .unwrap();
    pub static ref MALFORMED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_malformed_messages_total",
        "Total telemetry messages rejected as malformed"
    ))
    .unwrap();
    pub static ref UNKNOWN_DEVICE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_unknown_device_total",
        "Total telemetry messages for unregistered devices"
    ))
    .unwrap();
    pub static ref COMMANDS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_commands_total",
        "Total operator commands dispatched"
    ))
    .unwrap();
    pub static ref TRANSPORT_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_transport_failures_total",
        "Total outbound command publishes that failed"
    ))
    .unwrap();
    pub static ref OFFLINE_TRANSITIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_offline_transitions_total",
        "Total devices demoted to offline by the liveness sweep"
    ))
    .unwrap();
    pub static ref HISTORY_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_history_dropped_total",
        "Total sensor samples dropped before reaching storage"
    ))
    .unwrap();
    pub static ref STORAGE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_storage_failures_total",
        "Total storage operations that failed"
    ))
    .unwrap();
    pub static ref HISTORY_FLUSH_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gateway_history_flush_seconds",
            "Time taken to flush a batch of sensor samples"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref REALTIME_SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "gateway_realtime_subscribers",
        "Currently connected real-time subscribers"
    ))
    .unwrap();
}

/// Registers every gateway metric; repeated calls only log
pub fn init_metrics() {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(MESSAGES_TOTAL.clone()),
        Box::new(APPLIED_MESSAGES_TOTAL.clone()),
        Box::new(MALFORMED_MESSAGES_TOTAL.clone()),
        Box::new(UNKNOWN_DEVICE_TOTAL.clone()),
        Box::new(COMMANDS_TOTAL.clone()),
        Box::new(TRANSPORT_FAILURES_TOTAL.clone()),
        Box::new(OFFLINE_TRANSITIONS_TOTAL.clone()),
        Box::new(HISTORY_DROPPED_TOTAL.clone()),
        Box::new(STORAGE_FAILURES_TOTAL.clone()),
        Box::new(HISTORY_FLUSH_SECONDS.clone()),
        Box::new(REALTIME_SUBSCRIBERS.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            warn!("Failed to register metric: {}", e);
        }
    }
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
