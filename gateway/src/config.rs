use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
}

/// Process configuration, read from the environment at startup
#[derive(Debug, Clone)]
pub struct Config {
    /// Unset means run on the in-memory fallback
    pub database_url: Option<String>,
    pub mqtt: MqttConfig,
    pub http_addr: String,
    pub liveness_interval: Duration,
    pub offline_timeout: Duration,
    pub history_batch_size: usize,
    pub history_batch_timeout_ms: u64,
    pub history_channel_capacity: usize,
    pub memory_history_limit: usize,
    pub event_channel_capacity: usize,
    pub storage_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str, default| parse_or(lookup(key), default);

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            mqtt: MqttConfig {
                broker: lookup("MQTT_BROKER").unwrap_or_else(|| "localhost".to_string()),
                port: parse_or(lookup("MQTT_PORT"), 1883),
                username: lookup("MQTT_USERNAME"),
                password: lookup("MQTT_PASSWORD"),
                topic_prefix: lookup("MQTT_TOPIC_PREFIX")
                    .unwrap_or_else(|| "irrigation".to_string()),
            },
            http_addr: lookup("HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            liveness_interval: Duration::from_secs(parsed("LIVENESS_INTERVAL_SECS", 30)),
            offline_timeout: Duration::from_secs(parsed("OFFLINE_TIMEOUT_SECS", 20)),
            history_batch_size: parse_or(lookup("HISTORY_BATCH_SIZE"), 500),
            history_batch_timeout_ms: parsed("HISTORY_BATCH_TIMEOUT_MS", 250),
            history_channel_capacity: parse_or(lookup("HISTORY_CHANNEL_CAPACITY"), 10_000),
            memory_history_limit: parse_or(lookup("MEMORY_HISTORY_LIMIT"), 720),
            event_channel_capacity: parse_or(lookup("EVENT_CHANNEL_CAPACITY"), 256),
            storage_timeout: Duration::from_millis(parsed("STORAGE_TIMEOUT_MS", 5_000)),
        }
    }

    /// Database URL with credentials stripped, for logging
    pub fn database_display(&self) -> &str {
        match &self.database_url {
            Some(url) => url.split('@').last().unwrap_or("***"),
            None => "none (in-memory)",
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
