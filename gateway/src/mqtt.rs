use crate::commands::CommandTransport;
use crate::config::MqttConfig;
use crate::errors::{Error, Result};
use crate::ingest::TelemetryIngest;
use crate::metrics::{MALFORMED_MESSAGES_TOTAL, MESSAGES_TOTAL};
use crate::model::DeviceCommand;
use crate::validate::validate_device_id;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const TELEMETRY_SUFFIX: &str = "telemetry";
const COMMAND_SUFFIX: &str = "command";

/// Topic layout: `{prefix}/{device_id}/telemetry` inbound and
/// `{prefix}/{device_id}/command` outbound
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn telemetry_filter(&self) -> String {
        format!("{}/+/{}", self.prefix, TELEMETRY_SUFFIX)
    }

    pub fn telemetry(&self, device_id: &str) -> String {
        format!("{}/{}/{}", self.prefix, device_id, TELEMETRY_SUFFIX)
    }

    pub fn command(&self, device_id: &str) -> String {
        format!("{}/{}/{}", self.prefix, device_id, COMMAND_SUFFIX)
    }

    /// Extracts the device id from a telemetry topic
    pub fn parse_telemetry<'a>(&self, topic: &'a str) -> Result<&'a str> {
        let malformed = || {
            Error::MalformedMessage(format!(
                "Invalid topic '{}': expected '{}/{{device_id}}/{}'",
                topic, self.prefix, TELEMETRY_SUFFIX
            ))
        };

        let rest = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(malformed)?;
        let device_id = rest
            .strip_suffix(TELEMETRY_SUFFIX)
            .and_then(|rest| rest.strip_suffix('/'))
            .ok_or_else(malformed)?;

        validate_device_id(device_id)?;
        Ok(device_id)
    }
}

pub fn mqtt_options(config: &MqttConfig, client_id: String) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, config.broker.clone(), config.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        mqtt_options.set_credentials(username.clone(), password.clone());
    }
    mqtt_options
}

/// Drives the MQTT event loop and feeds telemetry into the ingest pipeline.
///
/// Subscribes again after every (re)connect. Connection errors are logged;
/// rumqttc reconnects on the next poll.
pub async fn run_mqtt(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topics: Topics,
    ingest: Arc<TelemetryIngest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let filter = topics.telemetry_filter();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        // try_subscribe: awaiting here would wait on this very loop
                        match client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                            Ok(()) => info!("Subscribed to {} with QoS 1", filter),
                            Err(e) => error!("Failed to subscribe to {}: {}", filter, e),
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_message(&topics, &ingest, &publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("Subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    info!("Disconnecting from MQTT broker");
    if client.try_disconnect().is_ok() {
        // Poll until the disconnect has gone out or the connection drops
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while eventloop.poll().await.is_ok() {}
        })
        .await;
    }
    info!("MQTT task stopped");
}

fn handle_message(topics: &Topics, ingest: &TelemetryIngest, topic: &str, payload: &[u8]) {
    MESSAGES_TOTAL.inc();
    debug!("Received message on topic {}, size: {} bytes", topic, payload.len());

    let device_id = match topics.parse_telemetry(topic) {
        Ok(device_id) => device_id,
        Err(e) => {
            MALFORMED_MESSAGES_TOTAL.inc();
            warn!("Skipping message: {}", e);
            return;
        }
    };

    match ingest.handle(device_id, payload) {
        Ok(_) => {}
        Err(Error::MalformedMessage(reason)) => {
            warn!(device_id = %device_id, "Discarding malformed telemetry: {}", reason);
        }
        Err(Error::UnknownDevice(_)) => {
            debug!(device_id = %device_id, "Discarding telemetry from unregistered device");
        }
        Err(e) => {
            error!(device_id = %device_id, "Failed to process telemetry: {}", e);
        }
    }
}

/// Publishes device commands through the shared MQTT client
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    topics: Topics,
}

impl MqttTransport {
    pub fn new(client: AsyncClient, topics: Topics) -> Self {
        Self { client, topics }
    }
}

impl CommandTransport for MqttTransport {
    fn send(&self, device_id: &str, command: &DeviceCommand) -> Result<()> {
        let payload = serde_json::to_vec(command)?;
        self.client
            .try_publish(self.topics.command(device_id), QoS::AtLeastOnce, false, payload)
            .map_err(Error::Mqtt)
    }
}
