mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use telemetry::{Command, VirtualDevice};
use tracing::{debug, error, info, warn};

/// Publishes telemetry for a fleet of simulated irrigation devices
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "irrigation")]
    prefix: String,

    /// Number of devices, named `{device_prefix}-{n}`
    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    #[arg(long, env = "DEVICE_PREFIX", default_value = "dev")]
    device_prefix: String,

    /// Seconds between two readings of the same device
    #[arg(long, env = "INTERVAL_SECS", default_value_t = 5)]
    interval: u64,

    /// How many of the devices never publish
    #[arg(long, env = "SILENT_DEVICES", default_value_t = 0)]
    silent: usize,
}

type Fleet = Arc<Mutex<HashMap<String, VirtualDevice>>>;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting irrigation simulator");
    info!(
        "Broker: {}:{}, Prefix: {}, Devices: {} ({} silent), Interval: {}s",
        args.broker, args.port, args.prefix, args.devices, args.silent, args.interval
    );

    let mut rng = rand::thread_rng();
    let fleet: Fleet = Arc::new(Mutex::new(
        (0..args.devices)
            .map(|n| {
                let id = format!("{}-{}", args.device_prefix, n);
                (id, VirtualDevice::new(&mut rng))
            })
            .collect(),
    ));

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    // Spawn eventloop handler; applies commands addressed to the fleet
    let command_filter = format!("{}/+/command", args.prefix);
    let command_prefix = format!("{}/", args.prefix);
    let subscriber = client.clone();
    let command_fleet = Arc::clone(&fleet);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    if let Err(e) = subscriber.try_subscribe(command_filter.as_str(), QoS::AtLeastOnce) {
                        error!("Failed to subscribe to {}: {}", command_filter, e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let device_id = publish
                        .topic
                        .strip_prefix(command_prefix.as_str())
                        .and_then(|rest| rest.strip_suffix("/command"));
                    handle_command(&command_fleet, device_id, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    let mut counter = 0u64;
    let publishers = args.devices.saturating_sub(args.silent);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal after {} messages", counter);
                break;
            }
        }

        let readings: Vec<(String, String)> = {
            let mut fleet = fleet.lock();
            (0..publishers)
                .filter_map(|n| {
                    let id = format!("{}-{}", args.device_prefix, n);
                    let device = fleet.get_mut(&id)?;
                    match serde_json::to_string(&device.step(&mut rng)) {
                        Ok(payload) => Some((id, payload)),
                        Err(e) => {
                            error!("Failed to serialize telemetry: {}", e);
                            None
                        }
                    }
                })
                .collect()
        };

        for (device_id, payload) in readings {
            let topic = format!("{}/{}/telemetry", args.prefix, device_id);
            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        // Occasional garbage to exercise the gateway's validation path
        if rng.gen_bool(0.01) {
            let topic = format!("{}/{}-0/telemetry", args.prefix, args.device_prefix);
            let _ = client
                .publish(&topic, QoS::AtMostOnce, false, "{\"temperature\":\"hot\"}")
                .await;
        }

        debug!("Published {} messages", counter);
    }
}

fn handle_command(fleet: &Fleet, device_id: Option<&str>, payload: &[u8]) {
    let Some(device_id) = device_id else {
        return;
    };

    let command: Command = match serde_json::from_slice(payload) {
        Ok(command) => command,
        Err(e) => {
            warn!(device_id = %device_id, "Ignoring malformed command: {}", e);
            return;
        }
    };

    match fleet.lock().get_mut(device_id) {
        Some(device) => {
            device.apply(&command);
            info!(device_id = %device_id, ?command, "Command applied");
        }
        None => debug!(device_id = %device_id, "Command for unknown device"),
    }
}
