use axum::{routing::get, Router};
use irrigation_gateway::config::Config;
use irrigation_gateway::db::PgStorage;
use irrigation_gateway::engine::Engine;
use irrigation_gateway::history::{self, HistoryRecorder};
use irrigation_gateway::memory::MemoryStorage;
use irrigation_gateway::mqtt::{self, MqttTransport, Topics};
use irrigation_gateway::storage::{self, Storage};
use irrigation_gateway::{liveness, metrics, rest};
use rumqttc::AsyncClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting irrigation gateway");
    info!("MQTT broker: {}:{}", config.mqtt.broker, config.mqtt.port);
    info!("MQTT topic prefix: {}", config.mqtt.topic_prefix);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_display());

    // Initialize metrics
    metrics::init_metrics();

    let storage = connect_storage(&config).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // MQTT client is shared by the telemetry loop and the command transport
    let topics = Topics::new(config.mqtt.topic_prefix.clone());
    let client_id = format!("gateway-{}", uuid::Uuid::new_v4());
    let (client, eventloop) = AsyncClient::new(mqtt::mqtt_options(&config.mqtt, client_id), 100);
    let transport = Arc::new(MqttTransport::new(client.clone(), topics.clone()));

    info!("History channel capacity: {}", config.history_channel_capacity);
    let (recorder, history_rx) = HistoryRecorder::channel(config.history_channel_capacity);
    let engine = Engine::new(config.event_channel_capacity, recorder, transport);

    match engine.hydrate(storage.as_ref(), config.storage_timeout).await {
        Ok(count) => info!("Loaded {} devices from {} storage", count, storage.backend()),
        Err(e) => warn!("Starting with an empty registry, failed to load devices: {}", e),
    }

    // Attached after hydration so loaded devices are not written back
    let sync_rx = engine.notifier.attach_sink();
    let sync_storage = Arc::clone(&storage);
    let storage_timeout = config.storage_timeout;
    let sync_handle = tokio::spawn(async move {
        storage::run_store_sync(sync_rx, sync_storage, storage_timeout).await;
    });

    let recorder_storage = Arc::clone(&storage);
    let batch_size = config.history_batch_size;
    let batch_timeout_ms = config.history_batch_timeout_ms;
    let recorder_handle = tokio::spawn(async move {
        history::run_recorder(
            history_rx,
            recorder_storage,
            batch_size,
            batch_timeout_ms,
            storage_timeout,
        )
        .await;
    });

    let mqtt_handle = tokio::spawn(mqtt::run_mqtt(
        client,
        eventloop,
        topics,
        Arc::clone(&engine.ingest),
        shutdown_rx.clone(),
    ));

    let monitor = engine.liveness(config.offline_timeout);
    let liveness_handle = tokio::spawn(liveness::run_liveness(
        monitor,
        config.liveness_interval,
        shutdown_rx.clone(),
    ));

    // Build HTTP app with REST API, real-time feed and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(rest::AppState {
            engine: engine.clone(),
            storage: Arc::clone(&storage),
            storage_timeout,
            shutdown: shutdown_rx.clone(),
        }));

    let listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };

    info!("HTTP server listening on {}", config.http_addr);

    let mut server_shutdown = shutdown_rx.clone();
    let mut server_handle = tokio::spawn(async move {
        let graceful = async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(()) => error!("HTTP server terminated"),
                Err(e) => error!("HTTP server task failed: {}", e),
            }
        }
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    let drain = async {
        if !server_handle.is_finished() {
            let _ = server_handle.await;
        }
        let _ = mqtt_handle.await;
        let _ = liveness_handle.await;
        // Dropping the engine closes the history and sync channels so both
        // writers flush what they hold and exit
        drop(engine);
        let _ = recorder_handle.await;
        let _ = sync_handle.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("Background tasks did not stop in time");
    }

    info!("Shutdown complete");
}

async fn connect_storage(config: &Config) -> Arc<dyn Storage> {
    let memory = || -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::new(config.memory_history_limit))
    };

    let Some(database_url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set, using in-memory storage");
        return memory();
    };

    match PgStorage::connect(database_url).await {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            warn!("Failed to connect to database, using in-memory storage: {}", e);
            memory()
        }
    }
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
